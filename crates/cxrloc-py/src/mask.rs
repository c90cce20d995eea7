use cxrloc_core::mask as rmask;
use cxrloc_core::BinaryMask;
use numpy::{PyArray2, PyReadonlyArray2};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::convert::{mask_to_py, py_to_mask, py_to_seg, seg_to_py, to_py_err};

/// Encode an `(h, w)` array into `{"size": [h, w], "counts": str}`.
#[pyfunction]
pub fn encode(py: Python<'_>, mask: PyReadonlyArray2<u8>) -> PyResult<PyObject> {
    let mask = py_to_mask(&mask)?;
    seg_to_py(py, &mask.encode())
}

#[pyfunction]
pub fn decode(py: Python<'_>, seg: &Bound<'_, PyDict>) -> PyResult<Py<PyArray2<u8>>> {
    let seg = py_to_seg(seg)?;
    let mask = BinaryMask::decode(&seg).map_err(to_py_err)?;
    mask_to_py(py, mask)
}

#[pyfunction]
pub fn area(seg: &Bound<'_, PyDict>) -> PyResult<u64> {
    let rle = py_to_seg(seg)?.to_rle().map_err(to_py_err)?;
    Ok(rmask::area(&rle))
}

/// IoU of two encoded masks; 0 when both are empty.
#[pyfunction]
pub fn iou(a: &Bound<'_, PyDict>, b: &Bound<'_, PyDict>) -> PyResult<f64> {
    let a = py_to_seg(a)?.to_rle().map_err(to_py_err)?;
    let b = py_to_seg(b)?.to_rle().map_err(to_py_err)?;
    rmask::iou(&a, &b).map_err(to_py_err)
}
