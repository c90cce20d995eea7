use cxrloc_core::{BinaryMask, EncodedSegmentation, Error, Heatmap, Manifest, MetricRecord};
use numpy::{PyArray1, PyArray2, PyArrayMethods, PyReadonlyArray2, PyUntypedArrayMethods};
use pyo3::prelude::*;
use pyo3::types::PyDict;

pub fn to_py_err(e: Error) -> PyErr {
    match e {
        Error::Io(_) => pyo3::exceptions::PyIOError::new_err(e.to_string()),
        _ => pyo3::exceptions::PyValueError::new_err(e.to_string()),
    }
}

pub fn seg_to_py(py: Python<'_>, seg: &EncodedSegmentation) -> PyResult<PyObject> {
    let dict = PyDict::new(py);
    dict.set_item("size", vec![seg.size[0], seg.size[1]])?;
    dict.set_item("counts", &seg.counts)?;
    Ok(dict.into_any().unbind())
}

pub fn py_to_seg(dict: &Bound<'_, PyDict>) -> PyResult<EncodedSegmentation> {
    let size: [u32; 2] = dict
        .get_item("size")?
        .ok_or_else(|| pyo3::exceptions::PyKeyError::new_err("size"))?
        .extract()?;
    let counts: String = dict
        .get_item("counts")?
        .ok_or_else(|| pyo3::exceptions::PyKeyError::new_err("counts"))?
        .extract()?;
    Ok(EncodedSegmentation { size, counts })
}

/// Any non-zero element is foreground.
pub fn py_to_mask(array: &PyReadonlyArray2<'_, u8>) -> PyResult<BinaryMask> {
    let shape = array.shape();
    let data: Vec<u8> = array.as_array().iter().map(|&v| (v != 0) as u8).collect();
    BinaryMask::from_vec(shape[0] as u32, shape[1] as u32, data).map_err(to_py_err)
}

pub fn mask_to_py(py: Python<'_>, mask: BinaryMask) -> PyResult<Py<PyArray2<u8>>> {
    let (h, w) = mask.shape();
    let arr = PyArray1::from_vec(py, mask.into_vec()).reshape([h, w])?;
    Ok(arr.unbind())
}

pub fn py_to_heatmap(array: &PyReadonlyArray2<'_, f32>) -> PyResult<Heatmap> {
    let shape = array.shape();
    let values: Vec<f32> = array.as_array().iter().copied().collect();
    Heatmap::from_vec(shape[0] as u32, shape[1] as u32, values).map_err(to_py_err)
}

pub fn record_to_py(py: Python<'_>, record: &MetricRecord) -> PyResult<PyObject> {
    let dict = PyDict::new(py);
    dict.set_item("img_id", &record.image_id)?;
    dict.set_item("task", &record.task)?;
    dict.set_item("value", record.value)?;
    dict.set_item("gt", record.gt_label)?;
    dict.set_item("pred", record.pred_label)?;
    Ok(dict.into_any().unbind())
}

/// `{"processed", "filtered", "skipped": [{"img_id", "task", "error"}]}`
pub fn manifest_to_py(py: Python<'_>, manifest: &Manifest) -> PyResult<PyObject> {
    let skipped = manifest
        .skipped
        .iter()
        .map(|f| {
            let dict = PyDict::new(py);
            dict.set_item("img_id", &f.image_id)?;
            dict.set_item("task", &f.task)?;
            dict.set_item("error", &f.error)?;
            Ok(dict)
        })
        .collect::<PyResult<Vec<_>>>()?;
    let dict = PyDict::new(py);
    dict.set_item("processed", manifest.processed)?;
    dict.set_item("filtered", manifest.filtered)?;
    dict.set_item("skipped", skipped)?;
    Ok(dict.into_any().unbind())
}
