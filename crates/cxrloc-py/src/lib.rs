use std::path::Path;

use cxrloc_core::heatmap::{segment_heatmap, ThresholdParams};
use cxrloc_core::params::{FillConvention, FillRule, RasterParams, Smoothing};
use cxrloc_core::{BootstrapParams, EvalParams, LocalizationEval, Metric, Prediction};
use numpy::{PyArray2, PyReadonlyArray2};
use pyo3::prelude::*;
use pyo3::types::PyList;

mod convert;
mod mask;

use convert::{manifest_to_py, mask_to_py, py_to_heatmap, record_to_py, to_py_err};

fn parse_rule(s: &str) -> PyResult<FillRule> {
    match s {
        "evenodd" => Ok(FillRule::EvenOdd),
        "nonzero" => Ok(FillRule::NonZero),
        _ => Err(pyo3::exceptions::PyValueError::new_err(format!(
            "Unknown fill rule: '{}'. Expected 'evenodd' or 'nonzero'",
            s
        ))),
    }
}

fn parse_convention(s: &str) -> PyResult<FillConvention> {
    match s {
        "inclusive" => Ok(FillConvention::Inclusive),
        "exclusive" => Ok(FillConvention::Exclusive),
        _ => Err(pyo3::exceptions::PyValueError::new_err(format!(
            "Unknown fill convention: '{}'. Expected 'inclusive' or 'exclusive'",
            s
        ))),
    }
}

/// Rasterize `[[[x, y], ...], ...]` onto an `(h, w)` canvas.
#[pyfunction]
#[pyo3(signature = (polygons, h, w, rule="evenodd", convention="inclusive"))]
fn polygons_to_mask(
    py: Python<'_>,
    polygons: Vec<Vec<[f64; 2]>>,
    h: u32,
    w: u32,
    rule: &str,
    convention: &str,
) -> PyResult<Py<PyArray2<u8>>> {
    let params = RasterParams {
        rule: parse_rule(rule)?,
        convention: parse_convention(convention)?,
    };
    let mask = cxrloc_core::raster::polygons_to_mask(&polygons, h, w, params).map_err(to_py_err)?;
    mask_to_py(py, mask)
}

/// Threshold a saliency map. With `size` the map is first resized to
/// `(h, w)`; otherwise it must already be at the radiograph's resolution.
#[pyfunction]
#[pyo3(signature = (heatmap, threshold=None, smoothing=false, kernel=0, prob=1.0, prob_cutoff=0.0, size=None))]
#[allow(clippy::too_many_arguments)]
fn heatmap_to_mask(
    py: Python<'_>,
    heatmap: PyReadonlyArray2<f32>,
    threshold: Option<f64>,
    smoothing: bool,
    kernel: u32,
    prob: f64,
    prob_cutoff: f64,
    size: Option<(u32, u32)>,
) -> PyResult<Py<PyArray2<u8>>> {
    let mut hm = py_to_heatmap(&heatmap)?;
    if let Some((h, w)) = size {
        hm = hm.resize_bilinear(h, w).map_err(to_py_err)?;
    }
    let params = ThresholdParams {
        mode: threshold.into(),
        smoothing: Smoothing {
            enabled: smoothing,
            kernel,
        },
        prob_cutoff,
    };
    let canvas = (hm.height(), hm.width());
    let mask = segment_heatmap(&hm, canvas, prob, &params).map_err(to_py_err)?;
    mask_to_py(py, mask)
}

/// `(lower, mean, upper)` of a bootstrapped mean, or `None` for no values.
#[pyfunction]
#[pyo3(signature = (values, replicates=1000, seed=0, alpha=0.05, task=""))]
fn bootstrap_ci(
    values: Vec<f64>,
    replicates: usize,
    seed: u64,
    alpha: f64,
    task: &str,
) -> PyResult<Option<(f64, f64, f64)>> {
    let params = BootstrapParams {
        replicates,
        seed,
        alpha,
    };
    let result = cxrloc_core::bootstrap::bootstrap_task(task, &values, &params).map_err(to_py_err)?;
    Ok(result.map(|b| (b.summary.lower, b.summary.mean, b.summary.upper)))
}

/// `(lower, mean, upper)` percentage decrease from paired benchmark replicates.
#[pyfunction]
#[pyo3(signature = (hb, pred, alpha=0.05))]
fn percentage_decrease(hb: Vec<f64>, pred: Vec<f64>, alpha: f64) -> PyResult<Option<(f64, f64, f64)>> {
    let row = cxrloc_core::percentage_decrease("", &hb, &pred, alpha).map_err(to_py_err)?;
    Ok(row.map(|r| (r.lower, r.mean, r.upper)))
}

/// Score a prediction segmentation JSON against a ground-truth one.
/// Returns `(records, manifest)`: a list of `{img_id, task, value, gt, pred}`
/// dicts and the processed/filtered/skipped accounting of the run.
#[pyfunction]
#[pyo3(signature = (gt_path, pred_path, metric="iou", tasks=None, true_pos_only=true))]
fn evaluate(
    py: Python<'_>,
    gt_path: &str,
    pred_path: &str,
    metric: &str,
    tasks: Option<Vec<String>>,
    true_pos_only: bool,
) -> PyResult<(PyObject, PyObject)> {
    let metric: Metric = metric.parse().map_err(to_py_err)?;
    let gt = cxrloc_core::io::read_segmentations(Path::new(gt_path)).map_err(to_py_err)?;
    let pred = cxrloc_core::io::read_segmentations(Path::new(pred_path)).map_err(to_py_err)?;
    let mut params = EvalParams::new(metric);
    if let Some(tasks) = tasks {
        params.tasks = tasks;
    }
    params.true_pos_only = true_pos_only;

    let batch = LocalizationEval::new(&gt, Prediction::Masks(&pred), params)
        .evaluate()
        .map_err(to_py_err)?;
    let list = PyList::new(
        py,
        batch
            .output
            .iter()
            .map(|r| record_to_py(py, r))
            .collect::<PyResult<Vec<_>>>()?,
    )?;
    Ok((list.into_any().unbind(), manifest_to_py(py, &batch.manifest)?))
}

#[pymodule]
fn cxrloc_py(py: Python<'_>, m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(polygons_to_mask, m)?)?;
    m.add_function(wrap_pyfunction!(heatmap_to_mask, m)?)?;
    m.add_function(wrap_pyfunction!(bootstrap_ci, m)?)?;
    m.add_function(wrap_pyfunction!(percentage_decrease, m)?)?;
    m.add_function(wrap_pyfunction!(evaluate, m)?)?;

    // mask submodule
    let mask_mod = PyModule::new(py, "mask")?;
    mask_mod.add_function(wrap_pyfunction!(mask::encode, &mask_mod)?)?;
    mask_mod.add_function(wrap_pyfunction!(mask::decode, &mask_mod)?)?;
    mask_mod.add_function(wrap_pyfunction!(mask::area, &mask_mod)?)?;
    mask_mod.add_function(wrap_pyfunction!(mask::iou, &mask_mod)?)?;
    m.add_submodule(&mask_mod)?;

    // Top-level aliases for the codec.
    m.add_function(wrap_pyfunction!(mask::encode, m)?)?;
    m.add_function(wrap_pyfunction!(mask::decode, m)?)?;
    m.add_function(wrap_pyfunction!(mask::iou, m)?)?;

    Ok(())
}
