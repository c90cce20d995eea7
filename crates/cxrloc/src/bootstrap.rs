//! Bootstrap confidence intervals for per-task mean metrics, and the
//! percentage decrease of a method relative to a human benchmark.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::params::BootstrapParams;
use crate::types::{CiSummary, MetricRecord, TaskBootstrap};

/// Seed for one task's resampling stream.
///
/// Depends only on the run seed and the task name, so a task's interval does
/// not change with which other tasks are evaluated or in what order.
pub fn task_seed(seed: u64, task: &str) -> u64 {
    splitmix64(seed ^ fnv1a(task.as_bytes()))
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn check(params: &BootstrapParams) -> Result<()> {
    if params.replicates == 0 {
        return Err(Error::InvalidArgument("replicates must be positive".to_string()));
    }
    if !(params.alpha > 0.0 && params.alpha < 1.0) {
        return Err(Error::InvalidArgument(format!(
            "alpha must be in (0, 1), got {}",
            params.alpha
        )));
    }
    Ok(())
}

/// Lower and upper percentile of sorted replicates.
///
/// With `n` replicates the bounds are the `floor(n * alpha / 2)`-th and
/// `floor(n * (1 - alpha / 2))`-th smallest values, counting from one.
/// `None` for no replicates.
pub fn percentile_bounds(sorted: &[f64], alpha: f64) -> Option<(f64, f64)> {
    let last = sorted.len().checked_sub(1)?;
    let rank = |q: f64| {
        let k = (q * sorted.len() as f64 + 1e-9).floor() as usize;
        k.saturating_sub(1).min(last)
    };
    Some((sorted[rank(alpha / 2.0)], sorted[rank(1.0 - alpha / 2.0)]))
}

/// Resample `values` with replacement and summarize the replicate means.
///
/// Returns `None` for an empty sample.
pub fn bootstrap_task(
    task: &str,
    values: &[f64],
    params: &BootstrapParams,
) -> Result<Option<TaskBootstrap>> {
    check(params)?;
    if values.is_empty() {
        return Ok(None);
    }
    let n = values.len();
    let mut rng = StdRng::seed_from_u64(task_seed(params.seed, task));
    let samples: Vec<f64> = (0..params.replicates)
        .map(|_| {
            let sum: f64 = (0..n).map(|_| values[rng.gen_range(0..n)]).sum();
            sum / n as f64
        })
        .collect();

    let mut sorted = samples.clone();
    sorted.sort_by(f64::total_cmp);
    let Some((lower, upper)) = percentile_bounds(&sorted, params.alpha) else {
        return Ok(None);
    };
    if lower == upper {
        debug!(task, n, "zero-width interval");
    }
    Ok(Some(TaskBootstrap {
        task: task.to_string(),
        summary: CiSummary {
            lower,
            mean: mean(values),
            upper,
        },
        samples,
    }))
}

/// Bootstrap every task in `tasks`, in that order.
///
/// Tasks without records are skipped with a warning.
pub fn bootstrap(
    records: &[MetricRecord],
    tasks: &[String],
    params: &BootstrapParams,
) -> Result<Vec<TaskBootstrap>> {
    check(params)?;
    let mut by_task: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for r in records {
        by_task.entry(r.task.as_str()).or_default().push(r.value);
    }

    let results: Vec<Result<Option<TaskBootstrap>>> = tasks
        .par_iter()
        .map(|task| {
            let values = by_task.get(task.as_str()).map_or(&[][..], Vec::as_slice);
            bootstrap_task(task, values, params)
        })
        .collect();

    let mut out = Vec::with_capacity(tasks.len());
    for (task, result) in tasks.iter().zip(results) {
        match result? {
            Some(b) => out.push(b),
            None => warn!(task = %task, "no records, skipping bootstrap"),
        }
    }
    Ok(out)
}

/// Percentage decrease of a method from the human benchmark for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PctDecrease {
    pub task: String,
    #[serde(rename = "pct_decrease_lower")]
    pub lower: f64,
    #[serde(rename = "pct_decrease_mean")]
    pub mean: f64,
    #[serde(rename = "pct_decrease_upper")]
    pub upper: f64,
}

/// Pair replicate `i` of the benchmark with replicate `i` of the method and
/// summarize `100 * (hb - pred) / hb` over the pairs.
///
/// Pairs whose benchmark replicate is 0 are left out; `None` when that
/// leaves nothing.
pub fn percentage_decrease(
    task: &str,
    hb: &[f64],
    pred: &[f64],
    alpha: f64,
) -> Result<Option<PctDecrease>> {
    if hb.len() != pred.len() {
        return Err(Error::shape((1, hb.len()), (1, pred.len())));
    }
    let mut pcts: Vec<f64> = hb
        .iter()
        .zip(pred)
        .filter(|(&h, _)| h != 0.0)
        .map(|(&h, &p)| 100.0 * (h - p) / h)
        .collect();
    let excluded = hb.len() - pcts.len();
    if excluded > 0 {
        warn!(task, excluded, "benchmark replicates equal to zero left out");
    }
    if pcts.is_empty() {
        warn!(task, "no usable replicate pairs");
        return Ok(None);
    }
    let mean = mean(&pcts);
    pcts.sort_by(f64::total_cmp);
    let Some((lower, upper)) = percentile_bounds(&pcts, alpha) else {
        return Ok(None);
    };
    Ok(Some(PctDecrease {
        task: task.to_string(),
        lower,
        mean,
        upper,
    }))
}

/// Percentage decrease for every task present in both replicate tables.
pub fn compare(
    hb: &BTreeMap<String, Vec<f64>>,
    pred: &BTreeMap<String, Vec<f64>>,
    alpha: f64,
) -> Result<Vec<PctDecrease>> {
    let mut out = Vec::new();
    for (task, hb_samples) in hb {
        let Some(pred_samples) = pred.get(task) else {
            warn!(task = %task, "no method replicates for task");
            continue;
        };
        if let Some(row) = percentage_decrease(task, hb_samples, pred_samples, alpha)? {
            out.push(row);
        }
    }
    for task in pred.keys().filter(|t| !hb.contains_key(*t)) {
        warn!(task = %task, "no benchmark replicates for task");
    }
    Ok(out)
}
