use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pathologies with ground-truth segmentations.
pub const LOCALIZATION_TASKS: [&str; 10] = [
    "Enlarged Cardiomediastinum",
    "Cardiomegaly",
    "Lung Lesion",
    "Airspace Opacity",
    "Edema",
    "Consolidation",
    "Atelectasis",
    "Pneumothorax",
    "Pleural Effusion",
    "Support Devices",
];

/// Label order of a 14-way classifier probability vector.
pub const CHEXPERT_TASKS: [&str; 14] = [
    "No Finding",
    "Enlarged Cardiomediastinum",
    "Cardiomegaly",
    "Lung Lesion",
    "Airspace Opacity",
    "Edema",
    "Consolidation",
    "Pneumonia",
    "Atelectasis",
    "Pneumothorax",
    "Pleural Effusion",
    "Pleural Other",
    "Fracture",
    "Support Devices",
];

/// The localization tasks in sorted order, the order every table is written in.
pub fn localization_tasks() -> Vec<String> {
    let mut tasks: Vec<String> = LOCALIZATION_TASKS.iter().map(|t| t.to_string()).collect();
    tasks.sort();
    tasks
}

/// Which localization metric to compute per (image, task) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Intersection over union of predicted and ground-truth masks.
    Iou,
    /// 1 if the prediction touches the ground truth at all, else 0.
    HitMiss,
}

impl Metric {
    /// Column header of the per-image metric table.
    pub fn column_name(&self) -> &'static str {
        match self {
            Metric::Iou => "iou",
            Metric::HitMiss => "hitmiss",
        }
    }

    /// Name of the aggregated metric, used in output file names.
    pub fn summary_name(&self) -> &'static str {
        match self {
            Metric::Iou => "miou",
            Metric::HitMiss => "hitrate",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "iou" | "miou" => Ok(Metric::Iou),
            "hitmiss" | "hitrate" => Ok(Metric::HitMiss),
            other => Err(Error::InvalidArgument(format!(
                "unknown metric '{}', expected iou or hitmiss",
                other
            ))),
        }
    }
}

/// How (image, task) pairs with a negative ground truth are scored when
/// evaluation is not restricted to true positives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegativePolicy {
    /// Score the pair like any other; with nothing to localize IoU and hit are both 0.
    #[default]
    Zero,
    /// Leave the pair out of the per-image table.
    Exclude,
}

/// Parameters for the localization evaluator.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EvalParams {
    pub metric: Metric,
    /// Tasks to evaluate, in output order.
    pub tasks: Vec<String>,
    /// Only evaluate pairs whose ground-truth mask is non-empty.
    pub true_pos_only: bool,
    /// Applies only when `true_pos_only` is false.
    pub negatives: NegativePolicy,
}

impl EvalParams {
    pub fn new(metric: Metric) -> Self {
        EvalParams {
            metric,
            tasks: localization_tasks(),
            true_pos_only: true,
            negatives: NegativePolicy::Zero,
        }
    }
}

impl Default for EvalParams {
    fn default() -> Self {
        EvalParams::new(Metric::Iou)
    }
}

/// Bootstrap resampling parameters.
///
/// The seed is always explicit so that confidence intervals are reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BootstrapParams {
    pub replicates: usize,
    pub seed: u64,
    /// Two-sided significance level; 0.05 gives a 95% interval.
    pub alpha: f64,
}

impl Default for BootstrapParams {
    fn default() -> Self {
        BootstrapParams {
            replicates: 1000,
            seed: 0,
            alpha: 0.05,
        }
    }
}

/// Box-filter smoothing applied before Otsu thresholding.
///
/// `kernel` only takes effect when `enabled` is set; a kernel of 0 or 1
/// leaves the false-colour map unfiltered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Smoothing {
    pub enabled: bool,
    pub kernel: u32,
}

impl Smoothing {
    pub fn new(kernel: u32) -> Self {
        Smoothing {
            enabled: true,
            kernel,
        }
    }
}

/// Scanline fill rule for polygon interiors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FillRule {
    #[default]
    EvenOdd,
    NonZero,
}

/// Which pixels on a polygon's boundary are part of the fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FillConvention {
    /// Vertices are pixel centres and the outline itself is painted.
    #[default]
    Inclusive,
    /// Only pixels whose centre `(x + 0.5, y + 0.5)` lies inside are painted.
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RasterParams {
    pub rule: FillRule,
    pub convention: FillConvention,
}

/// Per-task scalar table (segmentation thresholds or probability cutoffs).
pub type ThresholdTable = BTreeMap<String, f64>;

/// Parameters for turning heatmaps and annotations into segmentations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentParams {
    pub tasks: Vec<String>,
    pub smoothing: Smoothing,
    /// Fixed thresholds per task; Otsu's method is used when absent.
    pub thresholds: Option<ThresholdTable>,
    /// Probability cutoffs per task; no gating when absent.
    pub prob_cutoffs: Option<ThresholdTable>,
    pub raster: RasterParams,
}

impl SegmentParams {
    pub fn new() -> Self {
        SegmentParams {
            tasks: localization_tasks(),
            ..Default::default()
        }
    }

    /// Fixed threshold for `task`, or `None` for Otsu.
    pub fn threshold_for(&self, task: &str) -> Result<Option<f64>> {
        match &self.thresholds {
            None => Ok(None),
            Some(table) => table.get(task).copied().map(Some).ok_or_else(|| {
                Error::InvalidArgument(format!("threshold table has no row for '{}'", task))
            }),
        }
    }

    pub fn cutoff_for(&self, task: &str) -> Result<f64> {
        match &self.prob_cutoffs {
            None => Ok(0.0),
            Some(table) => table.get(task).copied().ok_or_else(|| {
                Error::InvalidArgument(format!("cutoff table has no row for '{}'", task))
            }),
        }
    }
}

/// Run configuration, loadable from JSON. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub tasks: Vec<String>,
    pub metric: Metric,
    pub true_pos_only: bool,
    pub negatives: NegativePolicy,
    pub bootstrap: BootstrapParams,
    pub smoothing: Smoothing,
    pub raster: RasterParams,
}

impl Default for Config {
    fn default() -> Self {
        let eval = EvalParams::default();
        Config {
            tasks: eval.tasks,
            metric: eval.metric,
            true_pos_only: eval.true_pos_only,
            negatives: eval.negatives,
            bootstrap: BootstrapParams::default(),
            smoothing: Smoothing::default(),
            raster: RasterParams::default(),
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)?;
        config.tasks.sort();
        config.tasks.dedup();
        Ok(config)
    }

    pub fn eval_params(&self) -> EvalParams {
        EvalParams {
            metric: self.metric,
            tasks: self.tasks.clone(),
            true_pos_only: self.true_pos_only,
            negatives: self.negatives,
        }
    }

    pub fn segment_params(
        &self,
        thresholds: Option<ThresholdTable>,
        prob_cutoffs: Option<ThresholdTable>,
    ) -> SegmentParams {
        SegmentParams {
            tasks: self.tasks.clone(),
            smoothing: self.smoothing,
            thresholds,
            prob_cutoffs,
            raster: self.raster,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_localization_tasks_sorted_subset() {
        let tasks = localization_tasks();
        assert_eq!(tasks.len(), 10);
        assert!(tasks.windows(2).all(|w| w[0] < w[1]));
        assert!(tasks.iter().all(|t| CHEXPERT_TASKS.contains(&t.as_str())));
    }

    #[test]
    fn test_metric_parse() {
        assert_eq!("iou".parse::<Metric>().unwrap(), Metric::Iou);
        assert_eq!("hitrate".parse::<Metric>().unwrap(), Metric::HitMiss);
        assert!("dice".parse::<Metric>().is_err());
    }

    #[test]
    fn test_smoothing_defaults_off() {
        let smoothing: Smoothing = serde_json::from_str(r#"{"kernel": 5}"#).unwrap();
        assert!(!smoothing.enabled);
        assert_eq!(Smoothing::new(5).kernel, 5);
        assert!(Smoothing::new(5).enabled);
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: Config =
            serde_json::from_str(r#"{"metric": "hitmiss", "bootstrap": {"seed": 7}}"#).unwrap();
        assert_eq!(config.metric, Metric::HitMiss);
        assert_eq!(config.bootstrap.seed, 7);
        assert_eq!(config.bootstrap.replicates, 1000);
        assert!(config.true_pos_only);
        assert_eq!(config.tasks, localization_tasks());
    }

    #[test]
    fn test_segment_params_lookup() {
        let mut params = SegmentParams::new();
        assert_eq!(params.threshold_for("Edema").unwrap(), None);
        assert_eq!(params.cutoff_for("Edema").unwrap(), 0.0);

        params.thresholds = Some(ThresholdTable::from([("Edema".to_string(), 0.3)]));
        assert_eq!(params.threshold_for("Edema").unwrap(), Some(0.3));
        assert!(params.threshold_for("Cardiomegaly").is_err());
    }
}
