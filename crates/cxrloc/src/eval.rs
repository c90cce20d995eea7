//! Localization evaluation: per-image IoU or hit/miss against ground truth,
//! plus the threshold sweep and label statistics built on the same masks.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::heatmap::{threshold_heatmap, Heatmap, ThresholdMode};
use crate::mask::{self, BinaryMask};
use crate::params::{EvalParams, Metric, NegativePolicy, Smoothing, ThresholdTable};
use crate::types::{
    Batch, EncodedSegmentation, HeatmapUnit, Manifest, MetricRecord, PointSet, Rle,
    SegmentationSet,
};

/// What a method predicted for each (image, task) pair.
#[derive(Debug, Clone, Copy)]
pub enum Prediction<'a> {
    Masks(&'a SegmentationSet),
    /// Discrete points; only meaningful for hit/miss.
    Points(&'a PointSet),
}

impl Prediction<'_> {
    fn has_image(&self, image_id: &str) -> bool {
        match self {
            Prediction::Masks(set) => set.contains_image(image_id),
            Prediction::Points(points) => points.contains_key(image_id),
        }
    }

    fn pairs(&self) -> Vec<(&str, &str)> {
        match self {
            Prediction::Masks(set) => set.iter().map(|(i, t, _)| (i, t)).collect(),
            Prediction::Points(points) => points
                .iter()
                .flat_map(|(i, tasks)| tasks.keys().map(move |t| (i.as_str(), t.as_str())))
                .collect(),
        }
    }
}

enum Outcome {
    Scored(MetricRecord),
    Filtered,
}

/// Evaluates predictions against ground-truth segmentations.
pub struct LocalizationEval<'a> {
    pub gt: &'a SegmentationSet,
    pub pred: Prediction<'a>,
    pub params: EvalParams,
}

impl<'a> LocalizationEval<'a> {
    pub fn new(gt: &'a SegmentationSet, pred: Prediction<'a>, params: EvalParams) -> Self {
        LocalizationEval { gt, pred, params }
    }

    /// Score every ground-truth image for every configured task.
    ///
    /// Records are grouped by task in configuration order. A prediction with no
    /// ground truth to compare against aborts the run; a ground-truth image
    /// without a prediction is scored against an empty mask.
    pub fn evaluate(&self) -> Result<Batch<Vec<MetricRecord>>> {
        if matches!(self.pred, Prediction::Points(_)) && self.params.metric == Metric::Iou {
            return Err(Error::InvalidArgument(
                "IoU needs predicted masks, not points".to_string(),
            ));
        }
        self.check_ground_truth()?;

        let units: Vec<(&str, &str)> = self
            .params
            .tasks
            .iter()
            .flat_map(|task| self.gt.image_ids().map(move |id| (id, task.as_str())))
            .collect();

        let results: Vec<(&str, &str, Result<Outcome>)> = units
            .par_iter()
            .map(|&(image_id, task)| (image_id, task, self.evaluate_unit(image_id, task)))
            .collect();

        let mut records = Vec::with_capacity(results.len());
        let mut manifest = Manifest::default();
        for (image_id, task, result) in results {
            match result {
                Ok(Outcome::Scored(record)) => {
                    manifest.processed += 1;
                    records.push(record);
                }
                Ok(Outcome::Filtered) => manifest.filtered += 1,
                Err(e) => manifest.skip(image_id, task, &e),
            }
        }
        info!(
            metric = %self.params.metric,
            processed = manifest.processed,
            filtered = manifest.filtered,
            skipped = manifest.skipped.len(),
            "evaluated localization"
        );
        Ok(Batch {
            output: records,
            manifest,
        })
    }

    fn check_ground_truth(&self) -> Result<()> {
        for (image_id, task) in self.pred.pairs() {
            if !self.params.tasks.iter().any(|t| t == task) {
                continue;
            }
            if self.gt.get(image_id, task).is_none() {
                return Err(Error::MissingGroundTruth {
                    image_id: image_id.to_string(),
                    task: task.to_string(),
                });
            }
        }
        Ok(())
    }

    fn evaluate_unit(&self, image_id: &str, task: &str) -> Result<Outcome> {
        let gt_rle = match self.gt.get(image_id, task) {
            None => {
                return Err(Error::MissingGroundTruth {
                    image_id: image_id.to_string(),
                    task: task.to_string(),
                })
            }
            Some(None) => return Err(Error::format("ground-truth entry is null")),
            Some(Some(seg)) => seg.to_rle()?,
        };
        let gt_label = mask::area(&gt_rle) > 0;
        if !gt_label && (self.params.true_pos_only || self.params.negatives == NegativePolicy::Exclude)
        {
            return Ok(Outcome::Filtered);
        }

        let (value, pred_label) = match self.pred {
            Prediction::Masks(set) => {
                let pred_rle = match set.get(image_id, task) {
                    None => {
                        if !self.pred.has_image(image_id) {
                            debug!(image_id, task, "no prediction, scoring an empty mask");
                        }
                        BinaryMask::zeros(gt_rle.h, gt_rle.w).to_rle()
                    }
                    Some(None) => return Err(Error::format("prediction entry is null")),
                    Some(Some(seg)) => seg.to_rle()?,
                };
                score_masks(&pred_rle, &gt_rle, self.params.metric)?
            }
            Prediction::Points(points) => {
                let pts = points
                    .get(image_id)
                    .and_then(|tasks| tasks.get(task))
                    .map_or(&[][..], Vec::as_slice);
                let gt_mask = BinaryMask::from_rle(&gt_rle)?;
                let hit = pts
                    .iter()
                    .any(|p| gt_mask.get(p[0].round() as i64, p[1].round() as i64));
                (if hit { 1.0 } else { 0.0 }, !pts.is_empty())
            }
        };

        Ok(Outcome::Scored(MetricRecord {
            image_id: image_id.to_string(),
            task: task.to_string(),
            value,
            gt_label: gt_label as u8,
            pred_label: pred_label as u8,
        }))
    }
}

/// Metric value and predicted label for one pair of masks.
fn score_masks(pred: &Rle, gt: &Rle, metric: Metric) -> Result<(f64, bool)> {
    let pred_label = mask::area(pred) > 0;
    let value = match metric {
        Metric::Iou => mask::iou(pred, gt)?,
        Metric::HitMiss => {
            if (pred.h, pred.w) != (gt.h, gt.w) {
                return Err(Error::shape(
                    (gt.h as usize, gt.w as usize),
                    (pred.h as usize, pred.w as usize),
                ));
            }
            if mask::intersection_area(pred, gt) > 0 {
                1.0
            } else {
                0.0
            }
        }
    };
    Ok((value, pred_label))
}

/// Saliency maxima of heatmaps at their radiograph resolution, for
/// point-based hit/miss.
pub fn peak_points(units: &[HeatmapUnit]) -> Batch<PointSet> {
    let results: Vec<(&HeatmapUnit, Result<(u32, u32)>)> = units
        .par_iter()
        .map(|u| {
            let (h, w) = u.record.canvas();
            let peak = u
                .record
                .map
                .to_heatmap()
                .and_then(|hm| hm.resize_bilinear(h, w))
                .map(|hm| hm.peak());
            (u, peak)
        })
        .collect();

    let mut output = PointSet::new();
    let mut manifest = Manifest::default();
    for (u, result) in results {
        let (image_id, task) = (u.image_id.as_str(), u.record.task.as_str());
        let tasks = output.entry(image_id.to_string()).or_default();
        match result {
            Ok(_) if tasks.contains_key(task) => {
                let dup = Error::DuplicateEntry {
                    image_id: image_id.to_string(),
                    task: task.to_string(),
                };
                manifest.skip(image_id, task, &dup);
            }
            Ok((x, y)) => {
                tasks.insert(task.to_string(), vec![[x as f64, y as f64]]);
                manifest.processed += 1;
            }
            Err(e) => manifest.skip(image_id, task, &e),
        }
    }
    Batch { output, manifest }
}

/// Fixed thresholds tried when tuning, in order.
pub const THRESHOLD_CANDIDATES: [f64; 6] = [0.2, 0.3, 0.4, 0.5, 0.6, 0.7];

/// Pick the fixed threshold with the best mIoU for one task.
///
/// Pairs where both the thresholded heatmap and the ground truth are empty
/// carry no signal and are left out of the mean. The first candidate wins a
/// tie. The output is `None` when no pair could be scored at any candidate;
/// pairs that fail to load are reported in the manifest.
pub fn tune_threshold(
    task: &str,
    units: &[HeatmapUnit],
    gt: &SegmentationSet,
) -> Result<Batch<Option<f64>>> {
    let mut manifest = Manifest::default();
    let mut pairs = Vec::new();
    for unit in units.iter().filter(|u| u.record.task == task) {
        let seg = match gt.get(&unit.image_id, task) {
            None => {
                return Err(Error::MissingGroundTruth {
                    image_id: unit.image_id.clone(),
                    task: task.to_string(),
                })
            }
            Some(seg) => seg,
        };
        match tuning_pair(unit, seg) {
            Ok(pair) => {
                pairs.push(pair);
                manifest.processed += 1;
            }
            Err(e) => manifest.skip(&unit.image_id, task, &e),
        }
    }

    let mut best: Option<(f64, f64)> = None;
    for &candidate in &THRESHOLD_CANDIDATES {
        let ious: Vec<f64> = pairs
            .par_iter()
            .filter_map(|(hm, gt_rle)| {
                let pred =
                    threshold_heatmap(hm, ThresholdMode::Fixed(candidate), Smoothing::default())
                        .to_rle();
                if mask::area(&pred) == 0 && mask::area(gt_rle) == 0 {
                    return None;
                }
                mask::iou(&pred, gt_rle).ok()
            })
            .collect();
        if ious.is_empty() {
            continue;
        }
        let miou = ious.iter().sum::<f64>() / ious.len() as f64;
        debug!(task, candidate, miou, "threshold candidate");
        if best.map_or(true, |(_, m)| miou > m) {
            best = Some((candidate, miou));
        }
    }
    Ok(Batch {
        output: best.map(|(t, _)| (t * 10.0).round() / 10.0),
        manifest,
    })
}

fn tuning_pair(unit: &HeatmapUnit, seg: Option<&EncodedSegmentation>) -> Result<(Heatmap, Rle)> {
    let gt_rle = seg
        .ok_or_else(|| Error::format("ground-truth entry is null"))?
        .to_rle()?;
    let (h, w) = unit.record.canvas();
    let hm = unit.record.map.to_heatmap()?.resize_bilinear(h, w)?;
    if hm.shape() != (gt_rle.h as usize, gt_rle.w as usize) {
        return Err(Error::shape((gt_rle.h as usize, gt_rle.w as usize), hm.shape()));
    }
    Ok((hm, gt_rle))
}

/// Tune every task. Tasks with nothing to score get no row; heatmaps of
/// other tasks count as filtered.
pub fn tune_thresholds(
    units: &[HeatmapUnit],
    gt: &SegmentationSet,
    tasks: &[String],
) -> Result<Batch<ThresholdTable>> {
    let mut table = ThresholdTable::new();
    let mut manifest = Manifest {
        filtered: units.iter().filter(|u| !tasks.contains(&u.record.task)).count(),
        ..Default::default()
    };
    for task in tasks {
        let batch = tune_threshold(task, units, gt)?;
        manifest.merge(batch.manifest);
        match batch.output {
            Some(t) => {
                info!(task = %task, threshold = t, "tuned threshold");
                table.insert(task.clone(), t);
            }
            None => warn!(task = %task, "no scorable heatmaps, no threshold"),
        }
    }
    Ok(Batch {
        output: table,
        manifest,
    })
}

/// Number of images with a non-empty mask for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCount {
    pub task: String,
    pub n_segs: usize,
}

/// Count non-empty masks per task. Null and undecodable entries are skipped.
pub fn count_segmentations(set: &SegmentationSet, tasks: &[String]) -> Batch<Vec<SegmentCount>> {
    let mut manifest = Manifest::default();
    let mut output = Vec::with_capacity(tasks.len());
    for task in tasks {
        let mut n_segs = 0;
        for image_id in set.image_ids() {
            match mask_label(set.get(image_id, task)) {
                Ok(Some(nonempty)) => {
                    n_segs += nonempty as usize;
                    manifest.processed += 1;
                }
                Ok(None) => {}
                Err(e) => manifest.skip(image_id, task, &e),
            }
        }
        output.push(SegmentCount {
            task: task.clone(),
            n_segs,
        });
    }
    Batch { output, manifest }
}

/// Whether an entry holds a non-empty mask; `None` when the pair is absent.
fn mask_label(entry: Option<Option<&EncodedSegmentation>>) -> Result<Option<bool>> {
    match entry {
        None => Ok(None),
        Some(None) => Err(Error::format("segmentation entry is null")),
        Some(Some(seg)) => Ok(Some(mask::area(&seg.to_rle()?) > 0)),
    }
}

/// Label agreement between ground truth and prediction for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelStats {
    pub task: String,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub specificity: Option<f64>,
}

/// Precision, recall and specificity of "mask is non-empty" as a label.
///
/// Each ground-truth image is one case; a missing prediction counts as
/// negative. A ratio with a zero denominator is `None`.
pub fn precision_recall_specificity(
    gt: &SegmentationSet,
    pred: &SegmentationSet,
    tasks: &[String],
) -> Batch<Vec<LabelStats>> {
    let mut manifest = Manifest::default();
    let mut output = Vec::with_capacity(tasks.len());
    for task in tasks {
        let (mut tp, mut fp, mut tn, mut fn_) = (0u64, 0u64, 0u64, 0u64);
        for image_id in gt.image_ids() {
            let labels = mask_label(gt.get(image_id, task)).and_then(|g| {
                let g = g.ok_or_else(|| Error::MissingGroundTruth {
                    image_id: image_id.to_string(),
                    task: task.to_string(),
                })?;
                let p = mask_label(pred.get(image_id, task))?.unwrap_or(false);
                Ok((g, p))
            });
            match labels {
                Ok((true, true)) => tp += 1,
                Ok((false, true)) => fp += 1,
                Ok((false, false)) => tn += 1,
                Ok((true, false)) => fn_ += 1,
                Err(e) => {
                    manifest.skip(image_id, task, &e);
                    continue;
                }
            }
            manifest.processed += 1;
        }
        output.push(LabelStats {
            task: task.clone(),
            precision: ratio(tp, tp + fp),
            recall: ratio(tp, tp + fn_),
            specificity: ratio(tn, tn + fp),
        });
    }
    Batch { output, manifest }
}

fn ratio(num: u64, den: u64) -> Option<f64> {
    (den > 0).then(|| num as f64 / den as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HeatmapRecord, MapTensor, Probability};
    use std::collections::BTreeMap;

    fn block(n: u32, size: u32) -> BinaryMask {
        BinaryMask::from_fn(n, n, |x, y| x < size && y < size)
    }

    fn set(entries: &[(&str, &str, Option<BinaryMask>)]) -> SegmentationSet {
        let mut s = SegmentationSet::new();
        for (image_id, task, m) in entries {
            s.insert(image_id, task, m.as_ref().map(BinaryMask::encode))
                .unwrap();
        }
        s
    }

    fn params(metric: Metric, true_pos_only: bool, negatives: NegativePolicy) -> EvalParams {
        EvalParams {
            metric,
            tasks: vec!["Edema".to_string()],
            true_pos_only,
            negatives,
        }
    }

    fn run(gt: &SegmentationSet, pred: &SegmentationSet, p: EvalParams) -> Batch<Vec<MetricRecord>> {
        LocalizationEval::new(gt, Prediction::Masks(pred), p)
            .evaluate()
            .unwrap()
    }

    #[test]
    fn test_empty_prediction_misses() {
        let gt = set(&[("img", "Edema", Some(block(4, 2)))]);
        let pred = set(&[("img", "Edema", Some(BinaryMask::zeros(4, 4)))]);
        for metric in [Metric::Iou, Metric::HitMiss] {
            let out = run(&gt, &pred, params(metric, true, NegativePolicy::Zero));
            assert_eq!(out.output.len(), 1);
            let r = &out.output[0];
            assert_eq!(r.value, 0.0);
            assert_eq!((r.gt_label, r.pred_label), (1, 0));
        }
    }

    #[test]
    fn test_identical_masks_hit() {
        let gt = set(&[("img", "Edema", Some(block(5, 3)))]);
        let pred = gt.clone();
        let iou = run(&gt, &pred, params(Metric::Iou, true, NegativePolicy::Zero));
        assert_eq!(iou.output[0].value, 1.0);
        let hit = run(&gt, &pred, params(Metric::HitMiss, true, NegativePolicy::Zero));
        assert_eq!(hit.output[0].value, 1.0);
    }

    #[test]
    fn test_partial_overlap() {
        let gt = set(&[("img", "Edema", Some(block(4, 2)))]);
        let pred = set(&[(
            "img",
            "Edema",
            Some(BinaryMask::from_fn(4, 4, |x, y| x == 1 && y < 2)),
        )]);
        let iou = run(&gt, &pred, params(Metric::Iou, true, NegativePolicy::Zero));
        assert_eq!(iou.output[0].value, 0.5);
        let hit = run(&gt, &pred, params(Metric::HitMiss, true, NegativePolicy::Zero));
        assert_eq!(hit.output[0].value, 1.0);
    }

    fn mixed() -> (SegmentationSet, SegmentationSet) {
        let gt = set(&[
            ("neg", "Edema", Some(BinaryMask::zeros(4, 4))),
            ("pos", "Edema", Some(block(4, 2))),
        ]);
        let pred = set(&[
            ("neg", "Edema", Some(BinaryMask::zeros(4, 4))),
            ("pos", "Edema", Some(block(4, 2))),
        ]);
        (gt, pred)
    }

    #[test]
    fn test_true_positive_only_filters_negatives() {
        let (gt, pred) = mixed();
        let out = run(&gt, &pred, params(Metric::Iou, true, NegativePolicy::Zero));
        assert_eq!(out.output.len(), 1);
        assert_eq!(out.output[0].image_id, "pos");
        assert_eq!(out.manifest.filtered, 1);
    }

    #[test]
    fn test_negatives_scored_as_zero() {
        let (gt, pred) = mixed();
        for metric in [Metric::Iou, Metric::HitMiss] {
            let out = run(&gt, &pred, params(metric, false, NegativePolicy::Zero));
            assert_eq!(out.output.len(), 2);
            let neg = out.output.iter().find(|r| r.image_id == "neg").unwrap();
            assert_eq!(neg.value, 0.0);
            assert_eq!((neg.gt_label, neg.pred_label), (0, 0));
            let mean: f64 = out.output.iter().map(|r| r.value).sum::<f64>() / 2.0;
            assert_eq!(mean, 0.5);
        }
    }

    #[test]
    fn test_negatives_excluded() {
        let (gt, pred) = mixed();
        let out = run(&gt, &pred, params(Metric::Iou, false, NegativePolicy::Exclude));
        assert_eq!(out.output.len(), 1);
        assert_eq!(out.output[0].value, 1.0);
        assert_eq!(out.manifest.filtered, 1);
    }

    #[test]
    fn test_prediction_without_ground_truth_aborts() {
        let gt = set(&[("img", "Edema", Some(block(4, 2)))]);
        let pred = set(&[
            ("img", "Edema", Some(block(4, 2))),
            ("other", "Edema", Some(block(4, 2))),
        ]);
        let err = LocalizationEval::new(&gt, Prediction::Masks(&pred), EvalParams {
            tasks: vec!["Edema".to_string()],
            ..Default::default()
        })
        .evaluate()
        .unwrap_err();
        assert!(matches!(err, Error::MissingGroundTruth { image_id, .. } if image_id == "other"));
    }

    #[test]
    fn test_missing_prediction_scores_empty_mask() {
        let gt = set(&[("img", "Edema", Some(block(4, 2)))]);
        let pred = SegmentationSet::new();
        let out = run(&gt, &pred, params(Metric::Iou, true, NegativePolicy::Zero));
        assert_eq!(out.output[0].value, 0.0);
        assert_eq!(out.manifest.processed, 1);
    }

    #[test]
    fn test_unit_failures_go_to_manifest() {
        let gt = set(&[
            ("a", "Edema", Some(block(4, 2))),
            ("b", "Edema", None),
            ("c", "Edema", Some(block(4, 2))),
        ]);
        let pred = set(&[("c", "Edema", Some(block(5, 2))), ("b", "Edema", None)]);
        let out = run(&gt, &pred, params(Metric::Iou, true, NegativePolicy::Zero));
        assert_eq!(out.output.len(), 1);
        assert_eq!(out.manifest.skipped.len(), 2);
        let skipped: Vec<&str> = out
            .manifest
            .skipped
            .iter()
            .map(|f| f.image_id.as_str())
            .collect();
        assert_eq!(skipped, vec!["b", "c"]);
        assert!(out.manifest.skipped[1].error.contains("shape mismatch"));
    }

    #[test]
    fn test_point_predictions() {
        let gt = set(&[
            ("a", "Edema", Some(block(4, 2))),
            ("b", "Edema", Some(block(4, 2))),
            ("c", "Edema", Some(block(4, 2))),
        ]);
        let mut points = PointSet::new();
        points.insert(
            "a".to_string(),
            BTreeMap::from([("Edema".to_string(), vec![[3.0, 3.0], [1.2, 0.6]])]),
        );
        points.insert(
            "b".to_string(),
            BTreeMap::from([("Edema".to_string(), vec![[2.0, 2.0]])]),
        );
        let p = params(Metric::HitMiss, true, NegativePolicy::Zero);
        let out = LocalizationEval::new(&gt, Prediction::Points(&points), p.clone())
            .evaluate()
            .unwrap();
        let values: Vec<f64> = out.output.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 0.0, 0.0]);
        assert_eq!(out.output[2].pred_label, 0);

        let iou = LocalizationEval::new(
            &gt,
            Prediction::Points(&points),
            EvalParams {
                metric: Metric::Iou,
                ..p
            },
        );
        assert!(matches!(iou.evaluate(), Err(Error::InvalidArgument(_))));
    }

    fn unit(image_id: &str, rows: Vec<Vec<f32>>) -> HeatmapUnit {
        let (h, w) = (rows.len() as u32, rows[0].len() as u32);
        HeatmapUnit {
            image_id: image_id.to_string(),
            record: HeatmapRecord {
                map: MapTensor::Plain(rows),
                prob: Probability::Scalar(1.0),
                task: "Edema".to_string(),
                gt: 1,
                cxr_dims: [w, h],
            },
        }
    }

    #[test]
    fn test_tune_threshold_picks_best_candidate() {
        // Normalized values 0.0, 0.25, 0.55, 0.8, 1.0 along a row.
        let u = unit("img", vec![vec![0.0, 0.25, 0.55, 0.8, 1.0]]);
        let gt = set(&[(
            "img",
            "Edema",
            Some(BinaryMask::from_fn(1, 5, |x, _| x >= 2)),
        )]);
        let t = tune_threshold("Edema", &[u.clone()], &gt).unwrap();
        assert_eq!(t.output, Some(0.3));
        assert_eq!(t.manifest.processed, 1);

        let table = tune_thresholds(&[u], &gt, &["Cardiomegaly".to_string(), "Edema".to_string()])
            .unwrap();
        assert_eq!(table.output.len(), 1);
        assert_eq!(table.output["Edema"], 0.3);
    }

    #[test]
    fn test_tune_threshold_reports_unusable_pairs() {
        let row = vec![vec![0.0, 0.25, 0.55, 0.8, 1.0]];
        let units = vec![unit("img", row.clone()), unit("null", row.clone()), unit("small", row)];
        let gt = set(&[
            ("img", "Edema", Some(BinaryMask::from_fn(1, 5, |x, _| x >= 2))),
            ("null", "Edema", None),
            ("small", "Edema", Some(block(2, 1))),
        ]);
        let batch = tune_thresholds(&units, &gt, &["Edema".to_string()]).unwrap();
        assert_eq!(batch.output["Edema"], 0.3);
        assert_eq!(batch.manifest.processed, 1);
        let skipped: Vec<&str> = batch
            .manifest
            .skipped
            .iter()
            .map(|f| f.image_id.as_str())
            .collect();
        assert_eq!(skipped, vec!["null", "small"]);

        // Heatmaps of tasks that are not tuned are accounted for too.
        let batch = tune_thresholds(&units, &gt, &["Cardiomegaly".to_string()]).unwrap();
        assert!(batch.output.is_empty());
        assert_eq!(batch.manifest.filtered, 3);
    }

    #[test]
    fn test_tune_threshold_requires_ground_truth() {
        let u = unit("img", vec![vec![0.0, 1.0]]);
        let err = tune_threshold("Edema", &[u], &SegmentationSet::new()).unwrap_err();
        assert!(matches!(err, Error::MissingGroundTruth { .. }));
    }

    #[test]
    fn test_peak_points() {
        let units = vec![
            unit("a", vec![vec![0.0, 0.1], vec![0.9, 0.2]]),
            unit("a", vec![vec![0.0, 0.1], vec![0.9, 0.2]]),
        ];
        let batch = peak_points(&units);
        assert_eq!(batch.output["a"]["Edema"], vec![[0.0, 1.0]]);
        assert_eq!(batch.manifest.skipped.len(), 1);
    }

    #[test]
    fn test_count_segmentations() {
        let s = set(&[
            ("a", "Edema", Some(block(4, 2))),
            ("b", "Edema", Some(BinaryMask::zeros(4, 4))),
            ("c", "Edema", Some(block(4, 1))),
            ("c", "Cardiomegaly", None),
        ]);
        let tasks = vec!["Cardiomegaly".to_string(), "Edema".to_string()];
        let batch = count_segmentations(&s, &tasks);
        assert_eq!(batch.output[0].n_segs, 0);
        assert_eq!(batch.output[1].n_segs, 2);
        assert_eq!(batch.manifest.skipped.len(), 1);
    }

    #[test]
    fn test_precision_recall_specificity() {
        let gt = set(&[
            ("tp", "Edema", Some(block(4, 2))),
            ("fn", "Edema", Some(block(4, 2))),
            ("fp", "Edema", Some(BinaryMask::zeros(4, 4))),
            ("tn", "Edema", Some(BinaryMask::zeros(4, 4))),
            ("tn2", "Edema", Some(BinaryMask::zeros(4, 4))),
        ]);
        let pred = set(&[
            ("tp", "Edema", Some(block(4, 1))),
            ("fp", "Edema", Some(block(4, 3))),
            ("tn", "Edema", Some(BinaryMask::zeros(4, 4))),
        ]);
        let tasks = vec!["Edema".to_string(), "Lung Lesion".to_string()];
        let batch = precision_recall_specificity(&gt, &pred, &tasks);
        let edema = &batch.output[0];
        assert_eq!(edema.precision, Some(0.5));
        assert_eq!(edema.recall, Some(0.5));
        assert_eq!(edema.specificity, Some(2.0 / 3.0));

        let lesion = &batch.output[1];
        assert_eq!(lesion.precision, None);
        assert_eq!(batch.manifest.skipped.len(), 5);
    }
}
