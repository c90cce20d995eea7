//! Batch producers: annotation polygons and saliency heatmaps to segmentation sets.
//!
//! Every (image, task) unit is independent. Units are converted in parallel and
//! collected in input order, then folded into the output set one by one so
//! that failures and duplicates land in the manifest instead of aborting.

use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::Result;
use crate::heatmap::{self, ThresholdParams};
use crate::params::SegmentParams;
use crate::raster;
use crate::types::{
    AnnotationSet, Batch, EncodedSegmentation, HeatmapUnit, ImageAnnotation, Manifest,
    SegmentationSet,
};

/// Rasterize every annotated image for every configured task.
///
/// A task with no polygons becomes an all-zero mask. A task whose polygon
/// list cannot be read becomes a `null` entry and is reported as skipped.
pub fn annotations_to_segmentations(
    annotations: &AnnotationSet,
    params: &SegmentParams,
) -> Batch<SegmentationSet> {
    let units: Vec<(&str, &ImageAnnotation, &str)> = annotations
        .iter()
        .flat_map(|(image_id, ann)| {
            params
                .tasks
                .iter()
                .map(move |task| (image_id.as_str(), ann, task.as_str()))
        })
        .collect();

    let results: Vec<(&str, &str, Result<EncodedSegmentation>)> = units
        .par_iter()
        .map(|&(image_id, ann, task)| (image_id, task, annotation_mask(ann, task, params)))
        .collect();

    let batch = fold_units(results);
    info!(
        images = batch.output.len(),
        processed = batch.manifest.processed,
        skipped = batch.manifest.skipped.len(),
        "rasterized annotations"
    );
    batch
}

fn annotation_mask(
    ann: &ImageAnnotation,
    task: &str,
    params: &SegmentParams,
) -> Result<EncodedSegmentation> {
    let polygons = ann.polygons(task)?;
    if polygons.is_empty() {
        debug!(task, "no polygons, emitting an empty mask");
    }
    let [h, w] = ann.img_size;
    let mask = raster::polygons_to_mask(&polygons, h, w, params.raster)?;
    Ok(mask.encode())
}

/// Threshold every heatmap whose task is configured.
///
/// Each unit uses the task's fixed threshold when a threshold table is given
/// and Otsu's method otherwise, gated by the task's probability cutoff. A
/// repeated (image, task) pair keeps the first unit and reports the rest.
pub fn heatmaps_to_segmentations(
    units: &[HeatmapUnit],
    params: &SegmentParams,
) -> Batch<SegmentationSet> {
    let (wanted, ignored): (Vec<&HeatmapUnit>, Vec<&HeatmapUnit>) = units
        .iter()
        .partition(|u| params.tasks.iter().any(|t| *t == u.record.task));
    for unit in &ignored {
        debug!(image_id = %unit.image_id, task = %unit.record.task, "task not configured");
    }

    let results: Vec<(&str, &str, Result<EncodedSegmentation>)> = wanted
        .par_iter()
        .map(|unit| {
            (
                unit.image_id.as_str(),
                unit.record.task.as_str(),
                heatmap_mask(unit, params),
            )
        })
        .collect();

    let mut batch = fold_units(results);
    batch.manifest.filtered += ignored.len();
    info!(
        images = batch.output.len(),
        processed = batch.manifest.processed,
        filtered = batch.manifest.filtered,
        skipped = batch.manifest.skipped.len(),
        "thresholded heatmaps"
    );
    batch
}

fn heatmap_mask(unit: &HeatmapUnit, params: &SegmentParams) -> Result<EncodedSegmentation> {
    let task = &unit.record.task;
    let threshold = ThresholdParams {
        mode: params.threshold_for(task)?.into(),
        smoothing: params.smoothing,
        prob_cutoff: params.cutoff_for(task)?,
    };
    let mask = heatmap::record_to_mask(&unit.record, &threshold)?;
    Ok(mask.encode())
}

fn fold_units(results: Vec<(&str, &str, Result<EncodedSegmentation>)>) -> Batch<SegmentationSet> {
    let mut output = SegmentationSet::new();
    let mut manifest = Manifest::default();
    for (image_id, task, result) in results {
        let (entry, failure) = match result {
            Ok(seg) => (Some(seg), None),
            Err(e) => (None, Some(e)),
        };
        match (output.insert(image_id, task, entry), failure) {
            (Err(dup), _) => manifest.skip(image_id, task, &dup),
            (Ok(()), Some(e)) => manifest.skip(image_id, task, &e),
            (Ok(()), None) => manifest.processed += 1,
        }
    }
    Batch { output, manifest }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::BinaryMask;
    use crate::params::{ThresholdTable, CHEXPERT_TASKS};
    use crate::types::{HeatmapRecord, MapTensor, Probability};

    fn annotations() -> AnnotationSet {
        serde_json::from_str(
            r#"{
                "img1": {
                    "img_size": [4, 4],
                    "Edema": [[[0, 0], [0, 2], [2, 2], [2, 0]]],
                    "Cardiomegaly": [[[0, 0], [1, 1]], [[3, 3]]]
                },
                "img2": {
                    "img_size": [3, 5],
                    "Edema": "not polygons"
                }
            }"#,
        )
        .unwrap()
    }

    fn params(tasks: &[&str]) -> SegmentParams {
        SegmentParams {
            tasks: tasks.iter().map(|t| t.to_string()).collect(),
            ..SegmentParams::new()
        }
    }

    fn unit(image_id: &str, task: &str, prob: f64) -> HeatmapUnit {
        HeatmapUnit {
            image_id: image_id.to_string(),
            record: HeatmapRecord {
                map: MapTensor::Plain(vec![vec![0.0, 0.2], vec![0.4, 1.0]]),
                prob: Probability::Scalar(prob),
                task: task.to_string(),
                gt: 1,
                cxr_dims: [4, 4],
            },
        }
    }

    #[test]
    fn test_annotations_cover_every_configured_task() {
        let batch = annotations_to_segmentations(
            &annotations(),
            &params(&["Cardiomegaly", "Edema", "Lung Lesion"]),
        );
        let set = &batch.output;

        let edema = BinaryMask::decode(set.get("img1", "Edema").unwrap().unwrap()).unwrap();
        assert_eq!(edema, BinaryMask::from_fn(4, 4, |x, y| x <= 2 && y <= 2));

        let cardio =
            BinaryMask::decode(set.get("img1", "Cardiomegaly").unwrap().unwrap()).unwrap();
        assert!(cardio.get(0, 0) && cardio.get(1, 1) && cardio.get(3, 3));

        let lesion = set.get("img2", "Lung Lesion").unwrap().unwrap();
        assert_eq!(lesion.size, [3, 5]);
        assert!(BinaryMask::decode(lesion).unwrap().is_empty());

        assert_eq!(set.get("img2", "Edema"), Some(None));
        assert_eq!(batch.manifest.processed, 5);
        assert_eq!(batch.manifest.skipped.len(), 1);
        assert_eq!(batch.manifest.skipped[0].image_id, "img2");
    }

    #[test]
    fn test_heatmaps_filter_and_detect_duplicates() {
        let units = vec![
            unit("img1", "Edema", 0.9),
            unit("img1", "Pneumonia", 0.9),
            unit("img1", "Edema", 0.9),
            unit("img2", "Edema", 0.9),
        ];
        let batch = heatmaps_to_segmentations(&units, &params(&["Edema"]));
        assert_eq!(batch.manifest.processed, 2);
        assert_eq!(batch.manifest.filtered, 1);
        assert_eq!(batch.manifest.skipped.len(), 1);
        assert!(batch.manifest.skipped[0].error.contains("duplicate"));
        assert_eq!(batch.output.len(), 2);
        assert!(batch.output.get("img1", "Pneumonia").is_none());
    }

    #[test]
    fn test_heatmaps_use_threshold_and_cutoff_tables() {
        let units = vec![unit("img1", "Edema", 0.3), unit("img2", "Edema", 0.8)];
        let mut p = params(&["Edema"]);
        p.thresholds = Some(ThresholdTable::from([("Edema".to_string(), 0.5)]));
        p.prob_cutoffs = Some(ThresholdTable::from([("Edema".to_string(), 0.5)]));
        let batch = heatmaps_to_segmentations(&units, &p);

        let gated = BinaryMask::decode(batch.output.get("img1", "Edema").unwrap().unwrap()).unwrap();
        assert_eq!(gated.shape(), (4, 4));
        assert!(gated.is_empty());

        let kept = BinaryMask::decode(batch.output.get("img2", "Edema").unwrap().unwrap()).unwrap();
        assert!(kept.get(3, 3));
        assert!(!kept.get(0, 0));
    }

    #[test]
    fn test_missing_table_row_is_a_unit_failure() {
        let units = vec![unit("img1", "Edema", 0.9), unit("img1", "Cardiomegaly", 0.9)];
        let mut p = params(&["Cardiomegaly", "Edema"]);
        p.thresholds = Some(ThresholdTable::from([("Edema".to_string(), 0.5)]));
        let batch = heatmaps_to_segmentations(&units, &p);
        assert_eq!(batch.manifest.processed, 1);
        assert_eq!(batch.manifest.skipped[0].task, "Cardiomegaly");
        assert_eq!(batch.output.get("img1", "Cardiomegaly"), Some(None));
    }

    #[test]
    fn test_per_task_probability_vector() {
        let mut u = unit("img1", "Edema", 0.0);
        let mut probs = vec![0.9; CHEXPERT_TASKS.len()];
        probs[5] = 0.1;
        u.record.prob = Probability::PerTask(probs);
        let mut p = params(&["Edema"]);
        p.prob_cutoffs = Some(ThresholdTable::from([("Edema".to_string(), 0.5)]));
        let batch = heatmaps_to_segmentations(&[u], &p);
        let mask = BinaryMask::decode(batch.output.get("img1", "Edema").unwrap().unwrap()).unwrap();
        assert!(mask.is_empty());
    }
}
