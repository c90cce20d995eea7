//! JSON and CSV artifacts: segmentation sets, annotations, heatmap records,
//! threshold tables and the result tables of an evaluation run.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bootstrap::PctDecrease;
use crate::error::{Error, Result};
use crate::eval::{LabelStats, SegmentCount};
use crate::params::{Metric, ThresholdTable};
use crate::types::{
    AnnotationSet, Batch, HeatmapRecord, HeatmapUnit, ImageAnnotation, Manifest, MetricRecord,
    PointSet, SegmentationSet, TaskBootstrap, UniqueKeys,
};

/// File name suffix of a serialized heatmap record: `<image_id>_<task>_map.json`.
pub const HEATMAP_SUFFIX: &str = "_map.json";

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

pub fn read_segmentations(path: &Path) -> Result<SegmentationSet> {
    read_json(path)
}

pub fn write_segmentations(path: &Path, set: &SegmentationSet) -> Result<()> {
    write_json(path, set)
}

/// An image id listed twice is a format error.
pub fn read_annotations(path: &Path) -> Result<AnnotationSet> {
    let images: UniqueKeys<ImageAnnotation> = read_json(path)?;
    Ok(images.0)
}

pub fn read_points(path: &Path) -> Result<PointSet> {
    read_json(path)
}

pub fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    write_json(path, manifest)
}

/// Load every heatmap record below `dir`, recursively.
///
/// Files not ending in [`HEATMAP_SUFFIX`] are ignored. A record that cannot be
/// parsed, or whose file name does not end in `_<task>`, is reported in the
/// manifest; an unreadable directory aborts.
pub fn read_heatmap_dir(dir: &Path) -> Result<Batch<Vec<HeatmapUnit>>> {
    let mut paths = Vec::new();
    collect_heatmap_paths(dir, &mut paths)?;
    paths.sort();

    let mut units = Vec::with_capacity(paths.len());
    let mut manifest = Manifest::default();
    for path in &paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let stem = name.strip_suffix(HEATMAP_SUFFIX).unwrap_or(name);
        match read_heatmap(path, stem) {
            Ok(unit) => {
                manifest.processed += 1;
                units.push(unit);
            }
            Err(e) => manifest.skip(stem, "", &e),
        }
    }
    info!(
        dir = %dir.display(),
        records = units.len(),
        skipped = manifest.skipped.len(),
        "loaded heatmaps"
    );
    Ok(Batch {
        output: units,
        manifest,
    })
}

fn collect_heatmap_paths(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_heatmap_paths(&path, out)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(HEATMAP_SUFFIX))
        {
            out.push(path);
        } else {
            debug!(path = %path.display(), "not a heatmap record");
        }
    }
    Ok(())
}

fn read_heatmap(path: &Path, stem: &str) -> Result<HeatmapUnit> {
    let record: HeatmapRecord = read_json(path)?;
    let image_id = stem
        .strip_suffix(record.task.as_str())
        .and_then(|s| s.strip_suffix('_'))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::format(format!(
                "file name '{}' does not end in the record's task '{}'",
                stem, record.task
            ))
        })?;
    Ok(HeatmapUnit {
        image_id: image_id.to_string(),
        record,
    })
}

fn csv_reader(path: &Path) -> Result<csv::Reader<File>> {
    Ok(csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[derive(Debug, Serialize, Deserialize)]
struct ThresholdRow {
    task: String,
    threshold: f64,
}

/// Read a `task, threshold` table. A task listed twice is a format error.
pub fn read_thresholds(path: &Path) -> Result<ThresholdTable> {
    let mut rdr = csv_reader(path)?;
    let mut table = ThresholdTable::new();
    for row in rdr.deserialize() {
        let row: ThresholdRow = row?;
        if table.insert(row.task.clone(), row.threshold).is_some() {
            return Err(Error::format(format!(
                "task '{}' listed twice in {}",
                row.task,
                path.display()
            )));
        }
    }
    Ok(table)
}

pub fn write_thresholds(path: &Path, table: &ThresholdTable) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for (task, &threshold) in table {
        wtr.serialize(ThresholdRow {
            task: task.clone(),
            threshold,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CutoffRow {
    task: String,
    prob_threshold: f64,
    #[serde(rename = "mIoU")]
    miou: f64,
}

/// Resolve a probability-cutoff sweep to one cutoff per task: the
/// `prob_threshold` of the first row with the highest `mIoU`.
pub fn read_prob_cutoffs(path: &Path) -> Result<ThresholdTable> {
    let mut rdr = csv_reader(path)?;
    let mut best: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for row in rdr.deserialize() {
        let row: CutoffRow = row?;
        match best.get_mut(&row.task) {
            Some(slot) if row.miou > slot.1 => *slot = (row.prob_threshold, row.miou),
            Some(_) => {}
            None => {
                best.insert(row.task, (row.prob_threshold, row.miou));
            }
        }
    }
    Ok(best.into_iter().map(|(task, (cutoff, _))| (task, cutoff)).collect())
}

/// Per-image table: `img_id, task, <metric>`.
pub fn write_metric_records(path: &Path, records: &[MetricRecord], metric: Metric) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(["img_id", "task", metric.column_name()])?;
    for r in records {
        let value = r.value.to_string();
        wtr.write_record([r.image_id.as_str(), r.task.as_str(), value.as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    task: &'a str,
    lower: f64,
    mean: f64,
    upper: f64,
}

/// Interval table: `task, lower, mean, upper`, rounded to three decimals.
pub fn write_summary(path: &Path, results: &[TaskBootstrap]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for b in results {
        wtr.serialize(SummaryRow {
            task: &b.task,
            lower: round3(b.summary.lower),
            mean: round3(b.summary.mean),
            upper: round3(b.summary.upper),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/// Replicate means, one column per task and one row per replicate.
pub fn write_bootstrap_samples(path: &Path, results: &[TaskBootstrap]) -> Result<()> {
    let rows = results.first().map_or(0, |b| b.samples.len());
    if let Some(b) = results.iter().find(|b| b.samples.len() != rows) {
        return Err(Error::shape((rows, 1), (b.samples.len(), 1)));
    }
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record(results.iter().map(|b| b.task.as_str()))?;
    for i in 0..rows {
        wtr.write_record(results.iter().map(|b| b.samples[i].to_string()))?;
    }
    wtr.flush()?;
    Ok(())
}

/// Read a replicate table written by [`write_bootstrap_samples`]. An unnamed
/// leading index column is ignored.
pub fn read_bootstrap_samples(path: &Path) -> Result<BTreeMap<String, Vec<f64>>> {
    let mut rdr = csv_reader(path)?;
    let headers = rdr.headers()?.clone();
    let mut samples: BTreeMap<String, Vec<f64>> = headers
        .iter()
        .filter(|h| !h.is_empty())
        .map(|h| (h.to_string(), Vec::new()))
        .collect();
    if samples.len() != headers.iter().filter(|h| !h.is_empty()).count() {
        return Err(Error::format(format!(
            "duplicate task column in {}",
            path.display()
        )));
    }
    for record in rdr.records() {
        let record = record?;
        for (task, field) in headers.iter().zip(record.iter()) {
            let Some(column) = samples.get_mut(task) else {
                continue;
            };
            let v: f64 = field.parse().map_err(|_| {
                Error::format(format!("bad replicate value '{}' for task '{}'", field, task))
            })?;
            column.push(v);
        }
    }
    Ok(samples)
}

#[derive(Debug, Serialize)]
struct PctRow<'a> {
    task: &'a str,
    pct_decrease_lower: f64,
    pct_decrease_mean: f64,
    pct_decrease_upper: f64,
}

pub fn write_pct_decrease(path: &Path, rows: &[PctDecrease]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for r in rows {
        wtr.serialize(PctRow {
            task: &r.task,
            pct_decrease_lower: round3(r.lower),
            pct_decrease_mean: round3(r.mean),
            pct_decrease_upper: round3(r.upper),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_segment_counts(path: &Path, counts: &[SegmentCount]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for c in counts {
        wtr.serialize(c)?;
    }
    wtr.flush()?;
    Ok(())
}

/// `task, precision, recall, specificity`; undefined ratios are left empty.
pub fn write_label_stats(path: &Path, stats: &[LabelStats]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for s in stats {
        wtr.serialize(s)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CiSummary;

    fn bootstrap(task: &str, samples: Vec<f64>) -> TaskBootstrap {
        TaskBootstrap {
            task: task.to_string(),
            summary: CiSummary {
                lower: 0.12345,
                mean: 0.5,
                upper: 0.98765,
            },
            samples,
        }
    }

    #[test]
    fn test_heatmap_dir_recurses_and_names_units() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("batch1");
        fs::create_dir(&nested).unwrap();
        let record = r#"{"map": [[0.0, 1.0]], "prob": 0.5, "task": "Lung Lesion", "cxr_dims": [2, 1]}"#;
        fs::write(
            nested.join("patient1_study1_view1_frontal_Lung Lesion_map.json"),
            record,
        )
        .unwrap();
        fs::write(dir.path().join("img2_Edema_map.json"), record).unwrap();
        fs::write(dir.path().join("img3_Edema_map.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let batch = read_heatmap_dir(dir.path()).unwrap();
        assert_eq!(batch.output.len(), 1);
        assert_eq!(batch.output[0].image_id, "patient1_study1_view1_frontal");
        assert_eq!(batch.output[0].record.task, "Lung Lesion");
        assert_eq!(batch.manifest.processed, 1);
        // img2 names Edema but holds a Lung Lesion record; img3 is truncated.
        assert_eq!(batch.manifest.skipped.len(), 2);
        assert_eq!(batch.manifest.skipped[0].image_id, "img2_Edema");

        assert!(read_heatmap_dir(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_segmentations_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.json");
        let mut set = SegmentationSet::new();
        let mask = crate::mask::BinaryMask::from_fn(3, 3, |x, y| x == y);
        set.insert("img1", "Edema", Some(mask.encode())).unwrap();
        set.insert("img1", "Atelectasis", None).unwrap();
        write_segmentations(&path, &set).unwrap();
        assert_eq!(read_segmentations(&path).unwrap(), set);

        fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(read_segmentations(&path), Err(Error::Json(_))));
    }

    #[test]
    fn test_annotations_reject_repeated_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann.json");
        fs::write(
            &path,
            r#"{"img1": {"img_size": [4, 4]}, "img2": {"img_size": [2, 2]}}"#,
        )
        .unwrap();
        assert_eq!(read_annotations(&path).unwrap().len(), 2);

        fs::write(
            &path,
            r#"{"img1": {"img_size": [4, 4]}, "img1": {"img_size": [2, 2]}}"#,
        )
        .unwrap();
        let err = read_annotations(&path).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().contains("duplicate key 'img1'"));
    }

    #[test]
    fn test_threshold_table_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thresholds.csv");
        let table = ThresholdTable::from([
            ("Edema".to_string(), 0.3),
            ("Cardiomegaly".to_string(), 0.6),
        ]);
        write_thresholds(&path, &table).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("task,threshold\nCardiomegaly,0.6\n"));
        assert_eq!(read_thresholds(&path).unwrap(), table);

        fs::write(&path, "task,threshold\nEdema,0.3\nEdema,0.4\n").unwrap();
        assert!(matches!(read_thresholds(&path), Err(Error::Format(_))));
    }

    #[test]
    fn test_prob_cutoffs_pick_first_best() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cutoffs.csv");
        fs::write(
            &path,
            "task,prob_threshold,mIoU,n\n\
             Edema,0.1,0.20,5\n\
             Edema,0.2,0.35,5\n\
             Edema,0.3,0.35,5\n\
             Cardiomegaly, 0.5 ,0.10,2\n",
        )
        .unwrap();
        let cutoffs = read_prob_cutoffs(&path).unwrap();
        assert_eq!(cutoffs["Edema"], 0.2);
        assert_eq!(cutoffs["Cardiomegaly"], 0.5);
    }

    #[test]
    fn test_metric_and_summary_tables() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![MetricRecord {
            image_id: "img1".to_string(),
            task: "Edema".to_string(),
            value: 0.25,
            gt_label: 1,
            pred_label: 1,
        }];
        let metric_path = dir.path().join("iou.csv");
        write_metric_records(&metric_path, &records, Metric::Iou).unwrap();
        assert_eq!(
            fs::read_to_string(&metric_path).unwrap(),
            "img_id,task,iou\nimg1,Edema,0.25\n"
        );

        let summary_path = dir.path().join("summary.csv");
        write_summary(&summary_path, &[bootstrap("Edema", vec![0.5])]).unwrap();
        assert_eq!(
            fs::read_to_string(&summary_path).unwrap(),
            "task,lower,mean,upper\nEdema,0.123,0.5,0.988\n"
        );
    }

    #[test]
    fn test_bootstrap_samples_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.csv");
        let results = vec![
            bootstrap("Edema", vec![0.1, 0.2, 0.3]),
            bootstrap("Lung Lesion", vec![0.4, 0.5, 0.6]),
        ];
        write_bootstrap_samples(&path, &results).unwrap();
        let back = read_bootstrap_samples(&path).unwrap();
        assert_eq!(back["Edema"], vec![0.1, 0.2, 0.3]);
        assert_eq!(back["Lung Lesion"], vec![0.4, 0.5, 0.6]);

        let ragged = vec![bootstrap("Edema", vec![0.1]), bootstrap("Lung Lesion", vec![])];
        assert!(matches!(
            write_bootstrap_samples(&path, &ragged),
            Err(Error::ShapeMismatch { .. })
        ));

        fs::write(&path, ",Edema\n0,0.5\n1,0.7\n").unwrap();
        let indexed = read_bootstrap_samples(&path).unwrap();
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed["Edema"], vec![0.5, 0.7]);

        fs::write(&path, "Edema\nabc\n").unwrap();
        assert!(matches!(read_bootstrap_samples(&path), Err(Error::Format(_))));
    }

    #[test]
    fn test_pct_and_stats_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pct_path = dir.path().join("pct.csv");
        write_pct_decrease(
            &pct_path,
            &[PctDecrease {
                task: "Edema".to_string(),
                lower: 10.0,
                mean: 12.34567,
                upper: 15.0,
            }],
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&pct_path).unwrap(),
            "task,pct_decrease_lower,pct_decrease_mean,pct_decrease_upper\nEdema,10.0,12.346,15.0\n"
        );

        let stats_path = dir.path().join("prs.csv");
        write_label_stats(
            &stats_path,
            &[LabelStats {
                task: "Edema".to_string(),
                precision: Some(0.5),
                recall: None,
                specificity: Some(1.0),
            }],
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&stats_path).unwrap(),
            "task,precision,recall,specificity\nEdema,0.5,,1.0\n"
        );

        let counts_path = dir.path().join("n_segs.csv");
        write_segment_counts(
            &counts_path,
            &[SegmentCount {
                task: "Edema".to_string(),
                n_segs: 3,
            }],
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&counts_path).unwrap(),
            "task,n_segs\nEdema,3\n"
        );
    }
}
