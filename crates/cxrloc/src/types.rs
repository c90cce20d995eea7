use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};
use crate::heatmap::Heatmap;
use crate::mask;
use crate::params::CHEXPERT_TASKS;

/// Run-length encoding for masks.
#[derive(Debug, Clone, PartialEq)]
pub struct Rle {
    pub h: u32,
    pub w: u32,
    /// Run counts: alternating runs of 0s and 1s, starting with 0s.
    pub counts: Vec<u32>,
}

impl Rle {
    /// Check that the runs cover the `h x w` canvas exactly.
    pub fn validate(&self) -> Result<()> {
        let total: u64 = self.counts.iter().map(|&c| c as u64).sum();
        let n = (self.h as u64) * (self.w as u64);
        if total != n {
            return Err(Error::format(format!(
                "runs cover {} pixels but the canvas is {}x{}",
                total, self.h, self.w
            )));
        }
        Ok(())
    }
}

/// A compressed mask as stored in segmentation JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedSegmentation {
    /// `[h, w]`
    pub size: [u32; 2],
    pub counts: String,
}

impl EncodedSegmentation {
    pub fn height(&self) -> u32 {
        self.size[0]
    }

    pub fn width(&self) -> u32 {
        self.size[1]
    }

    pub fn to_rle(&self) -> Result<Rle> {
        mask::rle_from_string(&self.counts, self.size[0], self.size[1])
    }
}

impl From<&Rle> for EncodedSegmentation {
    fn from(rle: &Rle) -> Self {
        EncodedSegmentation {
            size: [rle.h, rle.w],
            counts: mask::rle_to_string(rle),
        }
    }
}

/// Encoded masks keyed by image id then task.
///
/// A `None` entry records a mask that could not be built; an absent key means
/// the pair was never produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentationSet {
    #[serde(deserialize_with = "unique_entries")]
    images: BTreeMap<String, TaskMasks>,
}

impl SegmentationSet {
    pub fn new() -> Self {
        SegmentationSet::default()
    }

    /// Add an entry. An existing `(image_id, task)` pair is never overwritten.
    pub fn insert(
        &mut self,
        image_id: &str,
        task: &str,
        seg: Option<EncodedSegmentation>,
    ) -> Result<()> {
        let tasks = self.images.entry(image_id.to_string()).or_default();
        if tasks.contains_key(task) {
            return Err(Error::DuplicateEntry {
                image_id: image_id.to_string(),
                task: task.to_string(),
            });
        }
        tasks.insert(task.to_string(), seg);
        Ok(())
    }

    /// `None` when the pair is absent, `Some(None)` when it is present but null.
    pub fn get(&self, image_id: &str, task: &str) -> Option<Option<&EncodedSegmentation>> {
        self.images
            .get(image_id)
            .and_then(|tasks| tasks.get(task))
            .map(Option::as_ref)
    }

    pub fn tasks(&self, image_id: &str) -> Option<&BTreeMap<String, Option<EncodedSegmentation>>> {
        self.images.get(image_id)
    }

    pub fn contains_image(&self, image_id: &str) -> bool {
        self.images.contains_key(image_id)
    }

    pub fn image_ids(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }

    /// All entries in `(image_id, task)` order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, Option<&EncodedSegmentation>)> {
        self.images.iter().flat_map(|(image_id, tasks)| {
            tasks
                .iter()
                .map(move |(task, seg)| (image_id.as_str(), task.as_str(), seg.as_ref()))
        })
    }

    /// Number of images.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

type TaskMasks = BTreeMap<String, Option<EncodedSegmentation>>;

fn unique_entries<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, TaskMasks>, D::Error>
where
    D: Deserializer<'de>,
{
    let images = UniqueKeys::<UniqueKeys<Option<EncodedSegmentation>>>::deserialize(deserializer)?;
    Ok(images.0.into_iter().map(|(id, tasks)| (id, tasks.0)).collect())
}

/// A JSON object read into a map, failing on a key that appears twice
/// instead of keeping the last value.
pub(crate) struct UniqueKeys<V>(pub(crate) BTreeMap<String, V>);

impl<'de, V: Deserialize<'de>> Deserialize<'de> for UniqueKeys<V> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct UniqueKeysVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for UniqueKeysVisitor<V> {
            type Value = UniqueKeys<V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map with unique keys")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut map = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    match map.entry(key) {
                        Entry::Occupied(e) => {
                            return Err(de::Error::custom(format!("duplicate key '{}'", e.key())))
                        }
                        Entry::Vacant(e) => {
                            e.insert(value);
                        }
                    }
                }
                Ok(UniqueKeys(map))
            }
        }

        deserializer.deserialize_map(UniqueKeysVisitor(PhantomData))
    }
}

/// A polygon as a list of `[x, y]` pixel coordinates.
pub type Polygon = Vec<[f64; 2]>;

/// Human annotations for one image: the canvas size plus a polygon list per task.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ImageAnnotation {
    /// `[h, w]`
    pub img_size: [u32; 2],
    /// Raw polygon lists, parsed lazily so a bad task does not sink the image.
    #[serde(flatten)]
    pub tasks: BTreeMap<String, serde_json::Value>,
}

impl ImageAnnotation {
    /// Polygons for `task`; an unannotated task has none.
    pub fn polygons(&self, task: &str) -> Result<Vec<Polygon>> {
        match self.tasks.get(task) {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(value) => Vec::<Polygon>::deserialize(value).map_err(|e| {
                Error::format(format!("bad polygon list for task '{}': {}", task, e))
            }),
        }
    }
}

/// Annotation JSON keyed by image id.
pub type AnnotationSet = BTreeMap<String, ImageAnnotation>;

/// Discrete annotation points keyed by image id then task.
pub type PointSet = BTreeMap<String, BTreeMap<String, Vec<[f64; 2]>>>;

/// Classifier output attached to a heatmap: a single probability or one per
/// CheXpert label.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Probability {
    Scalar(f64),
    PerTask(Vec<f64>),
}

impl Probability {
    /// The probability for `task`.
    pub fn resolve(&self, task: &str) -> Result<f64> {
        match self {
            Probability::Scalar(p) => Ok(*p),
            Probability::PerTask(v) if v.len() == 1 => Ok(v[0]),
            Probability::PerTask(v) if v.len() == CHEXPERT_TASKS.len() => {
                let idx = CHEXPERT_TASKS
                    .iter()
                    .position(|&t| t == task)
                    .ok_or_else(|| {
                        Error::format(format!("task '{}' is not a CheXpert label", task))
                    })?;
                Ok(v[idx])
            }
            Probability::PerTask(v) => Err(Error::format(format!(
                "probability vector has {} entries, expected 1 or {}",
                v.len(),
                CHEXPERT_TASKS.len()
            ))),
        }
    }
}

/// Nested saliency tensor as serialized: `(1, 1, H, W)`, `(1, H, W)` or `(H, W)`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MapTensor {
    Batched(Vec<Vec<Vec<Vec<f32>>>>),
    Channel(Vec<Vec<Vec<f32>>>),
    Plain(Vec<Vec<f32>>),
}

impl MapTensor {
    /// Squeeze the leading singleton axes into a 2-D heatmap.
    pub fn to_heatmap(&self) -> Result<Heatmap> {
        let rows = match self {
            MapTensor::Plain(rows) => rows,
            MapTensor::Channel(c) => single(c, "channel")?,
            MapTensor::Batched(b) => single(single(b, "batch")?, "channel")?,
        };
        Heatmap::from_rows(rows)
    }
}

fn single<'a, T>(axis: &'a [T], name: &str) -> Result<&'a T> {
    match axis {
        [only] => Ok(only),
        _ => Err(Error::format(format!(
            "heatmap {} axis has length {}, expected 1",
            name,
            axis.len()
        ))),
    }
}

/// A saliency map for one (image, task) pair as written by the model runner.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HeatmapRecord {
    pub map: MapTensor,
    pub prob: Probability,
    pub task: String,
    #[serde(default)]
    pub gt: u8,
    /// `[w, h]` of the source radiograph.
    pub cxr_dims: [u32; 2],
}

impl HeatmapRecord {
    /// Target canvas as `(h, w)`.
    pub fn canvas(&self) -> (u32, u32) {
        (self.cxr_dims[1], self.cxr_dims[0])
    }
}

/// A heatmap record together with the image it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapUnit {
    pub image_id: String,
    pub record: HeatmapRecord,
}

/// One evaluated (image, task) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub image_id: String,
    pub task: String,
    pub value: f64,
    pub gt_label: u8,
    pub pred_label: u8,
}

/// A confidence interval around a point estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CiSummary {
    pub lower: f64,
    pub mean: f64,
    pub upper: f64,
}

/// Bootstrap result for one task: the interval plus the replicate means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBootstrap {
    pub task: String,
    pub summary: CiSummary,
    pub samples: Vec<f64>,
}

/// A unit that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub image_id: String,
    pub task: String,
    pub error: String,
}

/// Accounting for a batch run, so that no unit disappears silently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub processed: usize,
    /// Units deliberately left out (negative ground truth, unconfigured task).
    pub filtered: usize,
    pub skipped: Vec<UnitFailure>,
}

impl Manifest {
    pub fn skip(&mut self, image_id: &str, task: &str, error: &Error) {
        tracing::warn!(image_id, task, %error, "skipping unit");
        self.skipped.push(UnitFailure {
            image_id: image_id.to_string(),
            task: task.to_string(),
            error: error.to_string(),
        });
    }

    /// Carry over the failures of an earlier stage, such as heatmap files
    /// that could not be read, without counting its units twice.
    pub fn merge_skipped(&mut self, earlier: Manifest) {
        self.skipped.extend(earlier.skipped);
    }

    pub fn merge(&mut self, other: Manifest) {
        self.processed += other.processed;
        self.filtered += other.filtered;
        self.skipped.extend(other.skipped);
    }
}

/// Best-effort output of a batch together with its manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub output: T,
    pub manifest: Manifest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segmentation_set_json_shape() {
        let json = r#"{
            "img1": {
                "Edema": {"size": [2, 2], "counts": "04"},
                "Cardiomegaly": null
            }
        }"#;
        let set: SegmentationSet = serde_json::from_str(json).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.get("img1", "Edema").unwrap().unwrap().counts,
            "04".to_string()
        );
        assert_eq!(set.get("img1", "Cardiomegaly"), Some(None));
        assert_eq!(set.get("img1", "Edema2"), None);
        assert_eq!(set.get("img2", "Edema"), None);

        let back: serde_json::Value = serde_json::to_value(&set).unwrap();
        assert!(back["img1"]["Cardiomegaly"].is_null());
        assert_eq!(back["img1"]["Edema"]["size"][1], 2);
    }

    #[test]
    fn test_segmentation_json_rejects_repeated_keys() {
        let image = r#"{
            "img1": {"Edema": null},
            "img1": {"Cardiomegaly": null}
        }"#;
        let err = serde_json::from_str::<SegmentationSet>(image).unwrap_err();
        assert!(err.to_string().contains("duplicate key 'img1'"));

        let task = r#"{"img1": {"Edema": null, "Edema": {"size": [1, 1], "counts": "1"}}}"#;
        let err = serde_json::from_str::<SegmentationSet>(task).unwrap_err();
        assert!(err.to_string().contains("duplicate key 'Edema'"));
    }

    #[test]
    fn test_segmentation_set_rejects_duplicates() {
        let mut set = SegmentationSet::new();
        set.insert("img1", "Edema", None).unwrap();
        set.insert("img1", "Cardiomegaly", None).unwrap();
        let err = set.insert("img1", "Edema", None).unwrap_err();
        assert!(matches!(err, Error::DuplicateEntry { .. }));
        assert_eq!(set.iter().count(), 2);
    }

    #[test]
    fn test_rle_validate() {
        let ok = Rle {
            h: 2,
            w: 3,
            counts: vec![1, 4, 1],
        };
        assert!(ok.validate().is_ok());
        let short = Rle {
            h: 2,
            w: 3,
            counts: vec![1, 4],
        };
        assert!(matches!(short.validate(), Err(Error::Format(_))));
    }

    #[test]
    fn test_probability_resolution() {
        assert_eq!(Probability::Scalar(0.3).resolve("Edema").unwrap(), 0.3);
        assert_eq!(Probability::PerTask(vec![0.7]).resolve("Edema").unwrap(), 0.7);

        let per_task: Vec<f64> = (0..14).map(|i| i as f64 / 100.0).collect();
        let p = Probability::PerTask(per_task);
        assert_eq!(p.resolve("No Finding").unwrap(), 0.0);
        assert_eq!(p.resolve("Edema").unwrap(), 0.05);
        assert_eq!(p.resolve("Support Devices").unwrap(), 0.13);
        assert!(p.resolve("Not A Task").is_err());

        assert!(Probability::PerTask(vec![0.1, 0.2]).resolve("Edema").is_err());
    }

    #[test]
    fn test_heatmap_record_squeezes_axes() {
        let json = r#"{
            "map": [[[[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]]]],
            "prob": 0.9,
            "task": "Edema",
            "gt": 1,
            "cxr_img": [[[0.5]]],
            "cxr_dims": [6, 4]
        }"#;
        let record: HeatmapRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.canvas(), (4, 6));
        let hm = record.map.to_heatmap().unwrap();
        assert_eq!((hm.height(), hm.width()), (2, 3));
        assert_eq!(hm.get(2, 1), 5.0);

        let plain: MapTensor = serde_json::from_str("[[1.0, 2.0]]").unwrap();
        assert_eq!(plain.to_heatmap().unwrap().width(), 2);

        let two_channels: MapTensor = serde_json::from_str("[[[1.0]], [[2.0]]]").unwrap();
        assert!(two_channels.to_heatmap().is_err());
    }

    #[test]
    fn test_annotation_polygons() {
        let json = r#"{
            "img1": {
                "img_size": [4, 4],
                "Edema": [[[0, 0], [0, 2], [2, 2]]],
                "Cardiomegaly": [[["a", 1]]]
            }
        }"#;
        let set: AnnotationSet = serde_json::from_str(json).unwrap();
        let ann = &set["img1"];
        assert_eq!(ann.img_size, [4, 4]);
        assert_eq!(ann.polygons("Edema").unwrap()[0].len(), 3);
        assert!(ann.polygons("Lung Lesion").unwrap().is_empty());
        assert!(matches!(
            ann.polygons("Cardiomegaly"),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_manifest_merge() {
        let mut a = Manifest {
            processed: 2,
            ..Default::default()
        };
        let mut b = Manifest::default();
        b.filtered = 1;
        b.skip("img", "Edema", &Error::format("bad"));
        a.merge(b);
        assert_eq!((a.processed, a.filtered, a.skipped.len()), (2, 1, 1));
        assert_eq!(a.skipped[0].task, "Edema");
    }
}
