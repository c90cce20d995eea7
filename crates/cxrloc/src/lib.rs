pub mod bootstrap;
pub mod error;
pub mod eval;
pub mod heatmap;
pub mod io;
pub mod mask;
pub mod params;
pub mod raster;
pub mod segment;
pub mod types;

pub use bootstrap::{bootstrap, compare, percentage_decrease, PctDecrease};
pub use error::{Error, Result};
pub use eval::{LocalizationEval, Prediction};
pub use heatmap::{Heatmap, ThresholdMode, ThresholdParams};
pub use mask::BinaryMask;
pub use params::{BootstrapParams, Config, EvalParams, Metric, SegmentParams};
pub use segment::{annotations_to_segmentations, heatmaps_to_segmentations};
pub use types::{
    AnnotationSet, Batch, EncodedSegmentation, HeatmapRecord, HeatmapUnit, Manifest,
    MetricRecord, PointSet, Rle, SegmentationSet,
};
