use thiserror::Error;

/// Errors raised by mask conversion, evaluation, and artifact I/O.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed counts string, heatmap record, polygon, or table.
    #[error("format error: {0}")]
    Format(String),

    /// Two masks (or a heatmap and its canvas) disagree on `(h, w)`.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("no ground truth for image '{image_id}' task '{task}'")]
    MissingGroundTruth { image_id: String, task: String },

    #[error("duplicate entry for image '{image_id}' task '{task}'")]
    DuplicateEntry { image_id: String, task: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub(crate) fn shape(expected: (usize, usize), found: (usize, usize)) -> Self {
        Error::ShapeMismatch { expected, found }
    }
}
