use thiserror::Error;

/// Failures raised by the star analysis core.
///
/// Per-star conditions (missing PSF, star below threshold, already round)
/// are not errors: they are reported as skip outcomes and the loop
/// continues. A cooperative abort is reported through `RunOutcome`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StarError {
    #[error("No data provided (empty dataset)")]
    EmptyDataset,

    #[error("Degenerate dataset: {0}")]
    DegenerateDataset(String),

    #[error("Star detection failed: {0}")]
    DetectionFailed(String),

    #[error("PSF fit failed for star {star}: {reason}")]
    PsfFitFailed { star: String, reason: String },

    #[error("Invalid structure size {0} (supported: 5, 7, 9)")]
    InvalidStructureSize(u32),

    #[error("Invalid threshold specification for '{key}': {reason}")]
    InvalidThreshold { key: String, reason: String },

    #[error("Unknown feature: {0}")]
    UnknownFeature(String),

    #[error("Image operator '{operator}' failed on view {view}: {reason}")]
    OperatorFailed {
        operator: String,
        view: String,
        reason: String,
    },

    #[error("Statistics not available: run star analysis first")]
    NotAnalyzed,

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StarError>;

impl From<std::io::Error> for StarError {
    fn from(e: std::io::Error) -> Self {
        StarError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StarError {
    fn from(e: serde_json::Error) -> Self {
        StarError::Io(e.to_string())
    }
}
