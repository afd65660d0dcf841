//! Typed errors for the scoring core.
//!
//! Infrastructure plumbing (broker, store, config) uses `anyhow`; these are the
//! cases callers branch on.

use thiserror::Error;

/// Feature extraction failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeatureError {
    /// The member record carries no enrollment date
    #[error("member {member_id} has no enrollment date")]
    MissingEnrollment { member_id: i64 },
}

/// Reasons a training run is rejected or aborted
#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("need at least 2 samples, got {0}")]
    TooFewSamples(usize),

    #[error("{features} feature rows but {labels} labels")]
    LengthMismatch { features: usize, labels: usize },

    #[error("labels contain a single class")]
    SingleClass,

    #[error("label {0} is not 0 or 1")]
    InvalidLabel(u8),

    #[error("training diverged: {0}")]
    Numerical(String),

    #[error("failed to persist model artifact: {0}")]
    Persist(#[from] std::io::Error),

    #[error("failed to encode model artifact: {0}")]
    Encode(#[from] serde_json::Error),
}
