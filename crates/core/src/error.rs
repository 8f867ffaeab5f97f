use serde::{Deserialize, Serialize};

/// Errors produced by region parsing, bounds resolution, extraction and
/// metadata lookup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// Client input could not be turned into a region. `index` points at the
    /// offending token of the sequence that was being parsed.
    #[error("Malformed region at token {index}: {message}")]
    MalformedRegion { index: usize, message: String },

    #[error("Region not covered by any image extension: {0}")]
    RegionNotCovered(String),

    #[error("Image storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Corrupt image: {0}")]
    CorruptImage(String),

    #[error("Dataset not found: {dataset_id} (filter {filter})")]
    DatasetNotFound { dataset_id: String, filter: String },

    #[error("Job cancelled")]
    Cancelled,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn malformed(index: usize, message: impl Into<String>) -> Self {
        CoreError::MalformedRegion {
            index,
            message: message.into(),
        }
    }

    /// Only transient storage failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::StorageUnavailable(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::MalformedRegion { .. } => ErrorKind::MalformedRegion,
            CoreError::RegionNotCovered(_) => ErrorKind::RegionNotCovered,
            CoreError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            CoreError::CorruptImage(_) => ErrorKind::CorruptImage,
            CoreError::DatasetNotFound { .. } => ErrorKind::DatasetNotFound,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::InvalidData => {
                CoreError::CorruptImage(err.to_string())
            }
            _ => CoreError::StorageUnavailable(err.to_string()),
        }
    }
}

/// Stable error classification exposed in job status payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    MalformedRegion,
    RegionNotCovered,
    StorageUnavailable,
    CorruptImage,
    DatasetNotFound,
    Cancelled,
    Validation,
    Internal,
}
