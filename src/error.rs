use thiserror::Error;

use vellum_core::{FormatError, ReadError};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corruption detected: {0}")]
    Corruption(ReadError),

    #[error("store is closed")]
    Closed,

    #[error("{failed} queued write(s) could not be persisted: {last_error}")]
    WriteFailed { failed: u64, last_error: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("format error: {0}")]
    Format(FormatError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<FormatError> for StoreError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::InvalidCollectionName(_) | FormatError::DimensionMismatch { .. } => {
                StoreError::InvalidArgument(err.to_string())
            }
            FormatError::Io(io) => StoreError::Io(io),
            other => StoreError::Format(other),
        }
    }
}

impl From<ReadError> for StoreError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Io(io) => StoreError::Io(io),
            other => StoreError::Corruption(other),
        }
    }
}

impl StoreError {
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption(_))
    }
}
