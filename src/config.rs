//! Store configuration
//!
//! Options are plain data so they can be written by hand in JSON:
//!
//! ```json
//! {
//!   "data_path": "/var/lib/notes",
//!   "database_name": "notes",
//!   "vector_dimensionality": 384,
//!   "quantization": "int8",
//!   "initial_file_size_hint": 67108864
//! }
//! ```
//!
//! Everything except the first three keys has a default. Custom quantization
//! functions can only be set from code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vellum_core::{GrowthPolicy, Quantization};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    pub data_path: PathBuf,
    pub database_name: String,
    pub vector_dimensionality: usize,

    #[serde(default)]
    pub quantization: Quantization,

    /// Bytes preallocated for the content and embedding logs; 0 disables
    #[serde(default)]
    pub initial_file_size_hint: u64,

    #[serde(default = "default_free_space_threshold_percent")]
    pub free_space_threshold_percent: u8,

    #[serde(default = "default_growth_increment_percent")]
    pub growth_increment_percent: u32,

    #[serde(default = "default_ingestion_queue_capacity")]
    pub ingestion_queue_capacity: usize,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_writer_idle_timeout_ms")]
    pub writer_idle_timeout_ms: u64,

    #[serde(default = "default_write_retry_attempts")]
    pub write_retry_attempts: u32,
}

fn default_free_space_threshold_percent() -> u8 {
    10
}

fn default_growth_increment_percent() -> u32 {
    50
}

fn default_ingestion_queue_capacity() -> usize {
    1_000_000
}

fn default_flush_interval_ms() -> u64 {
    30_000
}

fn default_writer_idle_timeout_ms() -> u64 {
    500
}

fn default_write_retry_attempts() -> u32 {
    3
}

impl StoreOptions {
    pub fn new(
        data_path: impl Into<PathBuf>,
        database_name: impl Into<String>,
        vector_dimensionality: usize,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            database_name: database_name.into(),
            vector_dimensionality,
            quantization: Quantization::default(),
            initial_file_size_hint: 0,
            free_space_threshold_percent: default_free_space_threshold_percent(),
            growth_increment_percent: default_growth_increment_percent(),
            ingestion_queue_capacity: default_ingestion_queue_capacity(),
            flush_interval_ms: default_flush_interval_ms(),
            writer_idle_timeout_ms: default_writer_idle_timeout_ms(),
            write_retry_attempts: default_write_retry_attempts(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StoreError::Config(e.to_string()))
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))
    }

    pub fn with_quantization(mut self, quantization: Quantization) -> Self {
        self.quantization = quantization;
        self
    }

    pub fn with_initial_file_size_hint(mut self, bytes: u64) -> Self {
        self.initial_file_size_hint = bytes;
        self
    }

    pub fn with_growth(mut self, free_space_threshold_percent: u8, increment_percent: u32) -> Self {
        self.free_space_threshold_percent = free_space_threshold_percent;
        self.growth_increment_percent = increment_percent;
        self
    }

    pub fn with_ingestion_queue_capacity(mut self, capacity: usize) -> Self {
        self.ingestion_queue_capacity = capacity;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_writer_idle_timeout(mut self, timeout: Duration) -> Self {
        self.writer_idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_write_retry_attempts(mut self, attempts: u32) -> Self {
        self.write_retry_attempts = attempts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(StoreError::Config(msg));

        if self.database_name.is_empty() {
            return invalid("database_name must not be empty".into());
        }
        if self.database_name.contains(['/', '\\']) {
            return invalid(format!(
                "database_name {:?} must be a file stem, not a path",
                self.database_name
            ));
        }
        if self.vector_dimensionality == 0 {
            return invalid("vector_dimensionality must be positive".into());
        }
        if self.vector_dimensionality > i32::MAX as usize {
            return invalid(format!(
                "vector_dimensionality {} does not fit the index record",
                self.vector_dimensionality
            ));
        }
        if self.ingestion_queue_capacity == 0 {
            return invalid("ingestion_queue_capacity must be positive".into());
        }
        if self.free_space_threshold_percent >= 100 {
            return invalid(format!(
                "free_space_threshold_percent must be below 100, got {}",
                self.free_space_threshold_percent
            ));
        }
        if self.initial_file_size_hint > 0 && self.growth_increment_percent == 0 {
            return invalid("growth_increment_percent must be positive when preallocating".into());
        }
        if self.flush_interval_ms == 0 || self.writer_idle_timeout_ms == 0 {
            return invalid("flush and idle intervals must be positive".into());
        }
        if self.write_retry_attempts == 0 {
            return invalid("write_retry_attempts must be at least 1".into());
        }
        Ok(())
    }

    pub fn content_path(&self) -> PathBuf {
        self.log_path("content")
    }

    pub fn embeddings_path(&self) -> PathBuf {
        self.log_path("embeddings")
    }

    pub fn index_path(&self) -> PathBuf {
        self.log_path("index")
    }

    fn log_path(&self, extension: &str) -> PathBuf {
        self.data_path
            .join(format!("{}.{extension}", self.database_name))
    }

    pub(crate) fn growth_policy(&self) -> GrowthPolicy {
        GrowthPolicy {
            initial_size: self.initial_file_size_hint,
            free_space_threshold_percent: self.free_space_threshold_percent,
            growth_increment_percent: self.growth_increment_percent,
        }
    }

    pub(crate) fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub(crate) fn writer_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.writer_idle_timeout_ms)
    }
}
