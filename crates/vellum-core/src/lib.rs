//! Vellum Core – on-disk log format, position index, ingestion buffer and
//! SIMD vector math
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        IngestionQueue (bounded, multi-producer ring)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │     PositionIndex (replayed) · StoreHeader (derived)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  LogWriter (append-only)  │  MappedReader (mmap snapshots)  │
//! ├─────────────────────────────────────────────────────────────┤
//! │        <name>.content · <name>.embeddings · <name>.index    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod format;
pub mod header;
pub mod index;
pub mod log;
pub mod mapped;
pub mod quantize;
pub mod queue;
pub mod simd;

pub use format::{FormatError, IndexOp, IndexRecord, Position};
pub use header::{HeaderSnapshot, LogLengths, StoreHeader};
pub use index::{PositionIndex, ReplayStats};
pub use log::{GrowthPolicy, LogWriter};
pub use mapped::{LogSnapshot, MappedReader, ReadError, VisibleEnds};
pub use quantize::{ElementType, Quantization, QuantizationName, QueryVector, StoredVector};
pub use queue::IngestionQueue;
pub use simd::{dot_product, dot_product_i8};
