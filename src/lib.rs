//! Vellum-DB: an embedded, append-only vector store
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │   Store: append · read_content · search · flush · close     │
//! └─────────────────────────────────────────────────────────────┘
//!          │ enqueue                          │ snapshot
//!          ▼                                  ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │ serializer + flusher     │   │ parallel top-k scan (rayon)  │
//! │ threads, one I/O lock    │   │ over mapped embedding log    │
//! └──────────────────────────┘   └──────────────────────────────┘
//!          │ append                           ▲ remap after flush
//!          ▼                                  │
//! ┌─────────────────────────────────────────────────────────────┐
//! │     <name>.content · <name>.embeddings · <name>.index       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ```no_run
//! use vellum_db::{Store, StoreOptions};
//!
//! let store = Store::open(StoreOptions::new("/tmp/notes", "notes", 4))?;
//! let id = store.append("inbox", "buy milk", &[0.1, 0.9, 0.0, 0.0])?;
//! store.flush()?;
//! let hits = store.search("inbox", &[0.0, 1.0, 0.0, 0.0], 5)?;
//! assert_eq!(hits[0].id, id);
//! store.close()?;
//! # Ok::<(), vellum_db::StoreError>(())
//! ```

pub mod config;
pub mod error;
mod logs;
pub mod search;
pub mod store;
mod writer;

pub use config::StoreOptions;
pub use error::{Result, StoreError};
pub use search::SearchHit;
pub use store::Store;
pub use vellum_core::{HeaderSnapshot, Quantization, QuantizationName};
