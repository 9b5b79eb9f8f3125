//! NanoDB storage core: paged files, a pin-counted buffer cache,
//! slotted-page tuples, heap tables, a B+ tree index, a column store, and
//! a write-ahead log with ARIES-style recovery.
//!
//! The crate assumes serialized access by a session layer: no internal
//! threading, no background work. A `StorageManager` is the explicit
//! database handle; it is constructed at startup (running crash recovery)
//! and consumed at shutdown.

pub mod config;
pub mod error;
pub mod schema;
pub mod stats;
pub mod storage;
pub mod transactions;
pub mod tuple;
pub mod types;

pub use config::StorageConfig;
pub use error::{Error, Result};
pub use schema::{ColumnInfo, ColumnType, KeyConstraint, Schema};
pub use storage::{
    DBFile, DBFileType, DBPage, FilePointer, PageReader, PageRef, PageWriter, RowEventListener,
    StorageManager, TableFileInfo,
};
pub use tuple::{Tuple, TupleLiteral};
pub use types::{FileId, SessionId, Value};
