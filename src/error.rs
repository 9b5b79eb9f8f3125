//! Error types and Result alias for the storage core.

use thiserror::Error;

use crate::storage::FilePointer;

/// Errors raised by the storage core.
///
/// The variants follow the propagation rules of the storage design: argument
/// errors are raised at the call site and never retried, I/O failures
/// surface to the caller, and corruption errors are fatal to the operation
/// that detected them.
#[derive(Debug, Error)]
pub enum Error {
    /// Illegal page number, tuple arity mismatch, out-of-range column
    /// index, or a malformed configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Page size is not a power of two in [512, 65536].
    #[error("page size {0} is not valid for a DB file")]
    InvalidPageSize(u32),

    /// A stored row address no longer resolves to a live slot.
    #[error("file pointer {0} does not resolve to a live tuple")]
    InvalidFilePointer(FilePointer),

    /// A disk read, write, or truncation failed.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected record type, transaction-ID mismatch during rollback, or
    /// a recovery end-LSN that disagrees with the scan. Fatal.
    #[error("corrupt write-ahead log: {0}")]
    CorruptWal(String),

    /// One or more B+ tree verifier invariants failed. The problems are
    /// reported as messages; the index is never auto-repaired.
    #[error("corrupt index in {file}: {} problem(s) found", .problems.len())]
    CorruptIndex {
        file: String,
        problems: Vec<String>,
    },

    /// A column type ID outside the supported fixed set.
    #[error("unsupported column type id {0}")]
    UnsupportedType(u8),

    /// The operation is not provided by this file manager.
    #[error("{0}")]
    Unsupported(String),
}

impl Error {
    /// Shorthand for an `InvalidArgument` with a formatted message.
    pub fn invalid_arg<S: Into<String>>(msg: S) -> Error {
        Error::InvalidArgument(msg.into())
    }
}

/// Result type alias for storage-core operations.
pub type Result<T> = std::result::Result<T, Error>;
