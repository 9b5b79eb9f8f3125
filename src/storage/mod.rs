//! The storage engine: paged files, the buffer cache, tuple files (heap,
//! B+ tree, column store), and the write-ahead log.
//!
//! Every on-disk file is a `DBFile` of fixed-size pages, discriminated by a
//! type byte at offset 0. Pages are served through the `BufferManager` and
//! mutated through `DBPage` accessors; the `StorageManager` coordinates the
//! pieces and dispatches table operations to the tuple-file manager that
//! matches the file's type.

pub mod btree;
pub mod buffer;
pub mod colstore;
pub mod dbfile;
pub mod dbpage;
pub mod file_manager;
pub mod header_page;
pub mod heap;
pub mod page_tuple;
pub mod storage_manager;
pub mod wal;

use std::fmt;

use crate::error::{Error, Result};
use crate::tuple::{Tuple, TupleLiteral};
use crate::types::{SessionId, Value};

pub use dbfile::{DBFile, DBFileInfo, DBFileType};
pub use dbpage::{DBPage, PageReader, PageRef, PageWriter};
pub use storage_manager::{StorageManager, TableFileInfo};

// ============================================================================
// File pointers
// ============================================================================

/// The on-disk address of a tuple: a page number and a location within the
/// page. For heap files the location is the slot index; B+ tree keys carry
/// a `FilePointer` trailer so that every stored key is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilePointer {
    pub page_no: u16,
    pub offset: u16,
}

impl FilePointer {
    /// The all-zero pointer, used as a "no reference" sentinel.
    pub const ZERO: FilePointer = FilePointer {
        page_no: 0,
        offset: 0,
    };

    pub const fn new(page_no: u16, offset: u16) -> FilePointer {
        FilePointer { page_no, offset }
    }
}

impl fmt::Display for FilePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.page_no, self.offset)
    }
}

// ============================================================================
// Tuple-file managers
// ============================================================================

/// The capability set every tuple-file format provides. The storage manager
/// selects an implementation by the file's type byte; implementations are
/// stateless and receive the storage handle explicitly.
pub trait TupleFileManager {
    /// The file type this manager serves.
    fn file_type(&self) -> DBFileType;

    /// Writes the header(s) of a freshly created table file.
    fn init_table_file(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &mut TableFileInfo,
    ) -> Result<()>;

    /// Reads schema and statistics out of an existing table file.
    fn load_table_file(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &mut TableFileInfo,
    ) -> Result<()>;

    /// Flushes and releases the table's cached pages and file handles.
    fn close_table_file(&self, st: &mut StorageManager, tbl: &TableFileInfo) -> Result<()>;

    /// Removes the table's backing files from disk.
    fn drop_table_file(&self, st: &mut StorageManager, tbl: &TableFileInfo) -> Result<()>;

    /// The first tuple in scan order, if any.
    fn get_first_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
    ) -> Result<Option<Box<dyn Tuple>>>;

    /// The tuple following `current` in scan order, if any.
    fn get_next_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        current: &dyn Tuple,
    ) -> Result<Option<Box<dyn Tuple>>>;

    /// Resolves a stored tuple address.
    fn get_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        ptr: FilePointer,
    ) -> Result<Box<dyn Tuple>>;

    /// Stores a new tuple and returns its address.
    fn add_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &TupleLiteral,
    ) -> Result<FilePointer>;

    /// Applies `(column, value)` updates to an existing tuple in place.
    fn update_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &dyn Tuple,
        updates: &[(usize, Value)],
    ) -> Result<()>;

    /// Removes a tuple.
    fn delete_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &dyn Tuple,
    ) -> Result<()>;

    /// Recomputes the table's statistics.
    fn analyze_table_file(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &mut TableFileInfo,
    ) -> Result<()>;
}

/// Selects the tuple-file manager for a file type.
pub fn table_manager(file_type: DBFileType) -> Result<&'static dyn TupleFileManager> {
    match file_type {
        DBFileType::HeapTupleFile => Ok(&heap::HeapTupleFileManager),
        DBFileType::BTreeTupleFile => Ok(&btree::BTreeTupleFileManager),
        DBFileType::ColumnStoreHeaderFile => Ok(&colstore::ColStoreTupleFileManager),
        other => Err(Error::invalid_arg(format!(
            "no tuple-file manager serves {:?} files",
            other
        ))),
    }
}

// ============================================================================
// Row events
// ============================================================================

/// Hook for layers that must observe row changes (index maintenance lives
/// outside this crate and registers through this trait).
pub trait RowEventListener {
    fn after_row_inserted(&mut self, table: &str, ptr: FilePointer) -> Result<()>;
    fn before_row_deleted(&mut self, table: &str, ptr: FilePointer) -> Result<()>;
}
