//! The storage manager: the explicit database handle that owns the file
//! manager, buffer manager, write-ahead log, transaction table, and open
//! tables, and dispatches table operations by file type.
//!
//! One `StorageManager` is constructed at startup (running crash recovery
//! before returning) and torn down at shutdown; every operation receives it
//! explicitly rather than reaching for global state.

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::stats::TableStats;
use crate::storage::buffer::BufferManager;
use crate::storage::dbfile::DBFileType;
use crate::storage::dbpage::{DBPage, PageRef};
use crate::storage::file_manager::FileManager;
use crate::storage::wal::{recovery, WalManager};
use crate::storage::{table_manager, FilePointer, RowEventListener};
use crate::transactions::{self, TransactionState};
use crate::tuple::{Tuple, TupleLiteral};
use crate::types::{FileId, SessionId, Value};

/// A loaded table: its name, backing files (one for row stores; a header
/// plus one file per column for column stores), schema, and statistics.
#[derive(Clone)]
pub struct TableFileInfo {
    pub table_name: String,
    pub file_type: DBFileType,
    pub file_ids: Vec<FileId>,
    pub schema: Rc<Schema>,
    pub stats: TableStats,
}

impl TableFileInfo {
    /// The table's primary file: the heap/index file, or the column-store
    /// header file.
    pub fn primary_file(&self) -> FileId {
        self.file_ids[0]
    }
}

/// The on-disk name of a table's primary file.
pub fn table_file_name(table_name: &str) -> String {
    format!("{}.tbl", table_name)
}

pub struct StorageManager {
    pub(crate) config: StorageConfig,
    pub(crate) file_manager: FileManager,
    pub(crate) buffer: BufferManager,
    pub(crate) wal: WalManager,
    pub(crate) txns: HashMap<SessionId, TransactionState>,
    pub(crate) open_tables: HashMap<String, TableFileInfo>,
    listeners: Vec<Box<dyn RowEventListener>>,
}

impl StorageManager {
    /// Opens the storage layer under the configured base directory and runs
    /// crash recovery before returning.
    pub fn open(config: StorageConfig) -> Result<StorageManager> {
        let file_manager = FileManager::new(&config.base_dir)?;
        let buffer = BufferManager::new(config.page_cache_size, config.page_cache_policy);
        let wal = WalManager::open(&config.base_dir, config.page_size)?;

        let mut st = StorageManager {
            config,
            file_manager,
            buffer,
            wal,
            txns: HashMap::new(),
            open_tables: HashMap::new(),
            listeners: Vec::new(),
        };
        recovery::perform_recovery(&mut st)?;
        Ok(st)
    }

    /// Flushes all cached pages and forces the log. The handle is consumed;
    /// files close as it drops.
    pub fn shutdown(mut self) -> Result<()> {
        self.buffer.flush_all(&mut self.wal)?;
        self.wal.force(None)?;
        debug!("storage manager shut down");
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.config.page_size
    }

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    /// Loads a page through the cache, pinning it for `session`. With
    /// `create` set, a page past the end of the file materializes as
    /// zeros; otherwise that is an error.
    pub fn load_dbpage(
        &mut self,
        session: SessionId,
        file_id: FileId,
        page_no: u32,
        create: bool,
    ) -> Result<PageRef> {
        if let Some(page) = self.buffer.get_page(session, file_id, page_no) {
            return Ok(page);
        }

        let page_size = self.buffer.file(file_id)?.page_size() as usize;
        let mut buf = vec![0u8; page_size];
        let found = self.buffer.file_mut(file_id)?.read_page(page_no, &mut buf)?;
        if !found {
            if !create {
                return Err(Error::invalid_arg(format!(
                    "page {} is past the end of {}",
                    page_no, file_id
                )));
            }
            // Materialize the page on disk right away so the file's page
            // count stays authoritative for scans.
            self.buffer.file_mut(file_id)?.write_page(page_no, &buf)?;
        }
        self.buffer
            .add_page(&mut self.wal, session, DBPage::new(file_id, page_no, buf))
    }

    /// Releases one pin `session` holds on the page.
    pub fn unpin_page(&mut self, session: SessionId, page: &PageRef) -> Result<()> {
        let (file_id, page_no) = {
            let pg = page.borrow();
            (pg.file_id(), pg.page_no())
        };
        self.buffer.unpin_page(session, file_id, page_no)
    }

    /// Logs a dirty page's changes under the session's transaction (no-op
    /// outside a transaction).
    pub fn log_page_update(&mut self, session: SessionId, page: &PageRef) -> Result<()> {
        transactions::record_page_update(self, session, page)
    }

    /// Writes every dirty cached page to disk, forcing the WAL first so
    /// the write-ahead rule holds. A durability checkpoint; nothing is
    /// closed.
    pub fn flush_all_pages(&mut self) -> Result<()> {
        self.buffer.flush_all(&mut self.wal)
    }

    /// Opens a file by name if it is not already registered; used by
    /// recovery, whose update records carry file names.
    pub(crate) fn ensure_dbfile_open(&mut self, name: &str) -> Result<FileId> {
        if let Some(id) = self.buffer.file_id_for(name) {
            return Ok(id);
        }
        let file = self.file_manager.open_dbfile(name)?;
        Ok(self.buffer.register_file(file))
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    /// Creates a table of the given storage format and initializes its
    /// header(s).
    pub fn create_table(
        &mut self,
        session: SessionId,
        table_name: &str,
        schema: Schema,
        file_type: DBFileType,
    ) -> Result<TableFileInfo> {
        if schema.num_columns() == 0 {
            return Err(Error::invalid_arg("a table requires at least one column"));
        }
        let file_name = table_file_name(table_name);
        if self.file_manager.file_exists(&file_name) {
            return Err(Error::invalid_arg(format!(
                "table {} already exists",
                table_name
            )));
        }
        let manager = table_manager(file_type)?;

        let mut schema = schema;
        schema.set_table_name(table_name);
        let num_columns = schema.num_columns();

        let file = self
            .file_manager
            .create_dbfile(&file_name, file_type, self.config.page_size)?;
        let file_id = self.buffer.register_file(file);

        let mut tbl = TableFileInfo {
            table_name: table_name.to_string(),
            file_type,
            file_ids: vec![file_id],
            schema: Rc::new(schema),
            stats: TableStats::empty(num_columns),
        };
        manager.init_table_file(self, session, &mut tbl)?;
        debug!("created {:?} table \"{}\"", file_type, table_name);

        self.open_tables.insert(table_name.to_string(), tbl.clone());
        Ok(tbl)
    }

    /// Opens a table, reading its schema and statistics (cached once open).
    pub fn open_table(&mut self, session: SessionId, table_name: &str) -> Result<TableFileInfo> {
        if let Some(tbl) = self.open_tables.get(table_name) {
            return Ok(tbl.clone());
        }

        let file_name = table_file_name(table_name);
        let file_id = self.ensure_dbfile_open(&file_name)?;
        let file_type = self.buffer.file(file_id)?.file_type();
        let manager = table_manager(file_type)?;

        let mut tbl = TableFileInfo {
            table_name: table_name.to_string(),
            file_type,
            file_ids: vec![file_id],
            schema: Rc::new(Schema::empty()),
            stats: TableStats::empty(0),
        };
        manager.load_table_file(self, session, &mut tbl)?;
        debug!("opened {:?} table \"{}\"", file_type, table_name);

        self.open_tables.insert(table_name.to_string(), tbl.clone());
        Ok(tbl)
    }

    /// Flushes and releases a table's cached pages and file handles.
    pub fn close_table(&mut self, tbl: &TableFileInfo) -> Result<()> {
        let manager = table_manager(tbl.file_type)?;
        manager.close_table_file(self, tbl)?;
        self.open_tables.remove(&tbl.table_name);
        Ok(())
    }

    /// Removes a table and its backing files.
    pub fn drop_table(&mut self, session: SessionId, table_name: &str) -> Result<()> {
        let tbl = self.open_table(session, table_name)?;
        let manager = table_manager(tbl.file_type)?;
        manager.drop_table_file(self, &tbl)?;
        self.open_tables.remove(table_name);
        debug!("dropped table \"{}\"", table_name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tuple operations (dispatched by file type)
    // ------------------------------------------------------------------

    pub fn get_first_tuple(
        &mut self,
        session: SessionId,
        tbl: &TableFileInfo,
    ) -> Result<Option<Box<dyn Tuple>>> {
        table_manager(tbl.file_type)?.get_first_tuple(self, session, tbl)
    }

    pub fn get_next_tuple(
        &mut self,
        session: SessionId,
        tbl: &TableFileInfo,
        current: &dyn Tuple,
    ) -> Result<Option<Box<dyn Tuple>>> {
        table_manager(tbl.file_type)?.get_next_tuple(self, session, tbl, current)
    }

    pub fn get_tuple(
        &mut self,
        session: SessionId,
        tbl: &TableFileInfo,
        ptr: FilePointer,
    ) -> Result<Box<dyn Tuple>> {
        table_manager(tbl.file_type)?.get_tuple(self, session, tbl, ptr)
    }

    pub fn add_tuple(
        &mut self,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &TupleLiteral,
    ) -> Result<FilePointer> {
        table_manager(tbl.file_type)?.add_tuple(self, session, tbl, tuple)
    }

    pub fn update_tuple(
        &mut self,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &dyn Tuple,
        updates: &[(usize, Value)],
    ) -> Result<()> {
        table_manager(tbl.file_type)?.update_tuple(self, session, tbl, tuple, updates)
    }

    pub fn delete_tuple(
        &mut self,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &dyn Tuple,
    ) -> Result<()> {
        table_manager(tbl.file_type)?.delete_tuple(self, session, tbl, tuple)
    }

    /// Recomputes and stores the table's statistics; the refreshed stats
    /// are also written back into the open-table cache.
    pub fn analyze_table(&mut self, session: SessionId, tbl: &mut TableFileInfo) -> Result<()> {
        table_manager(tbl.file_type)?.analyze_table_file(self, session, tbl)?;
        self.open_tables
            .insert(tbl.table_name.clone(), tbl.clone());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(&mut self, session: SessionId) -> Result<u32> {
        transactions::begin_transaction(self, session)
    }

    pub fn commit_transaction(&mut self, session: SessionId) -> Result<()> {
        transactions::commit_transaction(self, session)
    }

    pub fn rollback_transaction(&mut self, session: SessionId) -> Result<()> {
        transactions::rollback_transaction(self, session)
    }

    pub fn has_transaction(&self, session: SessionId) -> bool {
        self.txns.contains_key(&session)
    }

    // ------------------------------------------------------------------
    // Row events
    // ------------------------------------------------------------------

    /// Registers a listener for row inserts and deletes (index maintenance
    /// hooks in here from outside the storage core).
    pub fn add_row_listener(&mut self, listener: Box<dyn RowEventListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn notify_row_inserted(&mut self, table: &str, ptr: FilePointer) -> Result<()> {
        for listener in &mut self.listeners {
            listener.after_row_inserted(table, ptr)?;
        }
        Ok(())
    }

    pub(crate) fn notify_row_deleting(&mut self, table: &str, ptr: FilePointer) -> Result<()> {
        for listener in &mut self.listeners {
            listener.before_row_deleted(table, ptr)?;
        }
        Ok(())
    }

    /// Read access to the buffer manager, mostly for tests asserting cache
    /// behavior.
    pub fn buffer_manager(&self) -> &BufferManager {
        &self.buffer
    }
}
