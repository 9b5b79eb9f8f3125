//! Heap tuple files: unordered tables of slotted data pages.
//!
//! Page 0 is the table header (schema and statistics); pages 1..n are
//! slotted data pages. Scans walk pages in order and slots in order,
//! skipping empty slots. Inserts take the first page with room, appending
//! a new page when none has any.

pub mod data_page;

use std::any::Any;
use std::rc::Rc;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::stats::{ColumnStats, TableStats};
use crate::storage::dbfile::DBFileType;
use crate::storage::dbpage::{DBPage, PageRef};
use crate::storage::header_page;
use crate::storage::page_tuple::{self, PageTuple};
use crate::storage::storage_manager::{StorageManager, TableFileInfo};
use crate::storage::{FilePointer, TupleFileManager};
use crate::tuple::{Tuple, TupleLiteral};
use crate::types::{FileId, SessionId, Value};

// ============================================================================
// Block-oriented navigation
// ============================================================================

/// The first data page of a heap file, if it has one.
pub fn first_data_page(st: &mut StorageManager, file_id: FileId) -> Result<Option<u32>> {
    Ok(if st.buffer.file(file_id)?.num_pages()? > 1 {
        Some(1)
    } else {
        None
    })
}

/// The last data page of a heap file, if it has one.
pub fn last_data_page(st: &mut StorageManager, file_id: FileId) -> Result<Option<u32>> {
    let num_pages = st.buffer.file(file_id)?.num_pages()?;
    Ok(if num_pages > 1 { Some(num_pages - 1) } else { None })
}

/// The data page after `page_no`, if any.
pub fn next_data_page(st: &mut StorageManager, file_id: FileId, page_no: u32) -> Result<Option<u32>> {
    let num_pages = st.buffer.file(file_id)?.num_pages()?;
    Ok(if page_no + 1 < num_pages {
        Some(page_no + 1)
    } else {
        None
    })
}

/// The data page before `page_no`, if any (page 0 is the header).
pub fn prev_data_page(page_no: u32) -> Option<u32> {
    if page_no > 1 {
        Some(page_no - 1)
    } else {
        None
    }
}

/// The first occupied slot in a data page.
pub fn first_tuple_in_page(page: &DBPage) -> Option<u16> {
    (0..data_page::num_slots(page))
        .find(|&slot| page.read_u16(2 + 2 * slot as usize) != data_page::EMPTY_SLOT)
}

/// The next occupied slot after `slot` in a data page.
pub fn next_tuple_in_page(page: &DBPage, slot: u16) -> Option<u16> {
    (slot + 1..data_page::num_slots(page))
        .find(|&s| page.read_u16(2 + 2 * s as usize) != data_page::EMPTY_SLOT)
}

// ============================================================================
// Heap page tuples
// ============================================================================

/// A tuple living in a heap data page, addressed by (page, slot).
pub struct HeapFilePageTuple {
    inner: PageTuple,
    page_no: u32,
    slot: u16,
}

impl HeapFilePageTuple {
    /// Resolves `slot` on a data page into a tuple.
    pub fn open(page: PageRef, page_no: u32, slot: u16, schema: Rc<Schema>) -> Result<HeapFilePageTuple> {
        let offset = {
            let pg = page.borrow();
            data_page::slot_value(&pg, slot)?
        };
        if offset == data_page::EMPTY_SLOT {
            return Err(Error::InvalidFilePointer(FilePointer::new(
                page_no as u16,
                slot,
            )));
        }
        Ok(HeapFilePageTuple {
            inner: PageTuple::new(page, offset as u32, schema)?,
            page_no,
            slot,
        })
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn storage_size(&self) -> u32 {
        self.inner.storage_size()
    }
}

impl Tuple for HeapFilePageTuple {
    fn column_count(&self) -> usize {
        self.inner.schema().num_columns()
    }

    fn is_null_value(&self, col: usize) -> Result<bool> {
        self.inner.is_null(col)
    }

    fn get_column_value(&self, col: usize) -> Result<Value> {
        self.inner.get_value(col)
    }

    fn set_column_value(&mut self, col: usize, value: Value) -> Result<()> {
        self.inner.set_value(col, &value)
    }

    fn external_reference(&self) -> Option<FilePointer> {
        Some(FilePointer::new(self.page_no as u16, self.slot))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// The heap tuple-file manager
// ============================================================================

pub struct HeapTupleFileManager;

impl HeapTupleFileManager {
    fn scan_from(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        start_page: u32,
        after_slot: Option<u16>,
    ) -> Result<Option<Box<dyn Tuple>>> {
        let file_id = tbl.primary_file();
        let mut page_no = start_page;
        let mut resume_slot = after_slot;

        loop {
            let num_pages = st.buffer.file(file_id)?.num_pages()?;
            if page_no >= num_pages {
                return Ok(None);
            }

            let page = st.load_dbpage(session, file_id, page_no, false)?;
            let slot = {
                let pg = page.borrow();
                match resume_slot {
                    Some(s) => next_tuple_in_page(&pg, s),
                    None => first_tuple_in_page(&pg),
                }
            };
            if let Some(slot) = slot {
                let tuple =
                    HeapFilePageTuple::open(page.clone(), page_no, slot, tbl.schema.clone())?;
                st.unpin_page(session, &page)?;
                return Ok(Some(Box::new(tuple)));
            }

            st.unpin_page(session, &page)?;
            page_no += 1;
            resume_slot = None;
        }
    }

    /// Resolves a pointer to (page, tuple), verifying the slot is live.
    fn resolve(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        ptr: FilePointer,
    ) -> Result<(PageRef, HeapFilePageTuple)> {
        let file_id = tbl.primary_file();
        let num_pages = st.buffer.file(file_id)?.num_pages()?;
        if ptr.page_no == 0 || (ptr.page_no as u32) >= num_pages {
            return Err(Error::InvalidFilePointer(ptr));
        }

        let page = st.load_dbpage(session, file_id, ptr.page_no as u32, false)?;
        let live = {
            let pg = page.borrow();
            ptr.offset < data_page::num_slots(&pg)
                && data_page::slot_value(&pg, ptr.offset)? != data_page::EMPTY_SLOT
        };
        if !live {
            st.unpin_page(session, &page)?;
            return Err(Error::InvalidFilePointer(ptr));
        }

        let tuple =
            HeapFilePageTuple::open(page.clone(), ptr.page_no as u32, ptr.offset, tbl.schema.clone())?;
        Ok((page, tuple))
    }
}

impl TupleFileManager for HeapTupleFileManager {
    fn file_type(&self) -> DBFileType {
        DBFileType::HeapTupleFile
    }

    fn init_table_file(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &mut TableFileInfo,
    ) -> Result<()> {
        let page = st.load_dbpage(session, tbl.primary_file(), 0, true)?;
        {
            let mut pg = page.borrow_mut();
            header_page::write_header(&mut pg, &tbl.schema, &tbl.stats)?;
        }
        st.log_page_update(session, &page)?;
        st.unpin_page(session, &page)
    }

    fn load_table_file(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &mut TableFileInfo,
    ) -> Result<()> {
        let page = st.load_dbpage(session, tbl.primary_file(), 0, false)?;
        let (mut schema, stats) = {
            let pg = page.borrow();
            header_page::read_header(&pg)?
        };
        schema.set_table_name(&tbl.table_name);
        tbl.schema = Rc::new(schema);
        tbl.stats = stats;
        st.unpin_page(session, &page)
    }

    fn close_table_file(&self, st: &mut StorageManager, tbl: &TableFileInfo) -> Result<()> {
        for &file_id in &tbl.file_ids {
            st.buffer.remove_dbfile(&mut st.wal, file_id)?;
        }
        Ok(())
    }

    fn drop_table_file(&self, st: &mut StorageManager, tbl: &TableFileInfo) -> Result<()> {
        for &file_id in &tbl.file_ids {
            let name = st.buffer.file_name(file_id)?;
            st.buffer.remove_dbfile(&mut st.wal, file_id)?;
            st.file_manager.delete_dbfile(&name)?;
        }
        Ok(())
    }

    fn get_first_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
    ) -> Result<Option<Box<dyn Tuple>>> {
        self.scan_from(st, session, tbl, 1, None)
    }

    fn get_next_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        current: &dyn Tuple,
    ) -> Result<Option<Box<dyn Tuple>>> {
        let ptr = current.external_reference().ok_or_else(|| {
            Error::invalid_arg("cannot continue a heap scan from a tuple with no file pointer")
        })?;
        self.scan_from(st, session, tbl, ptr.page_no as u32, Some(ptr.offset))
    }

    fn get_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        ptr: FilePointer,
    ) -> Result<Box<dyn Tuple>> {
        let (page, tuple) = self.resolve(st, session, tbl, ptr)?;
        st.unpin_page(session, &page)?;
        Ok(Box::new(tuple))
    }

    fn add_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &TupleLiteral,
    ) -> Result<FilePointer> {
        let file_id = tbl.primary_file();
        let size = page_tuple::get_tuple_storage_size(&tbl.schema, tuple.values())?;
        let page_size = st.buffer.file(file_id)?.page_size();
        if size + 4 > page_size {
            return Err(Error::invalid_arg(format!(
                "tuple of {} bytes cannot fit in a {}-byte page",
                size, page_size
            )));
        }

        // First data page with room; extend the file when none has any.
        let num_pages = st.buffer.file(file_id)?.num_pages()?;
        let mut target: Option<(PageRef, u32)> = None;
        for page_no in 1..num_pages {
            let page = st.load_dbpage(session, file_id, page_no, false)?;
            let fits = data_page::free_space(&page.borrow()) >= size + 2;
            if fits {
                target = Some((page, page_no));
                break;
            }
            st.unpin_page(session, &page)?;
        }
        let (page, page_no) = match target {
            Some(found) => found,
            None => {
                if num_pages > u16::MAX as u32 {
                    return Err(Error::invalid_arg("heap file is full (65535 data pages)"));
                }
                let page = st.load_dbpage(session, file_id, num_pages, true)?;
                data_page::init_new_page(&mut page.borrow_mut());
                trace!("extended \"{}\" with data page {}", tbl.table_name, num_pages);
                (page, num_pages)
            }
        };

        let slot = {
            let mut pg = page.borrow_mut();
            let (slot, offset) = data_page::alloc_new_tuple(&mut pg, size)?;
            page_tuple::store_new_tuple(&mut pg, offset, &tbl.schema, tuple.values())?;
            slot
        };
        st.log_page_update(session, &page)?;
        st.unpin_page(session, &page)?;

        let ptr = FilePointer::new(page_no as u16, slot);
        trace!("added tuple at {} in \"{}\"", ptr, tbl.table_name);
        st.notify_row_inserted(&tbl.table_name, ptr)?;
        Ok(ptr)
    }

    fn update_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &dyn Tuple,
        updates: &[(usize, Value)],
    ) -> Result<()> {
        let ptr = tuple.external_reference().ok_or_else(|| {
            Error::invalid_arg("cannot update a tuple with no file pointer")
        })?;
        let (page, mut stored) = self.resolve(st, session, tbl, ptr)?;

        let mut result = Ok(());
        for (col, value) in updates {
            result = stored.set_column_value(*col, value.clone());
            if result.is_err() {
                break;
            }
        }
        // Log whatever happened before surfacing an error; a partial
        // update is still a page change the WAL must describe.
        st.log_page_update(session, &page)?;
        st.unpin_page(session, &page)?;
        result
    }

    fn delete_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        tuple: &dyn Tuple,
    ) -> Result<()> {
        let ptr = tuple.external_reference().ok_or_else(|| {
            Error::invalid_arg("cannot delete a tuple with no file pointer")
        })?;
        st.notify_row_deleting(&tbl.table_name, ptr)?;

        let (page, _stored) = self.resolve(st, session, tbl, ptr)?;
        {
            let mut pg = page.borrow_mut();
            data_page::delete_tuple(&mut pg, ptr.offset)?;
        }
        st.log_page_update(session, &page)?;
        st.unpin_page(session, &page)?;
        trace!("deleted tuple at {} in \"{}\"", ptr, tbl.table_name);
        Ok(())
    }

    fn analyze_table_file(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &mut TableFileInfo,
    ) -> Result<()> {
        let file_id = tbl.primary_file();
        let num_cols = tbl.schema.num_columns();
        let num_pages = st.buffer.file(file_id)?.num_pages()?;

        let mut num_tuples = 0u32;
        let mut total_bytes = 0u64;
        let mut nulls = vec![0u32; num_cols];
        let mut seen: Vec<Vec<Value>> = vec![Vec::new(); num_cols];

        for page_no in 1..num_pages {
            let page = st.load_dbpage(session, file_id, page_no, false)?;
            let mut slot = {
                let pg = page.borrow();
                first_tuple_in_page(&pg)
            };
            while let Some(s) = slot {
                let tuple = HeapFilePageTuple::open(page.clone(), page_no, s, tbl.schema.clone())?;
                num_tuples += 1;
                total_bytes += tuple.storage_size() as u64;
                for col in 0..num_cols {
                    let value = tuple.get_column_value(col)?;
                    if value.is_null() {
                        nulls[col] += 1;
                    } else {
                        seen[col].push(value);
                    }
                }
                slot = {
                    let pg = page.borrow();
                    next_tuple_in_page(&pg, s)
                };
            }
            st.unpin_page(session, &page)?;
        }

        let mut column_stats = Vec::with_capacity(num_cols);
        for (col, mut values) in seen.into_iter().enumerate() {
            values.sort_by(|a, b| a.compare(b).unwrap_or(std::cmp::Ordering::Equal));
            let min_value = values.first().cloned();
            let max_value = values.last().cloned();
            values.dedup();
            column_stats.push(ColumnStats {
                num_unique: values.len() as i32,
                num_null: nulls[col] as i32,
                min_value,
                max_value,
            });
        }

        let stats = TableStats {
            num_data_pages: (num_pages - 1) as u16,
            num_tuples,
            avg_tuple_size: if num_tuples > 0 {
                total_bytes as f32 / num_tuples as f32
            } else {
                0.0
            },
            column_stats,
        };

        let page = st.load_dbpage(session, file_id, 0, false)?;
        {
            let mut pg = page.borrow_mut();
            header_page::write_header(&mut pg, &tbl.schema, &stats)?;
        }
        st.log_page_update(session, &page)?;
        st.unpin_page(session, &page)?;

        debug!(
            "analyzed \"{}\": {} tuples on {} page(s)",
            tbl.table_name, stats.num_tuples, stats.num_data_pages
        );
        tbl.stats = stats;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::schema::{ColumnInfo, ColumnType};

    const SESSION: SessionId = SessionId(1);

    fn open_storage(dir: &std::path::Path) -> StorageManager {
        let mut config = StorageConfig::default();
        config.base_dir = dir.to_path_buf();
        config.page_size = 1024;
        StorageManager::open(config).unwrap()
    }

    fn people_schema() -> Schema {
        Schema::new(vec![
            ColumnInfo::new("id", ColumnType::Integer),
            ColumnInfo::new("name", ColumnType::VarChar { length: 40 }),
        ])
        .unwrap()
    }

    fn row(id: i32, name: &str) -> TupleLiteral {
        TupleLiteral::new(vec![Value::Integer(id), Value::Text(name.into())])
    }

    fn scan_ids(st: &mut StorageManager, tbl: &TableFileInfo) -> Vec<i32> {
        let mut ids = Vec::new();
        let mut cursor = st.get_first_tuple(SESSION, tbl).unwrap();
        while let Some(tuple) = cursor {
            match tuple.get_column_value(0).unwrap() {
                Value::Integer(id) => ids.push(id),
                other => panic!("unexpected value {:?}", other),
            }
            cursor = st.get_next_tuple(SESSION, tbl, tuple.as_ref()).unwrap();
        }
        ids
    }

    #[test]
    fn test_create_insert_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path());
        let tbl = st
            .create_table(SESSION, "people", people_schema(), DBFileType::HeapTupleFile)
            .unwrap();

        for i in 1..=10 {
            st.add_tuple(SESSION, &tbl, &row(i, &format!("name-{}", i)))
                .unwrap();
        }
        assert_eq!(scan_ids(&mut st, &tbl), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_reopen_preserves_schema_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut st = open_storage(dir.path());
            let tbl = st
                .create_table(SESSION, "t", people_schema(), DBFileType::HeapTupleFile)
                .unwrap();
            st.add_tuple(SESSION, &tbl, &row(7, "seven")).unwrap();
            st.shutdown().unwrap();
        }

        let mut st = open_storage(dir.path());
        let tbl = st.open_table(SESSION, "t").unwrap();
        assert_eq!(tbl.schema.num_columns(), 2);
        assert_eq!(tbl.schema.column(1).unwrap().name, "name");
        assert_eq!(scan_ids(&mut st, &tbl), vec![7]);
    }

    #[test]
    fn test_varchar_update_grows_tuple() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path());
        let tbl = st
            .create_table(SESSION, "t", people_schema(), DBFileType::HeapTupleFile)
            .unwrap();

        let ptr = st.add_tuple(SESSION, &tbl, &row(1, "hi")).unwrap();
        let before = st.get_tuple(SESSION, &tbl, ptr).unwrap();
        let size_before = before
            .as_any()
            .downcast_ref::<HeapFilePageTuple>()
            .unwrap()
            .storage_size();

        st.update_tuple(
            SESSION,
            &tbl,
            before.as_ref(),
            &[(1, Value::Text("hello".into()))],
        )
        .unwrap();

        let after = st.get_tuple(SESSION, &tbl, ptr).unwrap();
        assert_eq!(after.get_column_value(1).unwrap(), Value::Text("hello".into()));
        assert_eq!(after.get_column_value(0).unwrap(), Value::Integer(1));
        let size_after = after
            .as_any()
            .downcast_ref::<HeapFilePageTuple>()
            .unwrap()
            .storage_size();
        assert_eq!(size_after, size_before + 3);
    }

    #[test]
    fn test_null_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path());
        let tbl = st
            .create_table(SESSION, "t", people_schema(), DBFileType::HeapTupleFile)
            .unwrap();

        let ptr = st
            .add_tuple(
                SESSION,
                &tbl,
                &TupleLiteral::new(vec![Value::Integer(1), Value::Null]),
            )
            .unwrap();
        let tuple = st.get_tuple(SESSION, &tbl, ptr).unwrap();
        assert!(tuple.is_null_value(1).unwrap());

        st.update_tuple(SESSION, &tbl, tuple.as_ref(), &[(1, Value::Text("x".into()))])
            .unwrap();
        let tuple = st.get_tuple(SESSION, &tbl, ptr).unwrap();
        assert_eq!(tuple.get_column_value(1).unwrap(), Value::Text("x".into()));

        st.update_tuple(SESSION, &tbl, tuple.as_ref(), &[(1, Value::Null)])
            .unwrap();
        let tuple = st.get_tuple(SESSION, &tbl, ptr).unwrap();
        assert!(tuple.is_null_value(1).unwrap());
    }

    #[test]
    fn test_delete_and_dead_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path());
        let tbl = st
            .create_table(SESSION, "t", people_schema(), DBFileType::HeapTupleFile)
            .unwrap();

        let p1 = st.add_tuple(SESSION, &tbl, &row(1, "a")).unwrap();
        let _p2 = st.add_tuple(SESSION, &tbl, &row(2, "b")).unwrap();

        let tuple = st.get_tuple(SESSION, &tbl, p1).unwrap();
        st.delete_tuple(SESSION, &tbl, tuple.as_ref()).unwrap();

        assert_eq!(scan_ids(&mut st, &tbl), vec![2]);
        assert!(matches!(
            st.get_tuple(SESSION, &tbl, p1),
            Err(Error::InvalidFilePointer(_))
        ));
    }

    #[test]
    fn test_insert_spills_to_new_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path());
        let tbl = st
            .create_table(SESSION, "t", people_schema(), DBFileType::HeapTupleFile)
            .unwrap();

        // 1 KiB pages; each row is ~50 bytes, so 40 rows need several pages.
        let wide = "x".repeat(38);
        for i in 0..40 {
            st.add_tuple(SESSION, &tbl, &row(i, &wide)).unwrap();
        }
        assert_eq!(scan_ids(&mut st, &tbl).len(), 40);
        assert!(st.buffer_manager().file(tbl.primary_file()).unwrap().num_pages().unwrap() > 2);
    }

    #[test]
    fn test_analyze_stats() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path());
        let mut tbl = st
            .create_table(SESSION, "t", people_schema(), DBFileType::HeapTupleFile)
            .unwrap();

        for i in 1..=5 {
            st.add_tuple(SESSION, &tbl, &row(i, "same")).unwrap();
        }
        st.add_tuple(
            SESSION,
            &tbl,
            &TupleLiteral::new(vec![Value::Integer(6), Value::Null]),
        )
        .unwrap();

        st.analyze_table(SESSION, &mut tbl).unwrap();
        assert_eq!(tbl.stats.num_tuples, 6);
        assert_eq!(tbl.stats.column_stats[0].num_unique, 6);
        assert_eq!(tbl.stats.column_stats[0].min_value, Some(Value::Integer(1)));
        assert_eq!(tbl.stats.column_stats[0].max_value, Some(Value::Integer(6)));
        assert_eq!(tbl.stats.column_stats[1].num_unique, 1);
        assert_eq!(tbl.stats.column_stats[1].num_null, 1);

        // Stats survive reopen.
        st.close_table(&tbl).unwrap();
        let tbl = st.open_table(SESSION, "t").unwrap();
        assert_eq!(tbl.stats.num_tuples, 6);
    }
}
