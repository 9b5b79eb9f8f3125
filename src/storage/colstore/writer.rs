//! Encoders that append column blocks page by page, allocating a fresh
//! page whenever the current one fills.

use itertools::Itertools;

use crate::error::{Error, Result};
use crate::schema::ColumnType;
use crate::storage::colstore::blocks::{self, Encoding};
use crate::storage::dbpage::PageRef;
use crate::storage::page_tuple;
use crate::storage::storage_manager::StorageManager;
use crate::types::{FileId, SessionId, Value};

/// Tracks the page being appended to within one column file.
struct ColumnPageWriter {
    file_id: FileId,
    encoding: Encoding,
    page: PageRef,
    page_no: u32,
    next_write: u32,
    page_size: u32,
}

impl ColumnPageWriter {
    fn begin(
        st: &mut StorageManager,
        session: SessionId,
        file_id: FileId,
        encoding: Encoding,
    ) -> Result<ColumnPageWriter> {
        let page_size = st.buffer.file(file_id)?.page_size();
        let page = st.load_dbpage(session, file_id, 0, false)?;
        blocks::init_page(&mut page.borrow_mut(), encoding);
        Ok(ColumnPageWriter {
            file_id,
            encoding,
            page,
            page_no: 0,
            next_write: blocks::DATA_START,
            page_size,
        })
    }

    /// Makes sure `bytes` more fit on the current page, rolling to a new
    /// page when they do not.
    fn reserve(&mut self, st: &mut StorageManager, session: SessionId, bytes: u32) -> Result<()> {
        if self.next_write + bytes <= self.page_size {
            return Ok(());
        }
        if blocks::DATA_START + bytes > self.page_size {
            return Err(Error::invalid_arg(format!(
                "{}-byte column block cannot fit a {}-byte page",
                bytes, self.page_size
            )));
        }
        self.finish_page(st, session)?;
        self.page_no += 1;
        self.page = st.load_dbpage(session, self.file_id, self.page_no, true)?;
        blocks::init_page(&mut self.page.borrow_mut(), self.encoding);
        self.next_write = blocks::DATA_START;
        Ok(())
    }

    fn write_value(&mut self, col_type: &ColumnType, value: &Value) -> Result<()> {
        let used = page_tuple::write_value(&mut self.page.borrow_mut(), self.next_write, col_type, value)?;
        self.next_write += used;
        Ok(())
    }

    fn write_u32(&mut self, v: u32) {
        self.page.borrow_mut().write_u32(self.next_write as usize, v);
        self.next_write += 4;
    }

    fn write_u16(&mut self, v: u16) {
        self.page.borrow_mut().write_u16(self.next_write as usize, v);
        self.next_write += 2;
    }

    fn add_cells(&mut self, cells: u32) {
        blocks::add_cells(&mut self.page.borrow_mut(), cells);
    }

    fn finish_page(&mut self, st: &mut StorageManager, session: SessionId) -> Result<()> {
        blocks::set_next_write_offset(&mut self.page.borrow_mut(), self.next_write);
        st.log_page_update(session, &self.page)?;
        st.unpin_page(session, &self.page)
    }
}

/// Encodes one column's values into its data file with the chosen
/// encoding.
pub fn write_column(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    col_type: &ColumnType,
    encoding: Encoding,
    values: &[Value],
) -> Result<()> {
    match encoding {
        Encoding::Rle => write_rle(st, session, file_id, col_type, values),
        Encoding::Uncompressed => write_uncompressed(st, session, file_id, col_type, values),
        Encoding::Dictionary => write_dictionary(st, session, file_id, col_type, values),
    }
}

/// RLE blocks: `value | start(i32) | run-length(i32)`.
fn write_rle(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    col_type: &ColumnType,
    values: &[Value],
) -> Result<()> {
    let mut writer = ColumnPageWriter::begin(st, session, file_id, Encoding::Rle)?;
    let mut position = 0u32;
    for (run_len, value) in values.iter().dedup_with_count() {
        let block_size = page_tuple::value_storage_size(col_type, value)? + 8;
        writer.reserve(st, session, block_size)?;
        writer.write_value(col_type, value)?;
        writer.write_u32(position);
        writer.write_u32(run_len as u32);
        writer.add_cells(run_len as u32);
        position += run_len as u32;
    }
    writer.finish_page(st, session)
}

/// Uncompressed blocks: `value | position(i32)`, one cell per block.
fn write_uncompressed(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    col_type: &ColumnType,
    values: &[Value],
) -> Result<()> {
    let mut writer = ColumnPageWriter::begin(st, session, file_id, Encoding::Uncompressed)?;
    for (position, value) in values.iter().enumerate() {
        let block_size = page_tuple::value_storage_size(col_type, value)? + 4;
        writer.reserve(st, session, block_size)?;
        writer.write_value(col_type, value)?;
        writer.write_u32(position as u32);
        writer.add_cells(1);
    }
    writer.finish_page(st, session)
}

/// Dictionary cells: code words packed into 16-bit cells, with the
/// dictionary itself written after the last data block.
fn write_dictionary(
    st: &mut StorageManager,
    session: SessionId,
    file_id: FileId,
    col_type: &ColumnType,
    values: &[Value],
) -> Result<()> {
    // Dictionary in first-appearance order; codes start at 1 so 0 can pad
    // the final cell.
    let mut dictionary: Vec<Value> = Vec::new();
    let mut codes = Vec::with_capacity(values.len());
    for value in values {
        let code = match dictionary.iter().position(|v| v == value) {
            Some(at) => at + 1,
            None => {
                dictionary.push(value.clone());
                dictionary.len()
            }
        };
        codes.push(code as u16);
    }
    if dictionary.len() > u16::MAX as usize {
        return Err(Error::invalid_arg(format!(
            "dictionary of {} entries exceeds the 16-bit code space",
            dictionary.len()
        )));
    }

    let (bits, codes_per_cell) = blocks::code_layout(dictionary.len().max(1));
    let mut writer = ColumnPageWriter::begin(st, session, file_id, Encoding::Dictionary)?;

    for chunk in codes.chunks(codes_per_cell as usize) {
        let mut cell = 0u16;
        for (i, &code) in chunk.iter().enumerate() {
            cell |= code << (16 - bits * (i as u32 + 1));
        }
        writer.reserve(st, session, 2)?;
        writer.write_u16(cell);
        writer.add_cells(chunk.len() as u32);
    }

    // The dictionary lands at the last page's next-write offset; move to a
    // fresh page when it cannot fit. The next-write field is recorded
    // before the dictionary bytes, so readers find it there.
    let mut dict_size = 2u32;
    for value in &dictionary {
        dict_size += page_tuple::value_storage_size(col_type, value)?;
    }
    writer.reserve(st, session, dict_size)?;
    blocks::set_next_write_offset(&mut writer.page.borrow_mut(), writer.next_write);
    writer.write_u16(dictionary.len() as u16);
    for value in &dictionary {
        writer.write_value(col_type, value)?;
    }

    // Close out without touching next-write again.
    st.log_page_update(session, &writer.page)?;
    st.unpin_page(session, &writer.page)
}
