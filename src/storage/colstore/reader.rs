//! Block-level reading of column files, and the generated row-oriented
//! tuple view composed from per-column blocks.

use std::any::Any;

use crate::error::{Error, Result};
use crate::schema::ColumnType;
use crate::storage::colstore::blocks::{self, ColStoreBlock, Encoding};
use crate::storage::page_tuple;
use crate::storage::storage_manager::StorageManager;
use crate::storage::FilePointer;
use crate::tuple::Tuple;
use crate::types::{FileId, SessionId, Value};

/// Streams the blocks of one column file in storage order.
pub struct BlockReader {
    file_id: FileId,
    col_type: ColumnType,
    encoding: Encoding,
    num_pages: u32,
    page_no: u32,
    offset: u32,
    /// Cells of the current page not yet consumed.
    cells_left_on_page: u32,
    /// Dictionary decode state.
    dictionary: Vec<Value>,
    bits: u32,
    codes_per_cell: u32,
}

impl BlockReader {
    /// Opens a reader at the start of a column file, loading the
    /// dictionary when the column is dictionary-encoded.
    pub fn open(
        st: &mut StorageManager,
        session: SessionId,
        file_id: FileId,
        col_type: ColumnType,
    ) -> Result<BlockReader> {
        let num_pages = st.buffer.file(file_id)?.num_pages()?;
        let page = st.load_dbpage(session, file_id, 0, false)?;
        let (encoding, cells) = {
            let pg = page.borrow();
            (blocks::page_encoding(&pg)?, blocks::cell_count(&pg))
        };
        st.unpin_page(session, &page)?;

        let mut reader = BlockReader {
            file_id,
            col_type,
            encoding,
            num_pages,
            page_no: 0,
            offset: blocks::DATA_START,
            cells_left_on_page: cells,
            dictionary: Vec::new(),
            bits: 1,
            codes_per_cell: 16,
        };
        if encoding == Encoding::Dictionary {
            reader.load_dictionary(st, session)?;
        }
        Ok(reader)
    }

    /// The dictionary sits at the last page's next-write offset.
    fn load_dictionary(&mut self, st: &mut StorageManager, session: SessionId) -> Result<()> {
        let last_page = self.num_pages - 1;
        let page = st.load_dbpage(session, self.file_id, last_page, false)?;
        {
            let pg = page.borrow();
            let mut pos = blocks::next_write_offset(&pg);
            let num_entries = pg.read_u16(pos as usize) as usize;
            pos += 2;
            for _ in 0..num_entries {
                let value = page_tuple::read_value(&pg, pos, &self.col_type)?;
                pos += page_tuple::stored_value_size(&pg, pos, &self.col_type);
                self.dictionary.push(value);
            }
        }
        st.unpin_page(session, &page)?;

        let (bits, codes_per_cell) = blocks::code_layout(self.dictionary.len().max(1));
        self.bits = bits;
        self.codes_per_cell = codes_per_cell;
        Ok(())
    }

    /// The next block, or `None` at the end of the column.
    pub fn next_block(
        &mut self,
        st: &mut StorageManager,
        session: SessionId,
    ) -> Result<Option<ColStoreBlock>> {
        while self.cells_left_on_page == 0 {
            if self.page_no + 1 >= self.num_pages {
                return Ok(None);
            }
            self.page_no += 1;
            self.offset = blocks::DATA_START;
            let page = st.load_dbpage(session, self.file_id, self.page_no, false)?;
            self.cells_left_on_page = blocks::cell_count(&page.borrow());
            st.unpin_page(session, &page)?;
        }

        let page = st.load_dbpage(session, self.file_id, self.page_no, false)?;
        let block = {
            let pg = page.borrow();
            match self.encoding {
                Encoding::Rle => {
                    let value = page_tuple::read_value(&pg, self.offset, &self.col_type)?;
                    let value_size = page_tuple::stored_value_size(&pg, self.offset, &self.col_type);
                    let start = pg.read_u32((self.offset + value_size) as usize);
                    let length = pg.read_u32((self.offset + value_size + 4) as usize);
                    self.offset += value_size + 8;
                    self.cells_left_on_page = self.cells_left_on_page.saturating_sub(length);
                    ColStoreBlock::Rle {
                        value,
                        start,
                        length,
                    }
                }
                Encoding::Uncompressed => {
                    let value = page_tuple::read_value(&pg, self.offset, &self.col_type)?;
                    let value_size = page_tuple::stored_value_size(&pg, self.offset, &self.col_type);
                    let position = pg.read_u32((self.offset + value_size) as usize);
                    self.offset += value_size + 4;
                    self.cells_left_on_page -= 1;
                    ColStoreBlock::Uncompressed { value, position }
                }
                Encoding::Dictionary => {
                    let cell = pg.read_u16(self.offset as usize);
                    self.offset += 2;
                    let take = self.cells_left_on_page.min(self.codes_per_cell);
                    self.cells_left_on_page -= take;

                    let mut values = Vec::with_capacity(take as usize);
                    for i in 0..take {
                        let shift = 16 - self.bits * (i + 1);
                        let mask = ((1u32 << self.bits) - 1) as u16;
                        let code = (cell >> shift) & mask;
                        if code == 0 || code as usize > self.dictionary.len() {
                            return Err(Error::invalid_arg(format!(
                                "dictionary code {} out of range on page {}",
                                code, self.page_no
                            )));
                        }
                        values.push(self.dictionary[code as usize - 1].clone());
                    }
                    ColStoreBlock::DictionaryCell { values }
                }
            }
        };
        st.unpin_page(session, &page)?;
        Ok(Some(block))
    }

    /// Total cells stored in the column, summed over its pages.
    pub fn total_cells(st: &mut StorageManager, session: SessionId, file_id: FileId) -> Result<u32> {
        let num_pages = st.buffer.file(file_id)?.num_pages()?;
        let mut total = 0u32;
        for page_no in 0..num_pages {
            let page = st.load_dbpage(session, file_id, page_no, false)?;
            total += blocks::cell_count(&page.borrow());
            st.unpin_page(session, &page)?;
        }
        Ok(total)
    }

    /// Scans forward for the value at row `position`. Readers are forward
    /// only; callers request monotonically increasing rows. `rows_consumed`
    /// and `pending` carry decode state between calls: `pending` holds the
    /// values of rows `rows_consumed..` that have been decoded but not yet
    /// served.
    pub fn value_at(
        &mut self,
        st: &mut StorageManager,
        session: SessionId,
        position: u32,
        rows_consumed: &mut u32,
        pending: &mut Vec<Value>,
    ) -> Result<Option<Value>> {
        if position < *rows_consumed {
            return Err(Error::invalid_arg(format!(
                "column readers are forward-only (row {} after row {})",
                position, *rows_consumed
            )));
        }

        loop {
            if *rows_consumed + pending.len() as u32 > position {
                let at = (position - *rows_consumed) as usize;
                let value = pending[at].clone();
                pending.drain(..=at);
                *rows_consumed = position + 1;
                return Ok(Some(value));
            }
            *rows_consumed += pending.len() as u32;
            pending.clear();

            let Some(block) = self.next_block(st, session)? else {
                return Ok(None);
            };
            match block {
                ColStoreBlock::Rle { value, start, length } => {
                    if start != *rows_consumed {
                        return Err(Error::invalid_arg(format!(
                            "RLE run starts at {} but row {} was expected",
                            start, *rows_consumed
                        )));
                    }
                    pending.extend(std::iter::repeat(value).take(length as usize));
                }
                ColStoreBlock::Uncompressed { value, position: at } => {
                    if at != *rows_consumed {
                        return Err(Error::invalid_arg(format!(
                            "cell at {} found where row {} was expected",
                            at, *rows_consumed
                        )));
                    }
                    pending.push(value);
                }
                ColStoreBlock::DictionaryCell { values } => {
                    pending.extend(values);
                }
            }
        }
    }
}

/// A row materialized from the column files at one row position. The
/// values are owned, so the tuple outlives any page.
pub struct ColumnStoreTuple {
    values: Vec<Value>,
    row: u32,
}

impl ColumnStoreTuple {
    pub fn new(values: Vec<Value>, row: u32) -> ColumnStoreTuple {
        ColumnStoreTuple { values, row }
    }

    pub fn row(&self) -> u32 {
        self.row
    }
}

impl Tuple for ColumnStoreTuple {
    fn column_count(&self) -> usize {
        self.values.len()
    }

    fn is_null_value(&self, col: usize) -> Result<bool> {
        Ok(self.value_at(col)?.is_null())
    }

    fn get_column_value(&self, col: usize) -> Result<Value> {
        Ok(self.value_at(col)?.clone())
    }

    fn set_column_value(&mut self, _col: usize, _value: Value) -> Result<()> {
        Err(Error::Unsupported(
            "column-store tuples are read-only views".into(),
        ))
    }

    fn external_reference(&self) -> Option<FilePointer> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ColumnStoreTuple {
    fn value_at(&self, col: usize) -> Result<&Value> {
        self.values.get(col).ok_or_else(|| {
            Error::invalid_arg(format!(
                "column index {} out of range for {} columns",
                col,
                self.values.len()
            ))
        })
    }
}
