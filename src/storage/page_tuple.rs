//! Tuples stored in pages: the null-bitmap encoding, typed value
//! serialization, and in-place column updates.
//!
//! A stored tuple is a null-bitmap of ceil(N/8) bytes (bit `i` set means
//! column `i` is NULL) followed by the non-null column values packed in
//! column order. NULL columns occupy no bytes and have the cached offset
//! `NULL_OFFSET`. In-place updates grow or shrink the tuple through the
//! slotted data-page range operations, which slide earlier tuple data
//! toward or away from the end of the page; B+ tree entries reuse the same
//! encoding but are replaced rather than edited, so their wrapper never
//! calls the mutating paths.

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::schema::{ColumnType, Schema};
use crate::storage::dbpage::{DBPage, PageRef};
use crate::storage::heap::data_page;
use crate::types::Value;

/// Cached-offset sentinel for NULL columns. Offset 0 is the file-type byte
/// of a header page, so no real value can live there.
pub const NULL_OFFSET: u32 = 0;

/// Size of the null-bitmap for a schema of `num_columns` columns.
pub fn bitmap_size(num_columns: usize) -> u32 {
    ((num_columns + 7) / 8) as u32
}

// ============================================================================
// Value serialization
// ============================================================================

/// The number of bytes `value` occupies when stored in a column of
/// `col_type`. NULL occupies zero bytes.
pub fn value_storage_size(col_type: &ColumnType, value: &Value) -> Result<u32> {
    if value.is_null() {
        return Ok(0);
    }
    col_type.check_value(value)?;
    match (col_type, value) {
        (ColumnType::VarChar { .. }, Value::Text(s)) => Ok(2 + s.len() as u32),
        _ => Ok(col_type.fixed_size()),
    }
}

/// The stored size of the value at `off`, read from the page (VARCHAR reads
/// its length prefix).
pub fn stored_value_size(page: &DBPage, off: u32, col_type: &ColumnType) -> u32 {
    match col_type {
        ColumnType::VarChar { .. } => 2 + page.read_u16(off as usize) as u32,
        _ => col_type.fixed_size(),
    }
}

/// Writes a non-NULL value at `off`; returns the bytes used.
pub fn write_value(page: &mut DBPage, off: u32, col_type: &ColumnType, value: &Value) -> Result<u32> {
    col_type.check_value(value)?;
    let off = off as usize;
    match (col_type, value) {
        (ColumnType::TinyInt, Value::TinyInt(v)) => {
            page.write_i8(off, *v);
            Ok(1)
        }
        (ColumnType::SmallInt, Value::SmallInt(v)) => {
            page.write_i16(off, *v);
            Ok(2)
        }
        (ColumnType::Integer, Value::Integer(v)) => {
            page.write_i32(off, *v);
            Ok(4)
        }
        (ColumnType::BigInt, Value::BigInt(v)) => {
            page.write_i64(off, *v);
            Ok(8)
        }
        (ColumnType::Float, Value::Float(v)) => {
            page.write_f32(off, *v);
            Ok(4)
        }
        (ColumnType::Double, Value::Double(v)) => {
            page.write_f64(off, *v);
            Ok(8)
        }
        (ColumnType::Char { length }, Value::Text(s)) => {
            page.write_fixed_string(off, s, *length as usize)?;
            Ok(*length as u32)
        }
        (ColumnType::VarChar { .. }, Value::Text(s)) => {
            let used = page.write_varstring64k(off, s)?;
            Ok(used as u32)
        }
        (ct, v) => Err(Error::invalid_arg(format!(
            "cannot store {} in a {:?} column",
            v, ct
        ))),
    }
}

/// Reads the non-NULL value at `off` for a column of `col_type`.
pub fn read_value(page: &DBPage, off: u32, col_type: &ColumnType) -> Result<Value> {
    let off = off as usize;
    Ok(match col_type {
        ColumnType::TinyInt => Value::TinyInt(page.read_i8(off)),
        ColumnType::SmallInt => Value::SmallInt(page.read_i16(off)),
        ColumnType::Integer => Value::Integer(page.read_i32(off)),
        ColumnType::BigInt => Value::BigInt(page.read_i64(off)),
        ColumnType::Float => Value::Float(page.read_f32(off)),
        ColumnType::Double => Value::Double(page.read_f64(off)),
        ColumnType::Char { length } => Value::Text(page.read_fixed_string(off, *length as usize)?),
        ColumnType::VarChar { .. } => Value::Text(page.read_varstring64k(off)?),
    })
}

// ============================================================================
// Whole-tuple helpers
// ============================================================================

/// The exact number of bytes needed to store `values` under `schema`:
/// bitmap plus packed non-null values.
pub fn get_tuple_storage_size(schema: &Schema, values: &[Value]) -> Result<u32> {
    if values.len() != schema.num_columns() {
        return Err(Error::invalid_arg(format!(
            "tuple has {} values but the schema has {} columns",
            values.len(),
            schema.num_columns()
        )));
    }
    let mut size = bitmap_size(schema.num_columns());
    for (i, value) in values.iter().enumerate() {
        size += value_storage_size(&schema.column(i)?.col_type, value)?;
    }
    Ok(size)
}

/// Writes a fresh tuple (bitmap plus values) at `off`. The caller must have
/// reserved `get_tuple_storage_size` bytes. Returns the end offset.
pub fn store_new_tuple(page: &mut DBPage, off: u32, schema: &Schema, values: &[Value]) -> Result<u32> {
    if values.len() != schema.num_columns() {
        return Err(Error::invalid_arg(format!(
            "tuple has {} values but the schema has {} columns",
            values.len(),
            schema.num_columns()
        )));
    }

    let bitmap = bitmap_size(schema.num_columns());
    page.fill(off as usize, bitmap as usize, 0);
    let mut pos = off + bitmap;
    for (i, value) in values.iter().enumerate() {
        if value.is_null() {
            let byte = off + (i as u32 / 8);
            let bit = 0x80u8 >> (i % 8);
            let old = page.read_u8(byte as usize);
            page.write_u8(byte as usize, old | bit);
        } else {
            pos += write_value(page, pos, &schema.column(i)?.col_type, value)?;
        }
    }
    Ok(pos)
}

// ============================================================================
// PageTuple
// ============================================================================

/// A tuple living inside a page, addressed by its start offset. Column
/// offsets are computed once and cached; they stay valid until the page is
/// re-slotted, at which point the tuple must be rebuilt.
pub struct PageTuple {
    page: PageRef,
    schema: Rc<Schema>,
    page_offset: u32,
    value_offsets: Vec<u32>,
    end_offset: u32,
}

impl PageTuple {
    pub fn new(page: PageRef, page_offset: u32, schema: Rc<Schema>) -> Result<PageTuple> {
        let mut tuple = PageTuple {
            page,
            schema,
            page_offset,
            value_offsets: Vec::new(),
            end_offset: page_offset,
        };
        tuple.compute_value_offsets()?;
        Ok(tuple)
    }

    pub fn page(&self) -> &PageRef {
        &self.page
    }

    pub fn schema(&self) -> &Rc<Schema> {
        &self.schema
    }

    pub fn page_offset(&self) -> u32 {
        self.page_offset
    }

    /// One past the last byte of the tuple.
    pub fn end_offset(&self) -> u32 {
        self.end_offset
    }

    /// Total stored size: bitmap plus values.
    pub fn storage_size(&self) -> u32 {
        self.end_offset - self.page_offset
    }

    fn compute_value_offsets(&mut self) -> Result<()> {
        let page = self.page.clone();
        let pg = page.borrow();
        let n = self.schema.num_columns();
        let mut offsets = Vec::with_capacity(n);
        let mut pos = self.page_offset + bitmap_size(n);
        for i in 0..n {
            if Self::null_flag(&pg, self.page_offset, i) {
                offsets.push(NULL_OFFSET);
            } else {
                offsets.push(pos);
                pos += stored_value_size(&pg, pos, &self.schema.column(i)?.col_type);
            }
        }
        self.value_offsets = offsets;
        self.end_offset = pos;
        Ok(())
    }

    fn null_flag(page: &DBPage, page_offset: u32, col: usize) -> bool {
        let byte = page.read_u8((page_offset + col as u32 / 8) as usize);
        byte & (0x80u8 >> (col % 8)) != 0
    }

    fn set_null_flag(page: &mut DBPage, page_offset: u32, col: usize, is_null: bool) {
        let pos = (page_offset + col as u32 / 8) as usize;
        let bit = 0x80u8 >> (col % 8);
        let old = page.read_u8(pos);
        let new = if is_null { old | bit } else { old & !bit };
        page.write_u8(pos, new);
    }

    fn check_column(&self, col: usize) -> Result<()> {
        if col >= self.schema.num_columns() {
            return Err(Error::invalid_arg(format!(
                "column index {} out of range for {}-column schema",
                col,
                self.schema.num_columns()
            )));
        }
        Ok(())
    }

    pub fn is_null(&self, col: usize) -> Result<bool> {
        self.check_column(col)?;
        Ok(self.value_offsets[col] == NULL_OFFSET)
    }

    pub fn get_value(&self, col: usize) -> Result<Value> {
        self.check_column(col)?;
        let off = self.value_offsets[col];
        if off == NULL_OFFSET {
            return Ok(Value::Null);
        }
        read_value(
            &self.page.borrow(),
            off,
            &self.schema.column(col)?.col_type,
        )
    }

    /// Sets one column in place, growing or shrinking the tuple within its
    /// slotted data page. The caller is responsible for ensuring the page
    /// has room for any growth.
    pub fn set_value(&mut self, col: usize, value: &Value) -> Result<()> {
        self.check_column(col)?;
        if value.is_null() {
            self.set_null_value(col)
        } else {
            self.set_nonnull_value(col, value)
        }
    }

    fn set_null_value(&mut self, col: usize) -> Result<()> {
        let off = self.value_offsets[col];
        if off == NULL_OFFSET {
            return Ok(());
        }

        let col_type = self.schema.column(col)?.col_type;
        let page = self.page.clone();
        let mut pg = page.borrow_mut();
        let old_size = stored_value_size(&pg, off, &col_type);

        Self::set_null_flag(&mut pg, self.page_offset, col, true);
        data_page::delete_tuple_data_range(&mut pg, off, old_size)?;

        // Everything before the removed range slid toward the end of the
        // page, this tuple's start included.
        self.page_offset += old_size;
        for other in self.value_offsets.iter_mut() {
            if *other != NULL_OFFSET && *other < off {
                *other += old_size;
            }
        }
        self.value_offsets[col] = NULL_OFFSET;
        Ok(())
    }

    fn set_nonnull_value(&mut self, col: usize, value: &Value) -> Result<()> {
        let col_type = self.schema.column(col)?.col_type;
        let new_size = value_storage_size(&col_type, value)?;

        let page = self.page.clone();
        let mut pg = page.borrow_mut();

        let was_null = self.value_offsets[col] == NULL_OFFSET;
        if was_null {
            // Derive the insertion point from the nearest preceding
            // non-NULL column; the new bytes go immediately after it.
            let mut insert_at = self.page_offset + bitmap_size(self.schema.num_columns());
            for j in (0..col).rev() {
                let off = self.value_offsets[j];
                if off != NULL_OFFSET {
                    insert_at = off + stored_value_size(&pg, off, &self.schema.column(j)?.col_type);
                    break;
                }
            }

            data_page::insert_tuple_data_range(&mut pg, insert_at, new_size)?;
            self.page_offset -= new_size;
            for other in self.value_offsets.iter_mut() {
                if *other != NULL_OFFSET && *other < insert_at {
                    *other -= new_size;
                }
            }
            self.value_offsets[col] = insert_at - new_size;
            Self::set_null_flag(&mut pg, self.page_offset, col, false);
        } else {
            let off = self.value_offsets[col];
            let old_size = stored_value_size(&pg, off, &col_type);
            if new_size > old_size {
                let delta = new_size - old_size;
                data_page::insert_tuple_data_range(&mut pg, off, delta)?;
                self.page_offset -= delta;
                for other in self.value_offsets.iter_mut() {
                    if *other != NULL_OFFSET && *other <= off {
                        *other -= delta;
                    }
                }
            } else if new_size < old_size {
                let delta = old_size - new_size;
                data_page::delete_tuple_data_range(&mut pg, off, delta)?;
                self.page_offset += delta;
                for other in self.value_offsets.iter_mut() {
                    if *other != NULL_OFFSET && *other <= off {
                        *other += delta;
                    }
                }
            }
        }

        write_value(&mut pg, self.value_offsets[col], &col_type, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnInfo;
    use crate::types::FileId;
    use std::cell::RefCell;

    fn make_page(size: usize) -> PageRef {
        Rc::new(RefCell::new(DBPage::new(FileId(1), 1, vec![0u8; size])))
    }

    fn test_schema() -> Rc<Schema> {
        Rc::new(
            Schema::new(vec![
                ColumnInfo::new("a", ColumnType::Integer),
                ColumnInfo::new("b", ColumnType::VarChar { length: 20 }),
                ColumnInfo::new("c", ColumnType::SmallInt),
            ])
            .unwrap()
        )
    }

    #[test]
    fn test_storage_size() {
        let schema = test_schema();
        // bitmap(1) + int(4) + "hi"(2+2) + smallint(2)
        let size = get_tuple_storage_size(
            &schema,
            &[
                Value::Integer(1),
                Value::Text("hi".into()),
                Value::SmallInt(3),
            ],
        )
        .unwrap();
        assert_eq!(size, 11);

        // NULL columns occupy no bytes.
        let size =
            get_tuple_storage_size(&schema, &[Value::Integer(1), Value::Null, Value::Null]).unwrap();
        assert_eq!(size, 5);

        assert!(get_tuple_storage_size(&schema, &[Value::Integer(1)]).is_err());
    }

    #[test]
    fn test_store_and_read_back() {
        let schema = test_schema();
        let page = make_page(512);
        let values = [
            Value::Integer(42),
            Value::Text("hello".into()),
            Value::Null,
        ];
        let end = {
            let mut pg = page.borrow_mut();
            store_new_tuple(&mut pg, 100, &schema, &values).unwrap()
        };
        assert_eq!(end, 100 + 1 + 4 + 7);

        let tuple = PageTuple::new(page, 100, schema).unwrap();
        assert_eq!(tuple.get_value(0).unwrap(), Value::Integer(42));
        assert_eq!(tuple.get_value(1).unwrap(), Value::Text("hello".into()));
        assert!(tuple.is_null(2).unwrap());
        assert_eq!(tuple.storage_size(), 12);
        assert!(tuple.get_value(3).is_err());
    }

    #[test]
    fn test_all_types_round_trip() {
        let schema = Rc::new(
            Schema::new(vec![
                ColumnInfo::new("t", ColumnType::TinyInt),
                ColumnInfo::new("s", ColumnType::SmallInt),
                ColumnInfo::new("i", ColumnType::Integer),
                ColumnInfo::new("b", ColumnType::BigInt),
                ColumnInfo::new("f", ColumnType::Float),
                ColumnInfo::new("d", ColumnType::Double),
                ColumnInfo::new("c", ColumnType::Char { length: 6 }),
                ColumnInfo::new("v", ColumnType::VarChar { length: 30 }),
            ])
            .unwrap(),
        );
        let values = [
            Value::TinyInt(-7),
            Value::SmallInt(300),
            Value::Integer(-100_000),
            Value::BigInt(1 << 40),
            Value::Float(2.5),
            Value::Double(-0.125),
            Value::Text("char".into()),
            Value::Text("varchar value".into()),
        ];
        let page = make_page(512);
        {
            let mut pg = page.borrow_mut();
            store_new_tuple(&mut pg, 10, &schema, &values).unwrap();
        }
        let tuple = PageTuple::new(page, 10, schema).unwrap();
        for (i, expected) in values.iter().enumerate() {
            assert_eq!(&tuple.get_value(i).unwrap(), expected);
        }
    }
}
