//! Column-store tables: one header file plus one data file per column.
//!
//! Tables are bulk-loaded from a CSV-shaped source: an analyzer makes a
//! pass over each column to pick its encoding (RLE, dictionary, or
//! uncompressed), then the writers encode each column into its own file.
//! Scans read blocks per column and compose them into row-oriented tuples
//! by row position. In-place DML is not provided; column tables are
//! rebuilt, not edited.

pub mod analyzer;
pub mod blocks;
pub mod reader;
pub mod writer;

use std::io::BufRead;
use std::rc::Rc;

use log::debug;

use crate::error::{Error, Result};
use crate::schema::{ColumnType, Schema};
use crate::stats::{ColumnStats, TableStats};
use crate::storage::colstore::analyzer::analyze_column;
use crate::storage::colstore::blocks::ColStoreBlock;
use crate::storage::colstore::reader::{BlockReader, ColumnStoreTuple};
use crate::storage::dbfile::DBFileType;
use crate::storage::header_page;
use crate::storage::storage_manager::{StorageManager, TableFileInfo};
use crate::storage::{FilePointer, TupleFileManager};
use crate::tuple::{Tuple, TupleLiteral};
use crate::types::{SessionId, Value};

/// On-disk name of one column's data file, under the table's directory.
pub fn column_file_name(table_name: &str, column_name: &str) -> String {
    format!("{}/{}.{}.tbl", table_name, table_name, column_name)
}

/// Parses one CSV field into a typed value.
fn parse_value(col_type: &ColumnType, text: &str) -> Result<Value> {
    let text = text.trim();
    let bad = || Error::invalid_arg(format!("cannot parse \"{}\" as {:?}", text, col_type));
    Ok(match col_type {
        ColumnType::TinyInt => Value::TinyInt(text.parse().map_err(|_| bad())?),
        ColumnType::SmallInt => Value::SmallInt(text.parse().map_err(|_| bad())?),
        ColumnType::Integer => Value::Integer(text.parse().map_err(|_| bad())?),
        ColumnType::BigInt => Value::BigInt(text.parse().map_err(|_| bad())?),
        ColumnType::Float => Value::Float(text.parse().map_err(|_| bad())?),
        ColumnType::Double => Value::Double(text.parse().map_err(|_| bad())?),
        ColumnType::Char { .. } | ColumnType::VarChar { .. } => Value::Text(text.to_string()),
    })
}

/// Bulk-loads a column-store table from a CSV-shaped source: analyzer pass
/// first, then one encoded write per column. The table must be empty.
/// Returns the number of rows loaded.
pub fn load_table_from_source<R: BufRead>(
    st: &mut StorageManager,
    session: SessionId,
    tbl: &mut TableFileInfo,
    source: R,
) -> Result<u32> {
    let num_cols = tbl.schema.num_columns();
    if BlockReader::total_cells(st, session, tbl.file_ids[1])? > 0 {
        return Err(Error::Unsupported(format!(
            "column-store table \"{}\" is already loaded",
            tbl.table_name
        )));
    }

    // Parse into column-major order.
    let mut columns: Vec<Vec<Value>> = vec![Vec::new(); num_cols];
    for line in source.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != num_cols {
            return Err(Error::invalid_arg(format!(
                "row has {} fields but the schema has {} columns",
                fields.len(),
                num_cols
            )));
        }
        for (i, field) in fields.iter().enumerate() {
            columns[i].push(parse_value(&tbl.schema.column(i)?.col_type, field)?);
        }
    }
    let num_rows = columns[0].len() as u32;

    // Analyze, choose encodings, and write each column.
    let mut column_stats = Vec::with_capacity(num_cols);
    let mut total_bytes = 0u64;
    for (i, values) in columns.iter().enumerate() {
        let col = tbl.schema.column(i)?.clone();
        let analysis = analyze_column(values)?;
        let encoding = analysis.choose_encoding();
        debug!(
            "column \"{}\": {} values, {} distinct, locality {:.2} -> {:?}",
            col.name,
            analysis.count,
            analysis.num_distinct,
            analysis.locality(),
            encoding
        );
        writer::write_column(st, session, tbl.file_ids[i + 1], &col.col_type, encoding, values)?;

        for value in values {
            total_bytes += crate::storage::page_tuple::value_storage_size(&col.col_type, value)? as u64;
        }
        column_stats.push(ColumnStats {
            num_unique: analysis.num_distinct as i32,
            num_null: 0,
            min_value: analysis.min_value,
            max_value: analysis.max_value,
        });
    }

    let stats = TableStats {
        num_data_pages: 0,
        num_tuples: num_rows,
        avg_tuple_size: if num_rows > 0 {
            total_bytes as f32 / num_rows as f32
        } else {
            0.0
        },
        column_stats,
    };
    write_header_stats(st, session, tbl, &stats)?;
    tbl.stats = stats;
    debug!("loaded {} rows into \"{}\"", num_rows, tbl.table_name);
    Ok(num_rows)
}

fn write_header_stats(
    st: &mut StorageManager,
    session: SessionId,
    tbl: &TableFileInfo,
    stats: &TableStats,
) -> Result<()> {
    let page = st.load_dbpage(session, tbl.primary_file(), 0, false)?;
    {
        let mut pg = page.borrow_mut();
        header_page::write_header(&mut pg, &tbl.schema, stats)?;
    }
    st.log_page_update(session, &page)?;
    st.unpin_page(session, &page)
}

/// Materializes the row at `row`, or `None` past the end of the table.
fn read_row(
    st: &mut StorageManager,
    session: SessionId,
    tbl: &TableFileInfo,
    row: u32,
) -> Result<Option<ColumnStoreTuple>> {
    let total = BlockReader::total_cells(st, session, tbl.file_ids[1])?;
    if row >= total {
        return Ok(None);
    }

    let mut values = Vec::with_capacity(tbl.schema.num_columns());
    for i in 0..tbl.schema.num_columns() {
        let col_type = tbl.schema.column(i)?.col_type;
        let mut reader = BlockReader::open(st, session, tbl.file_ids[i + 1], col_type)?;
        let mut consumed = 0u32;
        let mut pending = Vec::new();
        let value = reader
            .value_at(st, session, row, &mut consumed, &mut pending)?
            .ok_or_else(|| {
                Error::invalid_arg(format!(
                    "column {} of \"{}\" ended before row {}",
                    i, tbl.table_name, row
                ))
            })?;
        values.push(value);
    }
    Ok(Some(ColumnStoreTuple::new(values, row)))
}

/// All values of one column, in row order.
fn collect_column(
    st: &mut StorageManager,
    session: SessionId,
    file_id: crate::types::FileId,
    col_type: ColumnType,
) -> Result<Vec<Value>> {
    if BlockReader::total_cells(st, session, file_id)? == 0 {
        return Ok(Vec::new());
    }
    let mut reader = BlockReader::open(st, session, file_id, col_type)?;
    let mut values = Vec::new();
    while let Some(block) = reader.next_block(st, session)? {
        match block {
            ColStoreBlock::Rle { value, length, .. } => {
                values.extend(std::iter::repeat(value).take(length as usize));
            }
            ColStoreBlock::Uncompressed { value, .. } => values.push(value),
            ColStoreBlock::DictionaryCell {
                values: cell_values,
            } => values.extend(cell_values),
        }
    }
    Ok(values)
}

// ============================================================================
// The column-store tuple-file manager
// ============================================================================

pub struct ColStoreTupleFileManager;

impl TupleFileManager for ColStoreTupleFileManager {
    fn file_type(&self) -> DBFileType {
        DBFileType::ColumnStoreHeaderFile
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
        st.unpin_page(session, &page)?;

        let page_size = st.page_size();
        for col in tbl.schema.clone().columns() {
            let name = column_file_name(&tbl.table_name, &col.name);
            let file = st
                .file_manager
                .create_dbfile(&name, DBFileType::ColumnStoreDataFile, page_size)?;
            tbl.file_ids.push(st.buffer.register_file(file));
        }
        Ok(())
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
        st.unpin_page(session, &page)?;

        for col in tbl.schema.clone().columns() {
            let name = column_file_name(&tbl.table_name, &col.name);
            tbl.file_ids.push(st.ensure_dbfile_open(&name)?);
        }
        Ok(())
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
        // The per-table directory is empty now.
        let _ = std::fs::remove_dir(st.file_manager.resolve(&tbl.table_name));
        Ok(())
    }

    fn get_first_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
    ) -> Result<Option<Box<dyn Tuple>>> {
        Ok(read_row(st, session, tbl, 0)?.map(|t| Box::new(t) as Box<dyn Tuple>))
    }

    fn get_next_tuple(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &TableFileInfo,
        current: &dyn Tuple,
    ) -> Result<Option<Box<dyn Tuple>>> {
        let cur = current
            .as_any()
            .downcast_ref::<ColumnStoreTuple>()
            .ok_or_else(|| {
                Error::invalid_arg("column-store scans continue only from column-store tuples")
            })?;
        Ok(read_row(st, session, tbl, cur.row() + 1)?.map(|t| Box::new(t) as Box<dyn Tuple>))
    }

    fn get_tuple(
        &self,
        _st: &mut StorageManager,
        _session: SessionId,
        _tbl: &TableFileInfo,
        _ptr: FilePointer,
    ) -> Result<Box<dyn Tuple>> {
        Err(Error::Unsupported(
            "column-store tuples are not addressable by file pointer".into(),
        ))
    }

    fn add_tuple(
        &self,
        _st: &mut StorageManager,
        _session: SessionId,
        _tbl: &TableFileInfo,
        _tuple: &TupleLiteral,
    ) -> Result<FilePointer> {
        Err(Error::Unsupported(
            "column-store tables are bulk-loaded, not inserted into".into(),
        ))
    }

    fn update_tuple(
        &self,
        _st: &mut StorageManager,
        _session: SessionId,
        _tbl: &TableFileInfo,
        _tuple: &dyn Tuple,
        _updates: &[(usize, Value)],
    ) -> Result<()> {
        Err(Error::Unsupported(
            "column-store tables do not support in-place updates".into(),
        ))
    }

    fn delete_tuple(
        &self,
        _st: &mut StorageManager,
        _session: SessionId,
        _tbl: &TableFileInfo,
        _tuple: &dyn Tuple,
    ) -> Result<()> {
        Err(Error::Unsupported(
            "column-store tables do not support deletes".into(),
        ))
    }

    fn analyze_table_file(
        &self,
        st: &mut StorageManager,
        session: SessionId,
        tbl: &mut TableFileInfo,
    ) -> Result<()> {
        let num_cols = tbl.schema.num_columns();
        let mut column_stats = Vec::with_capacity(num_cols);
        let mut num_rows = 0u32;
        let mut total_bytes = 0u64;

        for i in 0..num_cols {
            let col_type = tbl.schema.column(i)?.col_type;
            let values = collect_column(st, session, tbl.file_ids[i + 1], col_type)?;
            num_rows = values.len() as u32;
            for value in &values {
                total_bytes +=
                    crate::storage::page_tuple::value_storage_size(&col_type, value)? as u64;
            }
            let analysis = analyze_column(&values)?;
            column_stats.push(ColumnStats {
                num_unique: analysis.num_distinct as i32,
                num_null: 0,
                min_value: analysis.min_value,
                max_value: analysis.max_value,
            });
        }

        let stats = TableStats {
            num_data_pages: 0,
            num_tuples: num_rows,
            avg_tuple_size: if num_rows > 0 {
                total_bytes as f32 / num_rows as f32
            } else {
                0.0
            },
            column_stats,
        };
        write_header_stats(st, session, tbl, &stats)?;
        tbl.stats = stats;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::schema::ColumnInfo;
    use crate::storage::colstore::blocks::Encoding;

    const SESSION: SessionId = SessionId(1);

    fn open_storage(dir: &std::path::Path) -> StorageManager {
        let mut config = StorageConfig::default();
        config.base_dir = dir.to_path_buf();
        config.page_size = 512;
        StorageManager::open(config).unwrap()
    }

    fn states_schema() -> Schema {
        Schema::new(vec![
            ColumnInfo::new("id", ColumnType::Integer),
            ColumnInfo::new("state", ColumnType::VarChar { length: 20 }),
        ])
        .unwrap()
    }

    fn column_encoding(st: &mut StorageManager, tbl: &TableFileInfo, col: usize) -> Encoding {
        let page = st
            .load_dbpage(SESSION, tbl.file_ids[col + 1], 0, false)
            .unwrap();
        let encoding = blocks::page_encoding(&page.borrow()).unwrap();
        st.unpin_page(SESSION, &page).unwrap();
        encoding
    }

    #[test]
    fn test_load_and_scan_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path());
        let mut tbl = st
            .create_table(SESSION, "states", states_schema(), DBFileType::ColumnStoreHeaderFile)
            .unwrap();

        let csv = "1,CA\n2,CA\n3,NY\n4,NY\n5,TX\n";
        load_table_from_source(&mut st, SESSION, &mut tbl, csv.as_bytes()).unwrap();
        assert_eq!(tbl.stats.num_tuples, 5);

        let mut rows = Vec::new();
        let mut cursor = st.get_first_tuple(SESSION, &tbl).unwrap();
        while let Some(tuple) = cursor {
            rows.push((
                tuple.get_column_value(0).unwrap(),
                tuple.get_column_value(1).unwrap(),
            ));
            cursor = st.get_next_tuple(SESSION, &tbl, tuple.as_ref()).unwrap();
        }
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0], (Value::Integer(1), Value::Text("CA".into())));
        assert_eq!(rows[4], (Value::Integer(5), Value::Text("TX".into())));
    }

    #[test]
    fn test_encoding_selection_per_column() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path());
        let schema = Schema::new(vec![
            ColumnInfo::new("sorted_runs", ColumnType::Integer),
            ColumnInfo::new("small_domain", ColumnType::Integer),
            ColumnInfo::new("distinct", ColumnType::Integer),
        ])
        .unwrap();
        let mut tbl = st
            .create_table(SESSION, "mix", schema, DBFileType::ColumnStoreHeaderFile)
            .unwrap();

        let mut csv = String::new();
        for i in 0..1000 {
            // Column 1: sorted with long runs; column 2: 20 distinct
            // values scattered; column 3: all distinct, scrambled.
            csv.push_str(&format!("{},{},{}\n", i / 50, (i * 7) % 20, (i * 241) % 1000));
        }
        load_table_from_source(&mut st, SESSION, &mut tbl, csv.as_bytes()).unwrap();

        assert_eq!(column_encoding(&mut st, &tbl, 0), Encoding::Rle);
        assert_eq!(column_encoding(&mut st, &tbl, 1), Encoding::Dictionary);
        assert_eq!(column_encoding(&mut st, &tbl, 2), Encoding::Uncompressed);

        // Every encoding must reconstruct the original cell sequence.
        for col in 0..3 {
            let col_type = tbl.schema.column(col).unwrap().col_type;
            let values = collect_column(&mut st, SESSION, tbl.file_ids[col + 1], col_type).unwrap();
            assert_eq!(values.len(), 1000);
            for (i, value) in values.iter().enumerate() {
                let expected = match col {
                    0 => (i / 50) as i32,
                    1 => ((i * 7) % 20) as i32,
                    _ => ((i * 241) % 1000) as i32,
                };
                assert_eq!(value, &Value::Integer(expected), "column {} row {}", col, i);
            }
        }
    }

    #[test]
    fn test_reopen_and_analyze() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut st = open_storage(dir.path());
            let mut tbl = st
                .create_table(SESSION, "t", states_schema(), DBFileType::ColumnStoreHeaderFile)
                .unwrap();
            load_table_from_source(&mut st, SESSION, &mut tbl, "1,a\n2,b\n3,a\n".as_bytes())
                .unwrap();
            st.shutdown().unwrap();
        }

        let mut st = open_storage(dir.path());
        let mut tbl = st.open_table(SESSION, "t").unwrap();
        assert_eq!(tbl.file_ids.len(), 3);
        assert_eq!(tbl.stats.num_tuples, 3);

        st.analyze_table(SESSION, &mut tbl).unwrap();
        assert_eq!(tbl.stats.num_tuples, 3);
        assert_eq!(tbl.stats.column_stats[1].num_unique, 2);
        assert_eq!(tbl.stats.column_stats[0].min_value, Some(Value::Integer(1)));
    }

    #[test]
    fn test_dml_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = open_storage(dir.path());
        let mut tbl = st
            .create_table(SESSION, "t", states_schema(), DBFileType::ColumnStoreHeaderFile)
            .unwrap();
        load_table_from_source(&mut st, SESSION, &mut tbl, "1,a\n".as_bytes()).unwrap();

        let lit = TupleLiteral::new(vec![Value::Integer(2), Value::Text("b".into())]);
        assert!(matches!(
            st.add_tuple(SESSION, &tbl, &lit),
            Err(Error::Unsupported(_))
        ));
        let first = st.get_first_tuple(SESSION, &tbl).unwrap().unwrap();
        assert!(matches!(
            st.delete_tuple(SESSION, &tbl, first.as_ref()),
            Err(Error::Unsupported(_))
        ));
        // Double-loading is refused.
        assert!(matches!(
            load_table_from_source(&mut st, SESSION, &mut tbl, "9,z\n".as_bytes()),
            Err(Error::Unsupported(_))
        ));
    }
}
