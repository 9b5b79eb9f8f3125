//! Serialization of table headers: schema, key constraints, and statistics.
//!
//! Header page layout (heap and column-store header files):
//!
//! ```text
//! [0]  file type          [1]    log2(page size)
//! [2]  schema size (2B)   [4]    stats size (2B)
//! [6]  schema ...               stats ...
//! ```
//!
//! The schema body is `numCols(1)` then per column `{typeID(1),
//! [length(2) for CHAR/VARCHAR], name}`, followed by the constraint section.

use crate::error::{Error, Result};
use crate::schema::{ColumnInfo, ColumnType, KeyConstraint, Schema};
use crate::stats::{ColumnStats, TableStats};
use crate::storage::dbpage::DBPage;
use crate::storage::page_tuple::{read_value, stored_value_size, write_value};

/// Offset of the 2-byte serialized-schema size.
pub const OFFSET_SCHEMA_SIZE: usize = 2;

/// Offset of the 2-byte serialized-statistics size.
pub const OFFSET_STATS_SIZE: usize = 4;

/// First byte of the serialized schema.
pub const OFFSET_SCHEMA_START: usize = 6;

/// Constraint-type tags; the high bit marks a named constraint.
const CONSTRAINT_PRIMARY: u8 = 1;
const CONSTRAINT_UNIQUE: u8 = 2;
const CONSTRAINT_FOREIGN: u8 = 3;
const CONSTRAINT_NAMED: u8 = 0x80;

/// Writes the schema and statistics into a table header page, recording
/// both section sizes.
pub fn write_header(page: &mut DBPage, schema: &Schema, stats: &TableStats) -> Result<()> {
    let schema_end = write_schema(page, OFFSET_SCHEMA_START, schema)?;
    let schema_size = schema_end - OFFSET_SCHEMA_START;
    let stats_end = write_stats(page, schema_end, schema, stats)?;
    let stats_size = stats_end - schema_end;

    page.write_u16(OFFSET_SCHEMA_SIZE, schema_size as u16);
    page.write_u16(OFFSET_STATS_SIZE, stats_size as u16);
    Ok(())
}

/// Reads the schema and statistics back out of a table header page.
pub fn read_header(page: &DBPage) -> Result<(Schema, TableStats)> {
    let (schema, schema_end) = read_schema(page, OFFSET_SCHEMA_START)?;
    let recorded = page.read_u16(OFFSET_SCHEMA_SIZE) as usize;
    if schema_end - OFFSET_SCHEMA_START != recorded {
        return Err(Error::invalid_arg(format!(
            "schema section is {} bytes but the header records {}",
            schema_end - OFFSET_SCHEMA_START,
            recorded
        )));
    }
    let (stats, _) = read_stats(page, schema_end, &schema)?;
    Ok((schema, stats))
}

/// Serializes a schema at `pos`; returns the end offset.
pub fn write_schema(page: &mut DBPage, pos: usize, schema: &Schema) -> Result<usize> {
    let mut pos = pos;
    page.write_u8(pos, schema.num_columns() as u8);
    pos += 1;

    for col in schema.columns() {
        page.write_u8(pos, col.col_type.type_id());
        pos += 1;
        if col.col_type.has_length() {
            page.write_u16(pos, col.col_type.length());
            pos += 2;
        }
        pos += page.write_varstring255(pos, &col.name)?;
    }

    page.write_u8(pos, schema.constraints().len() as u8);
    pos += 1;
    for constraint in schema.constraints() {
        pos = write_constraint(page, pos, constraint)?;
    }
    Ok(pos)
}

fn write_constraint(page: &mut DBPage, mut pos: usize, constraint: &KeyConstraint) -> Result<usize> {
    match constraint {
        KeyConstraint::Candidate {
            primary,
            name,
            columns,
            index_name,
        } => {
            let tag = if *primary {
                CONSTRAINT_PRIMARY
            } else {
                CONSTRAINT_UNIQUE
            };
            page.write_u8(pos, tag | if name.is_some() { CONSTRAINT_NAMED } else { 0 });
            pos += 1;
            if let Some(name) = name {
                pos += page.write_varstring255(pos, name)?;
            }
            page.write_u8(pos, columns.len() as u8);
            pos += 1;
            for col in columns {
                page.write_u8(pos, *col);
                pos += 1;
            }
            pos += page.write_varstring255(pos, index_name.as_deref().unwrap_or(""))?;
        }
        KeyConstraint::ForeignKey {
            name,
            ref_table,
            columns,
        } => {
            page.write_u8(
                pos,
                CONSTRAINT_FOREIGN | if name.is_some() { CONSTRAINT_NAMED } else { 0 },
            );
            pos += 1;
            if let Some(name) = name {
                pos += page.write_varstring255(pos, name)?;
            }
            pos += page.write_varstring255(pos, ref_table)?;
            page.write_u8(pos, columns.len() as u8);
            pos += 1;
            for (col, ref_col) in columns {
                page.write_u8(pos, *col);
                page.write_u8(pos + 1, *ref_col);
                pos += 2;
            }
        }
    }
    Ok(pos)
}

/// Deserializes a schema at `pos`; returns the schema and the end offset.
pub fn read_schema(page: &DBPage, pos: usize) -> Result<(Schema, usize)> {
    let mut pos = pos;
    let num_cols = page.read_u8(pos) as usize;
    pos += 1;

    let mut columns = Vec::with_capacity(num_cols);
    for _ in 0..num_cols {
        let type_id = page.read_u8(pos);
        pos += 1;
        let mut length = 0u16;
        if type_id == crate::schema::TYPE_ID_CHAR || type_id == crate::schema::TYPE_ID_VARCHAR {
            length = page.read_u16(pos);
            pos += 2;
        }
        let col_type = ColumnType::from_type_id(type_id, length)?;
        let name = page.read_varstring255(pos)?;
        pos += 1 + name.len();
        columns.push(ColumnInfo::new(name, col_type));
    }
    let mut schema = Schema::new(columns)?;

    let num_constraints = page.read_u8(pos) as usize;
    pos += 1;
    for _ in 0..num_constraints {
        let (constraint, next) = read_constraint(page, pos)?;
        schema.add_constraint(constraint);
        pos = next;
    }
    Ok((schema, pos))
}

fn read_constraint(page: &DBPage, mut pos: usize) -> Result<(KeyConstraint, usize)> {
    let tag = page.read_u8(pos);
    pos += 1;
    let named = tag & CONSTRAINT_NAMED != 0;
    let name = if named {
        let n = page.read_varstring255(pos)?;
        pos += 1 + n.len();
        Some(n)
    } else {
        None
    };

    let kind = tag & !CONSTRAINT_NAMED;
    match kind {
        CONSTRAINT_PRIMARY | CONSTRAINT_UNIQUE => {
            let num_cols = page.read_u8(pos) as usize;
            pos += 1;
            let mut columns = Vec::with_capacity(num_cols);
            for _ in 0..num_cols {
                columns.push(page.read_u8(pos));
                pos += 1;
            }
            let index_name = page.read_varstring255(pos)?;
            pos += 1 + index_name.len();
            Ok((
                KeyConstraint::Candidate {
                    primary: kind == CONSTRAINT_PRIMARY,
                    name,
                    columns,
                    index_name: if index_name.is_empty() {
                        None
                    } else {
                        Some(index_name)
                    },
                },
                pos,
            ))
        }
        CONSTRAINT_FOREIGN => {
            let ref_table = page.read_varstring255(pos)?;
            pos += 1 + ref_table.len();
            let num_cols = page.read_u8(pos) as usize;
            pos += 1;
            let mut columns = Vec::with_capacity(num_cols);
            for _ in 0..num_cols {
                columns.push((page.read_u8(pos), page.read_u8(pos + 1)));
                pos += 2;
            }
            Ok((
                KeyConstraint::ForeignKey {
                    name,
                    ref_table,
                    columns,
                },
                pos,
            ))
        }
        other => Err(Error::invalid_arg(format!(
            "unrecognized constraint tag {}",
            other
        ))),
    }
}

/// Serializes table statistics at `pos`; returns the end offset.
pub fn write_stats(
    page: &mut DBPage,
    pos: usize,
    schema: &Schema,
    stats: &TableStats,
) -> Result<usize> {
    let mut pos = pos;
    page.write_u16(pos, stats.num_data_pages);
    page.write_u32(pos + 2, stats.num_tuples);
    page.write_f32(pos + 6, stats.avg_tuple_size);
    pos += 10;

    for (i, col_stats) in stats.column_stats.iter().enumerate() {
        let col_type = schema.column(i)?.col_type;
        page.write_i32(pos, col_stats.num_unique);
        page.write_i32(pos + 4, col_stats.num_null);
        pos += 8;
        pos = write_optional_value(page, pos, &col_type, &col_stats.min_value)?;
        pos = write_optional_value(page, pos, &col_type, &col_stats.max_value)?;
    }
    Ok(pos)
}

/// Deserializes table statistics at `pos`; returns the stats and the end
/// offset.
pub fn read_stats(page: &DBPage, pos: usize, schema: &Schema) -> Result<(TableStats, usize)> {
    let mut pos = pos;
    let num_data_pages = page.read_u16(pos);
    let num_tuples = page.read_u32(pos + 2);
    let avg_tuple_size = page.read_f32(pos + 6);
    pos += 10;

    let mut column_stats = Vec::with_capacity(schema.num_columns());
    for i in 0..schema.num_columns() {
        let col_type = schema.column(i)?.col_type;
        let num_unique = page.read_i32(pos);
        let num_null = page.read_i32(pos + 4);
        pos += 8;
        let (min_value, next) = read_optional_value(page, pos, &col_type)?;
        let (max_value, next) = read_optional_value(page, next, &col_type)?;
        pos = next;
        column_stats.push(ColumnStats {
            num_unique,
            num_null,
            min_value,
            max_value,
        });
    }

    Ok((
        TableStats {
            num_data_pages,
            num_tuples,
            avg_tuple_size,
            column_stats,
        },
        pos,
    ))
}

fn write_optional_value(
    page: &mut DBPage,
    mut pos: usize,
    col_type: &ColumnType,
    value: &Option<crate::types::Value>,
) -> Result<usize> {
    match value {
        Some(v) => {
            page.write_u8(pos, 1);
            pos += 1;
            pos += write_value(page, pos as u32, col_type, v)? as usize;
        }
        None => {
            page.write_u8(pos, 0);
            pos += 1;
        }
    }
    Ok(pos)
}

fn read_optional_value(
    page: &DBPage,
    mut pos: usize,
    col_type: &ColumnType,
) -> Result<(Option<crate::types::Value>, usize)> {
    if page.read_u8(pos) == 0 {
        return Ok((None, pos + 1));
    }
    pos += 1;
    let value = read_value(page, pos as u32, col_type)?;
    pos += stored_value_size(page, pos as u32, col_type) as usize;
    Ok((Some(value), pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileId, Value};

    fn header_schema() -> Schema {
        let mut schema = Schema::new(vec![
            ColumnInfo::new("id", ColumnType::Integer),
            ColumnInfo::new("name", ColumnType::VarChar { length: 40 }),
            ColumnInfo::new("grade", ColumnType::Char { length: 2 }),
        ])
        .unwrap();
        schema.add_constraint(KeyConstraint::Candidate {
            primary: true,
            name: Some("pk_id".into()),
            columns: vec![0],
            index_name: Some("idx_id".into()),
        });
        schema.add_constraint(KeyConstraint::Candidate {
            primary: false,
            name: None,
            columns: vec![1, 2],
            index_name: None,
        });
        schema.add_constraint(KeyConstraint::ForeignKey {
            name: Some("fk_grade".into()),
            ref_table: "grades".into(),
            columns: vec![(2, 0)],
        });
        schema
    }

    #[test]
    fn test_header_round_trip() {
        let schema = header_schema();
        let mut stats = TableStats::empty(3);
        stats.num_data_pages = 4;
        stats.num_tuples = 100;
        stats.avg_tuple_size = 27.5;
        stats.column_stats[0] = ColumnStats {
            num_unique: 100,
            num_null: 0,
            min_value: Some(Value::Integer(1)),
            max_value: Some(Value::Integer(100)),
        };
        stats.column_stats[1] = ColumnStats {
            num_unique: 88,
            num_null: 12,
            min_value: Some(Value::Text("alice".into())),
            max_value: Some(Value::Text("zed".into())),
        };

        let mut page = DBPage::new(FileId(1), 0, vec![0u8; 1024]);
        write_header(&mut page, &schema, &stats).unwrap();
        let (schema2, stats2) = read_header(&page).unwrap();
        assert_eq!(schema2, schema);
        assert_eq!(stats2, stats);
    }

    #[test]
    fn test_empty_stats_round_trip() {
        let schema = Schema::new(vec![ColumnInfo::new("x", ColumnType::Double)]).unwrap();
        let mut page = DBPage::new(FileId(1), 0, vec![0u8; 512]);
        write_header(&mut page, &schema, &TableStats::empty(1)).unwrap();
        let (schema2, stats2) = read_header(&page).unwrap();
        assert_eq!(schema2, schema);
        assert_eq!(stats2, TableStats::empty(1));
    }
}
