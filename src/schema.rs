//! Table schemas: column types, column metadata, and key constraints.

use crate::error::{Error, Result};
use crate::types::Value;

/// The fixed set of column types the storage core understands.
///
/// Each type has a stable one-byte ID used in serialized table headers;
/// CHAR and VARCHAR additionally carry a length, serialized as two bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Double,
    /// Fixed-length US-ASCII string, NUL-padded on disk.
    Char { length: u16 },
    /// Variable-length US-ASCII string with a 2-byte length prefix.
    VarChar { length: u16 },
}

/// Type IDs as stored in table headers.
pub const TYPE_ID_TINYINT: u8 = 1;
pub const TYPE_ID_SMALLINT: u8 = 2;
pub const TYPE_ID_INTEGER: u8 = 3;
pub const TYPE_ID_BIGINT: u8 = 4;
pub const TYPE_ID_FLOAT: u8 = 5;
pub const TYPE_ID_DOUBLE: u8 = 6;
pub const TYPE_ID_CHAR: u8 = 21;
pub const TYPE_ID_VARCHAR: u8 = 22;

impl ColumnType {
    /// The one-byte type ID stored in table headers.
    pub fn type_id(&self) -> u8 {
        match self {
            ColumnType::TinyInt => TYPE_ID_TINYINT,
            ColumnType::SmallInt => TYPE_ID_SMALLINT,
            ColumnType::Integer => TYPE_ID_INTEGER,
            ColumnType::BigInt => TYPE_ID_BIGINT,
            ColumnType::Float => TYPE_ID_FLOAT,
            ColumnType::Double => TYPE_ID_DOUBLE,
            ColumnType::Char { .. } => TYPE_ID_CHAR,
            ColumnType::VarChar { .. } => TYPE_ID_VARCHAR,
        }
    }

    /// Reconstructs a type from its ID and optional length.
    pub fn from_type_id(id: u8, length: u16) -> Result<ColumnType> {
        match id {
            TYPE_ID_TINYINT => Ok(ColumnType::TinyInt),
            TYPE_ID_SMALLINT => Ok(ColumnType::SmallInt),
            TYPE_ID_INTEGER => Ok(ColumnType::Integer),
            TYPE_ID_BIGINT => Ok(ColumnType::BigInt),
            TYPE_ID_FLOAT => Ok(ColumnType::Float),
            TYPE_ID_DOUBLE => Ok(ColumnType::Double),
            TYPE_ID_CHAR => Ok(ColumnType::Char { length }),
            TYPE_ID_VARCHAR => Ok(ColumnType::VarChar { length }),
            other => Err(Error::UnsupportedType(other)),
        }
    }

    /// True for types whose serialized length carries a declared length.
    pub fn has_length(&self) -> bool {
        matches!(self, ColumnType::Char { .. } | ColumnType::VarChar { .. })
    }

    /// The declared length of CHAR/VARCHAR types.
    pub fn length(&self) -> u16 {
        match self {
            ColumnType::Char { length } | ColumnType::VarChar { length } => *length,
            _ => 0,
        }
    }

    /// True if values of this type occupy a fixed number of bytes.
    pub fn is_fixed_size(&self) -> bool {
        !matches!(self, ColumnType::VarChar { .. })
    }

    /// The on-page width of a fixed-size type, in bytes.
    pub fn fixed_size(&self) -> u32 {
        match self {
            ColumnType::TinyInt => 1,
            ColumnType::SmallInt => 2,
            ColumnType::Integer | ColumnType::Float => 4,
            ColumnType::BigInt | ColumnType::Double => 8,
            ColumnType::Char { length } => *length as u32,
            ColumnType::VarChar { .. } => 0,
        }
    }

    /// Checks that a value is storable in a column of this type.
    pub fn check_value(&self, value: &Value) -> Result<()> {
        let ok = match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::TinyInt, Value::TinyInt(_)) => true,
            (ColumnType::SmallInt, Value::SmallInt(_)) => true,
            (ColumnType::Integer, Value::Integer(_)) => true,
            (ColumnType::BigInt, Value::BigInt(_)) => true,
            (ColumnType::Float, Value::Float(_)) => true,
            (ColumnType::Double, Value::Double(_)) => true,
            (ColumnType::Char { length }, Value::Text(s)) => s.len() <= *length as usize,
            (ColumnType::VarChar { length }, Value::Text(s)) => s.len() <= *length as usize,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::invalid_arg(format!(
                "value {} is not storable in a {:?} column",
                value, self
            )))
        }
    }
}

/// Metadata for one column: its name, the table it belongs to (when known),
/// and its type.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub table_name: Option<String>,
    pub col_type: ColumnType,
}

impl ColumnInfo {
    pub fn new<S: Into<String>>(name: S, col_type: ColumnType) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            table_name: None,
            col_type,
        }
    }
}

/// Key constraints declared on a table. Column references are 0-based
/// indexes into the schema, stored as single bytes in table headers.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyConstraint {
    /// PRIMARY KEY or UNIQUE, with the enforcing index's name when one has
    /// been built.
    Candidate {
        primary: bool,
        name: Option<String>,
        columns: Vec<u8>,
        index_name: Option<String>,
    },
    /// FOREIGN KEY: pairs of (local column, referenced column).
    ForeignKey {
        name: Option<String>,
        ref_table: String,
        columns: Vec<(u8, u8)>,
    },
}

/// An ordered list of columns plus the table's key constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    columns: Vec<ColumnInfo>,
    constraints: Vec<KeyConstraint>,
}

impl Schema {
    /// A schema with no columns yet; used while a table header is being
    /// loaded.
    pub fn empty() -> Schema {
        Schema {
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Builds a schema from column metadata. At most 255 columns, and
    /// column names must be unique (case-sensitive).
    pub fn new(columns: Vec<ColumnInfo>) -> Result<Schema> {
        if columns.len() > 255 {
            return Err(Error::invalid_arg(format!(
                "a schema holds at most 255 columns, got {}",
                columns.len()
            )));
        }
        for (i, col) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == col.name) {
                return Err(Error::invalid_arg(format!(
                    "duplicate column name \"{}\"",
                    col.name
                )));
            }
        }
        Ok(Schema {
            columns,
            constraints: Vec::new(),
        })
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// The column at `index`, or an `InvalidArgument` error when out of
    /// range.
    pub fn column(&self, index: usize) -> Result<&ColumnInfo> {
        self.columns.get(index).ok_or_else(|| {
            Error::invalid_arg(format!(
                "column index {} out of range for {}-column schema",
                index,
                self.columns.len()
            ))
        })
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    /// The index of the named column, if present.
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn add_constraint(&mut self, constraint: KeyConstraint) {
        self.constraints.push(constraint);
    }

    pub fn constraints(&self) -> &[KeyConstraint] {
        &self.constraints
    }

    /// Sets the owning table name on every column.
    pub fn set_table_name(&mut self, table: &str) {
        for col in &mut self.columns {
            col.table_name = Some(table.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_col_schema() -> Schema {
        Schema::new(vec![
            ColumnInfo::new("id", ColumnType::Integer),
            ColumnInfo::new("name", ColumnType::VarChar { length: 20 }),
        ])
        .unwrap()
    }

    #[test]
    fn test_type_ids_round_trip() {
        let types = [
            ColumnType::TinyInt,
            ColumnType::SmallInt,
            ColumnType::Integer,
            ColumnType::BigInt,
            ColumnType::Float,
            ColumnType::Double,
            ColumnType::Char { length: 12 },
            ColumnType::VarChar { length: 200 },
        ];
        for t in types {
            let back = ColumnType::from_type_id(t.type_id(), t.length()).unwrap();
            assert_eq!(t, back);
        }
        assert!(matches!(
            ColumnType::from_type_id(99, 0),
            Err(Error::UnsupportedType(99))
        ));
    }

    #[test]
    fn test_schema_rejects_duplicates() {
        let result = Schema::new(vec![
            ColumnInfo::new("a", ColumnType::Integer),
            ColumnInfo::new("a", ColumnType::BigInt),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_column_lookup() {
        let schema = two_col_schema();
        assert_eq!(schema.find_column("name"), Some(1));
        assert_eq!(schema.find_column("missing"), None);
        assert!(schema.column(2).is_err());
    }

    #[test]
    fn test_value_checks() {
        let ct = ColumnType::Char { length: 4 };
        assert!(ct.check_value(&Value::Text("abcd".into())).is_ok());
        assert!(ct.check_value(&Value::Text("abcde".into())).is_err());
        assert!(ct.check_value(&Value::Null).is_ok());
        assert!(ColumnType::Integer.check_value(&Value::BigInt(1)).is_err());
    }
}
