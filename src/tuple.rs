//! The tuple abstraction shared by heap files, B+ tree indexes, and the
//! column store, plus the self-contained `TupleLiteral`.

use std::any::Any;

use crate::error::{Error, Result};
use crate::storage::FilePointer;
use crate::types::Value;

/// A row of typed values. Implementations may be backed by a page
/// (`HeapFilePageTuple`, `BTreeFilePageTuple`), by column-store blocks, or
/// by owned memory (`TupleLiteral`).
pub trait Tuple {
    /// The number of columns in the tuple.
    fn column_count(&self) -> usize;

    /// True if the column holds SQL NULL.
    fn is_null_value(&self, col: usize) -> Result<bool>;

    /// Reads one column.
    fn get_column_value(&self, col: usize) -> Result<Value>;

    /// Writes one column in place. Backings that are immutable once stored
    /// return `Unsupported`.
    fn set_column_value(&mut self, col: usize, value: Value) -> Result<()>;

    /// Where this tuple lives on disk, when it has a stable address.
    fn external_reference(&self) -> Option<FilePointer>;

    /// Downcast support for backing-specific scan state.
    fn as_any(&self) -> &dyn Any;
}

/// A tuple that owns its values outright.
///
/// Literals are byte-accurate deep copies: code that needs a key or row to
/// outlive its originating page (B+ tree navigation, index maintenance)
/// copies the page tuple into a literal before the page is unpinned.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleLiteral {
    values: Vec<Value>,
    external_ref: Option<FilePointer>,
}

impl TupleLiteral {
    pub fn new(values: Vec<Value>) -> TupleLiteral {
        TupleLiteral {
            values,
            external_ref: None,
        }
    }

    /// A literal that remembers where its source row lives; B+ tree entries
    /// require this so every stored key is unique.
    pub fn with_reference(values: Vec<Value>, ptr: FilePointer) -> TupleLiteral {
        TupleLiteral {
            values,
            external_ref: Some(ptr),
        }
    }

    /// Deep-copies another tuple, including its external reference.
    pub fn from_tuple(tuple: &dyn Tuple) -> Result<TupleLiteral> {
        let mut values = Vec::with_capacity(tuple.column_count());
        for i in 0..tuple.column_count() {
            values.push(tuple.get_column_value(i)?);
        }
        Ok(TupleLiteral {
            values,
            external_ref: tuple.external_reference(),
        })
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

impl Tuple for TupleLiteral {
    fn column_count(&self) -> usize {
        self.values.len()
    }

    fn is_null_value(&self, col: usize) -> Result<bool> {
        Ok(self.value_at(col)?.is_null())
    }

    fn get_column_value(&self, col: usize) -> Result<Value> {
        Ok(self.value_at(col)?.clone())
    }

    fn set_column_value(&mut self, col: usize, value: Value) -> Result<()> {
        let count = self.values.len();
        let slot = self.values.get_mut(col).ok_or_else(|| {
            Error::invalid_arg(format!("column index {} out of range for {} columns", col, count))
        })?;
        *slot = value;
        Ok(())
    }

    fn external_reference(&self) -> Option<FilePointer> {
        self.external_ref
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TupleLiteral {
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
