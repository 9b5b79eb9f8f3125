//! Core value and identifier types shared across the storage subsystems.

use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// Identifies a client session. The session layer serializes requests, but
/// the buffer manager still tracks page pins per session so that every pin
/// is released by the session that took it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// Identifies an open database file. Pages reference their owning file by
/// this id rather than by pointer, so the cache can own every page buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file #{}", self.0)
    }
}

/// A single column value.
///
/// The variants mirror the fixed SQL type set: integer widths 1/2/4/8,
/// IEEE-754 single and double floats, and ASCII text (used for both CHAR
/// and VARCHAR columns; the column type decides the stored form).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Float(f32),
    Double(f64),
    Text(String),
}

impl Value {
    /// True if this is the SQL NULL value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Compares two values of the same type. NULL orders before every
    /// non-NULL value; floats use the IEEE total order so comparisons are
    /// well defined for every bit pattern.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ok(Ordering::Equal),
            (Null, _) => Ok(Ordering::Less),
            (_, Null) => Ok(Ordering::Greater),
            (TinyInt(a), TinyInt(b)) => Ok(a.cmp(b)),
            (SmallInt(a), SmallInt(b)) => Ok(a.cmp(b)),
            (Integer(a), Integer(b)) => Ok(a.cmp(b)),
            (BigInt(a), BigInt(b)) => Ok(a.cmp(b)),
            (Float(a), Float(b)) => Ok(a.total_cmp(b)),
            (Double(a), Double(b)) => Ok(a.total_cmp(b)),
            (Text(a), Text(b)) => Ok(a.cmp(b)),
            (a, b) => Err(Error::invalid_arg(format!(
                "cannot compare {:?} with {:?}",
                a, b
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::TinyInt(v) => write!(f, "{}", v),
            Value::SmallInt(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "'{}'", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_orders_first() {
        assert_eq!(
            Value::Null.compare(&Value::Integer(0)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            Value::Integer(0).compare(&Value::Null).unwrap(),
            Ordering::Greater
        );
        assert_eq!(Value::Null.compare(&Value::Null).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_same_type_comparison() {
        assert_eq!(
            Value::Integer(3).compare(&Value::Integer(7)).unwrap(),
            Ordering::Less
        );
        assert_eq!(
            Value::Text("b".into())
                .compare(&Value::Text("a".into()))
                .unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            Value::Double(1.5).compare(&Value::Double(1.5)).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_mixed_type_comparison_fails() {
        assert!(Value::Integer(1).compare(&Value::BigInt(1)).is_err());
    }
}
