//! Table and column statistics, stored in table header pages and refreshed
//! by the `analyze` operation of each tuple-file manager.

use crate::types::Value;

/// Sentinel meaning "statistic has not been computed".
pub const STAT_UNKNOWN: i32 = -1;

/// Per-column statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    /// Number of distinct non-NULL values, or `STAT_UNKNOWN`.
    pub num_unique: i32,
    /// Number of NULL values, or `STAT_UNKNOWN`.
    pub num_null: i32,
    /// Smallest non-NULL value seen, when the column type is ordered.
    pub min_value: Option<Value>,
    /// Largest non-NULL value seen.
    pub max_value: Option<Value>,
}

impl ColumnStats {
    pub fn unknown() -> ColumnStats {
        ColumnStats {
            num_unique: STAT_UNKNOWN,
            num_null: STAT_UNKNOWN,
            min_value: None,
            max_value: None,
        }
    }
}

/// Whole-table statistics plus one `ColumnStats` per column.
#[derive(Debug, Clone, PartialEq)]
pub struct TableStats {
    pub num_data_pages: u16,
    pub num_tuples: u32,
    pub avg_tuple_size: f32,
    pub column_stats: Vec<ColumnStats>,
}

impl TableStats {
    /// Empty statistics for a freshly created table with `num_columns`
    /// columns.
    pub fn empty(num_columns: usize) -> TableStats {
        TableStats {
            num_data_pages: 0,
            num_tuples: 0,
            avg_tuple_size: 0.0,
            column_stats: vec![ColumnStats::unknown(); num_columns],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats_shape() {
        let stats = TableStats::empty(3);
        assert_eq!(stats.num_tuples, 0);
        assert_eq!(stats.column_stats.len(), 3);
        assert_eq!(stats.column_stats[0].num_unique, STAT_UNKNOWN);
    }
}
