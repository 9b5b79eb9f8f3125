//! Column analysis and encoding selection.
//!
//! A single pass over a column's values yields the statistics the encoding
//! choice needs: value count, distinct count, run structure, and
//! monotonicity. Sorted data dominated by runs compresses best as RLE;
//! unsorted data drawn from a small domain dictionary-encodes; everything
//! else is stored uncompressed.

use std::cmp::Ordering;

use itertools::Itertools;

use crate::error::Result;
use crate::storage::colstore::blocks::Encoding;
use crate::types::Value;

/// Run-locality threshold above which sorted data becomes RLE.
pub const RLE_LOCALITY_THRESHOLD: f64 = 0.75;

/// Distinct-ratio threshold below which unsorted data becomes
/// dictionary-encoded.
pub const DICTIONARY_DISTINCT_THRESHOLD: f64 = 0.75;

/// What one pass over a column learned.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnAnalysis {
    pub count: u32,
    pub num_distinct: u32,
    /// Number of maximal runs of equal adjacent values.
    pub num_runs: u32,
    pub is_sorted: bool,
    pub min_value: Option<Value>,
    pub max_value: Option<Value>,
}

impl ColumnAnalysis {
    /// Fraction of values that repeat their predecessor: 1 − runs/count.
    pub fn locality(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        1.0 - self.num_runs as f64 / self.count as f64
    }

    pub fn distinct_ratio(&self) -> f64 {
        if self.count == 0 {
            return 1.0;
        }
        self.num_distinct as f64 / self.count as f64
    }

    /// Picks the column's encoding from the measured shape.
    pub fn choose_encoding(&self) -> Encoding {
        if self.is_sorted && self.locality() > RLE_LOCALITY_THRESHOLD {
            Encoding::Rle
        } else if !self.is_sorted && self.distinct_ratio() < DICTIONARY_DISTINCT_THRESHOLD {
            Encoding::Dictionary
        } else {
            Encoding::Uncompressed
        }
    }
}

/// Analyzes one column's values.
pub fn analyze_column(values: &[Value]) -> Result<ColumnAnalysis> {
    let count = values.len() as u32;
    let num_runs = values.iter().dedup().count() as u32;

    let mut is_sorted = true;
    for pair in values.windows(2) {
        if pair[0].compare(&pair[1])? == Ordering::Greater {
            is_sorted = false;
            break;
        }
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
    let min_value = sorted.first().cloned();
    let max_value = sorted.last().cloned();
    sorted.dedup();
    let num_distinct = sorted.len() as u32;

    Ok(ColumnAnalysis {
        count,
        num_distinct,
        num_runs,
        is_sorted,
        min_value,
        max_value,
    })
}
