//! Column-store page layout and block shapes.
//!
//! Every page of a column data file shares one layout: bytes 0–1 are
//! reserved for the DBFile header (meaningful on page 0 only), bytes 2–5
//! hold the column's encoding marker, bytes 6–9 the number of cells the
//! page covers, bytes 10–13 the next write offset, and blocks start at
//! offset 14. The dictionary encoding stores its per-file dictionary at
//! the last page's next-write offset, after the final data block.

use crate::error::{Error, Result};
use crate::storage::dbpage::DBPage;
use crate::types::Value;

/// Encoding markers, stored in bytes 2–5 of every page of a column file.
pub const ENCODING_RLE: i32 = 1;
pub const ENCODING_UNCOMPRESSED: i32 = 2;
pub const ENCODING_DICTIONARY: i32 = 3;

/// Field offsets within a column-store page.
pub const OFFSET_ENCODING: usize = 2;
pub const OFFSET_CELL_COUNT: usize = 6;
pub const OFFSET_NEXT_WRITE: usize = 10;

/// First byte of block storage.
pub const DATA_START: u32 = 14;

/// The column encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Rle,
    Uncompressed,
    Dictionary,
}

impl Encoding {
    pub fn marker(&self) -> i32 {
        match self {
            Encoding::Rle => ENCODING_RLE,
            Encoding::Uncompressed => ENCODING_UNCOMPRESSED,
            Encoding::Dictionary => ENCODING_DICTIONARY,
        }
    }

    pub fn from_marker(marker: i32) -> Result<Encoding> {
        match marker {
            ENCODING_RLE => Ok(Encoding::Rle),
            ENCODING_UNCOMPRESSED => Ok(Encoding::Uncompressed),
            ENCODING_DICTIONARY => Ok(Encoding::Dictionary),
            other => Err(Error::invalid_arg(format!(
                "unrecognized column encoding marker {}",
                other
            ))),
        }
    }
}

/// One decoded block: a run, a single literal cell, or one 16-bit packed
/// dictionary cell's worth of values.
#[derive(Debug, Clone, PartialEq)]
pub enum ColStoreBlock {
    Rle {
        value: Value,
        start: u32,
        length: u32,
    },
    Uncompressed {
        value: Value,
        position: u32,
    },
    DictionaryCell {
        values: Vec<Value>,
    },
}

/// Initializes a page's column-store fields for writing.
pub fn init_page(page: &mut DBPage, encoding: Encoding) {
    page.write_i32(OFFSET_ENCODING, encoding.marker());
    page.write_u32(OFFSET_CELL_COUNT, 0);
    page.write_u32(OFFSET_NEXT_WRITE, DATA_START);
}

pub fn page_encoding(page: &DBPage) -> Result<Encoding> {
    Encoding::from_marker(page.read_i32(OFFSET_ENCODING))
}

pub fn cell_count(page: &DBPage) -> u32 {
    page.read_u32(OFFSET_CELL_COUNT)
}

pub fn add_cells(page: &mut DBPage, cells: u32) {
    let count = cell_count(page) + cells;
    page.write_u32(OFFSET_CELL_COUNT, count);
}

pub fn next_write_offset(page: &DBPage) -> u32 {
    page.read_u32(OFFSET_NEXT_WRITE)
}

pub fn set_next_write_offset(page: &mut DBPage, offset: u32) {
    page.write_u32(OFFSET_NEXT_WRITE, offset);
}

/// Bits needed for dictionary codes `1..=num_entries`, and the number of
/// codes packed into each 16-bit cell.
pub fn code_layout(num_entries: usize) -> (u32, u32) {
    debug_assert!(num_entries >= 1 && num_entries <= u16::MAX as usize);
    let bits = (16 - (num_entries as u16).leading_zeros()).max(1);
    (bits, 16 / bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileId;

    #[test]
    fn test_page_fields_round_trip() {
        let mut page = DBPage::new(FileId(1), 0, vec![0u8; 512]);
        init_page(&mut page, Encoding::Dictionary);
        assert_eq!(page_encoding(&page).unwrap(), Encoding::Dictionary);
        assert_eq!(cell_count(&page), 0);
        assert_eq!(next_write_offset(&page), DATA_START);

        add_cells(&mut page, 12);
        add_cells(&mut page, 3);
        set_next_write_offset(&mut page, 99);
        assert_eq!(cell_count(&page), 15);
        assert_eq!(next_write_offset(&page), 99);
    }

    #[test]
    fn test_code_layout() {
        assert_eq!(code_layout(1), (1, 16));
        assert_eq!(code_layout(2), (2, 8));
        assert_eq!(code_layout(3), (2, 8));
        assert_eq!(code_layout(20), (5, 3));
        assert_eq!(code_layout(255), (8, 2));
        assert_eq!(code_layout(256), (9, 1));
        assert_eq!(code_layout(65535), (16, 1));
    }

    #[test]
    fn test_unknown_marker_rejected() {
        assert!(Encoding::from_marker(9).is_err());
    }
}
