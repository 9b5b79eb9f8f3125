//! Page-level access to database files.
//!
//! A `DBFile` is a disk file divided into fixed-size pages. The first two
//! bytes of every database file identify it: byte 0 is the file type, byte
//! 1 the base-2 logarithm of the page size.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::types::FileId;

/// The minimum page size, 512 bytes.
pub const MIN_PAGE_SIZE: u32 = 512;

/// The maximum page size, 64 KiB.
pub const MAX_PAGE_SIZE: u32 = 65536;

/// The default page size, 8 KiB.
pub const DEFAULT_PAGE_SIZE: u32 = 8192;

/// True if `page_size` is a power of two within the supported range.
pub fn is_valid_page_size(page_size: u32) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) && page_size.is_power_of_two()
}

/// Encodes a valid page size as its base-2 logarithm for storage in a file
/// header.
pub fn encode_page_size(page_size: u32) -> Result<u8> {
    if !is_valid_page_size(page_size) {
        return Err(Error::InvalidPageSize(page_size));
    }
    Ok(page_size.trailing_zeros() as u8)
}

/// Decodes a base-2 logarithm back into a page size.
pub fn decode_page_size(encoded: u8) -> Result<u32> {
    if encoded >= 32 {
        return Err(Error::InvalidPageSize(0));
    }
    let page_size = 1u32 << encoded;
    if !is_valid_page_size(page_size) {
        return Err(Error::InvalidPageSize(page_size));
    }
    Ok(page_size)
}

/// The kinds of database file, stored as the first byte of every file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DBFileType {
    /// Heap tuple file: variable-size tuples in no particular order.
    HeapTupleFile = 1,
    /// B+ tree index file keeping tuples in key order.
    BTreeTupleFile = 2,
    /// Transaction-state file recording recovery boundaries.
    TxnStateFile = 3,
    /// Write-ahead log segment.
    WriteAheadLogFile = 4,
    /// One column of a column-store table.
    ColumnStoreDataFile = 5,
    /// The header file of a column-store table.
    ColumnStoreHeaderFile = 6,
}

impl DBFileType {
    pub fn from_u8(byte: u8) -> Result<DBFileType> {
        match byte {
            1 => Ok(DBFileType::HeapTupleFile),
            2 => Ok(DBFileType::BTreeTupleFile),
            3 => Ok(DBFileType::TxnStateFile),
            4 => Ok(DBFileType::WriteAheadLogFile),
            5 => Ok(DBFileType::ColumnStoreDataFile),
            6 => Ok(DBFileType::ColumnStoreHeaderFile),
            other => Err(Error::invalid_arg(format!(
                "unrecognized file type byte {}",
                other
            ))),
        }
    }
}

/// Identifying metadata for an open `DBFile`.
#[derive(Debug, Clone)]
pub struct DBFileInfo {
    pub id: FileId,
    /// Path of the file relative to the base directory.
    pub name: String,
    pub file_type: DBFileType,
    pub page_size: u32,
}

/// An open database file: metadata plus the OS file handle. Raw page I/O
/// lives here; everything above works in whole pages.
#[derive(Debug)]
pub struct DBFile {
    pub info: DBFileInfo,
    file: File,
}

impl DBFile {
    /// Wraps an open OS file. The page size must already be validated.
    pub fn new(info: DBFileInfo, file: File) -> Result<DBFile> {
        if !is_valid_page_size(info.page_size) {
            return Err(Error::InvalidPageSize(info.page_size));
        }
        Ok(DBFile { info, file })
    }

    pub fn id(&self) -> FileId {
        self.info.id
    }

    pub fn page_size(&self) -> u32 {
        self.info.page_size
    }

    pub fn file_type(&self) -> DBFileType {
        self.info.file_type
    }

    /// The number of whole pages currently in the file.
    pub fn num_pages(&self) -> Result<u32> {
        let len = self.file.metadata()?.len();
        Ok((len / self.info.page_size as u64) as u32)
    }

    /// Reads one page into `buf` (which must be page-size long). Returns
    /// `false` when the page lies past the end of the file.
    pub fn read_page(&mut self, page_no: u32, buf: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(buf.len(), self.info.page_size as usize);
        let offset = page_no as u64 * self.info.page_size as u64;
        if offset >= self.file.metadata()?.len() {
            return Ok(false);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(true)
    }

    /// Writes one page-size buffer at the page's offset, extending the file
    /// if needed. The write is not synced; call `sync` for durability.
    pub fn write_page(&mut self, page_no: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.info.page_size as usize);
        let offset = page_no as u64 * self.info.page_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Forces file contents (and metadata) to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_page_size() {
        // Out of range.
        assert!(!is_valid_page_size(256));
        assert!(!is_valid_page_size(131072));

        // In range but not powers of two.
        assert!(!is_valid_page_size(1000));
        assert!(!is_valid_page_size(513));
        assert!(!is_valid_page_size(65535));

        // The valid sizes.
        for shift in 9..=16 {
            assert!(is_valid_page_size(1 << shift));
        }
    }

    #[test]
    fn test_encode_page_size() {
        assert_eq!(encode_page_size(512).unwrap(), 9);
        assert_eq!(encode_page_size(1024).unwrap(), 10);
        assert_eq!(encode_page_size(8192).unwrap(), 13);
        assert_eq!(encode_page_size(65536).unwrap(), 16);
        assert!(matches!(
            encode_page_size(1000),
            Err(Error::InvalidPageSize(1000))
        ));
    }

    #[test]
    fn test_decode_page_size() {
        assert_eq!(decode_page_size(9).unwrap(), 512);
        assert_eq!(decode_page_size(13).unwrap(), 8192);
        assert_eq!(decode_page_size(16).unwrap(), 65536);
        assert!(decode_page_size(8).is_err());
        assert!(decode_page_size(17).is_err());
        assert!(decode_page_size(40).is_err());
    }

    #[test]
    fn test_file_type_round_trip() {
        for t in [
            DBFileType::HeapTupleFile,
            DBFileType::BTreeTupleFile,
            DBFileType::TxnStateFile,
            DBFileType::WriteAheadLogFile,
            DBFileType::ColumnStoreDataFile,
            DBFileType::ColumnStoreHeaderFile,
        ] {
            assert_eq!(DBFileType::from_u8(t as u8).unwrap(), t);
        }
        assert!(DBFileType::from_u8(0).is_err());
        assert!(DBFileType::from_u8(200).is_err());
    }
}
