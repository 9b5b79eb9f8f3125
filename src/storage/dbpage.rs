//! In-memory pages and their typed accessors.
//!
//! A `DBPage` is one page of a `DBFile` loaded into the buffer cache. All
//! multibyte accessors are big-endian; floats are stored by reinterpreting
//! their bits through the matching integer width. Every write captures the
//! page's old image (for WAL diffing) before the first change and sets the
//! dirty flag.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::storage::wal::Lsn;
use crate::types::FileId;

/// Shared handle to a cached page. The buffer manager owns the cache entry;
/// holders must keep the page pinned while they use the handle.
pub type PageRef = Rc<RefCell<DBPage>>;

/// One loaded page: its owning file id, page number, byte buffer, dirty
/// flag, and WAL bookkeeping.
#[derive(Debug)]
pub struct DBPage {
    file_id: FileId,
    page_no: u32,
    data: Vec<u8>,
    /// Snapshot of `data` taken when the page first diverges from its
    /// logged state; consumed by WAL update-record diffing.
    old_data: Option<Vec<u8>>,
    dirty: bool,
    /// LSN of the most recent update record describing this page.
    page_lsn: Option<Lsn>,
}

impl DBPage {
    /// Wraps a freshly read (or zero-filled) page buffer.
    pub fn new(file_id: FileId, page_no: u32, data: Vec<u8>) -> DBPage {
        DBPage {
            file_id,
            page_no,
            data,
            old_data: None,
            dirty: false,
            page_lsn: None,
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn page_no(&self) -> u32 {
        self.page_no
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn page_lsn(&self) -> Option<Lsn> {
        self.page_lsn
    }

    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        self.page_lsn = Some(lsn);
    }

    /// The page image the WAL last saw: the captured snapshot if the page
    /// has unlogged changes, otherwise the current data.
    pub fn old_data(&self) -> &[u8] {
        self.old_data.as_deref().unwrap_or(&self.data)
    }

    /// Declares the current contents logged: the next write captures a new
    /// snapshot from this state. The dirty flag is untouched; the page may
    /// still need a disk write.
    pub fn sync_old_data(&mut self) {
        self.old_data = None;
    }

    /// Marks the page written back to disk.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
        self.old_data = None;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Captures the old image (once) and sets the dirty flag. Every write
    /// accessor funnels through here.
    fn touch(&mut self) {
        if self.old_data.is_none() {
            self.old_data = Some(self.data.clone());
        }
        self.dirty = true;
    }

    // ------------------------------------------------------------------
    // Raw byte access
    // ------------------------------------------------------------------

    pub fn read_bytes(&self, off: usize, len: usize) -> &[u8] {
        &self.data[off..off + len]
    }

    pub fn write_bytes(&mut self, off: usize, bytes: &[u8]) {
        self.touch();
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
    }

    /// Moves `len` bytes from `src` to `dst` within the page (the ranges
    /// may overlap).
    pub fn move_bytes(&mut self, src: usize, len: usize, dst: usize) {
        if len == 0 || src == dst {
            return;
        }
        self.touch();
        self.data.copy_within(src..src + len, dst);
    }

    /// Fills `len` bytes starting at `off` with `byte`.
    pub fn fill(&mut self, off: usize, len: usize, byte: u8) {
        if len == 0 {
            return;
        }
        self.touch();
        self.data[off..off + len].fill(byte);
    }

    // ------------------------------------------------------------------
    // Integer accessors (big-endian)
    // ------------------------------------------------------------------

    pub fn read_u8(&self, off: usize) -> u8 {
        self.data[off]
    }

    pub fn read_i8(&self, off: usize) -> i8 {
        self.data[off] as i8
    }

    pub fn read_u16(&self, off: usize) -> u16 {
        u16::from_be_bytes([self.data[off], self.data[off + 1]])
    }

    pub fn read_i16(&self, off: usize) -> i16 {
        self.read_u16(off) as i16
    }

    pub fn read_u32(&self, off: usize) -> u32 {
        u32::from_be_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    pub fn read_i32(&self, off: usize) -> i32 {
        self.read_u32(off) as i32
    }

    pub fn read_u64(&self, off: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[off..off + 8]);
        u64::from_be_bytes(bytes)
    }

    pub fn read_i64(&self, off: usize) -> i64 {
        self.read_u64(off) as i64
    }

    pub fn write_u8(&mut self, off: usize, value: u8) {
        self.touch();
        self.data[off] = value;
    }

    pub fn write_i8(&mut self, off: usize, value: i8) {
        self.write_u8(off, value as u8);
    }

    pub fn write_u16(&mut self, off: usize, value: u16) {
        self.touch();
        self.data[off..off + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn write_i16(&mut self, off: usize, value: i16) {
        self.write_u16(off, value as u16);
    }

    pub fn write_u32(&mut self, off: usize, value: u32) {
        self.touch();
        self.data[off..off + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, off: usize, value: i32) {
        self.write_u32(off, value as u32);
    }

    pub fn write_u64(&mut self, off: usize, value: u64) {
        self.touch();
        self.data[off..off + 8].copy_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, off: usize, value: i64) {
        self.write_u64(off, value as u64);
    }

    // ------------------------------------------------------------------
    // Float accessors (IEEE-754 bits through the matching integer width)
    // ------------------------------------------------------------------

    pub fn read_f32(&self, off: usize) -> f32 {
        f32::from_bits(self.read_u32(off))
    }

    pub fn read_f64(&self, off: usize) -> f64 {
        f64::from_bits(self.read_u64(off))
    }

    pub fn write_f32(&mut self, off: usize, value: f32) {
        self.write_u32(off, value.to_bits());
    }

    pub fn write_f64(&mut self, off: usize, value: f64) {
        self.write_u64(off, value.to_bits());
    }

    // ------------------------------------------------------------------
    // String accessors (US-ASCII)
    // ------------------------------------------------------------------

    /// Reads a fixed-length field, trimming trailing NUL padding. An
    /// embedded NUL or non-ASCII byte means the field was not written by
    /// `write_fixed_string` and is rejected.
    pub fn read_fixed_string(&self, off: usize, len: usize) -> Result<String> {
        let raw = &self.data[off..off + len];
        let end = raw.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        let trimmed = &raw[..end];
        if trimmed.iter().any(|&b| b == 0) {
            return Err(Error::invalid_arg(
                "fixed-length string field contains an embedded NUL",
            ));
        }
        ascii_to_string(trimmed)
    }

    /// Writes a fixed-length field, padding with NULs out to `len`.
    pub fn write_fixed_string(&mut self, off: usize, value: &str, len: usize) -> Result<()> {
        check_ascii(value)?;
        if value.contains('\0') {
            return Err(Error::invalid_arg(
                "fixed-length strings cannot contain NUL",
            ));
        }
        if value.len() > len {
            return Err(Error::invalid_arg(format!(
                "string of {} bytes does not fit in a {}-byte field",
                value.len(),
                len
            )));
        }
        self.touch();
        self.data[off..off + value.len()].copy_from_slice(value.as_bytes());
        self.data[off + value.len()..off + len].fill(0);
        Ok(())
    }

    /// Reads a string with a one-byte length prefix (at most 255 bytes).
    pub fn read_varstring255(&self, off: usize) -> Result<String> {
        let len = self.read_u8(off) as usize;
        ascii_to_string(&self.data[off + 1..off + 1 + len])
    }

    /// Writes a string with a one-byte length prefix. Returns the total
    /// bytes used (prefix included).
    pub fn write_varstring255(&mut self, off: usize, value: &str) -> Result<usize> {
        check_ascii(value)?;
        if value.len() > 255 {
            return Err(Error::invalid_arg(format!(
                "string of {} bytes exceeds the 255-byte limit",
                value.len()
            )));
        }
        self.touch();
        self.data[off] = value.len() as u8;
        self.data[off + 1..off + 1 + value.len()].copy_from_slice(value.as_bytes());
        Ok(1 + value.len())
    }

    /// Reads a string with a two-byte length prefix (at most 65535 bytes).
    pub fn read_varstring64k(&self, off: usize) -> Result<String> {
        let len = self.read_u16(off) as usize;
        ascii_to_string(&self.data[off + 2..off + 2 + len])
    }

    /// Writes a string with a two-byte length prefix. Returns the total
    /// bytes used (prefix included).
    pub fn write_varstring64k(&mut self, off: usize, value: &str) -> Result<usize> {
        check_ascii(value)?;
        if value.len() > 65535 {
            return Err(Error::invalid_arg(format!(
                "string of {} bytes exceeds the 65535-byte limit",
                value.len()
            )));
        }
        self.touch();
        self.data[off..off + 2].copy_from_slice(&(value.len() as u16).to_be_bytes());
        self.data[off + 2..off + 2 + value.len()].copy_from_slice(value.as_bytes());
        Ok(2 + value.len())
    }
}

fn check_ascii(value: &str) -> Result<()> {
    if value.is_ascii() {
        Ok(())
    } else {
        Err(Error::invalid_arg("strings must be US-ASCII"))
    }
}

fn ascii_to_string(bytes: &[u8]) -> Result<String> {
    if !bytes.is_ascii() {
        return Err(Error::invalid_arg("stored string is not US-ASCII"));
    }
    // Safe: ASCII is valid UTF-8.
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

// ============================================================================
// Cursor wrappers
// ============================================================================

/// A read cursor over a page; every typed read advances the position. The
/// position must stay within `[0, page_size]`.
pub struct PageReader<'a> {
    page: &'a DBPage,
    position: usize,
}

impl<'a> PageReader<'a> {
    pub fn new(page: &'a DBPage) -> PageReader<'a> {
        PageReader { page, position: 0 }
    }

    pub fn at_position(page: &'a DBPage, position: usize) -> PageReader<'a> {
        assert!(position <= page.page_size());
        PageReader { page, position }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        assert!(position <= self.page.page_size());
        self.position = position;
    }

    pub fn read_u8(&mut self) -> u8 {
        let v = self.page.read_u8(self.position);
        self.position += 1;
        v
    }

    pub fn read_i8(&mut self) -> i8 {
        self.read_u8() as i8
    }

    pub fn read_u16(&mut self) -> u16 {
        let v = self.page.read_u16(self.position);
        self.position += 2;
        v
    }

    pub fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }

    pub fn read_u32(&mut self) -> u32 {
        let v = self.page.read_u32(self.position);
        self.position += 4;
        v
    }

    pub fn read_i32(&mut self) -> i32 {
        self.read_u32() as i32
    }

    pub fn read_u64(&mut self) -> u64 {
        let v = self.page.read_u64(self.position);
        self.position += 8;
        v
    }

    pub fn read_i64(&mut self) -> i64 {
        self.read_u64() as i64
    }

    pub fn read_f32(&mut self) -> f32 {
        f32::from_bits(self.read_u32())
    }

    pub fn read_f64(&mut self) -> f64 {
        f64::from_bits(self.read_u64())
    }

    pub fn read_fixed_string(&mut self, len: usize) -> Result<String> {
        let v = self.page.read_fixed_string(self.position, len)?;
        self.position += len;
        Ok(v)
    }

    pub fn read_varstring255(&mut self) -> Result<String> {
        let v = self.page.read_varstring255(self.position)?;
        self.position += 1 + v.len();
        Ok(v)
    }

    pub fn read_varstring64k(&mut self) -> Result<String> {
        let v = self.page.read_varstring64k(self.position)?;
        self.position += 2 + v.len();
        Ok(v)
    }
}

/// A write cursor over a page; every typed write advances the position.
pub struct PageWriter<'a> {
    page: &'a mut DBPage,
    position: usize,
}

impl<'a> PageWriter<'a> {
    pub fn new(page: &'a mut DBPage) -> PageWriter<'a> {
        PageWriter { page, position: 0 }
    }

    pub fn at_position(page: &'a mut DBPage, position: usize) -> PageWriter<'a> {
        assert!(position <= page.page_size());
        PageWriter { page, position }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        assert!(position <= self.page.page_size());
        self.position = position;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.page.write_u8(self.position, value);
        self.position += 1;
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.page.write_u16(self.position, value);
        self.position += 2;
    }

    pub fn write_i16(&mut self, value: i16) {
        self.write_u16(value as u16);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.page.write_u32(self.position, value);
        self.position += 4;
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(value as u32);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.page.write_u64(self.position, value);
        self.position += 8;
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_u64(value as u64);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.page.write_bytes(self.position, bytes);
        self.position += bytes.len();
    }

    pub fn write_fixed_string(&mut self, value: &str, len: usize) -> Result<()> {
        self.page.write_fixed_string(self.position, value, len)?;
        self.position += len;
        Ok(())
    }

    pub fn write_varstring255(&mut self, value: &str) -> Result<()> {
        let used = self.page.write_varstring255(self.position, value)?;
        self.position += used;
        Ok(())
    }

    pub fn write_varstring64k(&mut self, value: &str) -> Result<()> {
        let used = self.page.write_varstring64k(self.position, value)?;
        self.position += used;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_page(size: usize) -> DBPage {
        DBPage::new(FileId(1), 0, vec![0u8; size])
    }

    #[test]
    fn test_integer_round_trips() {
        let mut page = blank_page(512);
        page.write_u8(0, 0xfe);
        page.write_i8(1, -5);
        page.write_u16(2, 0xbeef);
        page.write_i16(4, -1234);
        page.write_u32(6, 0xdead_beef);
        page.write_i32(10, -123_456_789);
        page.write_u64(14, 0x0123_4567_89ab_cdef);
        page.write_i64(22, i64::MIN + 3);

        assert_eq!(page.read_u8(0), 0xfe);
        assert_eq!(page.read_i8(1), -5);
        assert_eq!(page.read_u16(2), 0xbeef);
        assert_eq!(page.read_i16(4), -1234);
        assert_eq!(page.read_u32(6), 0xdead_beef);
        assert_eq!(page.read_i32(10), -123_456_789);
        assert_eq!(page.read_u64(14), 0x0123_4567_89ab_cdef);
        assert_eq!(page.read_i64(22), i64::MIN + 3);
    }

    #[test]
    fn test_big_endian_layout() {
        let mut page = blank_page(512);
        page.write_u32(100, 0x0a0b0c0d);
        assert_eq!(page.read_bytes(100, 4), &[0x0a, 0x0b, 0x0c, 0x0d]);
    }

    #[test]
    fn test_float_round_trips() {
        let mut page = blank_page(512);
        page.write_f32(0, 3.5f32);
        page.write_f64(4, -2.25e300);
        assert_eq!(page.read_f32(0), 3.5f32);
        assert_eq!(page.read_f64(4), -2.25e300);

        // Bit patterns survive even for NaN payloads.
        page.write_f32(12, f32::from_bits(0x7fc0_1234));
        assert_eq!(page.read_u32(12), 0x7fc0_1234);
    }

    #[test]
    fn test_fixed_string_round_trip() {
        let mut page = blank_page(512);
        page.write_fixed_string(10, "hello", 8).unwrap();
        assert_eq!(page.read_fixed_string(10, 8).unwrap(), "hello");

        // Overlong and embedded-NUL strings are rejected.
        assert!(page.write_fixed_string(10, "toolongvalue", 8).is_err());
        assert!(page.write_fixed_string(10, "a\0b", 8).is_err());
    }

    #[test]
    fn test_embedded_nul_detected_on_read() {
        let mut page = blank_page(512);
        page.write_bytes(0, &[b'a', 0, b'b', 0]);
        assert!(page.read_fixed_string(0, 4).is_err());
    }

    #[test]
    fn test_varstring_round_trips() {
        let mut page = blank_page(512);
        let used = page.write_varstring255(0, "short").unwrap();
        assert_eq!(used, 6);
        assert_eq!(page.read_varstring255(0).unwrap(), "short");

        let used = page.write_varstring64k(20, "longer value").unwrap();
        assert_eq!(used, 14);
        assert_eq!(page.read_varstring64k(20).unwrap(), "longer value");

        assert!(page.write_varstring255(0, &"x".repeat(256)).is_err());
    }

    #[test]
    fn test_dirty_and_old_image() {
        let mut page = blank_page(512);
        assert!(!page.is_dirty());
        page.write_u32(0, 42);
        assert!(page.is_dirty());
        assert_eq!(page.old_data()[0..4], [0, 0, 0, 0]);

        page.sync_old_data();
        assert_eq!(page.old_data()[0..4], 42u32.to_be_bytes());
        page.write_u32(0, 43);
        assert_eq!(page.old_data()[0..4], 42u32.to_be_bytes());

        page.mark_clean();
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_reader_writer_cursor() {
        let mut page = blank_page(512);
        {
            let mut writer = PageWriter::new(&mut page);
            writer.write_u16(7);
            writer.write_i64(-9);
            writer.write_varstring255("abc").unwrap();
            assert_eq!(writer.position(), 2 + 8 + 4);
        }
        let mut reader = PageReader::new(&page);
        assert_eq!(reader.read_u16(), 7);
        assert_eq!(reader.read_i64(), -9);
        assert_eq!(reader.read_varstring255().unwrap(), "abc");
        assert_eq!(reader.position(), 14);
    }
}
