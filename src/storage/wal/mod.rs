//! The write-ahead log manager.
//!
//! The log is an append-only byte stream broken into fixed-size files named
//! `wal-NNNNN.log`. Each file begins with the standard two-byte DBFile
//! header and a 4-byte pointer to the previous file's end offset (zero in
//! the first file); records start at offset 6. Appends accumulate in an
//! in-memory buffer; `force` writes and syncs the buffer and then persists
//! the recovery boundaries to the transaction-state file, so the stored
//! `nextLSN` always describes durable log. Bytes past the stored `nextLSN`
//! belong to operations that never completed and are truncated on reopen.

pub mod records;
pub mod recovery;

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::storage::buffer::BufferObserver;
use crate::storage::dbfile::{self, DBFileType};
use records::{UpdateSegment, WalRecord};

/// Log files are capped at 10 MiB; the file number then increments modulo
/// 65536.
pub const MAX_WAL_FILE_SIZE: u32 = 10 * 1024 * 1024;

/// Records start after the file header and previous-file pointer.
pub const WAL_FILE_INITIAL_OFFSET: u32 = 6;

/// Name of the transaction-state file holding the next transaction ID and
/// the recovery boundaries.
pub const TXN_STATE_FILENAME: &str = "txnstate.dat";

const TXN_STATE_SIZE: usize = 18;

/// A log sequence number: the address of a record as (file number, offset
/// within file). Ordering is fileNo-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn {
    pub file_no: u16,
    pub offset: u32,
}

impl Lsn {
    pub const fn new(file_no: u16, offset: u32) -> Lsn {
        Lsn { file_no, offset }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN[{}:{}]", self.file_no, self.offset)
    }
}

/// Name of one write-ahead log file.
pub fn wal_file_name(file_no: u16) -> String {
    format!("wal-{:05}.log", file_no)
}

pub struct WalManager {
    base_dir: PathBuf,
    page_size: u32,
    next_txn_id: u32,
    /// Where recovery starts reading.
    first_lsn: Lsn,
    /// Where the next record will be appended.
    next_lsn: Lsn,
    /// Everything before this is durable.
    flushed_lsn: Lsn,
    /// Appended, not-yet-written record bytes; always within one file.
    buffer: Vec<u8>,
    /// File offset of `buffer[0]`.
    buffer_start: u32,
    cur_file: File,
    txn_state_file: File,
}

impl WalManager {
    /// Opens (or initializes) the log under `base_dir`. When a
    /// transaction-state file exists its boundaries are trusted: the
    /// current log file is truncated to the stored `nextLSN`, discarding
    /// any unacknowledged tail.
    pub fn open<P: AsRef<Path>>(base_dir: P, page_size: u32) -> Result<WalManager> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let txn_state_path = base_dir.join(TXN_STATE_FILENAME);

        if txn_state_path.is_file() {
            let mut txn_state_file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&txn_state_path)?;
            let (next_txn_id, first_lsn, next_lsn) = read_txn_state(&mut txn_state_file)?;

            let wal_path = base_dir.join(wal_file_name(next_lsn.file_no));
            let cur_file = OpenOptions::new().read(true).write(true).open(&wal_path);
            let cur_file = cur_file.map_err(|e| {
                Error::CorruptWal(format!(
                    "log file {} named by the transaction state is missing: {}",
                    wal_file_name(next_lsn.file_no),
                    e
                ))
            })?;
            if cur_file.metadata()?.len() < next_lsn.offset as u64 {
                return Err(Error::CorruptWal(format!(
                    "log file {} is shorter than the stored next LSN {}",
                    wal_file_name(next_lsn.file_no),
                    next_lsn
                )));
            }
            cur_file.set_len(next_lsn.offset as u64)?;

            debug!(
                "opened WAL: firstLSN={}, nextLSN={}, next txn id {}",
                first_lsn, next_lsn, next_txn_id
            );
            Ok(WalManager {
                base_dir,
                page_size,
                next_txn_id,
                first_lsn,
                next_lsn,
                flushed_lsn: next_lsn,
                buffer: Vec::new(),
                buffer_start: next_lsn.offset,
                cur_file,
                txn_state_file,
            })
        } else {
            let start = Lsn::new(0, WAL_FILE_INITIAL_OFFSET);
            let cur_file = create_wal_file(&base_dir, page_size, 0, 0)?;
            let txn_state_file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&txn_state_path)?;

            let mut manager = WalManager {
                base_dir,
                page_size,
                next_txn_id: 1,
                first_lsn: start,
                next_lsn: start,
                flushed_lsn: start,
                buffer: Vec::new(),
                buffer_start: start.offset,
                cur_file,
                txn_state_file,
            };
            manager.write_txn_state()?;
            debug!("initialized a fresh WAL at {}", start);
            Ok(manager)
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn
    }

    /// Advances the recovery start boundary; persisted by the next `force`.
    pub fn set_first_lsn(&mut self, lsn: Lsn) {
        self.first_lsn = lsn;
    }

    /// Hands out the next transaction ID.
    pub fn allocate_txn_id(&mut self) -> u32 {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        id
    }

    /// Makes sure future IDs stay above one observed in the log.
    pub fn ensure_txn_id_above(&mut self, seen: u32) {
        if seen >= self.next_txn_id {
            self.next_txn_id = seen + 1;
        }
    }

    // ------------------------------------------------------------------
    // Appending
    // ------------------------------------------------------------------

    fn append_record(&mut self, mut record: Vec<u8>, patch_at: Option<usize>) -> Result<Lsn> {
        let len = record.len() as u32;
        if self.next_lsn.offset + len > MAX_WAL_FILE_SIZE {
            self.roll_to_next_file()?;
        }
        let lsn = self.next_lsn;
        if let Some(at) = patch_at {
            record[at..at + 4].copy_from_slice(&lsn.offset.to_be_bytes());
        }
        self.buffer.extend_from_slice(&record);
        self.next_lsn.offset += len;
        trace!("appended {}-byte record at {}", len, lsn);
        Ok(lsn)
    }

    fn roll_to_next_file(&mut self) -> Result<()> {
        self.force(None)?;
        let prev_end = self.next_lsn.offset;
        let file_no = self.next_lsn.file_no.wrapping_add(1);
        self.cur_file = create_wal_file(&self.base_dir, self.page_size, file_no, prev_end)?;
        self.next_lsn = Lsn::new(file_no, WAL_FILE_INITIAL_OFFSET);
        self.flushed_lsn = self.next_lsn;
        self.buffer_start = WAL_FILE_INITIAL_OFFSET;
        debug!("rolled the WAL over to {}", wal_file_name(file_no));
        Ok(())
    }

    pub fn log_start_txn(&mut self, txn_id: u32) -> Result<Lsn> {
        self.append_record(records::encode_start(txn_id), None)
    }

    pub fn log_commit_txn(&mut self, txn_id: u32, prev_lsn: Lsn) -> Result<Lsn> {
        self.append_record(
            records::encode_txn_end(records::WalRecordType::CommitTxn, txn_id, prev_lsn),
            None,
        )
    }

    pub fn log_abort_txn(&mut self, txn_id: u32, prev_lsn: Lsn) -> Result<Lsn> {
        self.append_record(
            records::encode_txn_end(records::WalRecordType::AbortTxn, txn_id, prev_lsn),
            None,
        )
    }

    /// Diffs a page's old and new images and appends an UPDATE_PAGE record.
    /// Returns `None` when the images are identical.
    pub fn log_page_update(
        &mut self,
        txn_id: u32,
        prev_lsn: Lsn,
        filename: &str,
        page_no: u32,
        old: &[u8],
        new: &[u8],
    ) -> Result<Option<Lsn>> {
        let segments = records::compute_diff_segments(old, new);
        if segments.is_empty() {
            return Ok(None);
        }
        let page_no = u16::try_from(page_no)
            .map_err(|_| Error::invalid_arg(format!("page number {} exceeds 65535", page_no)))?;
        trace!(
            "logging {} segment(s) for page {} of \"{}\", first at {} ({})",
            segments.len(),
            page_no,
            filename,
            segments[0].start,
            hex::encode(&segments[0].new[..segments[0].new.len().min(16)])
        );
        let (buf, patch_at) =
            records::encode_update(txn_id, prev_lsn, filename, page_no, &segments, false)?;
        Ok(Some(self.append_record(buf, Some(patch_at))?))
    }

    /// Appends an UPDATE_PAGE_REDO_ONLY record describing an undo action.
    pub fn log_redo_only_update(
        &mut self,
        txn_id: u32,
        prev_lsn: Lsn,
        filename: &str,
        page_no: u16,
        segments: &[UpdateSegment],
    ) -> Result<Lsn> {
        let (buf, patch_at) =
            records::encode_update(txn_id, prev_lsn, filename, page_no, segments, true)?;
        self.append_record(buf, Some(patch_at))
    }

    // ------------------------------------------------------------------
    // Forcing
    // ------------------------------------------------------------------

    /// Writes and syncs buffered records, then persists the recovery
    /// boundaries. With `up_to` given, returns immediately when that LSN is
    /// already durable.
    pub fn force(&mut self, up_to: Option<Lsn>) -> Result<()> {
        if let Some(lsn) = up_to {
            if lsn < self.flushed_lsn {
                return Ok(());
            }
        }
        if !self.buffer.is_empty() {
            self.cur_file
                .seek(SeekFrom::Start(self.buffer_start as u64))?;
            self.cur_file.write_all(&self.buffer)?;
            self.cur_file.sync_all()?;
            self.buffer.clear();
            self.buffer_start = self.next_lsn.offset;
            self.flushed_lsn = self.next_lsn;
            debug!("forced WAL through {}", self.flushed_lsn);
        }
        self.write_txn_state()
    }

    fn write_txn_state(&mut self) -> Result<()> {
        let mut buf = [0u8; TXN_STATE_SIZE];
        buf[0] = DBFileType::TxnStateFile as u8;
        buf[1] = dbfile::encode_page_size(self.page_size)?;
        buf[2..6].copy_from_slice(&self.next_txn_id.to_be_bytes());
        buf[6..8].copy_from_slice(&self.first_lsn.file_no.to_be_bytes());
        buf[8..12].copy_from_slice(&self.first_lsn.offset.to_be_bytes());
        buf[12..14].copy_from_slice(&self.flushed_lsn.file_no.to_be_bytes());
        buf[14..18].copy_from_slice(&self.flushed_lsn.offset.to_be_bytes());

        self.txn_state_file.seek(SeekFrom::Start(0))?;
        self.txn_state_file.write_all(&buf)?;
        self.txn_state_file.sync_all()?;
        Ok(())
    }

    /// A reader positioned at `lsn`.
    pub(crate) fn reader_at(&self, lsn: Lsn) -> Result<WalReader> {
        WalReader::open(&self.base_dir, lsn)
    }
}

impl BufferObserver for WalManager {
    fn before_write_dirty_pages(&mut self, max_lsn: Option<Lsn>) -> Result<()> {
        if let Some(lsn) = max_lsn {
            self.force(Some(lsn))?;
        }
        Ok(())
    }
}

fn create_wal_file(base_dir: &Path, page_size: u32, file_no: u16, prev_end: u32) -> Result<File> {
    let path = base_dir.join(wal_file_name(file_no));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    let mut header = [0u8; WAL_FILE_INITIAL_OFFSET as usize];
    header[0] = DBFileType::WriteAheadLogFile as u8;
    header[1] = dbfile::encode_page_size(page_size)?;
    header[2..6].copy_from_slice(&prev_end.to_be_bytes());
    file.write_all(&header)?;
    file.sync_all()?;
    Ok(file)
}

fn read_txn_state(file: &mut File) -> Result<(u32, Lsn, Lsn)> {
    let mut buf = [0u8; TXN_STATE_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    if buf[0] != DBFileType::TxnStateFile as u8 {
        return Err(Error::CorruptWal(format!(
            "transaction-state file has type byte {}",
            buf[0]
        )));
    }
    let next_txn_id = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    let first_lsn = Lsn::new(
        u16::from_be_bytes([buf[6], buf[7]]),
        u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
    );
    let next_lsn = Lsn::new(
        u16::from_be_bytes([buf[12], buf[13]]),
        u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]),
    );
    Ok((next_txn_id, first_lsn, next_lsn))
}

// ============================================================================
// Reading
// ============================================================================

/// A positioned reader over the on-disk log. Only durable bytes are read
/// through this; the manager forces the log before any chain walk.
pub(crate) struct WalReader {
    base_dir: PathBuf,
    file_no: u16,
    offset: u32,
    file: File,
}

impl WalReader {
    pub fn open(base_dir: &Path, lsn: Lsn) -> Result<WalReader> {
        let file = OpenOptions::new()
            .read(true)
            .open(base_dir.join(wal_file_name(lsn.file_no)))?;
        Ok(WalReader {
            base_dir: base_dir.to_path_buf(),
            file_no: lsn.file_no,
            offset: lsn.offset,
            file,
        })
    }

    pub fn lsn(&self) -> Lsn {
        Lsn::new(self.file_no, self.offset)
    }

    pub fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Repositions onto another log file.
    pub fn switch_file(&mut self, file_no: u16, offset: u32) -> Result<()> {
        if file_no != self.file_no {
            self.file = OpenOptions::new()
                .read(true)
                .open(self.base_dir.join(wal_file_name(file_no)))?;
            self.file_no = file_no;
        }
        self.offset = offset;
        Ok(())
    }

    /// Decodes the record at the current position and advances past it.
    pub fn read_record(&mut self) -> Result<WalRecord> {
        self.file.seek(SeekFrom::Start(self.offset as u64))?;
        let (record, consumed) = records::decode_record(&mut self.file)?;
        self.offset += consumed;
        Ok(record)
    }

    /// Decodes the record at `lsn` and leaves the cursor after it.
    pub fn read_record_at(&mut self, lsn: Lsn) -> Result<WalRecord> {
        self.switch_file(lsn.file_no, lsn.offset)?;
        self.read_record()
    }

    /// Reads one byte at an absolute offset in the current file.
    pub fn read_u8_at(&mut self, offset: u32) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Reads a big-endian u32 at an absolute offset in the current file.
    pub fn read_u32_at(&mut self, offset: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// The previous file's end offset, from the current file's header.
    pub fn prev_file_end(&mut self) -> Result<u32> {
        self.read_u32_at(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_wal(dir: &Path) -> WalManager {
        WalManager::open(dir, 512).unwrap()
    }

    #[test]
    fn test_fresh_wal_layout() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path());
        assert_eq!(wal.first_lsn(), Lsn::new(0, 6));
        assert_eq!(wal.next_lsn(), Lsn::new(0, 6));
        assert!(dir.path().join("wal-00000.log").is_file());
        assert!(dir.path().join(TXN_STATE_FILENAME).is_file());
    }

    #[test]
    fn test_append_force_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path());

        let start = wal.log_start_txn(1).unwrap();
        let update = wal
            .log_page_update(1, start, "t.tbl", 2, &[0u8; 64], &{
                let mut img = [0u8; 64];
                img[10..14].copy_from_slice(b"BBBB");
                img
            })
            .unwrap()
            .unwrap();
        let commit = wal.log_commit_txn(1, update).unwrap();
        wal.force(Some(commit)).unwrap();

        let mut reader = wal.reader_at(start).unwrap();
        assert_eq!(reader.read_record().unwrap(), WalRecord::Start { txn_id: 1 });
        match reader.read_record().unwrap() {
            WalRecord::Update {
                txn_id,
                prev_lsn,
                filename,
                page_no,
                segments,
                redo_only,
            } => {
                assert_eq!(txn_id, 1);
                assert_eq!(prev_lsn, start);
                assert_eq!(filename, "t.tbl");
                assert_eq!(page_no, 2);
                assert!(!redo_only);
                assert_eq!(segments.len(), 1);
                assert_eq!(segments[0].start, 10);
                assert_eq!(segments[0].new, b"BBBB");
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert_eq!(
            reader.read_record().unwrap(),
            WalRecord::Commit {
                txn_id: 1,
                prev_lsn: update
            }
        );
        assert_eq!(reader.lsn(), wal.next_lsn());
    }

    #[test]
    fn test_reopen_restores_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let next = {
            let mut wal = open_wal(dir.path());
            let lsn = wal.log_start_txn(1).unwrap();
            wal.force(Some(lsn)).unwrap();
            wal.next_lsn()
        };
        let wal = open_wal(dir.path());
        assert_eq!(wal.next_lsn(), next);
        assert_eq!(wal.first_lsn(), Lsn::new(0, 6));
        // The id handed out before must not be reused.
        let mut wal = wal;
        assert!(wal.allocate_txn_id() >= 2);
    }

    #[test]
    fn test_unforced_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let forced_next = {
            let mut wal = open_wal(dir.path());
            let lsn = wal.log_start_txn(1).unwrap();
            wal.force(Some(lsn)).unwrap();
            let forced = wal.next_lsn();
            // Appended but never forced: must vanish on reopen.
            wal.log_start_txn(2).unwrap();
            forced
        };
        let wal = open_wal(dir.path());
        assert_eq!(wal.next_lsn(), forced_next);
    }

    #[test]
    fn test_backward_trailer_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(dir.path());
        let start = wal.log_start_txn(7).unwrap();
        let end_of_start = wal.next_lsn();
        wal.force(None).unwrap();

        let mut reader = wal.reader_at(start).unwrap();
        let trailer = reader.read_u8_at(end_of_start.offset - 1).unwrap();
        assert_eq!(trailer, records::WalRecordType::StartTxn as u8);
    }
}
