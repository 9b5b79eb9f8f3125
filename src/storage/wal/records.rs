//! Write-ahead log record formats: encoding, decoding, and page-image
//! diffing.
//!
//! Every record begins `type(1), txnID(4)`; non-START records follow with
//! `prevLSN(fileNo 2B, offset 4B)`. Update records carry the target file
//! name, page number, and change segments, and end with a
//! `recordStartOffset(4B)` so the log can be scanned backward. Every
//! record's final byte repeats its type, which is what the backward scan
//! reads first.

use std::io::Read;

use crate::error::{Error, Result};
use crate::storage::wal::Lsn;

/// Record type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    StartTxn = 1,
    UpdatePage = 2,
    UpdatePageRedoOnly = 3,
    CommitTxn = 4,
    AbortTxn = 5,
}

impl WalRecordType {
    pub fn from_u8(byte: u8) -> Result<WalRecordType> {
        match byte {
            1 => Ok(WalRecordType::StartTxn),
            2 => Ok(WalRecordType::UpdatePage),
            3 => Ok(WalRecordType::UpdatePageRedoOnly),
            4 => Ok(WalRecordType::CommitTxn),
            5 => Ok(WalRecordType::AbortTxn),
            other => Err(Error::CorruptWal(format!(
                "unrecognized record type byte {}",
                other
            ))),
        }
    }
}

/// Total size of a START_TXN record: type, txnID, trailing type.
pub const START_RECORD_SIZE: u32 = 6;

/// Total size of a COMMIT_TXN or ABORT_TXN record: type, txnID, prevLSN,
/// trailing type.
pub const TXN_END_RECORD_SIZE: u32 = 12;

/// One contiguous changed range within a page. `old` is absent in
/// redo-only records; when present it is the same length as `new`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSegment {
    pub start: u16,
    pub old: Option<Vec<u8>>,
    pub new: Vec<u8>,
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Start {
        txn_id: u32,
    },
    Commit {
        txn_id: u32,
        prev_lsn: Lsn,
    },
    Abort {
        txn_id: u32,
        prev_lsn: Lsn,
    },
    Update {
        txn_id: u32,
        prev_lsn: Lsn,
        filename: String,
        page_no: u16,
        segments: Vec<UpdateSegment>,
        redo_only: bool,
    },
}

impl WalRecord {
    pub fn txn_id(&self) -> u32 {
        match self {
            WalRecord::Start { txn_id }
            | WalRecord::Commit { txn_id, .. }
            | WalRecord::Abort { txn_id, .. }
            | WalRecord::Update { txn_id, .. } => *txn_id,
        }
    }

    pub fn prev_lsn(&self) -> Option<Lsn> {
        match self {
            WalRecord::Start { .. } => None,
            WalRecord::Commit { prev_lsn, .. }
            | WalRecord::Abort { prev_lsn, .. }
            | WalRecord::Update { prev_lsn, .. } => Some(*prev_lsn),
        }
    }
}

// ============================================================================
// Page-image diffing
// ============================================================================

/// Maximum identical-byte run that gets lumped into a surrounding segment
/// rather than splitting it; lumping trades a few redundant bytes for less
/// per-segment overhead.
const LUMP_RUN_LIMIT: usize = 4;

/// A segment's length field is two bytes, so longer ranges are split.
const MAX_SEGMENT_LEN: usize = 0xffff;

/// Diffs two page images of equal length into minimal change segments.
pub fn compute_diff_segments(old: &[u8], new: &[u8]) -> Vec<UpdateSegment> {
    debug_assert_eq!(old.len(), new.len());
    let len = old.len();
    let mut segments = Vec::new();
    let mut i = 0usize;

    while i < len {
        if old[i] == new[i] {
            i += 1;
            continue;
        }

        // A run of difference starts here; extend it, absorbing short
        // identical runs that separate nearby differences.
        let seg_start = i;
        let mut j = i;
        loop {
            while j < len && old[j] != new[j] {
                j += 1;
            }
            let run_start = j;
            while j < len && old[j] == new[j] {
                j += 1;
            }
            if j < len && j - run_start <= LUMP_RUN_LIMIT {
                continue;
            }
            j = run_start;
            break;
        }

        let mut pos = seg_start;
        while pos < j {
            let end = (pos + MAX_SEGMENT_LEN).min(j);
            segments.push(UpdateSegment {
                start: pos as u16,
                old: Some(old[pos..end].to_vec()),
                new: new[pos..end].to_vec(),
            });
            pos = end;
        }
        i = j;
    }
    segments
}

// ============================================================================
// Encoding
// ============================================================================

fn push_lsn(buf: &mut Vec<u8>, lsn: Lsn) {
    buf.extend_from_slice(&lsn.file_no.to_be_bytes());
    buf.extend_from_slice(&lsn.offset.to_be_bytes());
}

/// Encodes a START_TXN record.
pub fn encode_start(txn_id: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(START_RECORD_SIZE as usize);
    buf.push(WalRecordType::StartTxn as u8);
    buf.extend_from_slice(&txn_id.to_be_bytes());
    buf.push(WalRecordType::StartTxn as u8);
    buf
}

/// Encodes a COMMIT_TXN or ABORT_TXN record.
pub fn encode_txn_end(record_type: WalRecordType, txn_id: u32, prev_lsn: Lsn) -> Vec<u8> {
    debug_assert!(matches!(
        record_type,
        WalRecordType::CommitTxn | WalRecordType::AbortTxn
    ));
    let mut buf = Vec::with_capacity(TXN_END_RECORD_SIZE as usize);
    buf.push(record_type as u8);
    buf.extend_from_slice(&txn_id.to_be_bytes());
    push_lsn(&mut buf, prev_lsn);
    buf.push(record_type as u8);
    buf
}

/// Encodes an UPDATE_PAGE (or redo-only) record. The trailing start-offset
/// field is written as zero; the returned index locates it so the log
/// manager can patch in the final offset once the record's position is
/// known.
pub fn encode_update(
    txn_id: u32,
    prev_lsn: Lsn,
    filename: &str,
    page_no: u16,
    segments: &[UpdateSegment],
    redo_only: bool,
) -> Result<(Vec<u8>, usize)> {
    if filename.len() > 255 {
        return Err(Error::invalid_arg(format!(
            "file name \"{}\" exceeds 255 bytes",
            filename
        )));
    }
    let record_type = if redo_only {
        WalRecordType::UpdatePageRedoOnly
    } else {
        WalRecordType::UpdatePage
    };

    let mut buf = Vec::new();
    buf.push(record_type as u8);
    buf.extend_from_slice(&txn_id.to_be_bytes());
    push_lsn(&mut buf, prev_lsn);
    buf.push(filename.len() as u8);
    buf.extend_from_slice(filename.as_bytes());
    buf.extend_from_slice(&page_no.to_be_bytes());
    buf.extend_from_slice(&(segments.len() as u16).to_be_bytes());

    for seg in segments {
        buf.extend_from_slice(&seg.start.to_be_bytes());
        buf.extend_from_slice(&(seg.new.len() as u16).to_be_bytes());
        if !redo_only {
            let old = seg.old.as_ref().ok_or_else(|| {
                Error::invalid_arg("update segment is missing its undo bytes")
            })?;
            debug_assert_eq!(old.len(), seg.new.len());
            buf.extend_from_slice(old);
        }
        buf.extend_from_slice(&seg.new);
    }

    let patch_at = buf.len();
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.push(record_type as u8);
    Ok((buf, patch_at))
}

// ============================================================================
// Decoding
// ============================================================================

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u16<R: Read>(r: &mut R) -> Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_vec<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_lsn<R: Read>(r: &mut R) -> Result<Lsn> {
    let file_no = read_u16(r)?;
    let offset = read_u32(r)?;
    Ok(Lsn { file_no, offset })
}

fn check_trailer<R: Read>(r: &mut R, expected: WalRecordType) -> Result<()> {
    let byte = read_u8(r)?;
    if byte != expected as u8 {
        return Err(Error::CorruptWal(format!(
            "record trailer byte {} does not match type {:?}",
            byte, expected
        )));
    }
    Ok(())
}

/// Decodes one record from the reader, which must be positioned at its
/// first byte. Returns the record and the number of bytes consumed.
pub fn decode_record<R: Read>(r: &mut R) -> Result<(WalRecord, u32)> {
    let record_type = WalRecordType::from_u8(read_u8(r)?)?;
    let txn_id = read_u32(r)?;

    match record_type {
        WalRecordType::StartTxn => {
            check_trailer(r, record_type)?;
            Ok((WalRecord::Start { txn_id }, START_RECORD_SIZE))
        }
        WalRecordType::CommitTxn | WalRecordType::AbortTxn => {
            let prev_lsn = read_lsn(r)?;
            check_trailer(r, record_type)?;
            let record = if record_type == WalRecordType::CommitTxn {
                WalRecord::Commit { txn_id, prev_lsn }
            } else {
                WalRecord::Abort { txn_id, prev_lsn }
            };
            Ok((record, TXN_END_RECORD_SIZE))
        }
        WalRecordType::UpdatePage | WalRecordType::UpdatePageRedoOnly => {
            let redo_only = record_type == WalRecordType::UpdatePageRedoOnly;
            let prev_lsn = read_lsn(r)?;

            let name_len = read_u8(r)? as usize;
            let name_bytes = read_vec(r, name_len)?;
            let filename = String::from_utf8(name_bytes)
                .map_err(|_| Error::CorruptWal("file name is not valid text".into()))?;
            let page_no = read_u16(r)?;
            let num_segments = read_u16(r)? as usize;

            let mut consumed = 1 + 4 + 6 + 1 + name_len as u32 + 2 + 2;
            let mut segments = Vec::with_capacity(num_segments);
            for _ in 0..num_segments {
                let start = read_u16(r)?;
                let length = read_u16(r)? as usize;
                let old = if redo_only {
                    None
                } else {
                    Some(read_vec(r, length)?)
                };
                let new = read_vec(r, length)?;
                let seg_bytes = if redo_only { length } else { 2 * length };
                consumed += 4 + seg_bytes as u32;
                segments.push(UpdateSegment { start, old, new });
            }

            let _start_offset = read_u32(r)?;
            check_trailer(r, record_type)?;
            consumed += 5;

            Ok((
                WalRecord::Update {
                    txn_id,
                    prev_lsn,
                    filename,
                    page_no,
                    segments,
                    redo_only,
                },
                consumed,
            ))
        }
    }
}
