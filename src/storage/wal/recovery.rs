//! ARIES-style recovery and single-transaction rollback.
//!
//! Recovery runs at startup over the log range `[firstLSN, nextLSN)` from
//! the transaction-state file: a forward redo pass re-applies every update
//! unconditionally while rebuilding the set of in-flight transactions, then
//! a backward undo pass writes old images back (logging each undo as a
//! redo-only record so a crash during undo is itself recoverable) and
//! closes each in-flight transaction with ABORT_TXN. Finalization forces
//! the log, flushes all pages, advances `firstLSN` to `nextLSN`, and forces
//! again.

use std::collections::HashMap;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::storage_manager::StorageManager;
use crate::storage::wal::records::{
    UpdateSegment, WalRecord, WalRecordType, START_RECORD_SIZE, TXN_END_RECORD_SIZE,
};
use crate::storage::wal::{Lsn, WAL_FILE_INITIAL_OFFSET};
use crate::types::SessionId;

/// Session under which recovery pins pages; real sessions start at 1.
const RECOVERY_SESSION: SessionId = SessionId(0);

/// Runs crash recovery. Called once while the storage manager starts up,
/// before any session touches the database.
pub(crate) fn perform_recovery(st: &mut StorageManager) -> Result<()> {
    let first = st.wal.first_lsn();
    let end = st.wal.next_lsn();
    if first == end {
        debug!("WAL is empty between {} and {}; no recovery needed", first, end);
        return Ok(());
    }

    debug!("recovering WAL range [{}, {})", first, end);
    let incomplete = redo_pass(st, first, end)?;
    if !incomplete.is_empty() {
        debug!("{} transaction(s) were in flight; undoing", incomplete.len());
        undo_pass(st, first, end, incomplete)?;
    }

    // Finalize: everything re-applied or undone is made durable, then the
    // recovery window is collapsed.
    st.wal.force(None)?;
    st.buffer.flush_all(&mut st.wal)?;
    let next = st.wal.next_lsn();
    st.wal.set_first_lsn(next);
    st.wal.force(None)?;
    debug!("recovery complete; firstLSN advanced to {}", next);
    Ok(())
}

/// Forward pass: re-applies every update's new bytes and returns the map of
/// in-flight transactions to their last LSN.
fn redo_pass(st: &mut StorageManager, first: Lsn, end: Lsn) -> Result<HashMap<u32, Lsn>> {
    let mut reader = st.wal.reader_at(first)?;
    let mut incomplete: HashMap<u32, Lsn> = HashMap::new();

    loop {
        if reader.lsn().file_no == end.file_no {
            if reader.lsn().offset >= end.offset {
                if reader.lsn().offset != end.offset {
                    return Err(Error::CorruptWal(format!(
                        "redo scan ended at {} instead of the stored end {}",
                        reader.lsn(),
                        end
                    )));
                }
                break;
            }
        } else if reader.lsn().offset as u64 >= reader.file_len()? {
            let next_file = reader.lsn().file_no.wrapping_add(1);
            reader.switch_file(next_file, WAL_FILE_INITIAL_OFFSET)?;
            continue;
        }

        let lsn = reader.lsn();
        let record = reader.read_record()?;
        st.wal.ensure_txn_id_above(record.txn_id());

        match &record {
            WalRecord::Start { txn_id } => {
                if incomplete.insert(*txn_id, lsn).is_some() {
                    return Err(Error::CorruptWal(format!(
                        "transaction {} started twice (second START at {})",
                        txn_id, lsn
                    )));
                }
            }
            WalRecord::Commit { txn_id, .. } | WalRecord::Abort { txn_id, .. } => {
                if incomplete.remove(txn_id).is_none() {
                    return Err(Error::CorruptWal(format!(
                        "transaction {} completed at {} without a START in the scan",
                        txn_id, lsn
                    )));
                }
            }
            WalRecord::Update {
                txn_id,
                filename,
                page_no,
                segments,
                ..
            } => {
                let last = incomplete.get_mut(txn_id).ok_or_else(|| {
                    Error::CorruptWal(format!(
                        "update at {} for transaction {} outside any START/END pair",
                        lsn, txn_id
                    ))
                })?;
                *last = lsn;
                apply_new_bytes(st, filename, *page_no, segments, lsn)?;
            }
        }
    }
    Ok(incomplete)
}

/// Backward pass: undoes every update of the in-flight transactions and
/// closes them with ABORT_TXN records.
fn undo_pass(
    st: &mut StorageManager,
    first: Lsn,
    end: Lsn,
    mut incomplete: HashMap<u32, Lsn>,
) -> Result<()> {
    let mut reader = st.wal.reader_at(end)?;
    let mut cursor = end;

    while !incomplete.is_empty() {
        if cursor <= first {
            return Err(Error::CorruptWal(format!(
                "undo crossed firstLSN {} with {} transaction(s) still open",
                first,
                incomplete.len()
            )));
        }

        if cursor.offset == WAL_FILE_INITIAL_OFFSET {
            let prev_end = reader.prev_file_end()?;
            if prev_end == 0 {
                return Err(Error::CorruptWal(format!(
                    "undo reached the beginning of the log with {} transaction(s) still open",
                    incomplete.len()
                )));
            }
            cursor = Lsn::new(cursor.file_no.wrapping_sub(1), prev_end);
            reader.switch_file(cursor.file_no, cursor.offset)?;
            continue;
        }

        // Every record's final byte is its type; fixed-size records are
        // stepped over directly, update records carry their start offset.
        let trailer = reader.read_u8_at(cursor.offset - 1)?;
        let record_type = WalRecordType::from_u8(trailer)?;
        let start_off = match record_type {
            WalRecordType::StartTxn => cursor.offset - START_RECORD_SIZE,
            WalRecordType::CommitTxn | WalRecordType::AbortTxn => {
                cursor.offset - TXN_END_RECORD_SIZE
            }
            WalRecordType::UpdatePage | WalRecordType::UpdatePageRedoOnly => {
                reader.read_u32_at(cursor.offset - 5)?
            }
        };
        let record_lsn = Lsn::new(cursor.file_no, start_off);

        let record = reader.read_record_at(record_lsn)?;
        if let Some(&last) = incomplete.get(&record.txn_id()) {
            match record {
                WalRecord::Update {
                    txn_id,
                    filename,
                    page_no,
                    segments,
                    redo_only: false,
                    ..
                } => {
                    let redo_lsn = undo_update(st, txn_id, last, &filename, page_no, &segments)?;
                    incomplete.insert(txn_id, redo_lsn);
                }
                WalRecord::Update { redo_only: true, .. } => {
                    // Undo actions are never themselves undone.
                }
                WalRecord::Start { txn_id } => {
                    st.wal.log_abort_txn(txn_id, last)?;
                    debug!("aborted in-flight transaction {} during recovery", txn_id);
                    incomplete.remove(&txn_id);
                }
                WalRecord::Commit { txn_id, .. } | WalRecord::Abort { txn_id, .. } => {
                    return Err(Error::CorruptWal(format!(
                        "transaction {} has an end record at {} but was still open",
                        txn_id, record_lsn
                    )));
                }
            }
        }
        cursor = record_lsn;
    }
    Ok(())
}

/// Rolls back one session's transaction by walking its prevLSN chain,
/// undoing each update, and writing ABORT_TXN.
pub(crate) fn rollback_transaction(st: &mut StorageManager, session: SessionId) -> Result<()> {
    let state = st
        .txns
        .get(&session)
        .ok_or_else(|| Error::invalid_arg(format!("{} has no transaction in progress", session)))?;
    let txn_id = state.txn_id;
    let mut last = state.last_lsn;

    // The chain is read from disk, so everything appended so far must be
    // durable before the walk starts.
    st.wal.force(None)?;
    debug!("rolling back transaction {} from {}", txn_id, last);

    let mut reader = st.wal.reader_at(last)?;
    let mut cursor = last;
    loop {
        let record = reader.read_record_at(cursor)?;
        if record.txn_id() != txn_id {
            return Err(Error::CorruptWal(format!(
                "record at {} belongs to transaction {}, expected {} while rolling back",
                cursor,
                record.txn_id(),
                txn_id
            )));
        }

        match record {
            WalRecord::Update {
                prev_lsn,
                filename,
                page_no,
                segments,
                redo_only: false,
                ..
            } => {
                last = undo_update(st, txn_id, last, &filename, page_no, &segments)?;
                cursor = prev_lsn;
            }
            WalRecord::Update {
                prev_lsn,
                redo_only: true,
                ..
            } => {
                warn!("skipping redo-only record at {} in a live rollback chain", cursor);
                cursor = prev_lsn;
            }
            WalRecord::Start { .. } => {
                st.wal.log_abort_txn(txn_id, last)?;
                st.wal.force(None)?;
                break;
            }
            WalRecord::Commit { .. } | WalRecord::Abort { .. } => {
                return Err(Error::CorruptWal(format!(
                    "transaction {} has an end record at {} in its rollback chain",
                    txn_id, cursor
                )));
            }
        }
    }

    st.txns.remove(&session);
    st.buffer.unpin_session_pages(session);
    debug!("transaction {} rolled back", txn_id);
    Ok(())
}

/// Writes an update's old images back onto the page, logging the undo as a
/// redo-only record first. Returns the redo-only record's LSN (the
/// transaction's new last LSN).
fn undo_update(
    st: &mut StorageManager,
    txn_id: u32,
    prev_lsn: Lsn,
    filename: &str,
    page_no: u16,
    segments: &[UpdateSegment],
) -> Result<Lsn> {
    let mut undo_segments = Vec::with_capacity(segments.len());
    for seg in segments {
        let old = seg.old.clone().ok_or_else(|| {
            Error::CorruptWal(format!(
                "UPDATE_PAGE record for page {} of \"{}\" is missing undo bytes",
                page_no, filename
            ))
        })?;
        undo_segments.push(UpdateSegment {
            start: seg.start,
            old: None,
            new: old,
        });
    }

    if let Some(first) = undo_segments.first() {
        log::trace!(
            "undoing {} segment(s) on page {} of \"{}\", first at {} ({})",
            undo_segments.len(),
            page_no,
            filename,
            first.start,
            hex::encode(&first.new[..first.new.len().min(16)])
        );
    }
    let redo_lsn = st
        .wal
        .log_redo_only_update(txn_id, prev_lsn, filename, page_no, &undo_segments)?;
    apply_new_bytes(st, filename, page_no, &undo_segments, redo_lsn)?;
    Ok(redo_lsn)
}

/// Applies the `new` bytes of each segment to the target page. Idempotent:
/// re-running writes identical bytes.
fn apply_new_bytes(
    st: &mut StorageManager,
    filename: &str,
    page_no: u16,
    segments: &[UpdateSegment],
    lsn: Lsn,
) -> Result<()> {
    let file_id = st.ensure_dbfile_open(filename)?;
    let page = st.load_dbpage(RECOVERY_SESSION, file_id, page_no as u32, true)?;
    {
        let mut pg = page.borrow_mut();
        for seg in segments {
            pg.write_bytes(seg.start as usize, &seg.new);
        }
        // These bytes are already in the log; nothing further to diff.
        pg.sync_old_data();
        pg.set_page_lsn(lsn);
    }
    st.buffer.unpin_page(RECOVERY_SESSION, file_id, page_no as u32)?;
    Ok(())
}
