//! Per-session transaction state and lifecycle.
//!
//! The state machine is NONE → IN_PROGRESS (START_TXN) → COMMITTED
//! (COMMIT_TXN, forced) or ABORTED (ABORT_TXN); terminal states are final
//! and drop the session's entry from the transaction table. Page changes
//! are logged through `record_page_update`, which chains the transaction's
//! records via prevLSN.

use log::debug;

use crate::error::{Error, Result};
use crate::storage::dbpage::PageRef;
use crate::storage::storage_manager::StorageManager;
use crate::storage::wal::{recovery, Lsn};
use crate::types::SessionId;

/// The in-flight transaction of one session.
#[derive(Debug, Clone, Copy)]
pub struct TransactionState {
    pub txn_id: u32,
    /// The last record this transaction wrote; new records chain to it.
    pub last_lsn: Lsn,
}

/// Starts a transaction for `session` and logs START_TXN. Returns the new
/// transaction ID.
pub(crate) fn begin_transaction(st: &mut StorageManager, session: SessionId) -> Result<u32> {
    if st.txns.contains_key(&session) {
        return Err(Error::invalid_arg(format!(
            "{} already has a transaction in progress",
            session
        )));
    }
    let txn_id = st.wal.allocate_txn_id();
    let lsn = st.wal.log_start_txn(txn_id)?;
    st.txns.insert(session, TransactionState { txn_id, last_lsn: lsn });
    debug!("{} started transaction {} at {}", session, txn_id, lsn);
    Ok(txn_id)
}

/// Commits `session`'s transaction: COMMIT_TXN is appended and the log is
/// forced through it before this returns. On a force failure the
/// transaction stays IN_PROGRESS so the caller may retry or roll back.
pub(crate) fn commit_transaction(st: &mut StorageManager, session: SessionId) -> Result<()> {
    let state = st.txns.get(&session).copied().ok_or_else(|| {
        Error::invalid_arg(format!("{} has no transaction in progress", session))
    })?;

    let lsn = st.wal.log_commit_txn(state.txn_id, state.last_lsn)?;
    st.wal.force(Some(lsn))?;

    st.txns.remove(&session);
    st.buffer.unpin_session_pages(session);
    debug!("{} committed transaction {} at {}", session, state.txn_id, lsn);
    Ok(())
}

/// Rolls back `session`'s transaction by undoing its prevLSN chain.
pub(crate) fn rollback_transaction(st: &mut StorageManager, session: SessionId) -> Result<()> {
    recovery::rollback_transaction(st, session)
}

/// Logs a dirty page's changes under `session`'s transaction, stamps the
/// page with the record's LSN, and resets its old image. Outside a
/// transaction this is a no-op: the page simply stays dirty.
pub(crate) fn record_page_update(
    st: &mut StorageManager,
    session: SessionId,
    page: &PageRef,
) -> Result<()> {
    let Some(state) = st.txns.get(&session).copied() else {
        return Ok(());
    };

    let logged = {
        let mut pg = page.borrow_mut();
        if !pg.is_dirty() {
            return Ok(());
        }
        let filename = st.buffer.file_name(pg.file_id())?;
        let lsn = st.wal.log_page_update(
            state.txn_id,
            state.last_lsn,
            &filename,
            pg.page_no(),
            pg.old_data(),
            pg.data(),
        )?;
        if let Some(lsn) = lsn {
            pg.set_page_lsn(lsn);
            pg.sync_old_data();
        }
        lsn
    };

    if let Some(lsn) = logged {
        if let Some(state) = st.txns.get_mut(&session) {
            state.last_lsn = lsn;
        }
    }
    Ok(())
}
