//! Crash-recovery scenarios: committed work survives a crash through redo,
//! uncommitted work is rolled back through undo, recovery is idempotent,
//! and user rollback restores pages in place.

use std::fs;
use std::path::Path;
use std::sync::Once;

use nanodb::storage::dbfile::DBFileType;
use nanodb::{ColumnInfo, ColumnType, Schema, SessionId, StorageConfig, StorageManager};

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

const SESSION: SessionId = SessionId(1);

fn open_storage(dir: &Path) -> StorageManager {
    let mut config = StorageConfig::default();
    config.base_dir = dir.to_path_buf();
    config.page_size = 1024;
    StorageManager::open(config).unwrap()
}

fn one_column_schema() -> Schema {
    Schema::new(vec![ColumnInfo::new("v", ColumnType::Integer)]).unwrap()
}

/// Creates a heap table whose page 1 exists, with `AAAA` at offset 100,
/// flushed and durable. Returns nothing; the table is named `t`.
fn seed_table(dir: &Path) {
    let mut st = open_storage(dir);
    let tbl = st
        .create_table(SESSION, "t", one_column_schema(), DBFileType::HeapTupleFile)
        .unwrap();
    let page = st.load_dbpage(SESSION, tbl.primary_file(), 1, true).unwrap();
    page.borrow_mut().write_bytes(100, b"AAAA");
    st.unpin_page(SESSION, &page).unwrap();
    st.shutdown().unwrap();
}

fn read_page_bytes(st: &mut StorageManager, table: &str, page_no: u32) -> Vec<u8> {
    let tbl = st.open_table(SESSION, table).unwrap();
    let page = st
        .load_dbpage(SESSION, tbl.primary_file(), page_no, false)
        .unwrap();
    let bytes = page.borrow().read_bytes(100, 4).to_vec();
    st.unpin_page(SESSION, &page).unwrap();
    bytes
}

#[test]
fn test_redo_recovers_committed_update() {
    init();
    let dir = tempfile::tempdir().unwrap();
    seed_table(dir.path());

    // Update AAAA -> BBBB inside a transaction and commit, but never
    // flush the data page: the crash loses the cached copy.
    {
        let mut st = open_storage(dir.path());
        let tbl = st.open_table(SESSION, "t").unwrap();
        st.begin_transaction(SESSION).unwrap();
        let page = st.load_dbpage(SESSION, tbl.primary_file(), 1, false).unwrap();
        page.borrow_mut().write_bytes(100, b"BBBB");
        st.log_page_update(SESSION, &page).unwrap();
        st.unpin_page(SESSION, &page).unwrap();
        st.commit_transaction(SESSION).unwrap();
        // Dropped without shutdown: simulated crash.
    }

    let mut st = open_storage(dir.path());
    assert_eq!(read_page_bytes(&mut st, "t", 1), b"BBBB");
    st.shutdown().unwrap();
}

#[test]
fn test_undo_rolls_back_uncommitted_update() {
    init();
    let dir = tempfile::tempdir().unwrap();
    seed_table(dir.path());

    // Update without committing, and flush the dirty page so disk holds
    // uncommitted bytes when the crash hits.
    {
        let mut st = open_storage(dir.path());
        let tbl = st.open_table(SESSION, "t").unwrap();
        st.begin_transaction(SESSION).unwrap();
        let page = st.load_dbpage(SESSION, tbl.primary_file(), 1, false).unwrap();
        page.borrow_mut().write_bytes(100, b"BBBB");
        st.log_page_update(SESSION, &page).unwrap();
        st.unpin_page(SESSION, &page).unwrap();
        st.flush_all_pages().unwrap();
    }

    let mut st = open_storage(dir.path());
    assert_eq!(read_page_bytes(&mut st, "t", 1), b"AAAA");
    st.shutdown().unwrap();

    // The log must end with ABORT_TXN, preceded by the redo-only record
    // describing the undo (both record types trail with their type byte).
    let wal = fs::read(dir.path().join("wal-00000.log")).unwrap();
    assert_eq!(*wal.last().unwrap(), 5, "log must end with ABORT_TXN");
    assert_eq!(
        wal[wal.len() - 13],
        3,
        "an UPDATE_PAGE_REDO_ONLY record must precede the abort"
    );
}

#[test]
fn test_recovery_is_idempotent() {
    init();
    let dir = tempfile::tempdir().unwrap();
    seed_table(dir.path());
    {
        let mut st = open_storage(dir.path());
        let tbl = st.open_table(SESSION, "t").unwrap();
        st.begin_transaction(SESSION).unwrap();
        let page = st.load_dbpage(SESSION, tbl.primary_file(), 1, false).unwrap();
        page.borrow_mut().write_bytes(100, b"CCCC");
        st.log_page_update(SESSION, &page).unwrap();
        st.unpin_page(SESSION, &page).unwrap();
        st.commit_transaction(SESSION).unwrap();
    }

    // Clone the crashed state and recover both copies independently; the
    // durable results must match byte for byte.
    let twin = tempfile::tempdir().unwrap();
    for entry in fs::read_dir(dir.path()).unwrap() {
        let entry = entry.unwrap();
        if entry.file_type().unwrap().is_file() {
            fs::copy(entry.path(), twin.path().join(entry.file_name())).unwrap();
        }
    }

    open_storage(dir.path()).shutdown().unwrap();
    open_storage(twin.path()).shutdown().unwrap();

    let a = fs::read(dir.path().join("t.tbl")).unwrap();
    let b = fs::read(twin.path().join("t.tbl")).unwrap();
    assert_eq!(a, b);

    // A second recovery over the already-recovered state changes nothing.
    open_storage(dir.path()).shutdown().unwrap();
    let c = fs::read(dir.path().join("t.tbl")).unwrap();
    assert_eq!(a, c);
}

#[test]
fn test_rollback_restores_page() {
    init();
    let dir = tempfile::tempdir().unwrap();
    seed_table(dir.path());

    let mut st = open_storage(dir.path());
    let tbl = st.open_table(SESSION, "t").unwrap();
    st.begin_transaction(SESSION).unwrap();
    let page = st.load_dbpage(SESSION, tbl.primary_file(), 1, false).unwrap();
    page.borrow_mut().write_bytes(100, b"ZZZZ");
    st.log_page_update(SESSION, &page).unwrap();
    st.unpin_page(SESSION, &page).unwrap();

    st.rollback_transaction(SESSION).unwrap();
    assert!(!st.has_transaction(SESSION));
    assert_eq!(read_page_bytes(&mut st, "t", 1), b"AAAA");

    // The session can start fresh work afterwards.
    st.begin_transaction(SESSION).unwrap();
    let page = st.load_dbpage(SESSION, tbl.primary_file(), 1, false).unwrap();
    page.borrow_mut().write_bytes(100, b"DDDD");
    st.log_page_update(SESSION, &page).unwrap();
    st.unpin_page(SESSION, &page).unwrap();
    st.commit_transaction(SESSION).unwrap();
    st.shutdown().unwrap();

    let mut st = open_storage(dir.path());
    assert_eq!(read_page_bytes(&mut st, "t", 1), b"DDDD");
    st.shutdown().unwrap();
}

#[test]
fn test_multiple_transactions_mixed_outcome() {
    init();
    let dir = tempfile::tempdir().unwrap();
    seed_table(dir.path());

    // Session 1 commits page-1 bytes; session 2 leaves page-2 bytes
    // uncommitted (but flushed). Recovery must keep one and undo the
    // other.
    let s2 = SessionId(2);
    {
        let mut st = open_storage(dir.path());
        let tbl = st.open_table(SESSION, "t").unwrap();

        st.begin_transaction(SESSION).unwrap();
        let p1 = st.load_dbpage(SESSION, tbl.primary_file(), 1, false).unwrap();
        p1.borrow_mut().write_bytes(100, b"KEEP");
        st.log_page_update(SESSION, &p1).unwrap();
        st.unpin_page(SESSION, &p1).unwrap();
        st.commit_transaction(SESSION).unwrap();

        st.begin_transaction(s2).unwrap();
        let p2 = st.load_dbpage(s2, tbl.primary_file(), 2, true).unwrap();
        p2.borrow_mut().write_bytes(100, b"LOSE");
        st.log_page_update(s2, &p2).unwrap();
        st.unpin_page(s2, &p2).unwrap();
        st.flush_all_pages().unwrap();
    }

    let mut st = open_storage(dir.path());
    assert_eq!(read_page_bytes(&mut st, "t", 1), b"KEEP");
    let tbl = st.open_table(SESSION, "t").unwrap();
    let page = st.load_dbpage(SESSION, tbl.primary_file(), 2, false).unwrap();
    assert_eq!(page.borrow().read_bytes(100, 4), &[0u8; 4]);
    st.unpin_page(SESSION, &page).unwrap();
    st.shutdown().unwrap();
}
