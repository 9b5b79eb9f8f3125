//! Cross-subsystem behavior: cache bounds under real workloads, row-event
//! listeners, table lifecycle, and keeping a B+ tree index in sync with a
//! heap table through the listener seam.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::sync::Once;

use nanodb::storage::dbfile::DBFileType;
use nanodb::{
    ColumnInfo, ColumnType, FilePointer, RowEventListener, Schema, SessionId, StorageConfig,
    StorageManager, TupleLiteral, Value,
};

static INIT: Once = Once::new();

fn init() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

const SESSION: SessionId = SessionId(1);

fn open_storage_with_cache(dir: &Path, cache_bytes: usize) -> StorageManager {
    let mut config = StorageConfig::default();
    config.base_dir = dir.to_path_buf();
    config.page_size = 1024;
    config.page_cache_size = cache_bytes;
    StorageManager::open(config).unwrap()
}

fn people_schema() -> Schema {
    Schema::new(vec![
        ColumnInfo::new("id", ColumnType::Integer),
        ColumnInfo::new("name", ColumnType::VarChar { length: 60 }),
    ])
    .unwrap()
}

#[test]
fn test_cache_stays_bounded_under_load() {
    init();
    let dir = tempfile::tempdir().unwrap();
    // Four pages of cache, a workload spanning far more pages.
    let mut st = open_storage_with_cache(dir.path(), 4 * 1024);
    let tbl = st
        .create_table(SESSION, "t", people_schema(), DBFileType::HeapTupleFile)
        .unwrap();

    let filler = "x".repeat(50);
    for i in 0..200 {
        let row = TupleLiteral::new(vec![Value::Integer(i), Value::Text(filler.clone())]);
        st.add_tuple(SESSION, &tbl, &row).unwrap();
        assert!(
            st.buffer_manager().cached_bytes() <= 4 * 1024,
            "cache exceeded its budget after insert {}",
            i
        );
    }

    // A full scan also stays within budget and sees every row.
    let mut count = 0;
    let mut cursor = st.get_first_tuple(SESSION, &tbl).unwrap();
    while let Some(tuple) = cursor {
        count += 1;
        assert!(st.buffer_manager().cached_bytes() <= 4 * 1024);
        cursor = st.get_next_tuple(SESSION, &tbl, tuple.as_ref()).unwrap();
    }
    assert_eq!(count, 200);
    st.shutdown().unwrap();
}

#[derive(Default)]
struct EventLog {
    inserted: Vec<FilePointer>,
    deleted: Vec<FilePointer>,
}

struct RecordingListener(Rc<RefCell<EventLog>>);

impl RowEventListener for RecordingListener {
    fn after_row_inserted(&mut self, _table: &str, ptr: FilePointer) -> nanodb::Result<()> {
        self.0.borrow_mut().inserted.push(ptr);
        Ok(())
    }

    fn before_row_deleted(&mut self, _table: &str, ptr: FilePointer) -> nanodb::Result<()> {
        self.0.borrow_mut().deleted.push(ptr);
        Ok(())
    }
}

#[test]
fn test_row_event_listener_sees_inserts_and_deletes() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let mut st = open_storage_with_cache(dir.path(), 64 * 1024);
    let tbl = st
        .create_table(SESSION, "t", people_schema(), DBFileType::HeapTupleFile)
        .unwrap();

    let events = Rc::new(RefCell::new(EventLog::default()));
    st.add_row_listener(Box::new(RecordingListener(events.clone())));

    let p1 = st
        .add_tuple(SESSION, &tbl, &TupleLiteral::new(vec![Value::Integer(1), Value::Text("a".into())]))
        .unwrap();
    let p2 = st
        .add_tuple(SESSION, &tbl, &TupleLiteral::new(vec![Value::Integer(2), Value::Text("b".into())]))
        .unwrap();
    assert_eq!(events.borrow().inserted, vec![p1, p2]);

    let tuple = st.get_tuple(SESSION, &tbl, p1).unwrap();
    st.delete_tuple(SESSION, &tbl, tuple.as_ref()).unwrap();
    assert_eq!(events.borrow().deleted, vec![p1]);
    st.shutdown().unwrap();
}

#[test]
fn test_index_kept_in_sync_through_listener_seam() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let mut st = open_storage_with_cache(dir.path(), 64 * 1024);
    let tbl = st
        .create_table(SESSION, "people", people_schema(), DBFileType::HeapTupleFile)
        .unwrap();
    let idx = st
        .create_table(
            SESSION,
            "people_id_idx",
            Schema::new(vec![ColumnInfo::new("id", ColumnType::Integer)]).unwrap(),
            DBFileType::BTreeTupleFile,
        )
        .unwrap();

    // The index-maintenance layer lives outside this crate; here its job
    // is played by the test, driving the index through the same public
    // surface it would use.
    for (row, id) in [30, 10, 20, 50, 40].into_iter().enumerate() {
        let ptr = st
            .add_tuple(
                SESSION,
                &tbl,
                &TupleLiteral::new(vec![Value::Integer(id), Value::Text(format!("p{}", row))]),
            )
            .unwrap();
        st.add_tuple(
            SESSION,
            &idx,
            &TupleLiteral::with_reference(vec![Value::Integer(id)], ptr),
        )
        .unwrap();
    }

    // Index order drives row lookups back into the heap.
    let mut ids_in_order = Vec::new();
    let mut cursor = st.get_first_tuple(SESSION, &idx).unwrap();
    while let Some(entry) = cursor {
        let heap_ptr = entry.external_reference().unwrap();
        let row = st.get_tuple(SESSION, &tbl, heap_ptr).unwrap();
        ids_in_order.push(row.get_column_value(0).unwrap());
        cursor = st.get_next_tuple(SESSION, &idx, entry.as_ref()).unwrap();
    }
    assert_eq!(
        ids_in_order,
        vec![
            Value::Integer(10),
            Value::Integer(20),
            Value::Integer(30),
            Value::Integer(40),
            Value::Integer(50)
        ]
    );
    st.shutdown().unwrap();
}

#[test]
fn test_drop_table_removes_files() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let mut st = open_storage_with_cache(dir.path(), 64 * 1024);
    st.create_table(SESSION, "gone", people_schema(), DBFileType::HeapTupleFile)
        .unwrap();
    assert!(dir.path().join("gone.tbl").is_file());

    st.drop_table(SESSION, "gone").unwrap();
    assert!(!dir.path().join("gone.tbl").is_file());
    assert!(st.open_table(SESSION, "gone").is_err());

    // The name is reusable immediately.
    st.create_table(SESSION, "gone", people_schema(), DBFileType::HeapTupleFile)
        .unwrap();
    st.shutdown().unwrap();
}

#[test]
fn test_schema_with_constraints_survives_reopen() {
    init();
    let dir = tempfile::tempdir().unwrap();
    {
        let mut st = open_storage_with_cache(dir.path(), 64 * 1024);
        let mut schema = people_schema();
        schema.add_constraint(nanodb::KeyConstraint::Candidate {
            primary: true,
            name: Some("pk_people".into()),
            columns: vec![0],
            index_name: Some("people_id_idx".into()),
        });
        st.create_table(SESSION, "people", schema, DBFileType::HeapTupleFile)
            .unwrap();
        st.shutdown().unwrap();
    }

    let mut st = open_storage_with_cache(dir.path(), 64 * 1024);
    let tbl = st.open_table(SESSION, "people").unwrap();
    assert_eq!(tbl.schema.constraints().len(), 1);
    match &tbl.schema.constraints()[0] {
        nanodb::KeyConstraint::Candidate {
            primary,
            name,
            columns,
            index_name,
        } => {
            assert!(primary);
            assert_eq!(name.as_deref(), Some("pk_people"));
            assert_eq!(columns, &vec![0]);
            assert_eq!(index_name.as_deref(), Some("people_id_idx"));
        }
        other => panic!("unexpected constraint {:?}", other),
    }
    st.shutdown().unwrap();
}
