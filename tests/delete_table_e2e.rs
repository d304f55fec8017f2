//! DeleteTable: buffer erase, soft delete, delete-job broadcast, and
//! TTL-gated physical removal.

use ostinato_db::db::meta::FileState;
use ostinato_db::db::{JsonMeta, MetaStore, TableState};
use ostinato_db::{
    DbEngine, DbOptions, EngineType, IndexDescriptor, MetricKind, Mode, TableSchema,
};
use tempfile::tempdir;

fn flat_schema(table_id: &str) -> TableSchema {
    TableSchema {
        table_id: table_id.to_string(),
        dimension: 2,
        index_file_size: 64,
        metric: MetricKind::L2,
        index: IndexDescriptor {
            engine_type: EngineType::Flat,
            metric: MetricKind::L2,
            nlist: 0,
        },
        state: TableState::Active,
        flag: 0,
        created_at: 0,
    }
}

fn quiet_options(dir: &std::path::Path) -> DbOptions {
    let mut options = DbOptions::from_data_dir(dir);
    options.mode = Mode::ClusterReadonly;
    options
}

#[test]
fn s6_delete_table_makes_queries_fail_and_files_expire() {
    let dir = tempdir().unwrap();
    let db = DbEngine::open(quiet_options(dir.path())).unwrap();
    db.create_table(flat_schema("t")).unwrap();
    db.insert_vectors("t", &[1.0, 2.0, 3.0, 4.0]).unwrap();
    db.flush_once().unwrap();

    // Preload so the delete job has cached artifacts to release.
    db.preload_table("t").unwrap();
    assert!(db.cache_usage() > 0);

    db.delete_table("t", &[]).unwrap();

    let err = db.query("t", 1, 0, &[1.0, 2.0], &[], &[]).unwrap_err();
    assert_eq!(err.code(), "TABLE_NOT_EXIST");
    assert!(!db.has_table("t").unwrap());
    assert_eq!(db.cache_usage(), 0, "delete job released cached artifacts");
    db.stop().unwrap();

    // Before the TTL elapses the files survive on disk; at TTL zero they go.
    let meta = JsonMeta::open(&quiet_options(dir.path())).unwrap();
    assert_eq!(
        meta.files_by_type("t", &[FileState::ToDelete]).unwrap().len(),
        1
    );
    meta.cleanup_files_with_ttl(3600).unwrap();
    assert_eq!(meta.table_file_locations("t").unwrap().len(), 1);
    meta.cleanup_files_with_ttl(0).unwrap();
    assert!(meta.table_file_locations("t").unwrap().is_empty());
}

#[test]
fn delete_drops_unflushed_buffer() {
    let dir = tempdir().unwrap();
    let db = DbEngine::open(quiet_options(dir.path())).unwrap();
    db.create_table(flat_schema("t")).unwrap();
    db.insert_vectors("t", &[9.0, 9.0]).unwrap();

    db.delete_table("t", &[]).unwrap();
    // A later flush must not resurrect rows for the deleted table.
    db.flush_once().unwrap();
    db.stop().unwrap();

    let meta = JsonMeta::open(&quiet_options(dir.path())).unwrap();
    assert!(meta
        .files_by_type("t", &[FileState::Raw, FileState::New])
        .unwrap()
        .is_empty());
}

#[test]
fn delete_by_dates_keeps_other_partitions() {
    let dir = tempdir().unwrap();
    let db = DbEngine::open(quiet_options(dir.path())).unwrap();
    db.create_table(flat_schema("t")).unwrap();
    db.insert_vectors("t", &[1.0, 1.0]).unwrap();
    db.flush_once().unwrap();

    // Dropping a partition that holds no files leaves today's data alone.
    db.delete_table("t", &[1999_01_01]).unwrap();
    assert!(db.has_table("t").unwrap());
    assert_eq!(db.table_row_count("t").unwrap(), 1);

    // Dropping today's partition removes the rows from sight.
    db.delete_table("t", &[ostinato_db::db::today()]).unwrap();
    assert_eq!(db.table_row_count("t").unwrap(), 0);
    db.stop().unwrap();
}

#[test]
fn delete_missing_table_fails_but_deleted_table_is_noop() {
    let dir = tempdir().unwrap();
    let db = DbEngine::open(quiet_options(dir.path())).unwrap();
    let err = db.delete_table("ghost", &[]).unwrap_err();
    assert_eq!(err.code(), "TABLE_NOT_EXIST");

    db.create_table(flat_schema("t")).unwrap();
    db.delete_table("t", &[]).unwrap();
    db.delete_table("t", &[]).unwrap(); // second delete is a no-op
    db.stop().unwrap();
}
