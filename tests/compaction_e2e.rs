use ostinato_db::db::meta::FileState;
use ostinato_db::db::{JsonMeta, MetaStore, TableState};
use ostinato_db::{
    DbEngine, DbOptions, EngineType, IndexDescriptor, MetricKind, Mode, TableSchema,
};
use tempfile::tempdir;

fn ivf_schema(table_id: &str, dim: u32, file_size_mb: u64) -> TableSchema {
    TableSchema {
        table_id: table_id.to_string(),
        dimension: dim,
        index_file_size: file_size_mb,
        metric: MetricKind::L2,
        index: IndexDescriptor {
            engine_type: EngineType::IvfFlat,
            metric: MetricKind::L2,
            nlist: 16,
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

/// Flush `batches` rounds of `rows` vectors each, then compact once.
fn fill_and_compact(db: &DbEngine, table_id: &str, dim: usize, rows: usize, batches: usize) {
    for batch in 0..batches {
        let vectors: Vec<f32> = (0..rows * dim)
            .map(|i| (batch * rows * dim + i) as f32 * 1e-4)
            .collect();
        db.insert_vectors(table_id, &vectors).unwrap();
        db.flush_once().unwrap();
    }
    db.compact_once().unwrap();
}

#[test]
fn small_files_merge_into_one_raw_file() {
    let dir = tempdir().unwrap();
    let db = DbEngine::open(quiet_options(dir.path())).unwrap();
    db.create_table(ivf_schema("t", 4, 64)).unwrap();

    fill_and_compact(&db, "t", 4, 100, 3);

    // Row count is conserved across the merge.
    assert_eq!(db.table_row_count("t").unwrap(), 300);
    db.stop().unwrap();

    let meta = JsonMeta::open(&quiet_options(dir.path())).unwrap();
    let raw = meta.files_by_type("t", &[FileState::Raw]).unwrap();
    assert_eq!(raw.len(), 1, "three small flushes merge into one RAW file");
    let consumed = meta.files_by_type("t", &[FileState::ToDelete]).unwrap();
    assert_eq!(consumed.len(), 3, "sources are demoted in the same commit");
}

#[test]
fn s2_merged_file_reaching_threshold_is_promoted_to_index() {
    let dir = tempdir().unwrap();
    let mut options = quiet_options(dir.path());
    options.merge_trigger_number = 2;
    let db = DbEngine::open(options).unwrap();
    // 1 MB threshold; 64-dim rows are 256 B of payload each, so ~4100 rows
    // of two flushed files push the merged file over it.
    db.create_table(ivf_schema("t", 64, 1)).unwrap();

    fill_and_compact(&db, "t", 64, 3000, 2);

    assert_eq!(db.table_row_count("t").unwrap(), 6000);
    db.stop().unwrap();

    let meta = JsonMeta::open(&quiet_options(dir.path())).unwrap();
    let to_index = meta.files_by_type("t", &[FileState::ToIndex]).unwrap();
    assert_eq!(
        to_index.len(),
        1,
        "merged file at or above index_file_size goes to TO_INDEX"
    );
    let files = meta.files_to_search("t", &to_index, &[]).unwrap();
    let file = files.values().flatten().next().unwrap();
    assert!(file.file_size >= 1 << 20);
    assert_eq!(file.row_count, 6000);
}

#[test]
fn below_merge_trigger_nothing_happens() {
    let dir = tempdir().unwrap();
    let mut options = quiet_options(dir.path());
    options.merge_trigger_number = 4;
    let db = DbEngine::open(options).unwrap();
    db.create_table(ivf_schema("t", 4, 64)).unwrap();

    fill_and_compact(&db, "t", 4, 10, 2);

    db.stop().unwrap();
    let meta = JsonMeta::open(&quiet_options(dir.path())).unwrap();
    let raw = meta.files_by_type("t", &[FileState::Raw]).unwrap();
    assert_eq!(raw.len(), 2, "two files stay put below the trigger of 4");
}

#[test]
fn flat_table_merge_never_produces_to_index() {
    let dir = tempdir().unwrap();
    let mut options = quiet_options(dir.path());
    options.merge_trigger_number = 2;
    let db = DbEngine::open(options).unwrap();

    let mut schema = ivf_schema("t", 64, 1);
    schema.index.engine_type = EngineType::Flat;
    db.create_table(schema).unwrap();

    fill_and_compact(&db, "t", 64, 3000, 2);

    db.stop().unwrap();
    let meta = JsonMeta::open(&quiet_options(dir.path())).unwrap();
    assert!(
        meta.files_by_type("t", &[FileState::ToIndex])
            .unwrap()
            .is_empty(),
        "FLAT files never enter TO_INDEX regardless of size"
    );
    assert_eq!(meta.files_by_type("t", &[FileState::Raw]).unwrap().len(), 1);
}

#[test]
fn merged_data_stays_queryable() {
    let dir = tempdir().unwrap();
    let db = DbEngine::open(quiet_options(dir.path())).unwrap();
    db.create_table(ivf_schema("t", 4, 64)).unwrap();

    let first = db.insert_vectors("t", &[5.0, 5.0, 5.0, 5.0]).unwrap();
    db.flush_once().unwrap();
    let second = db.insert_vectors("t", &[9.0, 9.0, 9.0, 9.0]).unwrap();
    db.flush_once().unwrap();
    db.compact_once().unwrap();

    let hit = db.query("t", 1, 0, &[5.0, 5.0, 5.0, 5.0], &[], &[]).unwrap();
    assert_eq!(hit.ids, vec![first[0]]);
    let hit = db.query("t", 1, 0, &[9.0, 9.0, 9.0, 9.0], &[], &[]).unwrap();
    assert_eq!(hit.ids, vec![second[0]]);
    db.stop().unwrap();
}
