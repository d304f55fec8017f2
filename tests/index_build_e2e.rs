//! CreateIndex end-to-end: the polling loop converges once the background
//! index pipeline has converted every eligible file. These tests run in
//! SINGLE mode with the live one-second timer.

use ostinato_db::db::meta::FileState;
use ostinato_db::db::{JsonMeta, MetaStore, TableState};
use ostinato_db::{
    DbEngine, DbOptions, EngineType, IndexDescriptor, MetricKind, TableSchema,
};
use tempfile::tempdir;

fn schema(table_id: &str, engine_type: EngineType, nlist: u32) -> TableSchema {
    TableSchema {
        table_id: table_id.to_string(),
        dimension: 8,
        index_file_size: 1,
        metric: MetricKind::L2,
        index: IndexDescriptor {
            engine_type,
            metric: MetricKind::L2,
            nlist,
        },
        state: TableState::Active,
        flag: 0,
        created_at: 0,
    }
}

#[test]
fn s3_create_index_converts_every_file() {
    let dir = tempdir().unwrap();
    let mut options = DbOptions::from_data_dir(dir.path());
    options.index_poll_max_retries = Some(120); // safety net for CI
    let db = DbEngine::open(options).unwrap();
    db.create_table(schema("t", EngineType::IvfFlat, 16)).unwrap();

    let vectors: Vec<f32> = (0..64 * 8).map(|i| (i % 97) as f32).collect();
    let ids = db.insert_vectors("t", &vectors).unwrap();
    db.flush_once().unwrap();

    db.create_index(
        "t",
        IndexDescriptor {
            engine_type: EngineType::IvfFlat,
            metric: MetricKind::L2,
            nlist: 32,
        },
    )
    .unwrap();

    assert_eq!(db.describe_index("t").unwrap().nlist, 32);

    // Indexed data answers queries; probing every coarse list keeps the
    // scan exhaustive.
    let probe = &vectors[0..8];
    let hit = db.query("t", 1, 32, probe, &[], &[]).unwrap();
    assert_eq!(hit.ids, vec![ids[0]]);

    assert_eq!(db.table_row_count("t").unwrap(), 64);
    db.stop().unwrap();

    let meta = JsonMeta::open(&DbOptions::from_data_dir(dir.path())).unwrap();
    let non_final = meta
        .files_by_type(
            "t",
            &[
                FileState::New,
                FileState::NewMerge,
                FileState::Raw,
                FileState::NewIndex,
                FileState::ToIndex,
            ],
        )
        .unwrap();
    assert!(non_final.is_empty(), "every file must have reached INDEX");
    assert_eq!(meta.files_by_type("t", &[FileState::Index]).unwrap().len(), 1);
}

#[test]
fn create_index_on_flat_table_returns_quickly() {
    let dir = tempdir().unwrap();
    let mut options = DbOptions::from_data_dir(dir.path());
    options.index_poll_max_retries = Some(60);
    let db = DbEngine::open(options).unwrap();
    db.create_table(schema("t", EngineType::Flat, 0)).unwrap();
    db.insert_vectors("t", &[0.0; 8]).unwrap();
    db.flush_once().unwrap();

    db.create_index("t", IndexDescriptor::flat(MetricKind::L2))
        .unwrap();
    assert_eq!(
        db.describe_index("t").unwrap().engine_type,
        EngineType::Flat
    );
    db.stop().unwrap();
}

#[test]
fn create_index_keeps_table_metric() {
    let dir = tempdir().unwrap();
    let mut options = DbOptions::from_data_dir(dir.path());
    options.index_poll_max_retries = Some(120);
    let db = DbEngine::open(options).unwrap();

    let mut s = schema("t", EngineType::IvfFlat, 16);
    s.metric = MetricKind::InnerProduct;
    s.index.metric = MetricKind::InnerProduct;
    db.create_table(s).unwrap();
    db.insert_vectors("t", &[1.0; 8]).unwrap();
    db.flush_once().unwrap();

    // The caller asks for L2; the metric is immutable after creation.
    db.create_index(
        "t",
        IndexDescriptor {
            engine_type: EngineType::IvfFlat,
            metric: MetricKind::L2,
            nlist: 8,
        },
    )
    .unwrap();
    assert_eq!(
        db.describe_index("t").unwrap().metric,
        MetricKind::InnerProduct
    );
    db.stop().unwrap();
}
