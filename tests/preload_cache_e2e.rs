//! PreloadTable admission: never load more than the cache's free window.

use ostinato_db::db::TableState;
use ostinato_db::{
    DbEngine, DbOptions, EngineType, IndexDescriptor, MetricKind, Mode, TableSchema,
};
use tempfile::tempdir;

fn flat_schema(table_id: &str, dim: u32) -> TableSchema {
    TableSchema {
        table_id: table_id.to_string(),
        dimension: dim,
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

fn options_with_cache(dir: &std::path::Path, cache_bytes: u64) -> DbOptions {
    let mut options = DbOptions::from_data_dir(dir);
    options.mode = Mode::ClusterReadonly;
    options.cpu_cache_capacity = cache_bytes;
    options
}

#[test]
fn s4_preload_larger_than_cache_returns_cache_full() {
    let dir = tempdir().unwrap();
    // 16 KiB cache, ~66 KiB of segment data.
    let db = DbEngine::open(options_with_cache(dir.path(), 16 << 10)).unwrap();
    db.create_table(flat_schema("t", 16)).unwrap();
    let vectors: Vec<f32> = (0..1024 * 16).map(|i| i as f32).collect();
    db.insert_vectors("t", &vectors).unwrap();
    db.flush_once().unwrap();

    let err = db.preload_table("t").unwrap_err();
    assert_eq!(err.code(), "CACHE_FULL");
    assert!(db.cache_usage() <= db.cache_capacity());
    db.stop().unwrap();
}

#[test]
fn preload_within_budget_populates_cache() {
    let dir = tempdir().unwrap();
    let db = DbEngine::open(options_with_cache(dir.path(), 8 << 20)).unwrap();
    db.create_table(flat_schema("t", 16)).unwrap();
    let vectors: Vec<f32> = (0..256 * 16).map(|i| i as f32).collect();
    db.insert_vectors("t", &vectors).unwrap();
    db.flush_once().unwrap();

    assert_eq!(db.cache_usage(), 0);
    db.preload_table("t").unwrap();
    assert!(db.cache_usage() > 0);
    assert!(db.cache_usage() <= db.cache_capacity());

    // A preloaded table answers queries straight from the cache.
    let probe: Vec<f32> = vectors[0..16].to_vec();
    let hit = db.query("t", 1, 0, &probe, &[], &[]).unwrap();
    assert_eq!(hit.ids.len(), 1);
    db.stop().unwrap();
}

#[test]
fn preload_missing_table_fails() {
    let dir = tempdir().unwrap();
    let db = DbEngine::open(options_with_cache(dir.path(), 1 << 20)).unwrap();
    let err = db.preload_table("ghost").unwrap_err();
    assert_eq!(err.code(), "TABLE_NOT_EXIST");
    db.stop().unwrap();
}
