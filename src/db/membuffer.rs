//! Per-table insert buffer.
//!
//! Vectors live here from `insert` until the next flush. Ids are 64-bit,
//! derived from a microsecond timestamp so distinct inserters produce
//! disjoint ascending ranges. A flush that fails leaves the buffer intact:
//! an insert that returned OK is never silently dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::db::cache::CacheManager;
use crate::db::error::{DbError, Result};
use crate::db::meta::{FileState, MetaStore};
use crate::db::options::DbOptions;
use crate::engine::build_engine;
use crate::format;

/// Monotonic id allocator. Ids are `unix_micros << 8` plus a serial
/// component, clamped so consecutive batches never overlap.
pub struct IdGenerator {
    last: Mutex<i64>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(0),
        }
    }

    pub fn next_batch(&self, n: usize) -> Vec<i64> {
        let mut last = self.last.lock();
        let now = Utc::now().timestamp_micros() << 8;
        let base = now.max(*last + 1);
        *last = base + n as i64 - 1;
        (base..base + n as i64).collect()
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

struct TableBuffer {
    dim: usize,
    ids: Vec<i64>,
    vectors: Vec<f32>,
}

pub struct MemBuffer {
    meta: Arc<dyn MetaStore>,
    cache: Arc<CacheManager>,
    options: DbOptions,
    buffers: Mutex<HashMap<String, TableBuffer>>,
    id_gen: IdGenerator,
}

impl MemBuffer {
    pub fn new(meta: Arc<dyn MetaStore>, cache: Arc<CacheManager>, options: DbOptions) -> Self {
        Self {
            meta,
            cache,
            options,
            buffers: Mutex::new(HashMap::new()),
            id_gen: IdGenerator::new(),
        }
    }

    /// Buffer `n = vectors.len() / dim` rows and return their assigned ids.
    pub fn insert(&self, table_id: &str, vectors: &[f32]) -> Result<Vec<i64>> {
        let schema = self.meta.describe_table(table_id)?;
        let dim = schema.dimension as usize;
        if dim == 0 || vectors.is_empty() || vectors.len() % dim != 0 {
            return Err(DbError::Db(format!(
                "insert data length {} is not a positive multiple of dimension {}",
                vectors.len(),
                dim
            )));
        }
        let n = vectors.len() / dim;
        let ids = self.id_gen.next_batch(n);

        let mut buffers = self.buffers.lock();
        let buffer = buffers
            .entry(table_id.to_string())
            .or_insert_with(|| TableBuffer {
                dim,
                ids: Vec::new(),
                vectors: Vec::new(),
            });
        buffer.ids.extend_from_slice(&ids);
        buffer.vectors.extend_from_slice(vectors);
        Ok(ids)
    }

    /// Drop a table's unflushed rows. Used by DeleteTable before the soft
    /// delete so nothing gets flushed for a dying table.
    pub fn erase(&self, table_id: &str) {
        if self.buffers.lock().remove(table_id).is_some() {
            debug!(table_id, "dropped unflushed buffer");
        }
    }

    /// Rows currently buffered for a table (diagnostics).
    pub fn buffered_rows(&self, table_id: &str) -> usize {
        self.buffers
            .lock()
            .get(table_id)
            .map(|b| b.ids.len())
            .unwrap_or(0)
    }

    /// Flush every dirty buffer to a NEW file and commit it to RAW, adding
    /// each table that produced a file to `affected`. A table whose flush
    /// fails keeps its buffer and surfaces the error after the remaining
    /// tables were attempted; `affected` still reflects the tables that
    /// did flush.
    pub fn serialize(&self, affected: &mut HashSet<String>) -> Result<()> {
        let dirty: Vec<(String, TableBuffer)> = {
            let mut buffers = self.buffers.lock();
            let keys: Vec<String> = buffers
                .iter()
                .filter(|(_, b)| !b.ids.is_empty())
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| buffers.remove(&k).map(|b| (k, b)))
                .collect()
        };

        let mut first_error = None;
        for (table_id, buffer) in dirty {
            match self.flush_table(&table_id, &buffer) {
                Ok(()) => {
                    affected.insert(table_id);
                }
                Err(err) => {
                    warn!(table_id = %table_id, %err, "flush failed, buffer retained");
                    self.restore(table_id, buffer);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn flush_table(&self, table_id: &str, buffer: &TableBuffer) -> Result<()> {
        let mut file = self
            .meta
            .create_table_file(table_id, None, FileState::New)?;
        let location = std::path::Path::new(&file.location);

        let physical_size = format::write_segment(
            location,
            buffer.dim,
            &buffer.ids,
            &buffer.vectors,
            None,
        )?;

        file.state = FileState::Raw;
        file.file_size = physical_size;
        file.row_count = buffer.ids.len() as u64;
        self.meta.update_table_file(&file)?;
        debug!(
            table_id,
            file_id = file.file_id,
            rows = file.row_count,
            bytes = file.file_size,
            "buffer flushed"
        );

        if self.options.insert_cache_immediately {
            let mut engine = build_engine(
                buffer.dim,
                location,
                file.engine_type,
                file.metric,
                file.nlist,
                self.cache.clone(),
            )?;
            engine.cache()?;
        }
        Ok(())
    }

    /// Put a buffer back after a failed flush, in front of rows inserted
    /// meanwhile so id order is preserved.
    fn restore(&self, table_id: String, mut buffer: TableBuffer) {
        let mut buffers = self.buffers.lock();
        match buffers.remove(&table_id) {
            Some(newer) => {
                buffer.ids.extend_from_slice(&newer.ids);
                buffer.vectors.extend_from_slice(&newer.vectors);
                buffers.insert(table_id, buffer);
            }
            None => {
                buffers.insert(table_id, buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::meta::{IndexDescriptor, JsonMeta, TableSchema, TableState};
    use crate::engine::{EngineType, MetricKind};
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> MemBuffer {
        let options = DbOptions::from_data_dir(dir);
        let meta = Arc::new(JsonMeta::open(&options).unwrap());
        meta.create_table(TableSchema {
            table_id: "t".into(),
            dimension: 2,
            index_file_size: 1 << 20,
            metric: MetricKind::L2,
            index: IndexDescriptor {
                engine_type: EngineType::Flat,
                metric: MetricKind::L2,
                nlist: 0,
            },
            state: TableState::Active,
            flag: 0,
            created_at: 0,
        })
        .unwrap();
        let cache = Arc::new(CacheManager::new("cpu", 1 << 20));
        MemBuffer::new(meta, cache, options)
    }

    #[test]
    fn ids_are_monotonic_and_disjoint() {
        let id_gen = IdGenerator::new();
        let a = id_gen.next_batch(10);
        let b = id_gen.next_batch(10);
        assert!(a.windows(2).all(|w| w[1] == w[0] + 1));
        assert!(b[0] > a[9]);
    }

    #[test]
    fn insert_rejects_dimension_mismatch() {
        let dir = tempdir().unwrap();
        let mem = setup(dir.path());
        assert!(mem.insert("t", &[1.0, 2.0, 3.0]).is_err());
        assert!(mem.insert("t", &[]).is_err());
    }

    #[test]
    fn insert_into_missing_table_fails() {
        let dir = tempdir().unwrap();
        let mem = setup(dir.path());
        let err = mem.insert("ghost", &[1.0, 2.0]).unwrap_err();
        assert_eq!(err.code(), "TABLE_NOT_EXIST");
    }

    #[test]
    fn serialize_flushes_to_raw_and_clears_buffer() {
        let dir = tempdir().unwrap();
        let mem = setup(dir.path());
        let ids = mem.insert("t", &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(mem.buffered_rows("t"), 2);

        let mut affected = HashSet::new();
        mem.serialize(&mut affected).unwrap();
        assert!(affected.contains("t"));
        assert_eq!(mem.buffered_rows("t"), 0);
        assert_eq!(mem.meta.count("t").unwrap(), 2);

        // Nothing dirty: second flush is a no-op.
        let mut affected = HashSet::new();
        mem.serialize(&mut affected).unwrap();
        assert!(affected.is_empty());
    }

    #[test]
    fn erase_drops_unflushed_rows() {
        let dir = tempdir().unwrap();
        let mem = setup(dir.path());
        mem.insert("t", &[1.0, 2.0]).unwrap();
        mem.erase("t");
        let mut affected = HashSet::new();
        mem.serialize(&mut affected).unwrap();
        assert!(affected.is_empty());
        assert_eq!(mem.meta.count("t").unwrap(), 0);
    }
}
