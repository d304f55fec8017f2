//! Metadata store: the authoritative record of tables, files, file states
//! and index descriptors.
//!
//! The store is fronted by the [`MetaStore`] trait; the embedded backend
//! ([`JsonMeta`]) keeps the whole state in memory under one lock and
//! persists it to a single `meta.json` through a temp file + rename +
//! fsync, so every trait call — including multi-file batch updates — is
//! atomic on disk. File-state changes are validated against the state
//! machine before they are applied.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use chrono::{Duration, Local, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::error::{DbError, Result};
use crate::db::options::DbOptions;
use crate::engine::{EngineType, MetricKind};

/// Calendar partition key, YYYYMMDD.
pub type DateKey = u32;

pub const DEFAULT_NLIST: u32 = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableState {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileState {
    /// Freshly flushed insert buffer, not yet committed.
    New,
    /// Merge output being built.
    NewMerge,
    /// Index artifact written, commit pending.
    NewIndex,
    /// Committed raw segment.
    Raw,
    /// Raw segment waiting for the index pipeline.
    ToIndex,
    /// Committed indexed segment.
    Index,
    /// Awaiting TTL-delayed physical removal.
    ToDelete,
}

impl FileState {
    pub fn is_searchable(self) -> bool {
        matches!(self, FileState::Raw | FileState::ToIndex | FileState::Index)
    }

    pub fn is_mergeable(self) -> bool {
        matches!(self, FileState::Raw | FileState::New | FileState::NewMerge)
    }

    /// Legal edges of the file state machine. Self-transitions are allowed
    /// so batch updates can touch sizes without moving state.
    pub fn can_transition(self, to: FileState) -> bool {
        use FileState::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (New, Raw)
                | (New, ToDelete)
                | (NewMerge, Raw)
                | (NewMerge, ToIndex)
                | (NewMerge, ToDelete)
                | (Raw, ToIndex)
                | (Raw, ToDelete)
                | (ToIndex, NewIndex)
                | (ToIndex, Raw)      // drop-index policy
                | (ToIndex, ToDelete)
                | (NewIndex, Index)
                | (NewIndex, ToDelete)
                | (Index, Raw)        // drop-index policy
                | (Index, ToDelete)
        )
    }
}

/// Index configuration of a table. Equality is structural over all three
/// fields; the metric never changes after table creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub engine_type: EngineType,
    pub metric: MetricKind,
    pub nlist: u32,
}

impl IndexDescriptor {
    pub fn flat(metric: MetricKind) -> Self {
        Self {
            engine_type: EngineType::Flat,
            metric,
            nlist: DEFAULT_NLIST,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_id: String,
    pub dimension: u32,
    /// Size threshold in bytes at which a merged file is promoted to
    /// TO_INDEX.
    pub index_file_size: u64,
    pub metric: MetricKind,
    pub index: IndexDescriptor,
    pub state: TableState,
    pub flag: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFile {
    pub file_id: u64,
    pub table_id: String,
    pub date: DateKey,
    pub location: String,
    pub engine_type: EngineType,
    pub metric: MetricKind,
    pub nlist: u32,
    pub dimension: u32,
    /// Promotion threshold copied from the table at creation time.
    pub index_file_size: u64,
    pub file_size: u64,
    pub row_count: u64,
    pub state: FileState,
    pub created_at: i64,
    /// Last state-change timestamp; drives the TO_DELETE TTL.
    pub updated_at: i64,
}

/// Grouping of files by calendar partition.
pub type DatePartitionedFiles = BTreeMap<DateKey, Vec<TableFile>>;

/// Atomic operations over the table/file records. Each call either fully
/// applies or leaves the store unchanged; there are no cross-call
/// transactions.
pub trait MetaStore: Send + Sync {
    fn create_table(&self, schema: TableSchema) -> Result<TableSchema>;
    fn describe_table(&self, table_id: &str) -> Result<TableSchema>;
    fn has_table(&self, table_id: &str) -> Result<bool>;
    fn all_tables(&self) -> Result<Vec<TableSchema>>;
    /// Soft delete: the table flips to Deleted and every file goes to
    /// TO_DELETE.
    fn delete_table(&self, table_id: &str) -> Result<()>;
    fn drop_partitions_by_dates(&self, table_id: &str, dates: &[DateKey]) -> Result<()>;
    fn update_table_flag(&self, table_id: &str, flag: i64) -> Result<()>;

    /// Allocate a file id and location for a new file in state NEW (flush)
    /// or NEW_MERGE (merge output), engine parameters copied from the table.
    fn create_table_file(
        &self,
        table_id: &str,
        date: Option<DateKey>,
        state: FileState,
    ) -> Result<TableFile>;
    fn update_table_file(&self, file: &TableFile) -> Result<()>;
    /// Atomic over the whole batch: a failure leaves no file updated.
    fn update_table_files(&self, files: &[TableFile]) -> Result<()>;

    fn files_to_search(
        &self,
        table_id: &str,
        file_ids: &[u64],
        dates: &[DateKey],
    ) -> Result<DatePartitionedFiles>;
    fn files_to_merge(&self, table_id: &str) -> Result<DatePartitionedFiles>;
    fn files_to_index(&self) -> Result<Vec<TableFile>>;
    fn files_by_type(&self, table_id: &str, states: &[FileState]) -> Result<Vec<u64>>;
    fn table_file_locations(&self, table_id: &str) -> Result<Vec<String>>;

    fn update_table_files_to_index(&self, table_id: &str) -> Result<()>;
    fn update_table_index(&self, table_id: &str, index: &IndexDescriptor) -> Result<()>;
    fn describe_table_index(&self, table_id: &str) -> Result<IndexDescriptor>;
    fn drop_table_index(&self, table_id: &str) -> Result<()>;

    fn count(&self, table_id: &str) -> Result<u64>;
    fn size(&self) -> Result<u64>;

    /// Apply the retention policy (age- and disk-quota-based demotion to
    /// TO_DELETE).
    fn archive(&self) -> Result<()>;
    /// Physically remove TO_DELETE files older than `ttl_secs`, and purge
    /// deleted tables once they hold no files.
    fn cleanup_files_with_ttl(&self, ttl_secs: u64) -> Result<()>;
    /// Shutdown hook: drop uncommitted transient records and their partial
    /// files.
    fn cleanup(&self) -> Result<()>;
    fn drop_all(&self) -> Result<()>;
}

pub fn today() -> DateKey {
    date_key(Local::now().date_naive())
}

fn date_key(date: chrono::NaiveDate) -> DateKey {
    date.format("%Y%m%d")
        .to_string()
        .parse()
        .unwrap_or(1970_01_01)
}

fn date_key_days_ago(days: u64) -> DateKey {
    let date = Local::now().date_naive() - Duration::days(days as i64);
    date_key(date)
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct MetaSnapshot {
    tables: BTreeMap<String, TableSchema>,
    files: BTreeMap<u64, TableFile>,
    next_file_id: u64,
}

/// Embedded single-file backend.
pub struct JsonMeta {
    meta_path: PathBuf,
    tables_dir: PathBuf,
    archive_days: Option<u64>,
    archive_disk_threshold: Option<u64>,
    state: Mutex<MetaSnapshot>,
}

impl JsonMeta {
    pub fn open(options: &DbOptions) -> Result<Self> {
        std::fs::create_dir_all(&options.path)?;
        let tables_dir = options.tables_dir();
        std::fs::create_dir_all(&tables_dir)?;

        let meta_path = options.meta_path();
        let snapshot = if meta_path.exists() {
            let bytes = std::fs::read(&meta_path)?;
            serde_json::from_slice(&bytes)?
        } else {
            MetaSnapshot::default()
        };
        info!(
            tables = snapshot.tables.len(),
            files = snapshot.files.len(),
            "metadata store opened"
        );

        Ok(Self {
            meta_path,
            tables_dir,
            archive_days: options.archive_days,
            archive_disk_threshold: options.archive_disk_threshold,
            state: Mutex::new(snapshot),
        })
    }

    fn persist(&self, snapshot: &MetaSnapshot) -> Result<()> {
        let tmp = self.meta_path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&tmp, &bytes)?;
        let file = std::fs::File::open(&tmp)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.meta_path)?;
        crate::format::sync_parent(&self.meta_path)?;
        Ok(())
    }

    /// Run a mutation against a copy of the snapshot; the copy replaces the
    /// live state only after it has been persisted.
    fn mutate<T>(&self, f: impl FnOnce(&mut MetaSnapshot) -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&MetaSnapshot) -> Result<T>) -> Result<T> {
        let guard = self.state.lock();
        f(&guard)
    }

    fn apply_file_update(snapshot: &mut MetaSnapshot, file: &TableFile) -> Result<()> {
        let existing = snapshot
            .files
            .get(&file.file_id)
            .ok_or_else(|| DbError::Meta(format!("unknown file id {}", file.file_id)))?;
        if !existing.state.can_transition(file.state) {
            return Err(DbError::Meta(format!(
                "illegal file state transition {:?} -> {:?} for file {}",
                existing.state, file.state, file.file_id
            )));
        }
        let mut next = file.clone();
        next.updated_at = if existing.state == file.state {
            existing.updated_at
        } else {
            now_ts()
        };
        snapshot.files.insert(next.file_id, next);
        Ok(())
    }

    fn active_table<'a>(snapshot: &'a MetaSnapshot, table_id: &str) -> Result<&'a TableSchema> {
        match snapshot.tables.get(table_id) {
            Some(schema) if schema.state == TableState::Active => Ok(schema),
            _ => Err(DbError::TableNotFound(table_id.to_string())),
        }
    }

    fn remove_file_on_disk(location: &str) {
        let path = std::path::Path::new(location);
        if path.exists() {
            if let Err(err) = std::fs::remove_file(path) {
                warn!(location, %err, "failed to remove segment file");
            }
        }
    }
}

impl MetaStore for JsonMeta {
    fn create_table(&self, schema: TableSchema) -> Result<TableSchema> {
        self.mutate(|snapshot| {
            if let Some(existing) = snapshot.tables.get(&schema.table_id) {
                if existing.state == TableState::Active {
                    return Err(DbError::TableAlreadyExists(schema.table_id.clone()));
                }
                // A deleted table with pending files still owns its ids.
                let busy = snapshot
                    .files
                    .values()
                    .any(|f| f.table_id == schema.table_id);
                if busy {
                    return Err(DbError::TableAlreadyExists(schema.table_id.clone()));
                }
            }
            let mut schema = schema;
            schema.state = TableState::Active;
            schema.created_at = now_ts();
            snapshot
                .tables
                .insert(schema.table_id.clone(), schema.clone());
            Ok(schema)
        })
    }

    fn describe_table(&self, table_id: &str) -> Result<TableSchema> {
        self.read(|snapshot| Self::active_table(snapshot, table_id).cloned())
    }

    fn has_table(&self, table_id: &str) -> Result<bool> {
        self.read(|snapshot| {
            Ok(snapshot
                .tables
                .get(table_id)
                .map(|t| t.state == TableState::Active)
                .unwrap_or(false))
        })
    }

    fn all_tables(&self) -> Result<Vec<TableSchema>> {
        self.read(|snapshot| {
            Ok(snapshot
                .tables
                .values()
                .filter(|t| t.state == TableState::Active)
                .cloned()
                .collect())
        })
    }

    fn delete_table(&self, table_id: &str) -> Result<()> {
        self.mutate(|snapshot| {
            let schema = snapshot
                .tables
                .get_mut(table_id)
                .ok_or_else(|| DbError::TableNotFound(table_id.to_string()))?;
            if schema.state == TableState::Deleted {
                return Ok(()); // idempotent
            }
            schema.state = TableState::Deleted;
            let now = now_ts();
            for file in snapshot.files.values_mut() {
                if file.table_id == table_id && file.state != FileState::ToDelete {
                    file.state = FileState::ToDelete;
                    file.updated_at = now;
                }
            }
            Ok(())
        })
    }

    fn drop_partitions_by_dates(&self, table_id: &str, dates: &[DateKey]) -> Result<()> {
        let wanted: HashSet<DateKey> = dates.iter().copied().collect();
        self.mutate(|snapshot| {
            Self::active_table(snapshot, table_id)?;
            let now = now_ts();
            for file in snapshot.files.values_mut() {
                if file.table_id == table_id
                    && wanted.contains(&file.date)
                    && file.state != FileState::ToDelete
                {
                    file.state = FileState::ToDelete;
                    file.updated_at = now;
                }
            }
            Ok(())
        })
    }

    fn update_table_flag(&self, table_id: &str, flag: i64) -> Result<()> {
        self.mutate(|snapshot| {
            let schema = snapshot
                .tables
                .get_mut(table_id)
                .ok_or_else(|| DbError::TableNotFound(table_id.to_string()))?;
            schema.flag = flag;
            Ok(())
        })
    }

    fn create_table_file(
        &self,
        table_id: &str,
        date: Option<DateKey>,
        state: FileState,
    ) -> Result<TableFile> {
        if !matches!(state, FileState::New | FileState::NewMerge) {
            return Err(DbError::Meta(format!(
                "new files must start in NEW or NEW_MERGE, got {state:?}"
            )));
        }
        let table_dir = self.tables_dir.join(table_id);
        std::fs::create_dir_all(&table_dir)?;

        self.mutate(|snapshot| {
            let schema = Self::active_table(snapshot, table_id)?.clone();
            let file_id = snapshot.next_file_id;
            snapshot.next_file_id += 1;

            let mut salt = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut salt);
            let location = table_dir
                .join(format!("{:08}_{}.odb", file_id, hex_string(&salt)))
                .to_string_lossy()
                .into_owned();

            let now = now_ts();
            let file = TableFile {
                file_id,
                table_id: table_id.to_string(),
                date: date.unwrap_or_else(today),
                location,
                engine_type: schema.index.engine_type,
                metric: schema.metric,
                nlist: schema.index.nlist,
                dimension: schema.dimension,
                index_file_size: schema.index_file_size,
                file_size: 0,
                row_count: 0,
                state,
                created_at: now,
                updated_at: now,
            };
            snapshot.files.insert(file_id, file.clone());
            Ok(file)
        })
    }

    fn update_table_file(&self, file: &TableFile) -> Result<()> {
        self.mutate(|snapshot| Self::apply_file_update(snapshot, file))
    }

    fn update_table_files(&self, files: &[TableFile]) -> Result<()> {
        self.mutate(|snapshot| {
            for file in files {
                Self::apply_file_update(snapshot, file)?;
            }
            Ok(())
        })
    }

    fn files_to_search(
        &self,
        table_id: &str,
        file_ids: &[u64],
        dates: &[DateKey],
    ) -> Result<DatePartitionedFiles> {
        let id_filter: HashSet<u64> = file_ids.iter().copied().collect();
        let date_filter: HashSet<DateKey> = dates.iter().copied().collect();
        self.read(|snapshot| {
            Self::active_table(snapshot, table_id)?;
            let mut out = DatePartitionedFiles::new();
            for file in snapshot.files.values() {
                if file.table_id != table_id || !file.state.is_searchable() {
                    continue;
                }
                if !id_filter.is_empty() && !id_filter.contains(&file.file_id) {
                    continue;
                }
                if !date_filter.is_empty() && !date_filter.contains(&file.date) {
                    continue;
                }
                out.entry(file.date).or_default().push(file.clone());
            }
            Ok(out)
        })
    }

    fn files_to_merge(&self, table_id: &str) -> Result<DatePartitionedFiles> {
        self.read(|snapshot| {
            Self::active_table(snapshot, table_id)?;
            let mut out = DatePartitionedFiles::new();
            for file in snapshot.files.values() {
                // Transient records whose payload has not been committed yet
                // carry no rows and are skipped.
                if file.table_id == table_id && file.state.is_mergeable() && file.row_count > 0 {
                    out.entry(file.date).or_default().push(file.clone());
                }
            }
            Ok(out)
        })
    }

    fn files_to_index(&self) -> Result<Vec<TableFile>> {
        self.read(|snapshot| {
            Ok(snapshot
                .files
                .values()
                .filter(|f| f.state == FileState::ToIndex)
                .cloned()
                .collect())
        })
    }

    fn files_by_type(&self, table_id: &str, states: &[FileState]) -> Result<Vec<u64>> {
        let wanted: HashSet<FileState> = states.iter().copied().collect();
        self.read(|snapshot| {
            Ok(snapshot
                .files
                .values()
                .filter(|f| f.table_id == table_id && wanted.contains(&f.state))
                .map(|f| f.file_id)
                .collect())
        })
    }

    fn table_file_locations(&self, table_id: &str) -> Result<Vec<String>> {
        self.read(|snapshot| {
            Ok(snapshot
                .files
                .values()
                .filter(|f| f.table_id == table_id)
                .map(|f| f.location.clone())
                .collect())
        })
    }

    fn update_table_files_to_index(&self, table_id: &str) -> Result<()> {
        self.mutate(|snapshot| {
            let schema = Self::active_table(snapshot, table_id)?.clone();
            if schema.index.engine_type == EngineType::Flat {
                return Ok(());
            }
            let now = now_ts();
            for file in snapshot.files.values_mut() {
                if file.table_id == table_id && file.state == FileState::Raw {
                    file.state = FileState::ToIndex;
                    file.updated_at = now;
                }
            }
            Ok(())
        })
    }

    fn update_table_index(&self, table_id: &str, index: &IndexDescriptor) -> Result<()> {
        self.mutate(|snapshot| {
            let metric = Self::active_table(snapshot, table_id)?.metric;
            let mut next = *index;
            next.metric = metric; // fixed at table creation
            if let Some(schema) = snapshot.tables.get_mut(table_id) {
                schema.index = next;
            }
            // Files that have not been indexed yet pick up the new engine
            // parameters so the next build uses them.
            for file in snapshot.files.values_mut() {
                if file.table_id == table_id
                    && matches!(
                        file.state,
                        FileState::New | FileState::NewMerge | FileState::Raw | FileState::ToIndex
                    )
                {
                    file.engine_type = next.engine_type;
                    file.nlist = next.nlist;
                }
            }
            Ok(())
        })
    }

    fn describe_table_index(&self, table_id: &str) -> Result<IndexDescriptor> {
        self.read(|snapshot| Ok(Self::active_table(snapshot, table_id)?.index))
    }

    fn drop_table_index(&self, table_id: &str) -> Result<()> {
        self.mutate(|snapshot| {
            let metric = Self::active_table(snapshot, table_id)?.metric;
            let now = now_ts();
            for file in snapshot.files.values_mut() {
                if file.table_id != table_id {
                    continue;
                }
                match file.state {
                    // The segment format embeds the raw payload, so indexed
                    // files revert losslessly.
                    FileState::Index | FileState::ToIndex => {
                        file.state = FileState::Raw;
                        file.updated_at = now;
                    }
                    FileState::NewIndex => {
                        file.state = FileState::ToDelete;
                        file.updated_at = now;
                    }
                    _ => {}
                }
            }
            if let Some(schema) = snapshot.tables.get_mut(table_id) {
                schema.index = IndexDescriptor::flat(metric);
            }
            Ok(())
        })
    }

    fn count(&self, table_id: &str) -> Result<u64> {
        self.read(|snapshot| {
            Self::active_table(snapshot, table_id)?;
            Ok(snapshot
                .files
                .values()
                .filter(|f| f.table_id == table_id && f.state.is_searchable())
                .map(|f| f.row_count)
                .sum())
        })
    }

    fn size(&self) -> Result<u64> {
        self.read(|snapshot| {
            Ok(snapshot
                .files
                .values()
                .filter(|f| f.state != FileState::ToDelete)
                .map(|f| f.file_size)
                .sum())
        })
    }

    fn archive(&self) -> Result<()> {
        let days = self.archive_days;
        let disk = self.archive_disk_threshold;
        if days.is_none() && disk.is_none() {
            return Ok(());
        }
        self.mutate(|snapshot| {
            let now = now_ts();
            if let Some(days) = days {
                let cutoff = date_key_days_ago(days);
                for file in snapshot.files.values_mut() {
                    if file.state.is_searchable() && file.date < cutoff {
                        debug!(file_id = file.file_id, "archiving by age");
                        file.state = FileState::ToDelete;
                        file.updated_at = now;
                    }
                }
            }
            if let Some(threshold) = disk {
                let mut total: u64 = snapshot
                    .files
                    .values()
                    .filter(|f| f.state != FileState::ToDelete)
                    .map(|f| f.file_size)
                    .sum();
                let mut oldest: Vec<u64> = snapshot
                    .files
                    .values()
                    .filter(|f| f.state.is_searchable())
                    .map(|f| f.file_id)
                    .collect();
                oldest.sort_by_key(|id| snapshot.files[id].created_at);
                for id in oldest {
                    if total <= threshold {
                        break;
                    }
                    let Some(file) = snapshot.files.get_mut(&id) else {
                        continue;
                    };
                    debug!(file_id = id, "archiving by disk quota");
                    total = total.saturating_sub(file.file_size);
                    file.state = FileState::ToDelete;
                    file.updated_at = now;
                }
            }
            Ok(())
        })
    }

    fn cleanup_files_with_ttl(&self, ttl_secs: u64) -> Result<()> {
        self.mutate(|snapshot| {
            let now = now_ts();
            let expired: Vec<u64> = snapshot
                .files
                .values()
                .filter(|f| {
                    f.state == FileState::ToDelete && f.updated_at + ttl_secs as i64 <= now
                })
                .map(|f| f.file_id)
                .collect();
            for id in &expired {
                if let Some(file) = snapshot.files.remove(id) {
                    Self::remove_file_on_disk(&file.location);
                    debug!(file_id = file.file_id, location = %file.location, "file removed");
                }
            }

            // Deleted tables disappear once their last file is gone.
            let dead: Vec<String> = snapshot
                .tables
                .values()
                .filter(|t| t.state == TableState::Deleted)
                .filter(|t| !snapshot.files.values().any(|f| f.table_id == t.table_id))
                .map(|t| t.table_id.clone())
                .collect();
            for table_id in dead {
                snapshot.tables.remove(&table_id);
                let _ = std::fs::remove_dir(self.tables_dir.join(&table_id));
            }
            Ok(())
        })
    }

    fn cleanup(&self) -> Result<()> {
        self.mutate(|snapshot| {
            let transient: Vec<u64> = snapshot
                .files
                .values()
                .filter(|f| {
                    matches!(
                        f.state,
                        FileState::New | FileState::NewMerge | FileState::NewIndex
                    )
                })
                .map(|f| f.file_id)
                .collect();
            for id in transient {
                if let Some(file) = snapshot.files.remove(&id) {
                    Self::remove_file_on_disk(&file.location);
                }
            }
            Ok(())
        })
    }

    fn drop_all(&self) -> Result<()> {
        self.mutate(|snapshot| {
            for file in snapshot.files.values() {
                Self::remove_file_on_disk(&file.location);
            }
            snapshot.tables.clear();
            snapshot.files.clear();
            Ok(())
        })
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
