//! The database engine: public façade over the metadata store, insert
//! buffer, caches and scheduler, plus the background machinery that turns
//! buffered inserts into merged, indexed, queryable segment files.
//!
//! One timer thread ticks every second and drives three sub-tasks: metric
//! sampling, compaction and index building. Compaction and index building
//! are single-slot pipelines — one long-lived worker each, fed through a
//! bounded(1) channel; the timer's non-blocking send drops the tick when
//! the worker is still busy, so at most one task of each kind is ever in
//! flight and ticks coalesce.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::db::cache::CacheManager;
use crate::db::error::{DbError, Result};
use crate::db::membuffer::MemBuffer;
use crate::db::meta::{
    DateKey, FileState, IndexDescriptor, JsonMeta, MetaStore, TableFile, TableSchema,
};
use crate::db::metrics::Metrics;
use crate::db::options::{DbOptions, Mode, ONE_MB};
use crate::db::scheduler::{
    BuildIndexJob, DeleteJob, Job, ResMgr, Scheduler, SearchJob, SearchResult,
};
use crate::engine::{build_engine, EngineType};

const TIMER_PERIOD: Duration = Duration::from_secs(1);
const METRIC_ACTION_INTERVAL: u64 = 1;
const COMPACT_ACTION_INTERVAL: u64 = 1;
const INDEX_ACTION_INTERVAL: u64 = 1;

struct CompactWork {
    table_ids: HashSet<String>,
    done: Sender<()>,
}

struct IndexWork {
    done: Sender<()>,
}

struct CompactPipeline {
    /// Tables whose buffers were flushed since the last submitted round.
    pending: HashSet<String>,
    tx: Option<Sender<CompactWork>>,
    inflight: Option<Receiver<()>>,
}

struct IndexPipeline {
    tx: Option<Sender<IndexWork>>,
    inflight: Option<Receiver<()>>,
}

pub struct DbEngine {
    options: DbOptions,
    meta: Arc<dyn MetaStore>,
    mem: MemBuffer,
    cpu_cache: Arc<CacheManager>,
    gpu_cache: Arc<CacheManager>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<Metrics>,
    shutting_down: AtomicBool,
    /// Serializes CreateIndex against BackgroundBuildIndex.
    build_index_mutex: Mutex<()>,
    mem_serialize_mutex: Mutex<()>,
    /// Serializes compact_once against the compaction worker.
    merge_run_mutex: Mutex<()>,
    compact_pipeline: Mutex<CompactPipeline>,
    index_pipeline: Mutex<IndexPipeline>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DbEngine {
    /// Open the engine at `options.path` and start its background threads.
    /// In `CLUSTER_READONLY` mode the timer never starts.
    pub fn open(options: DbOptions) -> Result<Arc<Self>> {
        let meta: Arc<dyn MetaStore> = Arc::new(JsonMeta::open(&options)?);
        let cpu_cache = Arc::new(CacheManager::new("cpu", options.cpu_cache_capacity));
        let gpu_cache = Arc::new(CacheManager::new("gpu", options.gpu_cache_capacity));
        let res_mgr = Arc::new(ResMgr::new(options.compute_resources));
        let scheduler = Arc::new(Scheduler::new(
            res_mgr,
            meta.clone(),
            cpu_cache.clone(),
            gpu_cache.clone(),
        )?);
        let mem = MemBuffer::new(meta.clone(), cpu_cache.clone(), options.clone());

        let engine = Arc::new(Self {
            options,
            meta,
            mem,
            cpu_cache,
            gpu_cache,
            scheduler,
            metrics: Arc::new(Metrics::new()),
            shutting_down: AtomicBool::new(false),
            build_index_mutex: Mutex::new(()),
            mem_serialize_mutex: Mutex::new(()),
            merge_run_mutex: Mutex::new(()),
            compact_pipeline: Mutex::new(CompactPipeline {
                pending: HashSet::new(),
                tx: None,
                inflight: None,
            }),
            index_pipeline: Mutex::new(IndexPipeline {
                tx: None,
                inflight: None,
            }),
            threads: Mutex::new(Vec::new()),
        });
        engine.start();
        Ok(engine)
    }

    fn start(self: &Arc<Self>) {
        let mut threads = self.threads.lock();

        let (compact_tx, compact_rx) = bounded::<CompactWork>(1);
        self.compact_pipeline.lock().tx = Some(compact_tx);
        let worker = Arc::clone(self);
        if let Ok(handle) = std::thread::Builder::new()
            .name("ostinato-compaction".to_string())
            .spawn(move || {
                for work in compact_rx.iter() {
                    let _run = worker.merge_run_mutex.lock();
                    worker.background_compaction(work.table_ids);
                    drop(_run);
                    let _ = work.done.send(());
                }
            })
        {
            threads.push(handle);
        }

        let (index_tx, index_rx) = bounded::<IndexWork>(1);
        self.index_pipeline.lock().tx = Some(index_tx);
        let worker = Arc::clone(self);
        if let Ok(handle) = std::thread::Builder::new()
            .name("ostinato-index".to_string())
            .spawn(move || {
                for work in index_rx.iter() {
                    worker.background_build_index();
                    let _ = work.done.send(());
                }
            })
        {
            threads.push(handle);
        }

        // Read-only replicas never run the timer.
        if self.options.mode != Mode::ClusterReadonly {
            let timer = Arc::clone(self);
            if let Ok(handle) = std::thread::Builder::new()
                .name("ostinato-timer".to_string())
                .spawn(move || timer.background_timer_task())
            {
                threads.push(handle);
            }
        }
        info!(mode = ?self.options.mode, "engine started");
    }

    /// Flush remaining buffers, wait for in-flight background work, join
    /// every thread and release the metadata backend. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Make sure every acknowledged insert is durable.
        if let Err(err) = self.mem_serialize() {
            warn!(%err, "final flush failed during shutdown");
        }

        // Closing the channels lets the workers drain and exit; the timer
        // exits at its next tick after waiting for in-flight work.
        self.compact_pipeline.lock().tx = None;
        self.index_pipeline.lock().tx = None;

        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }

        if self.options.mode != Mode::ClusterReadonly {
            self.meta.cleanup()?;
        }
        info!("engine stopped");
        Ok(())
    }

    fn check_available(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(DbError::Shutdown)
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // public api
    // ------------------------------------------------------------------

    /// Create a table. `schema.index_file_size` is taken in megabytes.
    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.check_available()?;
        let mut schema = schema;
        schema.index_file_size *= ONE_MB; // store as bytes
        schema.index.metric = schema.metric;
        self.meta.create_table(schema)?;
        Ok(())
    }

    /// Describe a table. `index_file_size` is reported in megabytes.
    pub fn describe_table(&self, table_id: &str) -> Result<TableSchema> {
        self.check_available()?;
        let mut schema = self.meta.describe_table(table_id)?;
        schema.index_file_size /= ONE_MB;
        Ok(schema)
    }

    pub fn has_table(&self, table_id: &str) -> Result<bool> {
        self.check_available()?;
        self.meta.has_table(table_id)
    }

    pub fn all_tables(&self) -> Result<Vec<TableSchema>> {
        self.check_available()?;
        let mut tables = self.meta.all_tables()?;
        for schema in &mut tables {
            schema.index_file_size /= ONE_MB;
        }
        Ok(tables)
    }

    pub fn drop_all(&self) -> Result<()> {
        self.meta.drop_all()
    }

    /// Delete a table (empty `dates`) or only its given date partitions.
    /// A full delete drops the insert buffer, soft-deletes the table, then
    /// broadcasts a DeleteJob so every compute resource releases cached
    /// artifacts before the files are physically removed.
    pub fn delete_table(&self, table_id: &str, dates: &[DateKey]) -> Result<()> {
        self.check_available()?;
        debug!(table_id, "prepare to delete table");

        if dates.is_empty() {
            self.mem.erase(table_id); // no further inserts can land
            self.meta.delete_table(table_id)?;

            let nres = self.scheduler.res_mgr().num_compute_resources();
            let job = DeleteJob::new(table_id.to_string(), nres);
            self.scheduler.put(Job::Delete(job.clone()));
            job.wait_and_delete();
        } else {
            self.meta.drop_partitions_by_dates(table_id, dates)?;
        }
        Ok(())
    }

    pub fn table_row_count(&self, table_id: &str) -> Result<u64> {
        self.check_available()?;
        self.meta.count(table_id)
    }

    pub fn size(&self) -> Result<u64> {
        self.check_available()?;
        self.meta.size()
    }

    pub fn update_table_flag(&self, table_id: &str, flag: i64) -> Result<()> {
        self.check_available()?;
        self.meta.update_table_flag(table_id, flag)
    }

    /// Load every searchable file of a table into the CPU cache, refusing
    /// to admit more than the cache's free window.
    pub fn preload_table(&self, table_id: &str) -> Result<()> {
        self.check_available()?;
        let files = self.meta.files_to_search(table_id, &[], &[])?;

        let available = self
            .cpu_cache
            .capacity()
            .saturating_sub(self.cpu_cache.usage());
        let mut admitted: u64 = 0;

        for day_files in files.values() {
            for file in day_files {
                let mut engine = build_engine(
                    file.dimension as usize,
                    Path::new(&file.location),
                    file.engine_type,
                    file.metric,
                    file.nlist,
                    self.cpu_cache.clone(),
                )?;
                admitted += engine.physical_size();
                if admitted > available {
                    return Err(DbError::CacheFull);
                }
                engine.load(true).map_err(|err| {
                    DbError::Db(format!("pre-load table encountered failure: {err}"))
                })?;
            }
        }
        Ok(())
    }

    /// Buffer vectors for a table, returning their assigned ids.
    pub fn insert_vectors(&self, table_id: &str, vectors: &[f32]) -> Result<Vec<i64>> {
        self.check_available()?;
        let ids = self.mem.insert(table_id, vectors)?;
        self.metrics.record_inserts(ids.len() as u64);
        Ok(ids)
    }

    /// Change a table's index and wait until every eligible file has been
    /// converted. The metric is immutable and always inherited from the
    /// current descriptor.
    pub fn create_index(&self, table_id: &str, index: IndexDescriptor) -> Result<()> {
        {
            let _lock = self.build_index_mutex.lock();

            let old_index = self.meta.describe_table_index(table_id)?;
            let mut new_index = index;
            new_index.metric = old_index.metric;
            if old_index != new_index {
                self.drop_index(table_id)?;
                self.meta.update_table_index(table_id, &new_index)?;
            }
        }

        // Let the in-flight merge settle so it cannot recreate mergeable
        // files behind the conversion loop's back.
        self.wait_merge_file_finish();

        // FLAT only needs transient files to drain; everything else must
        // end up in INDEX.
        let file_states: Vec<FileState> = if index.engine_type == EngineType::Flat {
            vec![FileState::New, FileState::NewMerge]
        } else {
            vec![
                FileState::Raw,
                FileState::New,
                FileState::NewMerge,
                FileState::NewIndex,
                FileState::ToIndex,
            ]
        };

        let mut times: u32 = 1;
        loop {
            let file_ids = self.meta.files_by_type(table_id, &file_states)?;
            if file_ids.is_empty() {
                break;
            }
            debug!(table_id, round = times, "non-index files detected");
            if index.engine_type != EngineType::Flat {
                self.meta.update_table_files_to_index(table_id)?;
            }

            std::thread::sleep(Duration::from_millis(
                (times as u64 * 100).min(10_000),
            ));
            if let Some(ceiling) = self.options.index_poll_max_retries {
                if times >= ceiling {
                    return Err(DbError::Db(format!(
                        "index build for table {table_id} did not complete within {ceiling} polls"
                    )));
                }
            }
            times += 1;
        }
        Ok(())
    }

    pub fn describe_index(&self, table_id: &str) -> Result<IndexDescriptor> {
        self.meta.describe_table_index(table_id)
    }

    pub fn drop_index(&self, table_id: &str) -> Result<()> {
        debug!(table_id, "drop index");
        self.meta.drop_table_index(table_id)
    }

    /// Top-k query over the table's searchable files, optionally filtered
    /// by dates and/or explicit file ids.
    pub fn query(
        &self,
        table_id: &str,
        k: usize,
        nprobe: usize,
        vectors: &[f32],
        dates: &[DateKey],
        file_ids: &[u64],
    ) -> Result<SearchResult> {
        self.check_available()?;
        let schema = self.meta.describe_table(table_id)?;

        let files_by_date = self.meta.files_to_search(table_id, file_ids, dates)?;
        let files: Vec<TableFile> = files_by_date.into_values().flatten().collect();
        if !file_ids.is_empty() && files.is_empty() {
            return Err(DbError::InvalidFileId);
        }

        self.cpu_cache.print_info();
        let result = self.query_async(&schema, k, nprobe, vectors, files)?;
        self.cpu_cache.print_info();
        self.metrics.record_query();
        Ok(result)
    }

    fn query_async(
        &self,
        schema: &TableSchema,
        k: usize,
        nprobe: usize,
        vectors: &[f32],
        files: Vec<TableFile>,
    ) -> Result<SearchResult> {
        let dim = schema.dimension as usize;
        if dim == 0 || vectors.is_empty() || vectors.len() % dim != 0 {
            return Err(DbError::Db(format!(
                "query data length {} is not a positive multiple of dimension {dim}",
                vectors.len()
            )));
        }
        debug!(files = files.len(), "engine query begin");

        let job = SearchJob::new(k, nprobe, dim, schema.metric, vectors.to_vec(), files);
        self.scheduler.put(Job::Search(job.clone()));
        job.wait_result()
    }

    // ------------------------------------------------------------------
    // background machinery
    // ------------------------------------------------------------------

    fn background_timer_task(self: Arc<Self>) {
        let mut metric_clock: u64 = 0;
        let mut compact_clock: u64 = 0;
        let mut index_clock: u64 = 0;

        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                self.wait_merge_file_finish();
                self.wait_build_index_finish();
                debug!("background timer exit");
                break;
            }

            std::thread::sleep(TIMER_PERIOD);

            self.start_metric_task(&mut metric_clock);
            self.start_compaction_task(&mut compact_clock);
            self.start_build_index_task(&mut index_clock);
        }
    }

    fn start_metric_task(&self, clock: &mut u64) {
        *clock += 1;
        if *clock % METRIC_ACTION_INTERVAL != 0 {
            return;
        }

        self.metrics.keep_alive(METRIC_ACTION_INTERVAL);
        let pct = |cache: &CacheManager| {
            if cache.capacity() > 0 {
                cache.usage() * 100 / cache.capacity()
            } else {
                0
            }
        };
        self.metrics
            .set_cache_usage_percent(pct(&self.cpu_cache), pct(&self.gpu_cache));
        if let Ok(size) = self.meta.size() {
            self.metrics.set_data_file_size(size);
        }
        self.metrics.sample_system();
    }

    /// Serialize the insert buffer and record which tables became merge
    /// candidates.
    fn mem_serialize(&self) -> Result<()> {
        let _guard = self.mem_serialize_mutex.lock();
        let mut affected = HashSet::new();
        let result = self.mem.serialize(&mut affected);
        if !affected.is_empty() {
            self.compact_pipeline.lock().pending.extend(affected);
            debug!("insert buffer serialized");
        }
        result
    }

    fn start_compaction_task(&self, clock: &mut u64) {
        *clock += 1;
        if *clock % COMPACT_ACTION_INTERVAL != 0 {
            return;
        }

        if let Err(err) = self.mem_serialize() {
            warn!(%err, "serializing insert buffer failed");
        }

        let mut pipeline = self.compact_pipeline.lock();
        if let Some(inflight) = &pipeline.inflight {
            match inflight.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => pipeline.inflight = None,
                Err(TryRecvError::Empty) => {}
            }
        }
        if pipeline.inflight.is_some() {
            return;
        }
        let Some(tx) = pipeline.tx.clone() else {
            return;
        };

        // Swap-and-submit under the pipeline lock so a table id flushed
        // between submit and clear cannot be lost.
        let table_ids = std::mem::take(&mut pipeline.pending);
        let (done_tx, done_rx) = bounded(1);
        match tx.try_send(CompactWork {
            table_ids,
            done: done_tx,
        }) {
            Ok(()) => pipeline.inflight = Some(done_rx),
            Err(TrySendError::Full(work)) | Err(TrySendError::Disconnected(work)) => {
                pipeline.pending.extend(work.table_ids);
            }
        }
    }

    fn start_build_index_task(&self, clock: &mut u64) {
        *clock += 1;
        if *clock % INDEX_ACTION_INTERVAL != 0 {
            return;
        }

        let mut pipeline = self.index_pipeline.lock();
        if let Some(inflight) = &pipeline.inflight {
            match inflight.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => pipeline.inflight = None,
                Err(TryRecvError::Empty) => {}
            }
        }
        if pipeline.inflight.is_some() {
            return;
        }
        let Some(tx) = pipeline.tx.clone() else {
            return;
        };

        let (done_tx, done_rx) = bounded(1);
        if tx.try_send(IndexWork { done: done_tx }).is_ok() {
            pipeline.inflight = Some(done_rx);
        }
    }

    /// Block until the in-flight compaction (if any) settles.
    pub fn wait_merge_file_finish(&self) {
        let inflight = self.compact_pipeline.lock().inflight.clone();
        if let Some(rx) = inflight {
            let _ = rx.recv();
        }
    }

    /// Block until the in-flight index build (if any) settles.
    pub fn wait_build_index_finish(&self) {
        let inflight = self.index_pipeline.lock().inflight.clone();
        if let Some(rx) = inflight {
            let _ = rx.recv();
        }
    }

    fn background_compaction(&self, table_ids: HashSet<String>) {
        for table_id in table_ids {
            if let Err(err) = self.background_merge_files(&table_id) {
                error!(table_id = %table_id, %err, "merge files failed");
            }
            if self.shutting_down.load(Ordering::Acquire) {
                debug!("engine will shutdown, skip merge action");
                break;
            }
        }

        if let Err(err) = self.meta.archive() {
            warn!(%err, "archive failed");
        }
        let ttl = self.options.delete_ttl_secs();
        if let Err(err) = self.meta.cleanup_files_with_ttl(ttl) {
            warn!(%err, "ttl cleanup failed");
        }
    }

    fn background_merge_files(&self, table_id: &str) -> Result<()> {
        let grouped = self.meta.files_to_merge(table_id)?;
        for (date, files) in grouped {
            if files.len() < self.options.merge_trigger_number {
                debug!(
                    table_id,
                    date,
                    files = files.len(),
                    "below merge trigger, skipping"
                );
                continue;
            }
            self.merge_files(table_id, date, &files)?;

            if self.shutting_down.load(Ordering::Acquire) {
                debug!(table_id, "engine will shutdown, skip merge action");
                break;
            }
        }
        Ok(())
    }

    /// Merge one date partition's files into a new segment. Sources move to
    /// TO_DELETE only in the same atomic batch that commits the merged
    /// file, after its serialization succeeded; a serialize failure marks
    /// only the new file TO_DELETE so a retry can reprocess the sources.
    fn merge_files(&self, table_id: &str, date: DateKey, files: &[TableFile]) -> Result<()> {
        debug!(table_id, date, sources = files.len(), "merging files");

        let mut new_file = self
            .meta
            .create_table_file(table_id, Some(date), FileState::NewMerge)?;
        let mut engine = build_engine(
            new_file.dimension as usize,
            Path::new(&new_file.location),
            new_file.engine_type,
            new_file.metric,
            new_file.nlist,
            self.cpu_cache.clone(),
        )?;

        let result = (|| -> Result<Vec<TableFile>> {
            let mut updated = Vec::with_capacity(files.len() + 1);
            for file in files {
                engine.merge(Path::new(&file.location))?;
                let mut source = file.clone();
                source.state = FileState::ToDelete;
                updated.push(source);
                debug!(file_id = file.file_id, "merged source file");

                if engine.size() >= new_file.index_file_size {
                    break;
                }
            }
            engine.serialize()?;
            Ok(updated)
        })();

        let mut updated = match result {
            Ok(updated) => updated,
            Err(err) => {
                // Typical failure: out of disk space. Sources are left
                // untouched for a later retry.
                error!(table_id, %err, "serializing merged segment failed");
                new_file.state = FileState::ToDelete;
                let _ = self.meta.update_table_file(&new_file);
                return Err(err);
            }
        };

        new_file.state = if new_file.engine_type == EngineType::Flat
            || engine.physical_size() < new_file.index_file_size
        {
            FileState::Raw
        } else {
            FileState::ToIndex
        };
        new_file.file_size = engine.physical_size();
        new_file.row_count = engine.count();
        updated.push(new_file.clone());
        self.meta.update_table_files(&updated)?;
        debug!(
            file_id = new_file.file_id,
            bytes = new_file.file_size,
            rows = new_file.row_count,
            "new merged file committed"
        );
        self.metrics.record_merge();

        if self.options.insert_cache_immediately {
            if let Err(err) = engine.cache() {
                warn!(%err, "caching merged segment failed");
            }
        }
        Ok(())
    }

    fn background_build_index(&self) {
        let _lock = self.build_index_mutex.lock();

        let to_index = match self.meta.files_to_index() {
            Ok(files) => files,
            Err(err) => {
                warn!(%err, "listing files to index failed");
                return;
            }
        };
        if to_index.is_empty() {
            return;
        }

        let job = BuildIndexJob::new(to_index);
        self.scheduler.put(Job::BuildIndex(job.clone()));
        match job.wait_build_index_finish() {
            Ok(()) => self.metrics.record_index_build(),
            // Failed files stay in TO_INDEX; the next round retries them.
            Err(err) => error!(%err, "building index failed"),
        }
    }

    // ------------------------------------------------------------------
    // deterministic one-shot entry points (CLI and tests)
    // ------------------------------------------------------------------

    /// Flush the insert buffer now.
    pub fn flush_once(&self) -> Result<()> {
        self.mem_serialize()
    }

    /// Run one compaction round synchronously over every pending table.
    pub fn compact_once(&self) -> Result<()> {
        let table_ids = std::mem::take(&mut self.compact_pipeline.lock().pending);
        let _run = self.merge_run_mutex.lock();
        self.background_compaction(table_ids);
        Ok(())
    }

    /// Run one index-build round synchronously.
    pub fn build_index_once(&self) -> Result<()> {
        self.background_build_index();
        Ok(())
    }

    pub fn metrics_text(&self) -> String {
        self.metrics.render()
    }

    pub fn cache_capacity(&self) -> u64 {
        self.cpu_cache.capacity()
    }

    pub fn cache_usage(&self) -> u64 {
        self.cpu_cache.usage()
    }
}
