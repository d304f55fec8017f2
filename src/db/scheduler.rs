//! Job scheduler: search, index-build and delete jobs dispatched over a
//! fixed pool of compute resources.
//!
//! Every job exposes a blocking wait and a status. Search fans out one task
//! per file, loads artifacts through the CPU cache, and merges per-query
//! top-K in metric order. Delete broadcasts to every compute resource so
//! each can release cached state before files are physically removed, with
//! a join barrier. Index builds run per file; one file failing does not
//! abort the rest.

use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use tracing::{debug, error, warn};

use crate::db::cache::CacheManager;
use crate::db::error::{DbError, Result};
use crate::db::meta::{FileState, MetaStore, TableFile};
use crate::engine::{build_engine, merge_top_k, EngineType, MetricKind};

/// Registry of compute resources the scheduler can fan out over.
pub struct ResMgr {
    compute_resources: usize,
}

impl ResMgr {
    pub fn new(compute_resources: usize) -> Self {
        Self {
            compute_resources: compute_resources.max(1),
        }
    }

    pub fn num_compute_resources(&self) -> usize {
        self.compute_resources
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    /// `k * nq` ids, -1 padded.
    pub ids: Vec<i64>,
    pub distances: Vec<f32>,
}

struct SearchSlot {
    done: bool,
    failed: bool,
    result: Option<Result<SearchResult>>,
}

pub struct SearchJob {
    pub k: usize,
    pub nq: usize,
    pub nprobe: usize,
    pub dim: usize,
    pub metric: MetricKind,
    vectors: Vec<f32>,
    files: Vec<TableFile>,
    slot: Mutex<SearchSlot>,
    cond: Condvar,
}

impl SearchJob {
    pub fn new(
        k: usize,
        nprobe: usize,
        dim: usize,
        metric: MetricKind,
        vectors: Vec<f32>,
        files: Vec<TableFile>,
    ) -> Arc<Self> {
        let nq = if dim > 0 { vectors.len() / dim } else { 0 };
        Arc::new(Self {
            k,
            nq,
            nprobe,
            dim,
            metric,
            vectors,
            files,
            slot: Mutex::new(SearchSlot {
                done: false,
                failed: false,
                result: None,
            }),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, result: Result<SearchResult>) {
        let mut slot = self.slot.lock();
        slot.failed = result.is_err();
        slot.result = Some(result);
        slot.done = true;
        self.cond.notify_all();
    }

    /// Block until the job settles, surfacing its result.
    pub fn wait_result(&self) -> Result<SearchResult> {
        let mut slot = self.slot.lock();
        while !slot.done {
            self.cond.wait(&mut slot);
        }
        slot.result
            .take()
            .unwrap_or_else(|| Err(DbError::Db("search result already consumed".into())))
    }

    pub fn status(&self) -> JobStatus {
        let slot = self.slot.lock();
        if !slot.done {
            JobStatus::Running
        } else if slot.failed {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        }
    }
}

struct FinishSlot {
    done: bool,
    error: Option<String>,
}

pub struct BuildIndexJob {
    files: Vec<TableFile>,
    slot: Mutex<FinishSlot>,
    cond: Condvar,
}

impl BuildIndexJob {
    pub fn new(files: Vec<TableFile>) -> Arc<Self> {
        Arc::new(Self {
            files,
            slot: Mutex::new(FinishSlot {
                done: false,
                error: None,
            }),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, error: Option<String>) {
        let mut slot = self.slot.lock();
        slot.error = error;
        slot.done = true;
        self.cond.notify_all();
    }

    /// Block until every file was attempted. Per-file failures are recorded
    /// but do not fail the job.
    pub fn wait_build_index_finish(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        while !slot.done {
            self.cond.wait(&mut slot);
        }
        match &slot.error {
            Some(msg) => Err(DbError::Db(msg.clone())),
            None => Ok(()),
        }
    }

    pub fn status(&self) -> JobStatus {
        let slot = self.slot.lock();
        if !slot.done {
            JobStatus::Running
        } else if slot.error.is_some() {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        }
    }
}

pub struct DeleteJob {
    pub table_id: String,
    num_resources: usize,
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl DeleteJob {
    pub fn new(table_id: String, num_resources: usize) -> Arc<Self> {
        let n = num_resources.max(1);
        Arc::new(Self {
            table_id,
            num_resources: n,
            remaining: Mutex::new(n),
            cond: Condvar::new(),
        })
    }

    fn resource_done(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    /// Join barrier: returns once every compute resource has released its
    /// cached state for the table.
    pub fn wait_and_delete(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.cond.wait(&mut remaining);
        }
    }

    pub fn status(&self) -> JobStatus {
        if *self.remaining.lock() == 0 {
            JobStatus::Succeeded
        } else {
            JobStatus::Running
        }
    }
}

pub enum Job {
    Search(Arc<SearchJob>),
    BuildIndex(Arc<BuildIndexJob>),
    Delete(Arc<DeleteJob>),
}

pub struct Scheduler {
    pool: rayon::ThreadPool,
    res_mgr: Arc<ResMgr>,
    meta: Arc<dyn MetaStore>,
    cpu_cache: Arc<CacheManager>,
    gpu_cache: Arc<CacheManager>,
}

impl Scheduler {
    pub fn new(
        res_mgr: Arc<ResMgr>,
        meta: Arc<dyn MetaStore>,
        cpu_cache: Arc<CacheManager>,
        gpu_cache: Arc<CacheManager>,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(res_mgr.num_compute_resources())
            .thread_name(|idx| format!("ostinato-compute-{idx}"))
            .build()
            .map_err(|err| DbError::Db(format!("building compute pool: {err}")))?;
        Ok(Self {
            pool,
            res_mgr,
            meta,
            cpu_cache,
            gpu_cache,
        })
    }

    pub fn res_mgr(&self) -> &Arc<ResMgr> {
        &self.res_mgr
    }

    /// Submit a job. Returns immediately; callers use the job's wait.
    pub fn put(&self, job: Job) {
        match job {
            Job::Search(job) => {
                let cache = self.cpu_cache.clone();
                self.pool
                    .spawn(move || job.complete(execute_search(&job, &cache)));
            }
            Job::BuildIndex(job) => {
                let meta = self.meta.clone();
                let cache = self.cpu_cache.clone();
                self.pool
                    .spawn(move || execute_build_index(&job, &meta, &cache));
            }
            Job::Delete(job) => {
                let meta = self.meta.clone();
                let cpu = self.cpu_cache.clone();
                let gpu = self.gpu_cache.clone();
                let n = job.num_resources;
                self.pool.spawn(move || {
                    let locations = match meta.table_file_locations(&job.table_id) {
                        Ok(locations) => locations,
                        Err(err) => {
                            warn!(table_id = %job.table_id, %err, "delete job: listing files");
                            Vec::new()
                        }
                    };
                    // Broadcast: one task per compute resource, then join.
                    (0..n).into_par_iter().for_each(|resource| {
                        for location in &locations {
                            cpu.erase(location);
                            gpu.erase(location);
                        }
                        debug!(
                            table_id = %job.table_id,
                            resource, "compute resource released table artifacts"
                        );
                        job.resource_done();
                    });
                });
            }
        }
    }
}

fn execute_search(job: &SearchJob, cache: &Arc<CacheManager>) -> Result<SearchResult> {
    if job.files.is_empty() || job.nq == 0 {
        return Ok(SearchResult::default());
    }

    let partials: Result<Vec<(Vec<i64>, Vec<f32>)>> = job
        .files
        .par_iter()
        .map(|file| {
            let mut engine = build_engine(
                file.dimension as usize,
                Path::new(&file.location),
                file.engine_type,
                file.metric,
                file.nlist,
                cache.clone(),
            )?;
            engine.load(true)?;
            engine.search(&job.vectors, job.k, job.nprobe)
        })
        .collect();

    let (ids, distances) = merge_top_k(&partials?, job.nq, job.k, job.metric);
    Ok(SearchResult { ids, distances })
}

fn execute_build_index(job: &BuildIndexJob, meta: &Arc<dyn MetaStore>, cache: &Arc<CacheManager>) {
    let failures: Vec<String> = job
        .files
        .par_iter()
        .filter_map(|file| {
            build_file_index(file, meta, cache)
                .err()
                .map(|err| format!("file {}: {err}", file.file_id))
        })
        .collect();

    for failure in &failures {
        // The file stays TO_INDEX; the next pass retries it.
        error!(%failure, "index build failed");
    }
    job.complete(if failures.is_empty() {
        None
    } else {
        Some(failures.join("; "))
    });
}

fn build_file_index(
    file: &TableFile,
    meta: &Arc<dyn MetaStore>,
    cache: &Arc<CacheManager>,
) -> Result<()> {
    if file.engine_type == EngineType::Flat {
        // FLAT never enters TO_INDEX; tolerate a stray record by
        // committing it back to RAW.
        let mut f = file.clone();
        f.state = FileState::Raw;
        return meta.update_table_file(&f);
    }

    let location = Path::new(&file.location);
    let mut engine = build_engine(
        file.dimension as usize,
        location,
        file.engine_type,
        file.metric,
        file.nlist,
        cache.clone(),
    )?;
    engine.load(false)?;
    engine.build_index()?;
    engine.serialize()?;

    // The artifact at this location changed under the cache's feet.
    cache.erase(&file.location);

    let mut f = file.clone();
    f.state = FileState::NewIndex;
    meta.update_table_file(&f)?;
    f.state = FileState::Index;
    f.file_size = engine.physical_size();
    f.row_count = engine.count();
    meta.update_table_file(&f)?;
    debug!(
        file_id = file.file_id,
        bytes = f.file_size,
        "index built and committed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::meta::{IndexDescriptor, JsonMeta, TableSchema, TableState};
    use crate::db::options::DbOptions;
    use crate::format;
    use tempfile::tempdir;

    fn scheduler_with_meta(dir: &std::path::Path) -> (Scheduler, Arc<JsonMeta>) {
        let options = DbOptions::from_data_dir(dir);
        let meta = Arc::new(JsonMeta::open(&options).unwrap());
        let scheduler = Scheduler::new(
            Arc::new(ResMgr::new(2)),
            meta.clone(),
            Arc::new(CacheManager::new("cpu", 64 << 20)),
            Arc::new(CacheManager::new("gpu", 64 << 20)),
        )
        .unwrap();
        (scheduler, meta)
    }

    fn ivf_table(meta: &JsonMeta, table_id: &str, dim: u32, nlist: u32) {
        meta.create_table(TableSchema {
            table_id: table_id.into(),
            dimension: dim,
            index_file_size: 1 << 20,
            metric: MetricKind::L2,
            index: IndexDescriptor {
                engine_type: EngineType::IvfFlat,
                metric: MetricKind::L2,
                nlist,
            },
            state: TableState::Active,
            flag: 0,
            created_at: 0,
        })
        .unwrap();
    }

    fn committed_raw_file(meta: &JsonMeta, table_id: &str, ids: &[i64], dim: usize) -> TableFile {
        let mut file = meta
            .create_table_file(table_id, None, FileState::New)
            .unwrap();
        let vectors: Vec<f32> = ids
            .iter()
            .flat_map(|&id| (0..dim).map(move |d| id as f32 + d as f32 * 0.01))
            .collect();
        let size =
            format::write_segment(Path::new(&file.location), dim, ids, &vectors, None).unwrap();
        file.state = FileState::Raw;
        file.file_size = size;
        file.row_count = ids.len() as u64;
        meta.update_table_file(&file).unwrap();
        file
    }

    #[test]
    fn search_job_merges_across_files() {
        let dir = tempdir().unwrap();
        let (scheduler, meta) = scheduler_with_meta(dir.path());
        ivf_table(&meta, "t", 2, 4);
        let a = committed_raw_file(&meta, "t", &[1, 2], 2);
        let b = committed_raw_file(&meta, "t", &[30, 40], 2);

        // Nearest overall row to (30.0, 30.01) lives in file b.
        let job = SearchJob::new(
            2,
            1,
            2,
            MetricKind::L2,
            vec![30.0, 30.01],
            vec![a, b],
        );
        scheduler.put(Job::Search(job.clone()));
        let result = job.wait_result().unwrap();
        assert_eq!(result.ids[0], 30);
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(result.ids.len(), 2);
    }

    #[test]
    fn search_job_with_no_files_is_empty() {
        let dir = tempdir().unwrap();
        let (scheduler, _meta) = scheduler_with_meta(dir.path());
        let job = SearchJob::new(3, 1, 2, MetricKind::L2, vec![0.0, 0.0], Vec::new());
        scheduler.put(Job::Search(job.clone()));
        let result = job.wait_result().unwrap();
        assert!(result.ids.is_empty());
    }

    #[test]
    fn build_index_job_commits_index_state() {
        let dir = tempdir().unwrap();
        let (scheduler, meta) = scheduler_with_meta(dir.path());
        ivf_table(&meta, "t", 2, 2);
        let mut file = committed_raw_file(&meta, "t", &[1, 2, 3, 4], 2);
        file.state = FileState::ToIndex;
        meta.update_table_file(&file).unwrap();

        let job = BuildIndexJob::new(vec![file.clone()]);
        scheduler.put(Job::BuildIndex(job.clone()));
        job.wait_build_index_finish().unwrap();

        let indexed = meta.files_by_type("t", &[FileState::Index]).unwrap();
        assert_eq!(indexed, vec![file.file_id]);
        let seg = format::read_segment(Path::new(&file.location)).unwrap();
        assert!(seg.ivf.is_some());
    }

    #[test]
    fn delete_job_erases_cached_artifacts_on_every_resource() {
        let dir = tempdir().unwrap();
        let options = DbOptions::from_data_dir(dir.path());
        let meta = Arc::new(JsonMeta::open(&options).unwrap());
        let cpu = Arc::new(CacheManager::new("cpu", 64 << 20));
        let gpu = Arc::new(CacheManager::new("gpu", 64 << 20));
        let scheduler = Scheduler::new(
            Arc::new(ResMgr::new(3)),
            meta.clone(),
            cpu.clone(),
            gpu.clone(),
        )
        .unwrap();

        ivf_table(&meta, "t", 2, 2);
        let file = committed_raw_file(&meta, "t", &[9, 10], 2);

        // Warm the cache the way a query would.
        let mut engine = build_engine(
            2,
            Path::new(&file.location),
            file.engine_type,
            file.metric,
            file.nlist,
            cpu.clone(),
        )
        .unwrap();
        engine.load(true).unwrap();
        assert_eq!(cpu.len(), 1);

        let job = DeleteJob::new("t".into(), 3);
        scheduler.put(Job::Delete(job.clone()));
        job.wait_and_delete();
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(cpu.len(), 0);
    }
}
