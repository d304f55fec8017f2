//! Engine configuration.

use std::path::PathBuf;

/// `index_file_size` is accepted and reported in megabytes but stored in
/// bytes; this is the multiplier.
pub const ONE_MB: u64 = 1 << 20;

/// Operating mode of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Single,
    ClusterWritable,
    /// Read-only replica: no background timer, no metadata cleanup at stop.
    ClusterReadonly,
}

#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Data directory. The metadata store and all segment files live below it.
    pub path: PathBuf,
    pub mode: Mode,
    /// Minimum number of mergeable files per (table, date) before a merge
    /// is triggered.
    pub merge_trigger_number: usize,
    /// Pin freshly merged artifacts into the CPU cache.
    pub insert_cache_immediately: bool,
    pub cpu_cache_capacity: u64,
    pub gpu_cache_capacity: u64,
    /// Compute resources the scheduler fans out over.
    pub compute_resources: usize,
    /// Optional ceiling on CreateIndex's completion polling; `None` polls
    /// until the index build converges.
    pub index_poll_max_retries: Option<u32>,
    /// Archive files whose partition date is older than this many days.
    pub archive_days: Option<u64>,
    /// Archive oldest files once total data size exceeds this many bytes.
    pub archive_disk_threshold: Option<u64>,
}

impl DbOptions {
    pub fn from_data_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: Mode::Single,
            merge_trigger_number: 2,
            insert_cache_immediately: false,
            cpu_cache_capacity: 4 * 1024 * ONE_MB,
            gpu_cache_capacity: 1024 * ONE_MB,
            compute_resources: std::thread::available_parallelism()
                .map(|v| v.get())
                .unwrap_or(2)
                .clamp(1, 4),
            index_poll_max_retries: None,
            archive_days: None,
            archive_disk_threshold: None,
        }
    }

    /// Location of the embedded metadata store.
    pub fn meta_path(&self) -> PathBuf {
        self.path.join("meta.json")
    }

    /// Root directory for per-table segment files.
    pub fn tables_dir(&self) -> PathBuf {
        self.path.join("tables")
    }

    /// TTL applied to `TO_DELETE` files by the compaction loop.
    pub fn delete_ttl_secs(&self) -> u64 {
        match self.mode {
            Mode::ClusterWritable => 24 * 3600,
            _ => 5 * 60,
        }
    }
}
