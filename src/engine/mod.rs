//! Execution engines: the per-file objects the database dispatches work to.
//!
//! An engine wraps one segment file at a fixed location. The same object is
//! used on every path that touches vector data: merging source files into a
//! new segment, serializing it, building a coarse index over it, and
//! answering top-K searches. Loading goes through the [`CacheManager`] so
//! resident artifacts are bounded by the configured capacity.

mod flat;
mod ivf;

pub use flat::FlatEngine;
pub use ivf::IvfFlatEngine;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::db::cache::CacheManager;
use crate::db::error::{DbError, Result};
use crate::format::{self, IvfSection, SegmentFile};
use crate::simd;

/// Engine variant. FLAT segments are exact brute-force scans and never get
/// promoted to `TO_INDEX`; IVF_FLAT segments gain a coarse quantizer once
/// they are large enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineType {
    Flat,
    IvfFlat,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Flat => "FLAT",
            EngineType::IvfFlat => "IVF_FLAT",
        }
    }
}

impl std::str::FromStr for EngineType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FLAT" => Ok(EngineType::Flat),
            "IVF_FLAT" | "IVF" => Ok(EngineType::IvfFlat),
            other => Err(DbError::InvalidEngineType(other.to_string())),
        }
    }
}

/// Distance function shared by a table's segments. Fixed at table creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    L2,
    InnerProduct,
}

impl MetricKind {
    /// Whether a larger reported distance means a better match.
    pub fn larger_is_better(&self) -> bool {
        matches!(self, MetricKind::InnerProduct)
    }

    /// Distance between two vectors under this metric. L2 distances are
    /// squared.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            MetricKind::L2 => simd::l2_distance_squared(a, b),
            MetricKind::InnerProduct => simd::dot_product(a, b),
        }
    }

    /// Sentinel distance used to pad result rows with fewer than k hits.
    pub fn worst_distance(&self) -> f32 {
        if self.larger_is_better() {
            f32::MIN
        } else {
            f32::MAX
        }
    }
}

/// Coarse IVF index kept alongside the raw rows of a segment.
#[derive(Debug, Clone)]
pub struct IvfData {
    pub nlist: usize,
    /// `nlist * dim` row-major centroid table.
    pub centroids: Vec<f32>,
    /// Row offsets per coarse list.
    pub lists: Vec<Vec<u32>>,
}

impl IvfData {
    fn from_section(section: &IvfSection, rows: usize) -> Self {
        let nlist = section.nlist as usize;
        if nlist == 0 {
            return Self {
                nlist: 0,
                centroids: Vec::new(),
                lists: Vec::new(),
            };
        }
        let mut lists = vec![Vec::new(); nlist];
        for (row, &list) in section.assignments.iter().take(rows).enumerate() {
            let list = (list as usize).min(nlist.saturating_sub(1));
            lists[list].push(row as u32);
        }
        Self {
            nlist,
            centroids: section.centroids.clone(),
            lists,
        }
    }

    fn to_section(&self, rows: usize) -> IvfSection {
        let mut assignments = vec![0u32; rows];
        for (list, members) in self.lists.iter().enumerate() {
            for &row in members {
                if (row as usize) < rows {
                    assignments[row as usize] = list as u32;
                }
            }
        }
        IvfSection {
            centroids: self.centroids.clone(),
            assignments,
            nlist: self.nlist as u32,
        }
    }
}

/// A fully decoded segment: the artifact the cache holds.
#[derive(Debug)]
pub struct SegmentData {
    pub ids: Vec<i64>,
    /// `rows * dim` row-major vector data.
    pub vectors: Vec<f32>,
    pub dim: usize,
    pub ivf: Option<IvfData>,
    /// On-disk size of the backing file when it was read.
    pub physical_size: u64,
}

impl SegmentData {
    fn from_file(file: SegmentFile, physical_size: u64) -> Self {
        let rows = file.ids.len();
        let ivf = file.ivf.as_ref().map(|s| IvfData::from_section(s, rows));
        Self {
            ids: file.ids,
            vectors: file.vectors,
            dim: file.header.dim as usize,
            ivf,
            physical_size,
        }
    }

    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dim..(i + 1) * self.dim]
    }

    pub fn row_count(&self) -> usize {
        self.ids.len()
    }

    /// Approximate resident size, used for cache accounting.
    pub fn mem_size(&self) -> u64 {
        let index_bytes = self
            .ivf
            .as_ref()
            .map(|ivf| (ivf.centroids.len() * 4 + self.ids.len() * 4) as u64)
            .unwrap_or(0);
        (self.ids.len() * 8 + self.vectors.len() * 4) as u64 + index_bytes
    }
}

/// Per-file execution contract (spec'd operations plus `build_index`, which
/// the index pipeline drives; FLAT treats it as a no-op).
pub trait ExecutionEngine: Send {
    /// Read the segment at `location` into memory; insert the artifact into
    /// the cache iff `to_cache`.
    fn load(&mut self, to_cache: bool) -> Result<()>;

    /// Append every row of another segment file into this engine's builder.
    fn merge(&mut self, other_location: &Path) -> Result<()>;

    /// Construct the variant's index over the in-memory rows.
    fn build_index(&mut self) -> Result<()>;

    /// Write the in-memory state to `location` (temp file + rename).
    fn serialize(&mut self) -> Result<()>;

    /// Top-k search over `nq = vectors.len() / dim` queries. Returns
    /// `k * nq` ids and distances; rows with fewer than k hits are padded
    /// with id -1 and the metric's worst distance.
    fn search(&self, vectors: &[f32], k: usize, nprobe: usize) -> Result<(Vec<i64>, Vec<f32>)>;

    /// In-memory byte estimate of the current rows.
    fn size(&self) -> u64;

    /// On-disk byte size of the segment file.
    fn physical_size(&self) -> u64;

    /// Row count.
    fn count(&self) -> u64;

    /// Pin the loaded artifact into the cache.
    fn cache(&mut self) -> Result<()>;
}

/// Build an engine for one segment file.
pub fn build_engine(
    dim: usize,
    location: &Path,
    engine_type: EngineType,
    metric: MetricKind,
    nlist: u32,
    cache: Arc<CacheManager>,
) -> Result<Box<dyn ExecutionEngine>> {
    if dim == 0 {
        return Err(DbError::Db("vector dimension must be non-zero".into()));
    }
    let core = SegmentCore::new(dim, location, metric, cache);
    match engine_type {
        EngineType::Flat => Ok(Box::new(FlatEngine::new(core))),
        EngineType::IvfFlat => Ok(Box::new(IvfFlatEngine::new(core, nlist))),
    }
}

/// State shared by every engine variant: the location, the loaded artifact,
/// and the append builder merges write into.
pub(crate) struct SegmentCore {
    pub(crate) dim: usize,
    pub(crate) location: PathBuf,
    pub(crate) metric: MetricKind,
    cache: Arc<CacheManager>,
    pub(crate) data: Option<Arc<SegmentData>>,
    append_ids: Vec<i64>,
    append_vectors: Vec<f32>,
}

impl SegmentCore {
    fn new(dim: usize, location: &Path, metric: MetricKind, cache: Arc<CacheManager>) -> Self {
        Self {
            dim,
            location: location.to_path_buf(),
            metric,
            cache,
            data: None,
            append_ids: Vec::new(),
            append_vectors: Vec::new(),
        }
    }

    fn cache_key(&self) -> String {
        self.location.to_string_lossy().into_owned()
    }

    pub(crate) fn load(&mut self, to_cache: bool) -> Result<()> {
        if self.data.is_some() {
            return Ok(());
        }
        if let Some(hit) = self.cache.lookup(&self.cache_key()) {
            self.data = Some(hit);
            return Ok(());
        }

        let physical_size = std::fs::metadata(&self.location)?.len();
        let file = format::read_segment(&self.location)?;
        if file.header.dim as usize != self.dim {
            return Err(DbError::Db(format!(
                "segment {} has dimension {}, table expects {}",
                self.location.display(),
                file.header.dim,
                self.dim
            )));
        }
        let data = Arc::new(SegmentData::from_file(file, physical_size));
        if to_cache {
            self.cache.insert(self.cache_key(), data.clone());
        }
        self.data = Some(data);
        Ok(())
    }

    /// Append rows for the builder, either from a loaded artifact or raw.
    pub(crate) fn merge_from(&mut self, other: &Path) -> Result<()> {
        let file = format::read_segment(other)?;
        if file.header.dim as usize != self.dim {
            return Err(DbError::Db(format!(
                "cannot merge segment {} of dimension {} into dimension {}",
                other.display(),
                file.header.dim,
                self.dim
            )));
        }
        self.append_ids.extend_from_slice(&file.ids);
        self.append_vectors.extend_from_slice(&file.vectors);
        Ok(())
    }

    pub(crate) fn append_rows(&mut self, ids: &[i64], vectors: &[f32]) -> Result<()> {
        if vectors.len() != ids.len() * self.dim {
            return Err(DbError::Db(format!(
                "row data length {} does not match {} rows of dimension {}",
                vectors.len(),
                ids.len(),
                self.dim
            )));
        }
        self.append_ids.extend_from_slice(ids);
        self.append_vectors.extend_from_slice(vectors);
        Ok(())
    }

    /// Replace the builder contents wholesale. Used when an index build
    /// re-materializes rows that came from a loaded artifact.
    pub(crate) fn append_rows_replacing(&mut self, ids: Vec<i64>, vectors: Vec<f32>) {
        self.append_ids = ids;
        self.append_vectors = vectors;
    }

    /// Current rows: the builder when it holds anything, the loaded artifact
    /// otherwise.
    pub(crate) fn rows(&self) -> (&[i64], &[f32]) {
        if !self.append_ids.is_empty() {
            (&self.append_ids, &self.append_vectors)
        } else if let Some(data) = &self.data {
            (&data.ids, &data.vectors)
        } else {
            (&[], &[])
        }
    }

    pub(crate) fn serialize(&mut self, ivf: Option<&IvfData>) -> Result<()> {
        let (ids, vectors) = if !self.append_ids.is_empty() {
            (
                std::mem::take(&mut self.append_ids),
                std::mem::take(&mut self.append_vectors),
            )
        } else if let Some(data) = &self.data {
            (data.ids.clone(), data.vectors.clone())
        } else {
            return Err(DbError::Db("no rows to serialize".into()));
        };

        let section = ivf.map(|data| data.to_section(ids.len()));
        let physical_size =
            format::write_segment(&self.location, self.dim, &ids, &vectors, section.as_ref())?;

        self.data = Some(Arc::new(SegmentData {
            ids,
            vectors,
            dim: self.dim,
            ivf: ivf.cloned(),
            physical_size,
        }));
        Ok(())
    }

    pub(crate) fn mem_size(&self) -> u64 {
        if !self.append_ids.is_empty() {
            (self.append_ids.len() * 8 + self.append_vectors.len() * 4) as u64
        } else if let Some(data) = &self.data {
            data.mem_size()
        } else {
            0
        }
    }

    pub(crate) fn physical_size(&self) -> u64 {
        if let Some(data) = &self.data {
            return data.physical_size;
        }
        std::fs::metadata(&self.location)
            .map(|m| m.len())
            .unwrap_or_else(|_| self.mem_size())
    }

    pub(crate) fn count(&self) -> u64 {
        self.rows().0.len() as u64
    }

    pub(crate) fn cache_pin(&mut self) -> Result<()> {
        self.load(true)?;
        if let Some(data) = &self.data {
            self.cache.insert(self.cache_key(), data.clone());
        }
        Ok(())
    }

    pub(crate) fn loaded(&self) -> Result<&Arc<SegmentData>> {
        self.data
            .as_ref()
            .ok_or_else(|| DbError::Db("segment is not loaded".into()))
    }

    /// Top-k scan over every query. When `use_ivf` is set and the loaded
    /// artifact carries an index, only the `nprobe` nearest coarse lists are
    /// scanned; otherwise every row is a candidate.
    pub(crate) fn search(
        &self,
        queries: &[f32],
        k: usize,
        nprobe: usize,
        use_ivf: bool,
    ) -> Result<(Vec<i64>, Vec<f32>)> {
        if self.dim == 0 || queries.len() % self.dim != 0 {
            return Err(DbError::Db(format!(
                "query data length {} is not a multiple of dimension {}",
                queries.len(),
                self.dim
            )));
        }
        let data = self.loaded()?;
        let nq = queries.len() / self.dim;
        let mut out_ids = Vec::with_capacity(nq * k);
        let mut out_distances = Vec::with_capacity(nq * k);

        for query in queries.chunks_exact(self.dim) {
            let hits = match data.ivf.as_ref().filter(|_| use_ivf && nprobe > 0) {
                Some(ivf) => {
                    let probes = nearest_centroids(ivf, query, self.dim, nprobe);
                    let candidates = probes
                        .iter()
                        .flat_map(|&list| ivf.lists[list].iter().map(|&row| row as usize));
                    select_top_k(data, self.metric, query, k, candidates)
                }
                None => select_top_k(data, self.metric, query, k, 0..data.row_count()),
            };
            let found = hits.len();
            for (id, dist) in hits {
                out_ids.push(id);
                out_distances.push(dist);
            }
            for _ in found..k {
                out_ids.push(-1);
                out_distances.push(self.metric.worst_distance());
            }
        }
        Ok((out_ids, out_distances))
    }
}

/// Indices of the `nprobe` centroids closest to the query (squared L2; the
/// coarse quantizer is Euclidean for both metrics).
fn nearest_centroids(ivf: &IvfData, query: &[f32], dim: usize, nprobe: usize) -> Vec<usize> {
    let mut scored: Vec<(usize, f32)> = (0..ivf.nlist)
        .filter(|&c| (c + 1) * dim <= ivf.centroids.len())
        .map(|c| {
            let centroid = &ivf.centroids[c * dim..(c + 1) * dim];
            (c, simd::l2_distance_squared(query, centroid))
        })
        .collect();
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(nprobe.max(1));
    scored.into_iter().map(|(c, _)| c).collect()
}

#[derive(Clone, Copy)]
struct Scored {
    id: i64,
    dist: f32,
    /// Metric-normalized rank where larger is always better.
    score: f32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}
impl Eq for Scored {}
impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse for min-heap behavior: the heap root is the worst hit.
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

fn select_top_k(
    data: &SegmentData,
    metric: MetricKind,
    query: &[f32],
    k: usize,
    candidates: impl Iterator<Item = usize>,
) -> Vec<(i64, f32)> {
    if k == 0 {
        return Vec::new();
    }

    let larger_better = metric.larger_is_better();
    let mut heap = std::collections::BinaryHeap::with_capacity(k + 1);
    for row in candidates {
        let dist = metric.distance(query, data.row(row));
        let score = if larger_better { dist } else { -dist };
        let entry = Scored {
            id: data.ids[row],
            dist,
            score,
        };
        if heap.len() < k {
            heap.push(entry);
        } else if let Some(worst) = heap.peek() {
            if score > worst.score {
                heap.pop();
                heap.push(entry);
            }
        }
    }

    let mut hits = Vec::with_capacity(heap.len());
    while let Some(entry) = heap.pop() {
        hits.push((entry.id, entry.dist));
    }
    hits.reverse(); // best first
    hits
}

/// Merge per-source top-k result rows into a single top-k per query.
///
/// Each entry in `partials` is a `(ids, distances)` pair shaped `k * nq`,
/// padded with id -1. Used by the search job after fanning out over files.
pub fn merge_top_k(
    partials: &[(Vec<i64>, Vec<f32>)],
    nq: usize,
    k: usize,
    metric: MetricKind,
) -> (Vec<i64>, Vec<f32>) {
    let larger_better = metric.larger_is_better();
    let mut out_ids = Vec::with_capacity(nq * k);
    let mut out_distances = Vec::with_capacity(nq * k);

    for q in 0..nq {
        let mut candidates: Vec<(i64, f32)> = Vec::new();
        for (ids, distances) in partials {
            let start = q * k;
            let end = (start + k).min(ids.len());
            for i in start..end {
                if ids[i] >= 0 {
                    candidates.push((ids[i], distances[i]));
                }
            }
        }
        candidates.sort_by(|a, b| {
            let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
            if larger_better {
                ord.reverse()
            } else {
                ord
            }
        });
        candidates.truncate(k);

        let found = candidates.len();
        for (id, dist) in candidates {
            out_ids.push(id);
            out_distances.push(dist);
        }
        for _ in found..k {
            out_ids.push(-1);
            out_distances.push(metric.worst_distance());
        }
    }
    (out_ids, out_distances)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_top_k_orders_l2_ascending() {
        let a = (vec![1i64, 2], vec![0.5f32, 2.0]);
        let b = (vec![3i64, -1], vec![1.0f32, f32::MAX]);
        let (ids, dists) = merge_top_k(&[a, b], 1, 2, MetricKind::L2);
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(dists, vec![0.5, 1.0]);
    }

    #[test]
    fn merge_top_k_orders_ip_descending() {
        let a = (vec![1i64, 2], vec![0.9f32, 0.1]);
        let b = (vec![3i64, 4], vec![0.5f32, 0.2]);
        let (ids, _) = merge_top_k(&[a, b], 1, 3, MetricKind::InnerProduct);
        assert_eq!(ids, vec![1, 3, 4]);
    }

    #[test]
    fn merge_top_k_pads_missing_hits() {
        let a = (vec![7i64, -1], vec![1.0f32, f32::MAX]);
        let (ids, dists) = merge_top_k(&[a], 1, 2, MetricKind::L2);
        assert_eq!(ids, vec![7, -1]);
        assert_eq!(dists[1], f32::MAX);
    }

    #[test]
    fn ivf_section_roundtrip_preserves_lists() {
        let ivf = IvfData {
            nlist: 2,
            centroids: vec![0.0, 0.0, 1.0, 1.0],
            lists: vec![vec![0, 2], vec![1]],
        };
        let section = ivf.to_section(3);
        assert_eq!(section.assignments, vec![0, 1, 0]);
        let back = IvfData::from_section(&section, 3);
        assert_eq!(back.lists, ivf.lists);
    }
}
