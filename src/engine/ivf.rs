//! IVF_FLAT engine: raw rows plus a coarse k-means quantizer.
//!
//! A segment that has not been through the index pipeline yet is searched
//! like a FLAT segment; once `build_index` has run, queries probe only the
//! `nprobe` nearest coarse lists. Centroids are trained with Lloyd's
//! k-means seeded by k-means++, with tolerance-based early stop.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::db::error::{DbError, Result};
use crate::simd;

use super::{ExecutionEngine, IvfData, SegmentCore};

const KMEANS_MAX_ITERS: usize = 20;
const KMEANS_TOLERANCE: f32 = 1e-4;
const KMEANS_SEED: u64 = 0x5eed;

pub struct IvfFlatEngine {
    core: SegmentCore,
    nlist: usize,
    pending_index: Option<IvfData>,
}

impl IvfFlatEngine {
    pub(crate) fn new(core: SegmentCore, nlist: u32) -> Self {
        Self {
            core,
            nlist: (nlist as usize).max(1),
            pending_index: None,
        }
    }
}

impl ExecutionEngine for IvfFlatEngine {
    fn load(&mut self, to_cache: bool) -> Result<()> {
        self.core.load(to_cache)
    }

    fn merge(&mut self, other_location: &Path) -> Result<()> {
        self.core.merge_from(other_location)
    }

    fn build_index(&mut self) -> Result<()> {
        let dim = self.core.dim;
        let (ids, vectors) = self.core.rows();
        if ids.is_empty() {
            return Err(DbError::Db(
                "cannot build an index over an empty segment".into(),
            ));
        }
        let index = train_ivf(vectors, dim, self.nlist);
        // Rows must survive serialize alongside the new index section.
        let (ids, vectors) = (ids.to_vec(), vectors.to_vec());
        self.core.append_rows_replacing(ids, vectors);
        self.pending_index = Some(index);
        Ok(())
    }

    fn serialize(&mut self) -> Result<()> {
        let index = self.pending_index.take();
        self.core.serialize(index.as_ref())
    }

    fn search(&self, vectors: &[f32], k: usize, nprobe: usize) -> Result<(Vec<i64>, Vec<f32>)> {
        self.core.search(vectors, k, nprobe, true)
    }

    fn size(&self) -> u64 {
        self.core.mem_size()
    }

    fn physical_size(&self) -> u64 {
        self.core.physical_size()
    }

    fn count(&self) -> u64 {
        self.core.count()
    }

    fn cache(&mut self) -> Result<()> {
        self.core.cache_pin()
    }
}

/// Train the coarse quantizer and assign every row to its nearest centroid.
fn train_ivf(vectors: &[f32], dim: usize, nlist: usize) -> IvfData {
    let rows = vectors.len() / dim;
    let k = nlist.min(rows).max(1);
    let centroids = kmeans(vectors, dim, rows, k);

    let mut lists = vec![Vec::new(); k];
    for row in 0..rows {
        let v = &vectors[row * dim..(row + 1) * dim];
        let list = nearest_centroid(&centroids, v, dim, k);
        lists[list].push(row as u32);
    }

    IvfData {
        nlist: k,
        centroids,
        lists,
    }
}

fn nearest_centroid(centroids: &[f32], v: &[f32], dim: usize, k: usize) -> usize {
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for c in 0..k {
        let dist = simd::l2_distance_squared(v, &centroids[c * dim..(c + 1) * dim]);
        if dist < best_dist {
            best_dist = dist;
            best = c;
        }
    }
    best
}

/// k-means++ seeding: each next centroid is sampled proportionally to its
/// squared distance from the nearest already-chosen one.
fn kmeans_plus_plus_init(vectors: &[f32], dim: usize, rows: usize, k: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(KMEANS_SEED ^ k as u64);
    let mut centroids = vec![0.0f32; k * dim];

    let first = rng.gen_range(0..rows);
    centroids[0..dim].copy_from_slice(&vectors[first * dim..(first + 1) * dim]);

    let mut min_dists = vec![f32::MAX; rows];
    for c in 1..k {
        let last = &centroids[(c - 1) * dim..c * dim];
        for row in 0..rows {
            let d = simd::l2_distance_squared(&vectors[row * dim..(row + 1) * dim], last);
            if d < min_dists[row] {
                min_dists[row] = d;
            }
        }

        let total: f64 = min_dists.iter().map(|&d| d as f64).sum();
        let chosen = if total <= 0.0 {
            rng.gen_range(0..rows)
        } else {
            let threshold: f64 = rng.gen::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut idx = rows - 1;
            for (row, &d) in min_dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    idx = row;
                    break;
                }
            }
            idx
        };
        centroids[c * dim..(c + 1) * dim]
            .copy_from_slice(&vectors[chosen * dim..(chosen + 1) * dim]);
    }

    centroids
}

fn kmeans(vectors: &[f32], dim: usize, rows: usize, k: usize) -> Vec<f32> {
    let mut centroids = kmeans_plus_plus_init(vectors, dim, rows, k);
    let mut sums = vec![0.0f32; k * dim];
    let mut counts = vec![0usize; k];

    for _ in 0..KMEANS_MAX_ITERS {
        sums.iter_mut().for_each(|s| *s = 0.0);
        counts.iter_mut().for_each(|c| *c = 0);

        for row in 0..rows {
            let v = &vectors[row * dim..(row + 1) * dim];
            let c = nearest_centroid(&centroids, v, dim, k);
            counts[c] += 1;
            for (s, x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(v) {
                *s += x;
            }
        }

        let mut movement = 0.0f32;
        for c in 0..k {
            if counts[c] == 0 {
                continue; // empty list keeps its previous centroid
            }
            let inv = 1.0 / counts[c] as f32;
            let target = &mut centroids[c * dim..(c + 1) * dim];
            for (t, s) in target.iter_mut().zip(&sums[c * dim..(c + 1) * dim]) {
                let updated = s * inv;
                movement = movement.max((updated - *t).abs());
                *t = updated;
            }
        }
        if movement < KMEANS_TOLERANCE {
            break;
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use crate::db::cache::CacheManager;
    use crate::engine::{build_engine, EngineType, MetricKind};
    use crate::format;

    use super::*;

    fn clustered_vectors(dim: usize, per_cluster: usize) -> (Vec<i64>, Vec<f32>) {
        let mut rng = StdRng::seed_from_u64(7);
        let mut ids = Vec::new();
        let mut vectors = Vec::new();
        for (cluster, center) in [0.0f32, 10.0, -10.0].iter().enumerate() {
            for i in 0..per_cluster {
                ids.push((cluster * per_cluster + i) as i64);
                for _ in 0..dim {
                    vectors.push(center + rng.gen::<f32>() * 0.1);
                }
            }
        }
        (ids, vectors)
    }

    #[test]
    fn train_ivf_covers_every_row() {
        let (_, vectors) = clustered_vectors(4, 20);
        let index = train_ivf(&vectors, 4, 3);
        let assigned: usize = index.lists.iter().map(|l| l.len()).sum();
        assert_eq!(assigned, 60);
        assert_eq!(index.nlist, 3);
    }

    #[test]
    fn nlist_is_clamped_to_row_count() {
        let vectors = vec![0.0f32, 0.0, 1.0, 1.0];
        let index = train_ivf(&vectors, 2, 16);
        assert_eq!(index.nlist, 2);
    }

    #[test]
    fn indexed_search_finds_own_vector() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ivf.odb");
        let (ids, vectors) = clustered_vectors(4, 20);
        format::write_segment(&path, 4, &ids, &vectors, None).unwrap();

        let cache = Arc::new(CacheManager::new("cpu", 1 << 22));
        let mut engine =
            build_engine(4, &path, EngineType::IvfFlat, MetricKind::L2, 3, cache.clone()).unwrap();
        engine.load(false).unwrap();
        engine.build_index().unwrap();
        engine.serialize().unwrap();

        let seg = format::read_segment(&path).unwrap();
        assert!(seg.ivf.is_some(), "serialized segment must carry the index");

        let mut fresh =
            build_engine(4, &path, EngineType::IvfFlat, MetricKind::L2, 3, cache).unwrap();
        fresh.load(false).unwrap();
        let probe = &vectors[0..4];
        let (hit_ids, distances) = fresh.search(probe, 1, 2).unwrap();
        assert_eq!(hit_ids, vec![ids[0]]);
        assert!(distances[0] <= 1e-3);
    }

    #[test]
    fn unindexed_segment_falls_back_to_flat_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.odb");
        format::write_segment(&path, 2, &[5, 6], &[0.0, 0.0, 3.0, 3.0], None).unwrap();

        let cache = Arc::new(CacheManager::new("cpu", 1 << 20));
        let mut engine =
            build_engine(2, &path, EngineType::IvfFlat, MetricKind::L2, 8, cache).unwrap();
        engine.load(false).unwrap();
        let (hit_ids, _) = engine.search(&[3.0, 3.0], 1, 4).unwrap();
        assert_eq!(hit_ids, vec![6]);
    }
}
