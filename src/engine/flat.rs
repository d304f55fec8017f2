//! Exact brute-force engine. Every row is scanned on every query, so
//! results are exact under both metrics. FLAT segments carry no index
//! section and never enter the index pipeline.

use std::path::Path;

use crate::db::error::Result;

use super::{ExecutionEngine, SegmentCore};

pub struct FlatEngine {
    core: SegmentCore,
}

impl FlatEngine {
    pub(crate) fn new(core: SegmentCore) -> Self {
        Self { core }
    }
}

impl ExecutionEngine for FlatEngine {
    fn load(&mut self, to_cache: bool) -> Result<()> {
        self.core.load(to_cache)
    }

    fn merge(&mut self, other_location: &Path) -> Result<()> {
        self.core.merge_from(other_location)
    }

    fn build_index(&mut self) -> Result<()> {
        // Brute-force segments have nothing to build.
        Ok(())
    }

    fn serialize(&mut self) -> Result<()> {
        self.core.serialize(None)
    }

    fn search(&self, vectors: &[f32], k: usize, _nprobe: usize) -> Result<(Vec<i64>, Vec<f32>)> {
        self.core.search(vectors, k, 0, false)
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
