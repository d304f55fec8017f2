//! Ostinato-DB: a persistent vector similarity search engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         DbEngine                            │
//! │   insert / query / create_index / delete_table façade       │
//! └─────────────────────────────────────────────────────────────┘
//!        │               │                    │
//!        ▼               ▼                    ▼
//! ┌────────────┐  ┌─────────────┐  ┌─────────────────────────┐
//! │ MemBuffer  │  │  MetaStore  │  │ Scheduler (search/build │
//! │ per-table  │  │ tables/files│  │ /delete jobs over N     │
//! │ buffers    │  │ state FSM   │  │ compute resources)      │
//! └────────────┘  └─────────────┘  └─────────────────────────┘
//!        │               │                    │
//!        └───────────────┼────────────────────┘
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │    .odb segments on disk, loaded through bounded LRU caches │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A one-second timer drives three background sub-tasks: metric sampling,
//! compaction (flush + merge-by-date + retention + TTL cleanup) and index
//! building. Compaction and index building are single-slot pipelines: at
//! most one of each is in flight, and skipped ticks coalesce.

pub mod db;
pub mod engine;
pub mod format;
pub mod simd;

pub use db::{DbEngine, DbError, DbOptions, IndexDescriptor, Mode, Result, TableSchema};
pub use engine::{EngineType, MetricKind};
