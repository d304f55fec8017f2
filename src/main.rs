//! Ostinato-DB CLI
//!
//! # Usage
//!
//! ```bash
//! # Insert random vectors and query them back
//! ostinato-db bench --data ./data --dim 64 --count 10000 --k 10
//!
//! # Show tables and row counts
//! ostinato-db stats --data ./data
//!
//! # Flush the insert buffer and run one compaction round
//! ostinato-db compact --data ./data
//! ```

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ostinato_db::db::meta::DEFAULT_NLIST;
use ostinato_db::{
    DbEngine, DbOptions, EngineType, IndexDescriptor, MetricKind, TableSchema,
};

#[derive(Parser)]
#[command(name = "ostinato-db")]
#[command(about = "A persistent vector similarity search engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert random vectors into a scratch table and query them back
    Bench {
        /// Data directory
        #[arg(short, long)]
        data: PathBuf,

        /// Vector dimension
        #[arg(long, default_value = "64")]
        dim: u32,

        /// Number of vectors to insert
        #[arg(short, long, default_value = "10000")]
        count: usize,

        /// Top-k per query
        #[arg(short, long, default_value = "10")]
        k: usize,

        /// Engine type: FLAT or IVF_FLAT
        #[arg(long, default_value = "FLAT")]
        engine: String,

        /// Queries to run after inserting
        #[arg(short, long, default_value = "100")]
        queries: usize,
    },

    /// Display tables, row counts and total data size
    Stats {
        /// Data directory
        #[arg(short, long)]
        data: PathBuf,
    },

    /// Flush the insert buffer and run one compaction round
    Compact {
        /// Data directory
        #[arg(short, long)]
        data: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Bench {
            data,
            dim,
            count,
            k,
            engine,
            queries,
        } => bench(data, dim, count, k, &engine, queries),
        Commands::Stats { data } => stats(data),
        Commands::Compact { data } => compact(data),
    }
}

fn bench(
    data: PathBuf,
    dim: u32,
    count: usize,
    k: usize,
    engine: &str,
    queries: usize,
) -> anyhow::Result<()> {
    use rand::{Rng, SeedableRng};

    let engine_type: EngineType = engine.parse()?;
    let db = DbEngine::open(DbOptions::from_data_dir(&data))?;
    let table_id = format!("bench_{}", std::process::id());

    db.create_table(TableSchema {
        table_id: table_id.clone(),
        dimension: dim,
        index_file_size: 64, // MB
        metric: MetricKind::L2,
        index: IndexDescriptor {
            engine_type,
            metric: MetricKind::L2,
            nlist: DEFAULT_NLIST.min(256),
        },
        state: ostinato_db::db::TableState::Active,
        flag: 0,
        created_at: 0,
    })?;

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let vectors: Vec<f32> = (0..count * dim as usize)
        .map(|_| rng.gen::<f32>())
        .collect();

    let insert_start = Instant::now();
    let ids = db.insert_vectors(&table_id, &vectors)?;
    db.flush_once()?;
    tracing::info!(
        rows = ids.len(),
        elapsed_ms = insert_start.elapsed().as_millis() as u64,
        "insert + flush done"
    );

    let query_start = Instant::now();
    let mut hits = 0usize;
    let probes = queries.min(count);
    for q in 0..probes {
        let row = q * (count / probes.max(1)).max(1) % count;
        let query = &vectors[row * dim as usize..(row + 1) * dim as usize];
        let result = db.query(&table_id, k, 16, query, &[], &[])?;
        if result.ids.first() == Some(&ids[row]) {
            hits += 1;
        }
    }
    let elapsed = query_start.elapsed();
    tracing::info!(
        queries = probes,
        top1_hits = hits,
        avg_latency_us = (elapsed.as_micros() / probes.max(1) as u128) as u64,
        "query round done"
    );

    db.delete_table(&table_id, &[])?;
    db.stop()?;
    Ok(())
}

fn stats(data: PathBuf) -> anyhow::Result<()> {
    let db = DbEngine::open(DbOptions::from_data_dir(&data))?;
    for schema in db.all_tables()? {
        let rows = db.table_row_count(&schema.table_id)?;
        println!(
            "{}  dim={}  metric={:?}  index={}  nlist={}  rows={}",
            schema.table_id,
            schema.dimension,
            schema.metric,
            schema.index.engine_type.as_str(),
            schema.index.nlist,
            rows
        );
    }
    println!("total data size: {} bytes", db.size()?);
    db.stop()?;
    Ok(())
}

fn compact(data: PathBuf) -> anyhow::Result<()> {
    let db = DbEngine::open(DbOptions::from_data_dir(&data))?;
    db.flush_once()?;
    db.compact_once()?;
    println!("{}", db.metrics_text());
    db.stop()?;
    Ok(())
}
