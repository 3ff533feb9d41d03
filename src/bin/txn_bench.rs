use anyhow::{Context, Result, anyhow};
use clap::Parser;
use futures::future::try_join_all;
use rustspan::rpc::memory::MemoryDatabase;
use rustspan::{
    Column, DataType, Database, KeySet, PartitionOptions, PoolConfig, ReadSpec, TableSchema,
    TimestampBound, TransactionOptions, Value,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "txn-bench")]
#[command(about = "Contended read-modify-write transactions against the in-memory service")]
struct Cli {
    /// Concurrent workers.
    #[arg(long, default_value_t = 16)]
    workers: usize,
    /// Increments each worker commits.
    #[arg(long, default_value_t = 50)]
    increments: usize,
    /// Distinct counters; fewer counters means more ABORTED retries.
    #[arg(long, default_value_t = 4)]
    counters: usize,
    #[arg(long, default_value_t = 8)]
    max_sessions: usize,
    /// Simulated per-call latency in milliseconds.
    #[arg(long, default_value_t = 1)]
    latency_ms: u64,
    /// Partitions requested for the final scan.
    #[arg(long, default_value_t = 4)]
    partitions: usize,
    #[arg(long, default_value = "projects/bench/instances/local/databases/counters")]
    database: String,
}

fn counters_table() -> TableSchema {
    TableSchema::new(
        "Counters",
        vec![
            Column::new("Name", DataType::Text).not_null(),
            Column::new("Value", DataType::Integer).not_null(),
        ],
        vec!["Name"],
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if cli.counters == 0 {
        return Err(anyhow!("--counters must be at least 1"));
    }

    let rpc = Arc::new(
        MemoryDatabase::new(cli.database.parse().context("parsing --database")?)
            .with_table(counters_table())
            .with_latency(Duration::from_millis(cli.latency_ms)),
    );
    rpc.seed(
        "Counters",
        (0..cli.counters)
            .map(|i| vec![Value::Text(format!("c{}", i)), Value::Integer(0)])
            .collect(),
    )?;

    let config = PoolConfig::new()
        .min_sessions(cli.max_sessions.min(4))
        .max_sessions(cli.max_sessions);
    let db = Arc::new(
        Database::open(rpc.clone(), config)
            .await?
            .with_catalog(rpc.catalog())
            .with_transaction_options(TransactionOptions::new().timeout(Duration::from_secs(60))),
    );
    info!(workers = cli.workers, increments = cli.increments, "starting bench");

    let started = Instant::now();
    let tasks = (0..cli.workers).map(|worker| {
        let db = Arc::clone(&db);
        let counters = cli.counters;
        let increments = cli.increments;
        tokio::spawn(async move {
            let mut attempts = 0u64;
            for i in 0..increments {
                let name = format!("c{}", (worker + i) % counters);
                let outcome = db
                    .run_transaction(|txn| {
                        let name = name.clone();
                        async move {
                            let row = txn
                                .read_row("Counters", &["Name", "Value"], vec![Value::Text(name.clone())])
                                .await?;
                            let current = row.and_then(|r| r[1].as_i64()).unwrap_or(0);
                            txn.update(
                                "Counters",
                                &["Name", "Value"],
                                vec![vec![Value::Text(name), Value::Integer(current + 1)]],
                            )?;
                            Ok(current + 1)
                        }
                    })
                    .await?;
                attempts += u64::from(outcome.attempts);
            }
            Ok::<u64, rustspan::DbError>(attempts)
        })
    });

    let mut total_attempts = 0;
    for joined in try_join_all(tasks).await? {
        total_attempts += joined?;
    }
    let elapsed = started.elapsed();
    let committed = (cli.workers * cli.increments) as u64;

    let batch = db.batch_transaction(TimestampBound::Strong).await?;
    let partitions = batch
        .partition_read(
            ReadSpec::new("Counters", &["Name", "Value"], KeySet::all()),
            PartitionOptions {
                partition_size_bytes: None,
                max_partitions: Some(cli.partitions),
            },
        )
        .await?;
    let scans = partitions.iter().map(|partition| batch.execute(partition));
    let mut sum = 0;
    for result in try_join_all(scans).await? {
        let rows = result.collect().await?;
        sum += rows.rows().iter().filter_map(|r| r[1].as_i64()).sum::<i64>();
    }
    batch.close().await;

    let stats = db.close().await;

    println!("committed:      {}", committed);
    println!("attempts:       {}", total_attempts);
    println!("retries:        {}", total_attempts.saturating_sub(committed));
    println!("elapsed:        {:.2?}", elapsed);
    println!(
        "throughput:     {:.1} txn/s",
        committed as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("partitions:     {}", partitions.len());
    println!("counter sum:    {}", sum);
    println!("pool:           {}", stats);

    if sum != committed as i64 {
        return Err(anyhow!("lost updates: expected {}, scanned {}", committed, sum));
    }
    Ok(())
}
