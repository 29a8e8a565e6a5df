use clap::Parser;
use std::sync::atomic::Ordering;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod annotations;
mod config;
mod error;
mod models;
mod normalize;
mod partition;
mod pipeline;
mod projections;
mod store;
mod workers;


use config::{Cli, Config};
use error::ShardError;
use models::ShardReport;
use workers::WorkerPool;

/// Offline session reconstruction over a web event log
/// Pass 1 groups each user's events into navigation sequences,
/// pass 2 (`--process-linear`) annotates the events of those sequences
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::try_from(Cli::parse())?;
    let run_id = Uuid::new_v4();
    let span = info_span!("run", %run_id, pass = ?config.pass);

    let pool = WorkerPool::new(config.store.clone());
    let stop = pool.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping once current keys are committed");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let results = pipeline::run(&config, &pool).instrument(span.clone()).await?;
    span.in_scope(|| summarize(&results))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Logs the totals; fails if any shard was aborted
fn summarize(results: &[Result<ShardReport, ShardError>]) -> anyhow::Result<()> {
    let reports: Vec<&ShardReport> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let aborted = results.len() - reports.len();

    info!(
        shards = results.len(),
        aborted,
        keys_processed = reports.iter().map(|r| r.keys_processed).sum::<usize>(),
        keys_failed = reports.iter().map(|r| r.keys_failed).sum::<usize>(),
        events_processed = reports.iter().map(|r| r.events_processed).sum::<usize>(),
        "run finished"
    );

    if aborted > 0 {
        error!(aborted, "some shards did not complete");
        anyhow::bail!("{} of {} shards aborted", aborted, results.len());
    }
    Ok(())
}
