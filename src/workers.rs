use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, info_span, warn};

use crate::error::{KeyError, PartitionError, ShardError};
use crate::models::{Anomaly, ShardReport};
use crate::store::{SqliteStore, StoreConfig};

/// Progress is logged for the first key, the last key and every LOG_PACE-th key
pub const LOG_PACE: usize = 1000;

/// What one key's unit of work did
#[derive(Debug, Default)]
pub struct KeyOutcome {
    pub events: usize,
    pub anomalies: Vec<Anomaly>,
}

/// Runs one blocking worker per shard. Workers share nothing but the stop flag.
pub struct WorkerPool {
    store: StoreConfig,
    stop: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops every worker before its next key
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Spawns `partition_count` workers and waits for all of them.
    ///
    /// `load` yields a shard's keys, `process` handles one key inside its own
    /// transaction. Results come back in partition order.
    pub async fn run<K, L, P>(
        &self,
        partition_count: usize,
        load: L,
        process: P,
    ) -> Vec<Result<ShardReport, ShardError>>
    where
        K: Display + Send + 'static,
        L: Fn(usize) -> Result<Vec<K>, PartitionError> + Send + Sync + 'static,
        P: Fn(&mut SqliteStore, &K) -> Result<KeyOutcome, KeyError> + Send + Sync + 'static,
    {
        let load = Arc::new(load);
        let process = Arc::new(process);
        let mut handles = Vec::with_capacity(partition_count);

        for partition in 0..partition_count {
            let load = Arc::clone(&load);
            let process = Arc::clone(&process);
            let store = self.store.clone();
            let stop = Arc::clone(&self.stop);
            let span = info_span!("shard", partition);

            handles.push(tokio::task::spawn_blocking(move || -> Result<ShardReport, ShardError> {
                let _entered = span.enter();
                let keys = load(partition)
                    .map_err(|source| ShardError::Partition { partition, source })?;
                let mut store = store
                    .open()
                    .map_err(|source| ShardError::Store { partition, source })?;
                Ok(process_shard(partition, keys, &mut store, process.as_ref(), &stop))
            }));
            info!(partition, "worker started");
        }

        let mut results = Vec::with_capacity(partition_count);
        for (partition, handle) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(ShardError::Join {
                    partition,
                    reason: e.to_string(),
                }),
            };
            match &result {
                Ok(report) => info!(
                    partition,
                    keys_read = report.keys_read,
                    keys_processed = report.keys_processed,
                    keys_failed = report.keys_failed,
                    events_processed = report.events_processed,
                    cancelled = report.cancelled,
                    "worker finished"
                ),
                Err(e) => error!(partition, error = %e, "worker aborted"),
            }
            results.push(result);
        }
        results
    }
}

/// Works through one shard key by key; a failed key is logged and skipped
fn process_shard<K, P>(
    partition: usize,
    keys: Vec<K>,
    store: &mut SqliteStore,
    process: &P,
    stop: &AtomicBool,
) -> ShardReport
where
    K: Display,
    P: Fn(&mut SqliteStore, &K) -> Result<KeyOutcome, KeyError>,
{
    let record_count = keys.len();
    let mut report = ShardReport {
        partition,
        keys_read: record_count,
        ..ShardReport::default()
    };
    info!(records = record_count, "keys read");

    for (idx, key) in keys.iter().enumerate() {
        if stop.load(Ordering::SeqCst) {
            warn!(remaining = record_count - idx, "stop requested, leaving remaining keys");
            report.cancelled = true;
            break;
        }

        if idx == 0 || idx + 1 == record_count || idx % LOG_PACE == 0 {
            let progress = (idx + 1) as f64 / record_count as f64 * 100.0;
            info!(
                key = %key,
                "record {} of {}; {:.2}%",
                idx + 1,
                record_count,
                progress
            );
        }

        match process(store, key) {
            Ok(outcome) => {
                report.keys_processed += 1;
                report.events_processed += outcome.events;
                for anomaly in &outcome.anomalies {
                    warn!(key = %key, event_id = anomaly.event_id(), ?anomaly, "data anomaly, field skipped");
                }
            }
            Err(e) => {
                report.keys_failed += 1;
                warn!(key = %key, error = %e, "unit of work rolled back");
            }
        }
    }

    info!(events = report.events_processed, "events processed");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PreconditionError;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn pool() -> (TempDir, WorkerPool) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.db");
        SqliteStore::create(&path).unwrap();
        (dir, WorkerPool::new(StoreConfig::new(path)))
    }

    #[tokio::test]
    async fn test_every_shard_processes_its_keys() {
        let (_dir, pool) = pool();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let results = pool
            .run(
                3,
                |partition| Ok(vec![partition as i64 * 10, partition as i64 * 10 + 1]),
                move |_store, key: &i64| {
                    sink.lock().unwrap().push(*key);
                    Ok(KeyOutcome {
                        events: 2,
                        anomalies: Vec::new(),
                    })
                },
            )
            .await;

        assert_eq!(results.len(), 3);
        for (partition, result) in results.iter().enumerate() {
            let report = result.as_ref().unwrap();
            assert_eq!(report.partition, partition);
            assert_eq!(report.keys_processed, 2);
            assert_eq!(report.events_processed, 4);
        }
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 10, 11, 20, 21]);
    }

    #[tokio::test]
    async fn test_failed_key_does_not_stop_shard() {
        let (_dir, pool) = pool();

        let results = pool
            .run(
                1,
                |_| Ok(vec![1i64, 2, 3]),
                |_store, key: &i64| {
                    if *key == 2 {
                        Err(PreconditionError::EmptyGroup {
                            key: key.to_string(),
                        }
                        .into())
                    } else {
                        Ok(KeyOutcome::default())
                    }
                },
            )
            .await;

        let report = results[0].as_ref().unwrap();
        assert_eq!(report.keys_processed, 2);
        assert_eq!(report.keys_failed, 1);
    }

    #[tokio::test]
    async fn test_partition_error_only_aborts_its_shard() {
        let (_dir, pool) = pool();

        let results = pool
            .run(
                2,
                |partition| {
                    if partition == 0 {
                        Err(PartitionError::MissingFile("gone.jsonl".into()))
                    } else {
                        Ok(vec![7i64])
                    }
                },
                |_store, _key: &i64| Ok(KeyOutcome::default()),
            )
            .await;

        assert!(matches!(
            results[0],
            Err(ShardError::Partition { partition: 0, .. })
        ));
        assert_eq!(results[1].as_ref().unwrap().keys_processed, 1);
    }

    #[tokio::test]
    async fn test_stop_flag_skips_remaining_keys() {
        let (_dir, pool) = pool();
        let stop = pool.stop_handle();

        let results = pool
            .run(
                1,
                |_| Ok(vec![1i64, 2, 3]),
                move |_store, key: &i64| {
                    if *key == 1 {
                        stop.store(true, Ordering::SeqCst);
                    }
                    Ok(KeyOutcome::default())
                },
            )
            .await;

        let report = results[0].as_ref().unwrap();
        assert_eq!(report.keys_processed, 1);
        assert!(report.cancelled);
    }
}
