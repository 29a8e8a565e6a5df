use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info};

use crate::annotations::annotate_sequence;
use crate::config::{Config, Pass};
use crate::error::{KeyError, ShardError};
use crate::models::ShardReport;
use crate::normalize::{StackOverflowNormalizer, UrlNormalizer};
use crate::partition::{
    ensure_data_dir, PartitionFiles, ROOT_EVENT_IDS_BASE_FILENAME, USER_IDENTIFIERS_BASE_FILENAME,
};
use crate::projections::build_sequences;
use crate::store::{
    apply_annotation_patch, apply_sequence_patch, fetch_events_by_root, fetch_events_by_user,
    SqliteStore,
};
use crate::workers::{KeyOutcome, WorkerPool};

/// Pass 1 unit of work: rebuild all sequences of one user
pub fn rebuild_user_sequences(store: &mut SqliteStore, user: &str) -> Result<KeyOutcome, KeyError> {
    store.unit_of_work(|tx| {
        let events = fetch_events_by_user(tx, user)?;
        let outcome = build_sequences(user, &events)?;
        for patch in &outcome.patches {
            apply_sequence_patch(tx, patch)?;
        }
        debug!(user, sessions = outcome.session_count(), "sequences rebuilt");
        Ok(KeyOutcome {
            events: events.len(),
            anomalies: outcome.anomalies,
        })
    })
}

/// Pass 2 unit of work: annotate the events of one sequence
pub fn annotate_root_sequence(
    store: &mut SqliteStore,
    root_event_id: i64,
    normalizer: &dyn UrlNormalizer,
) -> Result<KeyOutcome, KeyError> {
    store.unit_of_work(|tx| {
        let events = fetch_events_by_root(tx, root_event_id)?;
        let outcome = annotate_sequence(root_event_id, &events, normalizer)?;
        for patch in &outcome.patches {
            apply_annotation_patch(tx, patch)?;
        }
        Ok(KeyOutcome {
            events: events.len(),
            anomalies: outcome.anomalies,
        })
    })
}

/// Runs the configured pass over every shard
pub async fn run(
    config: &Config,
    pool: &WorkerPool,
) -> anyhow::Result<Vec<Result<ShardReport, ShardError>>> {
    ensure_data_dir(&config.data_dir)?;
    config
        .store
        .open()
        .and_then(|store| store.ensure_schema())
        .context("preparing event store")?;

    let results = match config.pass {
        Pass::Sequences => run_sequence_pass(config, pool).await?,
        Pass::Annotations => run_annotation_pass(config, pool).await?,
    };
    Ok(results)
}

async fn run_sequence_pass(
    config: &Config,
    pool: &WorkerPool,
) -> anyhow::Result<Vec<Result<ShardReport, ShardError>>> {
    let files = PartitionFiles::new(&config.data_dir, USER_IDENTIFIERS_BASE_FILENAME);

    if !config.skip_retrieval {
        info!("retrieving user identifiers with more than one event");
        let users = config
            .store
            .open()?
            .user_identifiers_with_multiple_events()
            .context("retrieving user identifiers")?;
        info!(count = users.len(), "user identifiers retrieved");
        files.save_and_split(&users, config.partition_count)?;
        info!(partitions = config.partition_count, "user identifiers split");
    }

    info!("building navigation sequences");
    let results = pool
        .run(
            config.partition_count,
            move |partition| files.read_shard::<String>(partition),
            |store, user: &String| rebuild_user_sequences(store, user),
        )
        .await;
    info!("navigation sequences built");
    Ok(results)
}

async fn run_annotation_pass(
    config: &Config,
    pool: &WorkerPool,
) -> anyhow::Result<Vec<Result<ShardReport, ShardError>>> {
    let files = PartitionFiles::new(&config.data_dir, ROOT_EVENT_IDS_BASE_FILENAME);

    if !config.skip_retrieval {
        info!(source = ?config.sequence_source, "retrieving root event ids");
        let roots = config
            .store
            .open()?
            .root_event_ids(config.sequence_source)
            .context("retrieving root event ids")?;
        info!(count = roots.len(), "root event ids retrieved");
        files.save_and_split(&roots, config.partition_count)?;
        info!(partitions = config.partition_count, "root event ids split");
    }

    info!("annotating navigation sequences");
    let normalizer: Arc<dyn UrlNormalizer> = Arc::new(StackOverflowNormalizer);
    let results = pool
        .run(
            config.partition_count,
            move |partition| files.read_shard::<i64>(partition),
            move |store, root: &i64| annotate_root_sequence(store, *root, normalizer.as_ref()),
        )
        .await;
    info!("navigation sequences annotated");
    Ok(results)
}
