use std::path::PathBuf;
use thiserror::Error;

/// Input handed to a unit of work does not satisfy its contract
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("no events found for key {key}")]
    EmptyGroup { key: String },

    #[error("event {event_id} belongs to user {found:?}, expected {expected:?}")]
    MixedUsers {
        event_id: i64,
        expected: String,
        found: String,
    },

    #[error("event {event_id} has root event id {found:?}, expected Some({expected})")]
    MixedRoots {
        event_id: i64,
        expected: i64,
        found: Option<i64>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("not a post link: {url}")]
    NotAPostLink { url: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("update touched no row: event {0} does not exist")]
    MissingEvent(i64),

    #[error("database file not found: {}", .0.display())]
    MissingDatabase(PathBuf),
}

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("partition file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt line {line} in {}: {source}", path.display())]
    CorruptLine {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not encode key for {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure of one key's unit of work; the worker moves on to the next key
#[derive(Error, Debug)]
pub enum KeyError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for KeyError {
    fn from(e: rusqlite::Error) -> Self {
        KeyError::Store(StoreError::Sqlite(e))
    }
}

/// Failure that ends a whole shard
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("shard {partition}: {source}")]
    Partition {
        partition: usize,
        #[source]
        source: PartitionError,
    },

    #[error("shard {partition}: {source}")]
    Store {
        partition: usize,
        #[source]
        source: StoreError,
    },

    #[error("shard {partition}: worker task failed: {reason}")]
    Join { partition: usize, reason: String },
}
