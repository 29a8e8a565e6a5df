use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::PartitionError;

pub const USER_IDENTIFIERS_BASE_FILENAME: &str = "user_identifiers";
pub const ROOT_EVENT_IDS_BASE_FILENAME: &str = "root_event_ids";

/// Splits `keys` into exactly `n` contiguous chunks whose sizes differ by at
/// most one; earlier chunks take the remainder.
pub fn split<T: Clone>(keys: &[T], n: usize) -> Vec<Vec<T>> {
    let n = n.max(1);
    let base = keys.len() / n;
    let remainder = keys.len() % n;

    let mut chunks = Vec::with_capacity(n);
    let mut offset = 0;
    for i in 0..n {
        let len = base + usize::from(i < remainder);
        chunks.push(keys[offset..offset + len].to_vec());
        offset += len;
    }
    chunks
}

/// Key files kept in the data directory between retrieval and processing.
///
/// One JSON value per line, so opaque identifiers survive unchanged.
#[derive(Debug, Clone)]
pub struct PartitionFiles {
    data_dir: PathBuf,
    base_name: &'static str,
}

impl PartitionFiles {
    pub fn new(data_dir: &Path, base_name: &'static str) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            base_name,
        }
    }

    pub fn full_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.jsonl", self.base_name))
    }

    pub fn shard_path(&self, partition: usize) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}.jsonl", self.base_name, partition))
    }

    /// Saves the full key list, splits it and saves one file per shard
    pub fn save_and_split<T: Serialize + DeserializeOwned + Clone>(
        &self,
        keys: &[T],
        partition_count: usize,
    ) -> Result<Vec<PathBuf>, PartitionError> {
        write_keys(&self.full_path(), keys)?;
        let keys: Vec<T> = read_keys(&self.full_path())?;

        split(&keys, partition_count)
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let path = self.shard_path(i);
                write_keys(&path, chunk)?;
                tracing::debug!(path = %path.display(), keys = chunk.len(), "partition file written");
                Ok(path)
            })
            .collect()
    }

    pub fn read_shard<T: DeserializeOwned>(&self, partition: usize) -> Result<Vec<T>, PartitionError> {
        read_keys(&self.shard_path(partition))
    }
}

/// Replaces `path` with one JSON line per key
pub fn write_keys<T: Serialize>(path: &Path, keys: &[T]) -> Result<(), PartitionError> {
    let io_err = |source| PartitionError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);
    for key in keys {
        let line = serde_json::to_string(key).map_err(|source| PartitionError::Encode {
            path: path.to_path_buf(),
            source,
        })?;
        writeln!(writer, "{line}").map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;
    Ok(())
}

/// Reads keys back; blank lines are skipped, anything else must parse
pub fn read_keys<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, PartitionError> {
    if !path.is_file() {
        return Err(PartitionError::MissingFile(path.to_path_buf()));
    }
    let io_err = |source| PartitionError::Io {
        path: path.to_path_buf(),
        source,
    };

    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut keys = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let key = serde_json::from_str(&line).map_err(|source| PartitionError::CorruptLine {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        keys.push(key);
    }
    Ok(keys)
}

/// Makes sure the data directory exists
pub fn ensure_data_dir(data_dir: &Path) -> Result<(), PartitionError> {
    fs::create_dir_all(data_dir).map_err(|source| PartitionError::Io {
        path: data_dir.to_path_buf(),
        source,
    })
}
