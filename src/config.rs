use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::error::PreconditionError;
use crate::store::{SequenceSource, StoreConfig};

pub const DEFAULT_PARTITION_COUNT: usize = 4;

/// CLI wrapper for SequenceSource (needed for clap ValueEnum)
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum CliSequenceSource {
    All,
    #[default]
    LinearNonBot,
}

impl From<CliSequenceSource> for SequenceSource {
    fn from(cli: CliSequenceSource) -> Self {
        match cli {
            CliSequenceSource::All => SequenceSource::All,
            CliSequenceSource::LinearNonBot => SequenceSource::LinearNonBot,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "navseq")]
#[command(
    about = "Reconstruct navigation sequences from a web event log and annotate their events"
)]
pub struct Cli {
    /// Directory for partition files (created if missing)
    #[arg(short, long)]
    pub data_dir: PathBuf,

    /// SQLite database holding the event table
    #[arg(short = 'b', long)]
    pub database: PathBuf,

    /// Number of partitions, one worker per partition
    #[arg(short, long, default_value_t = DEFAULT_PARTITION_COUNT)]
    pub partition_count: usize,

    /// Reuse the partition files already in the data directory
    #[arg(short, long)]
    pub skip_retrieval: bool,

    /// Annotate existing sequences instead of building them
    #[arg(short = 'l', long)]
    pub process_linear: bool,

    /// Where sequence annotation takes its root event ids from
    #[arg(long, value_enum, default_value_t = CliSequenceSource::LinearNonBot)]
    pub sequence_source: CliSequenceSource,
}

/// Which of the two passes to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Group each user's events into sequences
    Sequences,
    /// Annotate the events of existing sequences
    Annotations,
}

/// Validated run configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub store: StoreConfig,
    pub partition_count: usize,
    pub skip_retrieval: bool,
    pub pass: Pass,
    pub sequence_source: SequenceSource,
}

impl TryFrom<Cli> for Config {
    type Error = PreconditionError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.partition_count == 0 {
            return Err(PreconditionError::InvalidConfig(
                "partition count must be at least 1".to_string(),
            ));
        }
        if cli.data_dir.exists() && !cli.data_dir.is_dir() {
            return Err(PreconditionError::InvalidConfig(format!(
                "data dir is not a directory: {}",
                cli.data_dir.display()
            )));
        }
        if !cli.database.is_file() {
            return Err(PreconditionError::InvalidConfig(format!(
                "not a valid database file: {}",
                cli.database.display()
            )));
        }

        Ok(Config {
            data_dir: cli.data_dir,
            store: StoreConfig::new(cli.database),
            partition_count: cli.partition_count,
            skip_retrieval: cli.skip_retrieval,
            pass: if cli.process_linear {
                Pass::Annotations
            } else {
                Pass::Sequences
            },
            sequence_source: cli.sequence_source.into(),
        })
    }
}
