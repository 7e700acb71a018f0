use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueHint};
use unchained::config::{CliIndexConfig, CliRpcConfig};
use unchained::scrape::{OutputMode, DEFAULT_CHANNEL_SIZE};

const PIPELINE_HELP_HEADING: &str = "Pipeline options";

/// Builds and inspects an address-appearance index.
#[derive(Parser)]
#[command(version = unchained::version(), propagate_version = true)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Command,

    #[clap(flatten)]
    pub(crate) index: CliIndexConfig,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Extracts the appearances of a range of blocks from a node.
    Scrape {
        #[clap(flatten)]
        rpc: CliRpcConfig,
        /// The first block to scrape.
        #[arg(short = 's', long, env = "UNCHAINED_FIRST_BLOCK")]
        first_block: u64,
        /// How many blocks to scrape.
        #[arg(short = 'n', long, env = "UNCHAINED_BLOCK_COUNT", default_value_t = 1)]
        block_count: u64,
        /// Tasks fetching traces and logs.
        #[arg(long, env = "UNCHAINED_FETCH_WORKERS", help_heading = PIPELINE_HELP_HEADING, default_value_t = 10)]
        fetch_workers: usize,
        /// Tasks extracting and writing appearances.
        #[arg(long, env = "UNCHAINED_EXTRACT_WORKERS", help_heading = PIPELINE_HELP_HEADING, default_value_t = 20)]
        extract_workers: usize,
        /// Capacity of the queues between stages.
        #[arg(long, env = "UNCHAINED_CHANNEL_SIZE", help_heading = PIPELINE_HELP_HEADING, default_value_t = DEFAULT_CHANNEL_SIZE)]
        channel_size: usize,
        /// Which per-block artifacts to write.
        #[arg(short = 'o', long, env = "UNCHAINED_OUTPUT", help_heading = PIPELINE_HELP_HEADING, value_enum, default_value = "text")]
        output: OutputMode,
        /// Also cache every block's logs.
        #[arg(long, env = "UNCHAINED_CACHE_LOGS", help_heading = PIPELINE_HELP_HEADING, default_value_t = false)]
        cache_logs: bool,
    },
    /// Reports how far the index has been built.
    Meta {
        #[clap(flatten)]
        rpc: CliRpcConfig,
        /// Report fixed values for every block field.
        #[arg(long, env = "UNCHAINED_TEST_MODE", default_value_t = false)]
        test_mode: bool,
    },
    /// Consolidates cached blocks into a finalized chunk.
    Chunk {
        /// The first block of the chunk.
        #[arg(long)]
        first: u64,
        /// The last block of the chunk (inclusive).
        #[arg(long)]
        last: u64,
    },
    /// Reads and validates the header of a chunk.
    Header {
        /// The chunk file.
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
    },
}
