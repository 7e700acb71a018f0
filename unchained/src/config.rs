use std::path::PathBuf;

use clap::{Args, ValueHint};
use directories::ProjectDirs;
use unchained_common::{IndexEra, MAINNET};
use url::Url;

use crate::cache::CacheStore;
use crate::rpc::MAX_NUMBER_OF_PARALLEL_REQUESTS;
use crate::walk::IndexLayout;

const INDEX_HELP_HEADING: &str = "Index options";
const RPC_HELP_HEADING: &str = "RPC options";

/// Name of the per-user directory roots default to.
pub const PROJECT_DIR_NAME: &str = "unchained";

/// Folder under a chain's cache path that receives per-block text files.
pub const TEXT_SINK_FOLDER: &str = "new_index";

fn project_cache_dir() -> PathBuf {
    match ProjectDirs::from("", "", PROJECT_DIR_NAME) {
        Some(dirs) => dirs.cache_dir().to_path_buf(),
        None => std::env::current_dir().unwrap_or_default(),
    }
}

fn default_cache_root() -> PathBuf {
    project_cache_dir().join("cache")
}

fn default_index_root() -> PathBuf {
    project_cache_dir().join("unchained")
}

/// Where one chain's data lives and which header era it is written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub chain: String,
    pub cache_root: PathBuf,
    pub index_root: PathBuf,
    pub era: IndexEra,
}

impl IndexConfig {
    /// `<cache root>/<chain>`
    pub fn cache_path(&self) -> PathBuf {
        self.cache_root.join(&self.chain)
    }

    /// `<cache root>/<chain>/new_index`
    pub fn text_sink_dir(&self) -> PathBuf {
        self.cache_path().join(TEXT_SINK_FOLDER)
    }

    pub fn cache_store(&self) -> CacheStore {
        CacheStore::new(self.cache_path())
    }

    pub fn layout(&self) -> IndexLayout {
        IndexLayout::new(&self.index_root, &self.chain)
    }
}

#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct CliIndexConfig {
    /// The chain the index partition belongs to.
    #[arg(long, env = "UNCHAINED_CHAIN", help_heading = INDEX_HELP_HEADING, default_value = MAINNET)]
    pub chain: String,
    /// Root of the per-chain block caches.
    #[arg(long, env = "UNCHAINED_CACHE_ROOT", help_heading = INDEX_HELP_HEADING, value_hint = ValueHint::DirPath, default_value = default_cache_root().into_os_string())]
    pub cache_root: PathBuf,
    /// Root of the per-chain index folders.
    #[arg(long, env = "UNCHAINED_INDEX_ROOT", help_heading = INDEX_HELP_HEADING, value_hint = ValueHint::DirPath, default_value = default_index_root().into_os_string())]
    pub index_root: PathBuf,
    /// Header era of the chunks being read or written.
    #[arg(long, env = "UNCHAINED_ERA", help_heading = INDEX_HELP_HEADING, default_value_t = IndexEra::Unchained)]
    pub era: IndexEra,
}

impl From<CliIndexConfig> for IndexConfig {
    fn from(cli: CliIndexConfig) -> Self {
        Self {
            chain: cli.chain,
            cache_root: cli.cache_root,
            index_root: cli.index_root,
            era: cli.era,
        }
    }
}

#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct CliRpcConfig {
    /// The node RPC URL.
    #[arg(short = 'u', long, env = "UNCHAINED_RPC_URL", help_heading = RPC_HELP_HEADING, value_hint = ValueHint::Url)]
    pub rpc_url: Url,
    /// Backoff in milliseconds before the first retry of a failed request.
    #[arg(long, env = "UNCHAINED_BACKOFF", help_heading = RPC_HELP_HEADING, default_value_t = 100)]
    pub backoff: u64,
    /// Retries before a failed request is given up on.
    #[arg(long, env = "UNCHAINED_MAX_RETRIES", help_heading = RPC_HELP_HEADING, default_value_t = 5)]
    pub max_retries: u32,
    /// Upper bound on concurrent requests to the node.
    #[arg(long, env = "UNCHAINED_MAX_PARALLEL_REQUESTS", help_heading = RPC_HELP_HEADING, default_value_t = MAX_NUMBER_OF_PARALLEL_REQUESTS)]
    pub max_parallel_requests: usize,
}
