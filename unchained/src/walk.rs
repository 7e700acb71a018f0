use std::fmt;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::range::FileRange;

/// The on-disk kinds of index data, from most to least confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKind {
    Bloom,
    Final,
    Staging,
    Ripe,
    Unripe,
}

impl CacheKind {
    pub fn folder(self) -> &'static str {
        match self {
            CacheKind::Bloom => "blooms",
            CacheKind::Final => "finalized",
            CacheKind::Staging => "staging",
            CacheKind::Ripe => "ripe",
            CacheKind::Unripe => "unripe",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            CacheKind::Bloom => "bloom",
            CacheKind::Final => "bin",
            CacheKind::Staging | CacheKind::Ripe | CacheKind::Unripe => "txt",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder())
    }
}

/// Where one chain's index lives: `<root>/<chain>/<kind folder>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLayout {
    pub root: PathBuf,
    pub chain: String,
}

impl IndexLayout {
    pub fn new(root: impl Into<PathBuf>, chain: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            chain: chain.into(),
        }
    }

    pub fn chain_root(&self) -> PathBuf {
        self.root.join(&self.chain)
    }

    pub fn folder(&self, kind: CacheKind) -> PathBuf {
        self.chain_root().join(kind.folder())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkEvent {
    File { kind: CacheKind, range: FileRange },
    /// Always the last event a walker sends.
    Done(CacheKind),
}

/// Sends a [`WalkEvent::File`] for every file of `kind` under `folder` whose
/// name encodes a block range, then [`WalkEvent::Done`]. Blocks the calling
/// thread.
///
/// Files with other extensions or unparseable names are skipped. A directory
/// that cannot be read ends the walk early with whatever was found so far.
pub fn walk_cache_folder(folder: &Path, kind: CacheKind, sender: &mpsc::Sender<WalkEvent>) {
    for entry in WalkDir::new(folder).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                debug!("no {kind} folder at {}: {e}", folder.display());
                break;
            }
            Err(e) => {
                warn!("stopped walking {kind} folder {}: {e}", folder.display());
                break;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().and_then(|it| it.to_str()) != Some(kind.extension())
        {
            continue;
        }
        match FileRange::from_filename(path) {
            Ok(range) => {
                if sender.blocking_send(WalkEvent::File { kind, range }).is_err() {
                    // Nobody is listening any more.
                    return;
                }
            }
            Err(e) => debug!("skipping {}: {e}", path.display()),
        }
    }
    let _ = sender.blocking_send(WalkEvent::Done(kind));
}
