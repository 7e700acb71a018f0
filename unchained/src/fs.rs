use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncWriteExt;
use tracing::debug;

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sibling path a file is staged under before being renamed into place.
/// Unique per process and per call, so concurrent writers of one path never
/// share a staging file.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|it| it.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{n}.tmp", std::process::id()))
}

async fn stage_and_rename(staged: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut f = tokio::fs::File::create(staged).await?;
    f.write_all(bytes).await?;
    f.sync_all().await?;
    drop(f);
    tokio::fs::rename(staged, path).await
}

/// Writes `bytes` to `path` so that readers only ever see the old file or the
/// complete new one. Parent directories are created as needed. On failure the
/// staging file is removed.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let staged = staging_path(path);
    let result = stage_and_rename(&staged, path, bytes).await;
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            debug!("could not remove {}: {e}", staged.display());
        }
    }
    result
}
