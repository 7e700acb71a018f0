//! Block-sharded placement of serialized entities.
//!
//! An entity named `Log` with identifier `013000001` lives at
//! `logs/01/30/00/013000001.bin` under the cache root. Only the first six
//! digits pick the shard, so every level holds at most 100 entries.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::codec::{read_versioned, to_versioned_bytes, CacheRead, CacheWrite, CodecError};
use crate::fs::write_atomic;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache identifier {0:?} must be at least six decimal digits")]
    Identifier(String),
    #[error("unable to decode cache entry {}: {source}", path.display())]
    Codec {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("cache entry {} has {count} unexpected trailing bytes", path.display())]
    TrailingBytes { path: PathBuf, count: usize },
    #[error("cache I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An entity that can be serialized into the cache and found again by its
/// identifier.
pub trait Cacheable: CacheWrite + CacheRead {
    /// Singular, capitalized entity name, e.g. `"Log"`.
    const CACHE_NAME: &'static str;
    const EXTENSION: &'static str = "bin";

    /// Fixed-width decimal identifier, e.g. a zero-padded block number.
    fn cache_id(&self) -> String;
}

/// `<name, lower-cased and pluralized>/<xx>/<yy>/<zz>`, from the first six
/// digits of `id`.
pub fn cache_directory(name: &str, id: &str) -> Result<PathBuf, CacheError> {
    if id.len() < 6 || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CacheError::Identifier(id.to_string()));
    }
    let mut dir = PathBuf::from(format!("{}s", name.to_lowercase()));
    dir.extend([&id[0..2], &id[2..4], &id[4..6]]);
    Ok(dir)
}

/// Path of entity `T` with identifier `id`, relative to the cache root.
pub fn cache_location<T: Cacheable>(id: &str) -> Result<PathBuf, CacheError> {
    Ok(cache_directory(T::CACHE_NAME, id)?.join(format!("{id}.{}", T::EXTENSION)))
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of<T: Cacheable>(&self, id: &str) -> Result<PathBuf, CacheError> {
        Ok(self.root.join(cache_location::<T>(id)?))
    }

    /// Serializes `item` with the current version tag, replacing any previous
    /// file as a whole.
    pub async fn write<T: Cacheable>(&self, item: &T) -> Result<PathBuf, CacheError> {
        let path = self.path_of::<T>(&item.cache_id())?;
        let bytes = to_versioned_bytes(item).map_err(|source| CacheError::Codec {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| CacheError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// `Ok(None)` if nothing is cached under `id`.
    pub async fn read<T: Cacheable>(&self, id: &str) -> Result<Option<T>, CacheError> {
        let path = self.path_of::<T>(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        let mut rest = bytes.as_slice();
        let item = read_versioned(&mut rest).map_err(|source| CacheError::Codec {
            path: path.clone(),
            source,
        })?;
        if !rest.is_empty() {
            return Err(CacheError::TrailingBytes {
                path,
                count: rest.len(),
            });
        }
        Ok(Some(item))
    }
}
