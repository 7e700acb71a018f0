//! Finalized index chunks.
//!
//! Behind the header come two tables with no length prefixes, since the
//! header carries both counts:
//!
//! ```text
//! address table:    (address: 20, offset: u32, count: u32) * address_count
//! appearance table: (block: u32, tx_index: u32)            * appearance_count
//! ```
//!
//! Address records are sorted by address. Each one points at a contiguous run
//! of `count` appearance records starting at `offset`.
//!
//! Unlike cache entries, a chunk body carries no format version tag. The
//! header hash identifies the era the chunk was written in, and the tables are
//! always decoded with the current [`CACHE_VERSION`]. A change to the table
//! layout therefore needs a new era, not a version bump.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use alloy::primitives::Address;
use itertools::Itertools as _;
use thiserror::Error;
use tracing::info;
use unchained_common::{padded_block_id, IndexEra};

use crate::appearance::{Appearance, BlockAppearanceSet};
use crate::cache::{CacheError, CacheStore};
use crate::codec::{CacheRead, CacheWrite, CodecError, CACHE_VERSION};
use crate::fs::write_atomic;
use crate::header::{ChunkHeader, HeaderError, HEADER_WIDTH};
use crate::range::FileRange;

pub const ADDRESS_RECORD_WIDTH: usize = 28;
pub const APPEARANCE_RECORD_WIDTH: usize = 8;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("malformed chunk body in {}: {source}", path.display())]
    Codec {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("chunk I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("chunk {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("block {block} is outside chunk range {range}")]
    OutOfRange { block: u64, range: FileRange },
    #[error("block {0} does not fit in a chunk record")]
    BlockTooLarge(u64),
    #[error("chunk would hold more than {} records", u32::MAX)]
    TooManyRecords,
    #[error("no cached appearances for block {0}")]
    MissingBlock(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRecord {
    pub address: Address,
    pub offset: u32,
    pub count: u32,
}

impl CacheWrite for AddressRecord {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        self.address.write_to(writer)?;
        self.offset.write_to(writer)?;
        self.count.write_to(writer)
    }
}

impl CacheRead for AddressRecord {
    fn read_from<R: Read>(reader: &mut R, version: u64) -> Result<Self, CodecError> {
        Ok(Self {
            address: Address::read_from(reader, version)?,
            offset: u32::read_from(reader, version)?,
            count: u32::read_from(reader, version)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AppearanceRecord {
    pub block: u32,
    pub tx_index: u32,
}

impl CacheWrite for AppearanceRecord {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        self.block.write_to(writer)?;
        self.tx_index.write_to(writer)
    }
}

impl CacheRead for AppearanceRecord {
    fn read_from<R: Read>(reader: &mut R, version: u64) -> Result<Self, CodecError> {
        Ok(Self {
            block: u32::read_from(reader, version)?,
            tx_index: u32::read_from(reader, version)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexChunk {
    pub range: FileRange,
    pub header: ChunkHeader,
    addresses: Vec<AddressRecord>,
    appearances: Vec<AppearanceRecord>,
}

impl IndexChunk {
    /// Builds the chunk covering `range`. Input order does not matter and
    /// duplicates are dropped.
    pub fn from_appearances(
        chain: &str,
        era: IndexEra,
        range: FileRange,
        appearances: impl IntoIterator<Item = Appearance>,
    ) -> Result<Self, ChunkError> {
        let sorted = appearances
            .into_iter()
            .map(|it| {
                if !range.contains(it.block_number) {
                    return Err(ChunkError::OutOfRange {
                        block: it.block_number,
                        range,
                    });
                }
                let block = u32::try_from(it.block_number)
                    .map_err(|_| ChunkError::BlockTooLarge(it.block_number))?;
                Ok((it.address, AppearanceRecord {
                    block,
                    tx_index: it.transaction_index,
                }))
            })
            .collect::<Result<std::collections::BTreeSet<_>, _>>()?;

        let mut addresses = Vec::new();
        let mut records = Vec::with_capacity(sorted.len());
        for (address, group) in &sorted.into_iter().chunk_by(|(address, _)| *address) {
            let offset = u32::try_from(records.len()).map_err(|_| ChunkError::TooManyRecords)?;
            records.extend(group.map(|(_, record)| record));
            let count = u32::try_from(records.len()).map_err(|_| ChunkError::TooManyRecords)?
                - offset;
            addresses.push(AddressRecord {
                address,
                offset,
                count,
            });
        }

        let header = ChunkHeader::for_range(
            chain,
            era,
            range,
            u32::try_from(addresses.len()).map_err(|_| ChunkError::TooManyRecords)?,
            u32::try_from(records.len()).map_err(|_| ChunkError::TooManyRecords)?,
        );
        Ok(Self {
            range,
            header,
            addresses,
            appearances: records,
        })
    }

    pub fn addresses(&self) -> &[AddressRecord] {
        &self.addresses
    }

    pub fn appearance_count(&self) -> usize {
        self.appearances.len()
    }

    /// Appearances of `address`, oldest first; empty if it never appears.
    pub fn lookup(&self, address: &Address) -> &[AppearanceRecord] {
        match self
            .addresses
            .binary_search_by_key(address, |record| record.address)
        {
            Ok(i) => {
                let record = &self.addresses[i];
                let start = record.offset as usize;
                &self.appearances[start..start + record.count as usize]
            }
            Err(_) => &[],
        }
    }

    pub fn file_name(&self) -> String {
        self.range.to_filename("bin")
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut bytes = Vec::with_capacity(
            HEADER_WIDTH
                + self.addresses.len() * ADDRESS_RECORD_WIDTH
                + self.appearances.len() * APPEARANCE_RECORD_WIDTH,
        );
        self.header.write_to(&mut bytes)?;
        for record in &self.addresses {
            record.write_to(&mut bytes)?;
        }
        for record in &self.appearances {
            record.write_to(&mut bytes)?;
        }
        Ok(bytes)
    }

    /// Writes the chunk into `dir` under its range file name.
    pub async fn write(&self, dir: &Path) -> Result<PathBuf, ChunkError> {
        let path = dir.join(self.file_name());
        let bytes = self.to_bytes().map_err(|source| ChunkError::Codec {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes)
            .await
            .map_err(|source| ChunkError::Io {
                path: path.clone(),
                source,
            })?;
        info!(
            "wrote chunk {} ({} addresses, {} appearances)",
            path.display(),
            self.addresses.len(),
            self.appearances.len()
        );
        Ok(path)
    }

    /// Reads a chunk, validating its header against the era rule and its
    /// tables against each other.
    pub fn read(path: &Path, chain: &str, era: IndexEra) -> Result<Self, ChunkError> {
        let range = FileRange::from_filename(path).map_err(HeaderError::from)?;
        let bytes = std::fs::read(path).map_err(|source| ChunkError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut rest = bytes.as_slice();
        let header = ChunkHeader::read_from(&mut rest, path)?;
        header.validate_hash(chain, era, range, path)?;

        let corrupt = |reason: String| ChunkError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };
        let expected = header.address_count as usize * ADDRESS_RECORD_WIDTH
            + header.appearance_count as usize * APPEARANCE_RECORD_WIDTH;
        if rest.len() != expected {
            return Err(corrupt(format!(
                "expected {expected} body bytes, found {}",
                rest.len()
            )));
        }

        let codec_err = |source| ChunkError::Codec {
            path: path.to_path_buf(),
            source,
        };
        let addresses = (0..header.address_count)
            .map(|_| AddressRecord::read_from(&mut rest, CACHE_VERSION))
            .collect::<Result<Vec<_>, _>>()
            .map_err(codec_err)?;
        let appearances = (0..header.appearance_count)
            .map(|_| AppearanceRecord::read_from(&mut rest, CACHE_VERSION))
            .collect::<Result<Vec<_>, _>>()
            .map_err(codec_err)?;

        for (prev, next) in addresses.iter().tuple_windows() {
            if prev.address >= next.address {
                return Err(corrupt(format!(
                    "address table is not sorted at {}",
                    next.address
                )));
            }
        }
        for record in &addresses {
            let end = u64::from(record.offset) + u64::from(record.count);
            if end > u64::from(header.appearance_count) {
                return Err(corrupt(format!(
                    "records of {} end at {end}, past {} appearances",
                    record.address, header.appearance_count
                )));
            }
        }

        Ok(Self {
            range,
            header,
            addresses,
            appearances,
        })
    }
}

/// Gathers the cached appearances of every block in `range` into one chunk.
/// Every block must already be cached.
pub async fn consolidate(
    cache: &CacheStore,
    chain: &str,
    era: IndexEra,
    range: FileRange,
) -> Result<IndexChunk, ChunkError> {
    let mut appearances = Vec::new();
    for block in range.first..=range.last {
        let set = cache
            .read::<BlockAppearanceSet>(&padded_block_id(block))
            .await?
            .ok_or(ChunkError::MissingBlock(block))?;
        appearances.extend_from_slice(set.appearances());
    }
    IndexChunk::from_appearances(chain, era, range, appearances)
}

#[cfg(test)]
mod tests {
    use alloy::primitives::address;
    use unchained_common::MAINNET;

    use super::*;

    const A: Address = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa01");
    const B: Address = address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb02");
    const C: Address = address!("cccccccccccccccccccccccccccccccccccccc03");

    fn sample() -> IndexChunk {
        IndexChunk::from_appearances(
            "gnosis",
            IndexEra::Unchained,
            FileRange::new(100, 102),
            [
                Appearance::new(B, 101, 0),
                Appearance::new(A, 102, 4),
                Appearance::new(A, 100, 1),
                Appearance::new(B, 101, 0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn groups_records_by_address() {
        let chunk = sample();
        assert_eq!(chunk.header.address_count, 2);
        assert_eq!(chunk.header.appearance_count, 3);
        assert_eq!(
            chunk.lookup(&A),
            [
                AppearanceRecord { block: 100, tx_index: 1 },
                AppearanceRecord { block: 102, tx_index: 4 }
            ]
        );
        assert_eq!(chunk.lookup(&B), [AppearanceRecord { block: 101, tx_index: 0 }]);
        assert!(chunk.lookup(&C).is_empty());
        assert_eq!(chunk.file_name(), "000000100-000000102.bin");
    }

    #[test]
    fn rejects_appearances_outside_range() {
        let err = IndexChunk::from_appearances(
            MAINNET,
            IndexEra::Unchained,
            FileRange::new(100, 102),
            [Appearance::new(A, 103, 0)],
        )
        .unwrap_err();
        assert!(matches!(err, ChunkError::OutOfRange { block: 103, .. }));
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = sample();
        let path = chunk.write(dir.path()).await.unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len() as usize,
            HEADER_WIDTH + 2 * ADDRESS_RECORD_WIDTH + 3 * APPEARANCE_RECORD_WIDTH
        );
        assert_eq!(IndexChunk::read(&path, "gnosis", IndexEra::Unchained).unwrap(), chunk);
        assert!(matches!(
            IndexChunk::read(&path, "gnosis", IndexEra::Legacy),
            Err(ChunkError::Header(HeaderError::Hash { .. }))
        ));
    }

    #[test]
    fn body_follows_header_without_version_tag() {
        let bytes = sample().to_bytes().unwrap();
        let first_record = &bytes[HEADER_WIDTH..HEADER_WIDTH + ADDRESS_RECORD_WIDTH];
        assert_eq!(&first_record[..20], A.as_slice());
        assert_eq!(&first_record[20..24], 0u32.to_le_bytes());
        assert_eq!(&first_record[24..], 2u32.to_le_bytes());
    }

    #[test]
    fn truncated_body_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = sample();
        let path = dir.path().join(chunk.file_name());
        let bytes = chunk.to_bytes().unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        assert!(matches!(
            IndexChunk::read(&path, "gnosis", IndexEra::Unchained),
            Err(ChunkError::Corrupt { .. })
        ));
    }

    #[test]
    fn dangling_offset_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = sample();
        let path = dir.path().join(chunk.file_name());
        let mut bytes = chunk.to_bytes().unwrap();
        // count of the second address record
        let at = HEADER_WIDTH + ADDRESS_RECORD_WIDTH + 24;
        bytes[at..at + 4].copy_from_slice(&9u32.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        let err = IndexChunk::read(&path, "gnosis", IndexEra::Unchained).unwrap_err();
        assert!(err.to_string().contains("past 3 appearances"), "{err}");
    }

    #[tokio::test]
    async fn consolidates_cached_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStore::new(dir.path());
        for (block, address) in [(100, A), (101, B), (102, A)] {
            let set = BlockAppearanceSet::new(
                block,
                [Appearance::new(address, block, 0)].into_iter().collect(),
            );
            cache.write(&set).await.unwrap();
        }

        let chunk = consolidate(&cache, MAINNET, IndexEra::Unchained, FileRange::new(100, 102))
            .await
            .unwrap();
        assert_eq!(chunk.lookup(&A).len(), 2);
        assert_eq!(chunk.lookup(&B).len(), 1);

        let err = consolidate(&cache, MAINNET, IndexEra::Unchained, FileRange::new(100, 103))
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::MissingBlock(103)));
    }
}
