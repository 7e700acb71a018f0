//! The fixed 44-byte record at the start of every index chunk.
//!
//! The magic number is checked on every read since it is cheap and catches
//! files that are not chunks at all. The integrity hash depends on which era
//! the chunk was written in (see [`expected_header_hash`]), so it is checked
//! separately by [`ChunkHeader::validate_hash`].

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use alloy::primitives::B256;
use thiserror::Error;
use unchained_common::{expected_header_hash, IndexEra, MAGIC_NUMBER};

use crate::codec::{CacheRead, CacheWrite, CodecError, CACHE_VERSION};
use crate::range::{FileRange, RangeError};

/// `magic (4) + hash (32) + address count (4) + appearance count (4)`.
pub const HEADER_WIDTH: usize = 44;

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("unable to read chunk header from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed chunk header in {}: {source}", path.display())]
    Codec {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("magic number in file {} is incorrect, expected {expected:#x}, got {actual:#x}", path.display())]
    Magic {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },
    #[error("header has incorrect hash in {}, expected {expected}, got {actual}", path.display())]
    Hash {
        path: PathBuf,
        expected: B256,
        actual: B256,
    },
    #[error(transparent)]
    Range(#[from] RangeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub magic: u32,
    pub hash: B256,
    pub address_count: u32,
    pub appearance_count: u32,
}

impl ChunkHeader {
    pub fn new(hash: B256, address_count: u32, appearance_count: u32) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            hash,
            address_count,
            appearance_count,
        }
    }

    /// A header stamped with the hash the era rule expects for `range` on
    /// `chain`.
    pub fn for_range(
        chain: &str,
        era: IndexEra,
        range: FileRange,
        address_count: u32,
        appearance_count: u32,
    ) -> Self {
        Self::new(
            expected_header_hash(chain, era, range.first),
            address_count,
            appearance_count,
        )
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        self.magic.write_to(writer)?;
        self.hash.write_to(writer)?;
        self.address_count.write_to(writer)?;
        self.appearance_count.write_to(writer)
    }

    /// Reads exactly [`HEADER_WIDTH`] bytes and checks the magic number.
    /// `path` only labels errors.
    pub fn read_from<R: Read>(reader: &mut R, path: &Path) -> Result<Self, HeaderError> {
        let mut raw = [0u8; HEADER_WIDTH];
        reader.read_exact(&mut raw).map_err(|source| HeaderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let codec_err = |source| HeaderError::Codec {
            path: path.to_path_buf(),
            source,
        };
        let buf = &mut raw.as_slice();
        let header = Self {
            magic: u32::read_from(buf, CACHE_VERSION).map_err(codec_err)?,
            hash: B256::read_from(buf, CACHE_VERSION).map_err(codec_err)?,
            address_count: u32::read_from(buf, CACHE_VERSION).map_err(codec_err)?,
            appearance_count: u32::read_from(buf, CACHE_VERSION).map_err(codec_err)?,
        };
        if header.magic != MAGIC_NUMBER {
            return Err(HeaderError::Magic {
                path: path.to_path_buf(),
                expected: MAGIC_NUMBER,
                actual: header.magic,
            });
        }
        Ok(header)
    }

    /// Checks the integrity hash against the era rule for `range` on `chain`.
    pub fn validate_hash(
        &self,
        chain: &str,
        era: IndexEra,
        range: FileRange,
        path: &Path,
    ) -> Result<(), HeaderError> {
        let expected = expected_header_hash(chain, era, range.first);
        if self.hash != expected {
            return Err(HeaderError::Hash {
                path: path.to_path_buf(),
                expected,
                actual: self.hash,
            });
        }
        Ok(())
    }
}

/// Opens a chunk, reads its header and validates both the magic number and
/// the era-dependent hash. The block range comes from the file name.
pub fn read_header_from_file(
    path: &Path,
    chain: &str,
    era: IndexEra,
) -> Result<ChunkHeader, HeaderError> {
    let range = FileRange::from_filename(path)?;
    let file = File::open(path).map_err(|source| HeaderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let header = ChunkHeader::read_from(&mut BufReader::new(file), path)?;
    header.validate_hash(chain, era, range, path)?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use unchained_common::{HEADER_MAGIC_HASH, LEGACY_HASH_CUTOFF, MAINNET, ZERO_MAGIC_HASH};

    use super::*;

    fn encode(header: &ChunkHeader) -> Vec<u8> {
        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn header_is_44_bytes_and_round_trips() {
        for header in [
            ChunkHeader::new(ZERO_MAGIC_HASH, 0, 0),
            ChunkHeader::new(HEADER_MAGIC_HASH, 1, 2),
            ChunkHeader::new(B256::repeat_byte(0xab), u32::MAX, u32::MAX - 1),
        ] {
            let bytes = encode(&header);
            assert_eq!(bytes.len(), HEADER_WIDTH);
            let decoded = ChunkHeader::read_from(&mut bytes.as_slice(), Path::new("t")).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn corrupted_magic_is_rejected() {
        let mut bytes = encode(&ChunkHeader::new(HEADER_MAGIC_HASH, 3, 4));
        bytes[0] ^= 0xff;
        let err = ChunkHeader::read_from(&mut bytes.as_slice(), Path::new("bad.bin")).unwrap_err();
        assert!(matches!(err, HeaderError::Magic { expected: MAGIC_NUMBER, .. }));
        assert!(err.to_string().contains("bad.bin"));
    }

    #[test]
    fn short_header_is_an_io_error() {
        let bytes = encode(&ChunkHeader::new(HEADER_MAGIC_HASH, 3, 4));
        let err = ChunkHeader::read_from(&mut &bytes[..40], Path::new("short.bin")).unwrap_err();
        assert!(matches!(err, HeaderError::Io { .. }));
    }

    fn check(hash: B256, chain: &str, era: IndexEra, first: u64) -> bool {
        ChunkHeader::new(hash, 0, 0)
            .validate_hash(chain, era, FileRange::new(first, first + 10), Path::new("c.bin"))
            .is_ok()
    }

    #[test]
    fn zero_hash_era_rules() {
        assert!(check(ZERO_MAGIC_HASH, "sepolia", IndexEra::Legacy, 20_000_000));
        assert!(check(ZERO_MAGIC_HASH, MAINNET, IndexEra::Legacy, 0));
        assert!(check(ZERO_MAGIC_HASH, MAINNET, IndexEra::Unchained, LEGACY_HASH_CUTOFF));
        assert!(!check(ZERO_MAGIC_HASH, MAINNET, IndexEra::Unchained, LEGACY_HASH_CUTOFF + 1));
        assert!(!check(ZERO_MAGIC_HASH, "gnosis", IndexEra::Unchained, 0));
    }

    #[test]
    fn magic_hash_era_rules() {
        assert!(check(HEADER_MAGIC_HASH, MAINNET, IndexEra::Unchained, LEGACY_HASH_CUTOFF + 1));
        assert!(check(HEADER_MAGIC_HASH, "gnosis", IndexEra::Unchained, 0));
        assert!(!check(HEADER_MAGIC_HASH, MAINNET, IndexEra::Unchained, 12_000_000));
        assert!(!check(HEADER_MAGIC_HASH, "gnosis", IndexEra::Legacy, 0));
    }

    #[test]
    fn hash_mismatch_names_both_hashes() {
        let err = ChunkHeader::new(HEADER_MAGIC_HASH, 0, 0)
            .validate_hash(MAINNET, IndexEra::Legacy, FileRange::new(0, 1), Path::new("x.bin"))
            .unwrap_err()
            .to_string();
        assert!(err.contains(&ZERO_MAGIC_HASH.to_string()), "{err}");
        assert!(err.contains(&HEADER_MAGIC_HASH.to_string()), "{err}");
        assert!(err.contains("x.bin"), "{err}");
    }

    #[test]
    fn reads_and_validates_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let range = FileRange::new(15_000_000, 15_000_100);
        let path = dir.path().join(range.to_filename("bin"));
        let header = ChunkHeader::for_range(MAINNET, IndexEra::Unchained, range, 5, 9);
        std::fs::write(&path, encode(&header)).unwrap();

        assert_eq!(
            read_header_from_file(&path, MAINNET, IndexEra::Unchained).unwrap(),
            header
        );
        assert!(matches!(
            read_header_from_file(&path, MAINNET, IndexEra::Legacy),
            Err(HeaderError::Hash { .. })
        ));
    }
}
