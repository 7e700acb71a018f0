use std::{fmt, str::FromStr};

use alloy::primitives::{b256, B256};
use serde::{Deserialize, Serialize};

/// The first four bytes of every index chunk (`0xdeadbeef`, little-endian on
/// disk).
pub const MAGIC_NUMBER: u32 = 0xdeadbeef;

/// Integrity hash carried by chunks written before the unchained migration.
pub const ZERO_MAGIC_HASH: B256 = B256::ZERO;

/// Integrity hash carried by chunks written after the unchained migration.
/// 0x81ae14ba68e372bc9bd4a295b844abd8e72b1de10fcd706e624647701d911da1
pub const HEADER_MAGIC_HASH: B256 =
    b256!("81ae14ba68e372bc9bd4a295b844abd8e72b1de10fcd706e624647701d911da1");

/// The chain whose early chunks were never re-stamped with
/// [`HEADER_MAGIC_HASH`].
pub const MAINNET: &str = "mainnet";

/// Chunks on [`MAINNET`] starting at or below this block keep the zero hash,
/// even in the unchained era.
pub const LEGACY_HASH_CUTOFF: u64 = 13_000_000;

/// Width of the zero-padded decimal block identifiers used in file names.
pub const BLOCK_ID_WIDTH: usize = 9;

/// Which integrity-hash scheme a chain's index was written under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexEra {
    /// Written before the migration; every header carries the zero hash.
    Legacy,
    /// Written after the migration.
    #[default]
    Unchained,
}

impl fmt::Display for IndexEra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexEra::Legacy => "legacy",
            IndexEra::Unchained => "unchained",
        })
    }
}

impl FromStr for IndexEra {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(IndexEra::Legacy),
            "unchained" => Ok(IndexEra::Unchained),
            other => Err(format!("unknown index era {other:?}, expected `legacy` or `unchained`")),
        }
    }
}

/// The integrity hash a chunk of `chain` starting at `first_block` must carry.
pub fn expected_header_hash(chain: &str, era: IndexEra, first_block: u64) -> B256 {
    match era {
        IndexEra::Legacy => ZERO_MAGIC_HASH,
        IndexEra::Unchained if chain == MAINNET && first_block <= LEGACY_HASH_CUTOFF => {
            ZERO_MAGIC_HASH
        }
        IndexEra::Unchained => HEADER_MAGIC_HASH,
    }
}

/// Formats a block number as a [`BLOCK_ID_WIDTH`]-digit identifier.
pub fn padded_block_id(block_number: u64) -> String {
    format!("{block_number:0width$}", width = BLOCK_ID_WIDTH)
}

#[test]
fn test_legacy_era_always_zero() {
    for (chain, first) in [(MAINNET, 0), (MAINNET, 20_000_000), ("sepolia", 5)] {
        assert_eq!(
            expected_header_hash(chain, IndexEra::Legacy, first),
            ZERO_MAGIC_HASH
        );
    }
}

#[test]
fn test_mainnet_legacy_window() {
    assert_eq!(
        expected_header_hash(MAINNET, IndexEra::Unchained, LEGACY_HASH_CUTOFF),
        ZERO_MAGIC_HASH
    );
    assert_eq!(
        expected_header_hash(MAINNET, IndexEra::Unchained, LEGACY_HASH_CUTOFF + 1),
        HEADER_MAGIC_HASH
    );
    assert_eq!(
        expected_header_hash("gnosis", IndexEra::Unchained, 0),
        HEADER_MAGIC_HASH
    );
}

#[test]
fn test_padded_block_id() {
    assert_eq!(padded_block_id(13_000_001), "013000001");
    assert_eq!(padded_block_id(0), "000000000");
    assert_eq!(padded_block_id(1_234_567_890), "1234567890");
}

#[test]
fn test_era_names() {
    assert_eq!(
        serde_json::to_string(&IndexEra::Unchained).unwrap(),
        "\"unchained\""
    );
    for era in [IndexEra::Legacy, IndexEra::Unchained] {
        assert_eq!(era.to_string().parse::<IndexEra>(), Ok(era));
    }
    assert!("pre-migration".parse::<IndexEra>().is_err());
}
