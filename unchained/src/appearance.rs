use std::collections::BTreeSet;
use std::fmt;
use std::io::{Read, Write};

use alloy::primitives::Address;
use unchained_common::padded_block_id;

use crate::cache::Cacheable;
use crate::codec::{CacheRead, CacheWrite, CodecError};

/// Transaction index recorded for a block reward's author.
pub const REWARD_TX_INDEX: u32 = 99999;

/// One occurrence of an address in a block.
///
/// Ordering is by address, then block, then transaction index, which matches
/// the byte order of the rendered text lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Appearance {
    pub address: Address,
    pub block_number: u64,
    pub transaction_index: u32,
}

impl Appearance {
    pub fn new(address: Address, block_number: u64, transaction_index: u32) -> Self {
        Self {
            address,
            block_number,
            transaction_index,
        }
    }
}

/// `<address>\t<9-digit block>\t<5-digit tx index>`
impl fmt::Display for Appearance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}\t{}\t{:05}",
            self.address,
            padded_block_id(self.block_number),
            self.transaction_index
        )
    }
}

impl CacheWrite for Appearance {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        self.address.write_to(writer)?;
        self.block_number.write_to(writer)?;
        self.transaction_index.write_to(writer)
    }
}

impl CacheRead for Appearance {
    fn read_from<R: Read>(reader: &mut R, version: u64) -> Result<Self, CodecError> {
        Ok(Self {
            address: Address::read_from(reader, version)?,
            block_number: u64::read_from(reader, version)?,
            transaction_index: u32::read_from(reader, version)?,
        })
    }
}

/// Every appearance found in one block, sorted and free of duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockAppearanceSet {
    pub block_number: u64,
    appearances: Vec<Appearance>,
}

impl BlockAppearanceSet {
    pub fn new(block_number: u64, appearances: BTreeSet<Appearance>) -> Self {
        Self {
            block_number,
            appearances: appearances.into_iter().collect(),
        }
    }

    pub fn appearances(&self) -> &[Appearance] {
        &self.appearances
    }

    pub fn len(&self) -> usize {
        self.appearances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appearances.is_empty()
    }

    /// Newline-terminated lines, one per appearance.
    pub fn to_text(&self) -> String {
        self.appearances
            .iter()
            .map(|it| format!("{it}\n"))
            .collect()
    }

    /// `<block>.txt`, the name of the text artifact for this block.
    pub fn text_file_name(&self) -> String {
        format!("{}.txt", padded_block_id(self.block_number))
    }
}

impl CacheWrite for BlockAppearanceSet {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        self.block_number.write_to(writer)?;
        self.appearances.write_to(writer)
    }
}

impl CacheRead for BlockAppearanceSet {
    fn read_from<R: Read>(reader: &mut R, version: u64) -> Result<Self, CodecError> {
        let block_number = u64::read_from(reader, version)?;
        let appearances = Vec::<Appearance>::read_from(reader, version)?;
        // Files are not trusted to be sorted or duplicate-free.
        Ok(Self::new(block_number, appearances.into_iter().collect()))
    }
}

impl Cacheable for BlockAppearanceSet {
    const CACHE_NAME: &'static str = "Appearance";

    fn cache_id(&self) -> String {
        padded_block_id(self.block_number)
    }
}
