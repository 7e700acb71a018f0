use std::io::{Read, Write};

use alloy::primitives::{Address, B256};
use unchained_common::padded_block_id;

use crate::cache::Cacheable;
use crate::codec::{CacheRead, CacheWrite, CodecError};

/// An event log as kept in the cache. `data` stays hex encoded, as the node
/// returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: String,
    pub log_index: u64,
    pub transaction_index: u32,
    pub transaction_hash: Option<B256>,
}

impl CacheWrite for Log {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        self.address.write_to(writer)?;
        self.topics.write_to(writer)?;
        self.data.write_to(writer)?;
        self.log_index.write_to(writer)?;
        self.transaction_index.write_to(writer)?;
        self.transaction_hash.write_to(writer)
    }
}

impl CacheRead for Log {
    fn read_from<R: Read>(reader: &mut R, version: u64) -> Result<Self, CodecError> {
        Ok(Self {
            address: Address::read_from(reader, version)?,
            topics: Vec::read_from(reader, version)?,
            data: String::read_from(reader, version)?,
            log_index: u64::read_from(reader, version)?,
            transaction_index: u32::read_from(reader, version)?,
            transaction_hash: Option::read_from(reader, version)?,
        })
    }
}

/// All logs of one block, in the order the node returned them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogGroup {
    pub block_number: u64,
    pub logs: Vec<Log>,
}

impl CacheWrite for LogGroup {
    fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), CodecError> {
        self.block_number.write_to(writer)?;
        self.logs.write_to(writer)
    }
}

impl CacheRead for LogGroup {
    fn read_from<R: Read>(reader: &mut R, version: u64) -> Result<Self, CodecError> {
        Ok(Self {
            block_number: u64::read_from(reader, version)?,
            logs: Vec::read_from(reader, version)?,
        })
    }
}

impl Cacheable for LogGroup {
    const CACHE_NAME: &'static str = "Log";

    fn cache_id(&self) -> String {
        padded_block_id(self.block_number)
    }
}
