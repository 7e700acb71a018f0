//! Rules for pulling address appearances out of a block's raw traces and logs.
//!
//! Besides the addresses a trace names outright (sender, recipient, created
//! contract, ...), every 32-byte word of call data, return data, log topics and
//! log data is checked for something shaped like a left-padded address. The
//! shape test is an [`AddressFilter`] so it can be tightened without touching
//! the pipeline.

use std::collections::BTreeSet;

use alloy::primitives::{Address, B256};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::appearance::{Appearance, BlockAppearanceSet, REWARD_TX_INDEX};
use crate::logs::{Log, LogGroup};
use crate::rpc::{AppearanceSource, FetchError};

/// Hex characters in one 32-byte word.
const WORD_HEX_LEN: usize = 64;
/// `0x` plus a 4-byte function selector.
const SELECTOR_PREFIX_LEN: usize = 10;
/// `0x`
const HEX_PREFIX_LEN: usize = 2;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("block {block}: unrecognized trace type {kind:?}")]
    UnknownTraceType { block: u64, kind: String },
    #[error("block {block}: {what} is missing required field `{field}`")]
    MissingField {
        block: u64,
        what: &'static str,
        field: &'static str,
    },
    #[error("block {block}: {what} field `{field}` has invalid value {value:?}")]
    InvalidField {
        block: u64,
        what: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("block {block}: malformed {what} payload at `{path}`: {message}")]
    Json {
        block: u64,
        what: &'static str,
        path: String,
        message: String,
    },
}

impl From<ExtractError> for FetchError {
    fn from(e: ExtractError) -> Self {
        FetchError::Other(e.into())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTrace {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub action: TraceAction,
    #[serde(default)]
    pub result: Option<TraceResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub trace_address: Vec<u64>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default)]
    pub transaction_position: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceAction {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub input: Option<String>,
    pub init: Option<String>,
    pub author: Option<Address>,
    pub reward_type: Option<String>,
    pub address: Option<Address>,
    pub refund_address: Option<Address>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TraceResult {
    pub output: Option<String>,
    pub address: Option<Address>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: Option<Address>,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub data: Option<String>,
    pub transaction_index: Option<String>,
    #[serde(default)]
    pub log_index: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawReceipt {
    pub contract_address: Option<Address>,
}

/// Decodes a raw payload, reporting the JSON path of the first bad element.
pub fn decode_payload<T: DeserializeOwned>(
    block: u64,
    what: &'static str,
    payload: Value,
) -> Result<T, ExtractError> {
    serde_path_to_error::deserialize(payload).map_err(|e| ExtractError::Json {
        block,
        what,
        path: e.path().to_string(),
        message: e.inner().to_string(),
    })
}

/// Decides which 32-byte words count as addresses.
pub trait AddressFilter: Send + Sync {
    /// Whether `word` looks like a left-padded address.
    fn is_potential_address(&self, word: &[u8; 32]) -> bool;

    /// Whether `address` is worth recording at all.
    fn is_good_address(&self, address: &Address) -> bool {
        good_address(address)
    }
}

/// Favors recall: accepts any word with a zero 12-byte prefix unless its
/// value is a small integer or it ends in four zero bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConservativeFilter;

impl AddressFilter for ConservativeFilter {
    fn is_potential_address(&self, word: &[u8; 32]) -> bool {
        word[..12].iter().all(|b| *b == 0)
            && word[12..19].iter().any(|b| *b != 0)
            && word[28..].iter().any(|b| *b != 0)
    }
}

/// Drops the zero address and the precompiles below `0x...09`.
pub fn good_address(address: &Address) -> bool {
    *address >= Address::with_last_byte(9)
}

/// A failed contract creation whose address only the receipt knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReceipt {
    pub transaction_hash: B256,
    pub transaction_index: u32,
}

/// Accumulates the appearances of one block.
pub struct BlockExtractor<'a, F: ?Sized> {
    block_number: u64,
    filter: &'a F,
    appearances: BTreeSet<Appearance>,
}

impl<'a, F: AddressFilter + ?Sized> BlockExtractor<'a, F> {
    pub fn new(block_number: u64, filter: &'a F) -> Self {
        Self {
            block_number,
            filter,
            appearances: BTreeSet::new(),
        }
    }

    fn insert(&mut self, address: Option<Address>, transaction_index: u32) {
        if let Some(address) = address.filter(|it| self.filter.is_good_address(it)) {
            self.appearances.insert(Appearance::new(
                address,
                self.block_number,
                transaction_index,
            ));
        }
    }

    fn insert_word(&mut self, word: &[u8; 32], transaction_index: u32) {
        if self.filter.is_potential_address(word) {
            self.insert(Some(Address::from_slice(&word[12..])), transaction_index);
        }
    }

    /// Scans every complete word of `hex_data` after its first `skip`
    /// characters. Trailing partial words are ignored.
    fn scan_hex(&mut self, hex_data: Option<&str>, skip: usize, transaction_index: u32) {
        let Some(data) = hex_data.and_then(|it| it.as_bytes().get(skip..)) else {
            return;
        };
        let mut word = [0u8; 32];
        for chunk in data.chunks_exact(WORD_HEX_LEN) {
            if hex::decode_to_slice(chunk, &mut word).is_ok() {
                self.insert_word(&word, transaction_index);
            }
        }
    }

    /// Records the addresses of every trace. Failed contract creations are
    /// returned so the caller can resolve them from their receipts.
    pub fn add_traces(&mut self, traces: &[RawTrace]) -> Result<Vec<PendingReceipt>, ExtractError> {
        let block = self.block_number;
        let mut pending = Vec::new();
        for trace in traces {
            let action = &trace.action;
            let tx_index = match (trace.kind.as_str(), trace.transaction_position) {
                (_, Some(position)) => position,
                ("reward", None) => REWARD_TX_INDEX,
                (_, None) => {
                    return Err(ExtractError::MissingField {
                        block,
                        what: "trace",
                        field: "transactionPosition",
                    })
                }
            };

            self.scan_hex(action.input.as_deref(), SELECTOR_PREFIX_LEN, tx_index);

            match trace.kind.as_str() {
                "call" => {
                    self.insert(action.from, tx_index);
                    self.insert(action.to, tx_index);
                }
                "reward" => match action.reward_type.as_deref() {
                    Some("block") => self.insert(action.author, REWARD_TX_INDEX),
                    Some("uncle") => debug!("block {block}: uncle reward not recorded"),
                    other => warn!("block {block}: new type of reward {other:?}"),
                },
                "suicide" => {
                    self.insert(action.address, tx_index);
                    self.insert(action.refund_address, tx_index);
                }
                "create" => {
                    let created = trace.result.as_ref().and_then(|it| it.address);
                    self.insert(action.from, tx_index);
                    self.insert(created, tx_index);
                    if trace.trace_address.is_empty() {
                        self.scan_hex(action.init.as_deref(), SELECTOR_PREFIX_LEN, tx_index);
                    }
                    if action.to.is_none() && created.is_none() && trace.error.is_some() {
                        let transaction_hash =
                            trace.transaction_hash.ok_or(ExtractError::MissingField {
                                block,
                                what: "trace",
                                field: "transactionHash",
                            })?;
                        pending.push(PendingReceipt {
                            transaction_hash,
                            transaction_index: tx_index,
                        });
                    }
                }
                other => {
                    return Err(ExtractError::UnknownTraceType {
                        block,
                        kind: other.to_string(),
                    })
                }
            }

            let output = trace.result.as_ref().and_then(|it| it.output.as_deref());
            self.scan_hex(output, HEX_PREFIX_LEN, tx_index);
        }
        Ok(pending)
    }

    /// Records topic and data words of every log. The emitting contract
    /// itself is not recorded.
    pub fn add_logs(&mut self, logs: &[RawLog]) -> Result<(), ExtractError> {
        for log in logs {
            let tx_index = parse_hex_index(self.block_number, log.transaction_index.as_deref())?;
            for topic in &log.topics {
                self.insert_word(&topic.0, tx_index);
            }
            self.scan_hex(log.data.as_deref(), HEX_PREFIX_LEN, tx_index);
        }
        Ok(())
    }

    pub fn add_receipt(&mut self, pending: &PendingReceipt, receipt: &RawReceipt) {
        self.insert(receipt.contract_address, pending.transaction_index);
    }

    pub fn finish(self) -> BlockAppearanceSet {
        BlockAppearanceSet::new(self.block_number, self.appearances)
    }
}

fn parse_hex_index(block: u64, value: Option<&str>) -> Result<u32, ExtractError> {
    let value = value.ok_or(ExtractError::MissingField {
        block,
        what: "log",
        field: "transactionIndex",
    })?;
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|_| ExtractError::InvalidField {
        block,
        what: "log",
        field: "transactionIndex",
        value: value.to_string(),
    })
}

/// Converts raw logs into their cached form.
pub fn to_log_group(block: u64, logs: &[RawLog]) -> Result<LogGroup, ExtractError> {
    let logs = logs
        .iter()
        .map(|raw| {
            let log_index = match raw.log_index.as_deref() {
                Some(value) => {
                    let digits = value.strip_prefix("0x").unwrap_or(value);
                    u64::from_str_radix(digits, 16).map_err(|_| ExtractError::InvalidField {
                        block,
                        what: "log",
                        field: "logIndex",
                        value: value.to_string(),
                    })?
                }
                None => 0,
            };
            Ok(Log {
                address: raw.address.ok_or(ExtractError::MissingField {
                    block,
                    what: "log",
                    field: "address",
                })?,
                topics: raw.topics.clone(),
                data: raw.data.clone().unwrap_or_else(|| "0x".to_string()),
                log_index,
                transaction_index: parse_hex_index(block, raw.transaction_index.as_deref())?,
                transaction_hash: raw.transaction_hash,
            })
        })
        .collect::<Result<_, ExtractError>>()?;
    Ok(LogGroup {
        block_number: block,
        logs,
    })
}

/// The raw traces and logs of one block, as fetched.
#[derive(Debug, Clone)]
pub struct BlockPayload {
    pub block_number: u64,
    pub traces: Value,
    pub logs: Value,
}

#[derive(Debug, Clone)]
pub struct ExtractedBlock {
    pub appearances: BlockAppearanceSet,
    pub logs: LogGroup,
    /// Neither traces nor logs were present.
    pub is_empty: bool,
}

/// Runs every extraction rule over `payload`, fetching receipts from `source`
/// for failed contract creations.
pub async fn extract_block<S, F>(
    source: &S,
    filter: &F,
    payload: BlockPayload,
) -> Result<ExtractedBlock, FetchError>
where
    S: AppearanceSource + ?Sized,
    F: AddressFilter + ?Sized,
{
    let block = payload.block_number;
    let traces: Vec<RawTrace> = decode_payload(block, "trace", payload.traces)?;
    let logs: Vec<RawLog> = decode_payload(block, "log", payload.logs)?;

    let mut extractor = BlockExtractor::new(block, filter);
    let pending = extractor.add_traces(&traces)?;
    extractor.add_logs(&logs)?;
    for it in &pending {
        let raw = source.receipt_for_transaction(it.transaction_hash).await?;
        let receipt: RawReceipt = decode_payload(block, "receipt", raw)?;
        extractor.add_receipt(it, &receipt);
    }

    Ok(ExtractedBlock {
        appearances: extractor.finish(),
        logs: to_log_group(block, &logs)?,
        is_empty: traces.is_empty() && logs.is_empty(),
    })
}
