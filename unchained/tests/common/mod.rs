use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;

use alloy::primitives::B256;
use anyhow::{anyhow, Context as _};
use serde::Deserialize;
use serde_json::Value;
use unchained::config::IndexConfig;
use unchained::rpc::{AppearanceSource, FetchError};
use unchained_common::{IndexEra, MAINNET};
use walkdir::WalkDir;

/// One block worth of node responses, with what scraping it should produce.
///
/// Stored as `tests/cases/<name>.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Case {
    #[serde(skip)]
    pub name: String,
    pub block: u64,
    pub traces: Value,
    pub logs: Value,
    /// Keyed by transaction hash.
    #[serde(default)]
    pub receipts: BTreeMap<String, Value>,
    /// Lines of the block's text file.
    #[serde(default)]
    pub expected: Option<Vec<String>>,
    /// Part of the error scraping the block must fail with.
    #[serde(default)]
    pub fatal: Option<String>,
}

impl Case {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let des = &mut serde_json::Deserializer::from_reader(File::open(path)?);
        let mut case: Case = serde_path_to_error::deserialize(des)?;
        case.name = path
            .file_stem()
            .context("case file has no name")?
            .to_string_lossy()
            .into_owned();
        Ok(case)
    }

    /// The expected text file contents.
    pub fn expected_text(&self) -> Option<String> {
        self.expected
            .as_ref()
            .filter(|lines| !lines.is_empty())
            .map(|lines| lines.iter().map(|line| format!("{line}\n")).collect())
    }
}

pub fn cases() -> anyhow::Result<Vec<Case>> {
    let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/cases");
    let mut cases = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) if entry.path().extension().is_some_and(|it| it == "json") => {
                Some(Case::load(entry.path()).with_context(|| {
                    format!("couldn't load case {}", entry.path().display())
                }))
            }
            Ok(_) => None,
            Err(e) => Some(Err(e.into())),
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    cases.sort_by_key(|it| it.block);
    Ok(cases)
}

#[track_caller]
pub fn case(name: &str) -> Case {
    cases()
        .unwrap()
        .into_iter()
        .find(|it| it.name == name)
        .unwrap_or_else(|| panic!("no test case named {name}"))
}

/// Serves fixture payloads. Unknown blocks and receipts are not found;
/// blocks marked broken fail outright.
#[derive(Debug, Default)]
pub struct FixtureSource {
    blocks: BTreeMap<u64, (Value, Value)>,
    receipts: BTreeMap<String, Value>,
    broken: BTreeSet<u64>,
}

impl FixtureSource {
    pub fn new<'a>(cases: impl IntoIterator<Item = &'a Case>) -> Self {
        let mut source = Self::default();
        for case in cases {
            source
                .blocks
                .insert(case.block, (case.traces.clone(), case.logs.clone()));
            source.receipts.extend(case.receipts.clone());
        }
        source
    }

    pub fn with_broken_block(mut self, block_number: u64) -> Self {
        self.broken.insert(block_number);
        self
    }

    fn block(&self, block_number: u64) -> Result<&(Value, Value), FetchError> {
        if self.broken.contains(&block_number) {
            return Err(anyhow!("connection reset fetching block {block_number}").into());
        }
        self.blocks
            .get(&block_number)
            .ok_or_else(|| FetchError::NotFound(format!("block {block_number}")))
    }
}

impl AppearanceSource for FixtureSource {
    async fn traces_for_block(&self, block_number: u64) -> Result<Value, FetchError> {
        Ok(self.block(block_number)?.0.clone())
    }

    async fn logs_for_block(&self, block_number: u64) -> Result<Value, FetchError> {
        Ok(self.block(block_number)?.1.clone())
    }

    async fn receipt_for_transaction(&self, hash: B256) -> Result<Value, FetchError> {
        self.receipts
            .get(&format!("{hash:#x}"))
            .cloned()
            .ok_or_else(|| FetchError::NotFound(format!("receipt {hash}")))
    }
}

pub fn index_config(root: &Path) -> IndexConfig {
    IndexConfig {
        chain: MAINNET.to_string(),
        cache_root: root.join("cache"),
        index_root: root.join("index"),
        era: IndexEra::Unchained,
    }
}
