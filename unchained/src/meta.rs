//! How far the index has been built, derived from what is on disk.

use std::fmt;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinSet};
use tracing::warn;

use crate::rpc::ChainClient;
use crate::walk::{walk_cache_folder, CacheKind, IndexLayout, WalkEvent};

/// Block value reported for every freshness field in test mode.
pub const TEST_MODE_BLOCK: u64 = 0xdeadbeef;

/// The kinds scanned for a freshness report. Blooms and finalized chunks
/// both count towards the finalized tier.
pub const SCANNED_KINDS: [CacheKind; 5] = [
    CacheKind::Bloom,
    CacheKind::Final,
    CacheKind::Staging,
    CacheKind::Ripe,
    CacheKind::Unripe,
];

const WALK_CHANNEL_SIZE: usize = 64;

/// Highest block reached per tier. After [`Freshness::clamped`],
/// `unripe >= ripe >= staging >= finalized`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Freshness {
    pub finalized: u64,
    pub staging: u64,
    pub ripe: u64,
    pub unripe: u64,
}

impl Freshness {
    pub fn observe(&mut self, event: &WalkEvent) {
        let WalkEvent::File { kind, range } = event else {
            return;
        };
        let slot = match kind {
            CacheKind::Bloom | CacheKind::Final => &mut self.finalized,
            CacheKind::Staging => &mut self.staging,
            CacheKind::Ripe => &mut self.ripe,
            CacheKind::Unripe => &mut self.unripe,
        };
        *slot = (*slot).max(range.last);
    }

    /// A tier never trails the one that supersedes it. An unset staging tier
    /// takes the finalized value.
    pub fn clamped(self) -> Self {
        let staging = self.staging.max(self.finalized);
        let ripe = self.ripe.max(staging);
        Self {
            finalized: self.finalized,
            staging,
            ripe,
            unripe: self.unripe.max(ripe),
        }
    }
}

/// Walks the bloom, finalized, staging, ripe and unripe folders of `layout`
/// concurrently and reduces what they find.
pub async fn scan_freshness(layout: &IndexLayout) -> anyhow::Result<Freshness> {
    let (tx, mut rx) = mpsc::channel(WALK_CHANNEL_SIZE);
    let mut walkers = JoinSet::new();
    for kind in SCANNED_KINDS {
        let folder = layout.folder(kind);
        let tx = tx.clone();
        walkers.spawn_blocking(move || walk_cache_folder(&folder, kind, &tx));
    }
    drop(tx);

    let mut freshness = Freshness::default();
    let mut remaining = SCANNED_KINDS.len();
    while remaining > 0 {
        match rx.recv().await {
            Some(WalkEvent::Done(_)) => remaining -= 1,
            Some(event) => freshness.observe(&event),
            None => {
                warn!("{remaining} walkers ended without reporting");
                break;
            }
        }
    }

    while let Some(joined) = walkers.join_next().await {
        joined.context("cache folder walker panicked")?;
    }
    Ok(freshness.clamped())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaData {
    #[serde(rename = "client")]
    pub latest: u64,
    pub finalized: u64,
    pub staging: u64,
    pub ripe: u64,
    pub unripe: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub network_id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chain: String,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl MetaData {
    /// Head of the chain from `client`, tiers from the index under `layout`.
    /// In test mode every block field is [`TEST_MODE_BLOCK`] and nothing is
    /// scanned.
    pub async fn fetch<C: ChainClient + ?Sized>(
        client: &C,
        layout: &IndexLayout,
        test_mode: bool,
    ) -> anyhow::Result<Self> {
        let (chain_id, network_id) = client.client_ids().await?;
        let chain = layout.chain.clone();

        if test_mode {
            return Ok(Self {
                latest: TEST_MODE_BLOCK,
                finalized: TEST_MODE_BLOCK,
                staging: TEST_MODE_BLOCK,
                ripe: TEST_MODE_BLOCK,
                unripe: TEST_MODE_BLOCK,
                chain_id,
                network_id,
                chain,
            });
        }

        let latest = client.latest_block_number().await?;
        let freshness = scan_freshness(layout)
            .await
            .with_context(|| format!("scanning index at {}", layout.chain_root().display()))?;
        Ok(Self {
            latest,
            finalized: freshness.finalized,
            staging: freshness.staging,
            ripe: freshness.ripe,
            unripe: freshness.unripe,
            chain_id,
            network_id,
            chain,
        })
    }

    /// Blocks between `block_number` and the head; negative if the block is
    /// ahead of what the client reported.
    pub fn age(&self, block_number: u64) -> i64 {
        self.latest as i64 - block_number as i64
    }
}

impl fmt::Display for MetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
