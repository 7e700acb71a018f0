//! The block scraper: a feeder, a pool of fetch workers and a pool of extract
//! workers joined by bounded queues.
//!
//! ```text
//! feeder -> [blocks] -> fetch workers -> [payloads] -> extract workers -> disk
//! ```
//!
//! A full payload queue holds fetch workers back. Any fatal error cancels the
//! shared token so every stage drains and exits; blocks the node does not have
//! are skipped.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use clap::ValueEnum;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::CacheStore;
use crate::config::IndexConfig;
use crate::extract::{extract_block, AddressFilter, BlockPayload, ExtractedBlock};
use crate::fs::write_atomic;
use crate::rpc::{AppearanceSource, FetchError};

/// Capacity of each queue between stages, unless configured.
pub const DEFAULT_CHANNEL_SIZE: usize = 64;

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// One sorted text file per block under `new_index/`.
    #[default]
    Text,
    /// One binary appearance set per block in the sharded cache.
    Cache,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeConfig {
    pub first_block: u64,
    pub block_count: u64,
    pub fetch_workers: usize,
    pub extract_workers: usize,
    pub channel_size: usize,
    pub output: OutputMode,
    /// Also keep each block's logs in the cache.
    pub cache_logs: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            first_block: 0,
            block_count: 1,
            fetch_workers: 10,
            extract_workers: 20,
            channel_size: DEFAULT_CHANNEL_SIZE,
            output: OutputMode::default(),
            cache_logs: false,
        }
    }
}

/// Block numbers by outcome, each list ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeReport {
    pub written: Vec<u64>,
    /// The node did not have the block (or a receipt it needed).
    pub skipped: Vec<u64>,
    /// No traces and no logs, so nothing was written.
    pub empty: Vec<u64>,
}

#[derive(Default)]
struct WorkerOutcome {
    report: ScrapeReport,
    failure: Option<(u64, anyhow::Error)>,
}

impl WorkerOutcome {
    fn fail(&mut self, block_number: u64, err: anyhow::Error, cancel: &CancellationToken) {
        error!("block {block_number}: {err:#}");
        cancel.cancel();
        self.failure = Some((block_number, err));
    }

    fn merge(&mut self, other: WorkerOutcome) {
        self.report.written.extend(other.report.written);
        self.report.skipped.extend(other.report.skipped);
        self.report.empty.extend(other.report.empty);
        if let Some((block, err)) = other.failure {
            if self.failure.as_ref().map_or(true, |(first, _)| block < *first) {
                self.failure = Some((block, err));
            }
        }
    }
}

/// Where finished blocks go.
struct OutputSink {
    mode: OutputMode,
    cache_logs: bool,
    text_dir: PathBuf,
    cache: CacheStore,
}

impl OutputSink {
    fn caches_appearances(&self) -> bool {
        matches!(self.mode, OutputMode::Cache | OutputMode::Both)
    }

    /// A block with no traces and no logs gets no text file, but its empty set
    /// is still cached so that ranges containing it can be consolidated.
    async fn write_empty(&self, block: &ExtractedBlock) -> anyhow::Result<()> {
        if self.caches_appearances() {
            self.cache.write(&block.appearances).await?;
        }
        Ok(())
    }

    async fn write(&self, block: &ExtractedBlock) -> anyhow::Result<()> {
        let set = &block.appearances;
        if matches!(self.mode, OutputMode::Text | OutputMode::Both) {
            let path = self.text_dir.join(set.text_file_name());
            write_atomic(&path, set.to_text().as_bytes())
                .await
                .with_context(|| format!("writing {}", path.display()))?;
        }
        if self.caches_appearances() {
            self.cache.write(set).await?;
        }
        if self.cache_logs {
            self.cache.write(&block.logs).await?;
        }
        Ok(())
    }
}

/// Takes the next item off a shared queue, or `None` once the queue is closed
/// or the run is cancelled.
async fn next<T>(queue: &Mutex<mpsc::Receiver<T>>, cancel: &CancellationToken) -> Option<T> {
    let mut queue = queue.lock().await;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = queue.recv() => item,
    }
}

async fn feed(blocks: std::ops::Range<u64>, tx: mpsc::Sender<u64>, cancel: CancellationToken) {
    for block_number in blocks {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = tx.send(block_number) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Fetches traces and logs together. When both fail, a fatal error wins over
/// a not-found one so that it is never mistaken for a skippable block.
async fn fetch_payload<S: AppearanceSource + ?Sized>(
    source: &S,
    block_number: u64,
) -> Result<BlockPayload, FetchError> {
    let (traces, logs) = tokio::join!(
        source.traces_for_block(block_number),
        source.logs_for_block(block_number)
    );
    match (traces, logs) {
        (Ok(traces), Ok(logs)) => Ok(BlockPayload {
            block_number,
            traces,
            logs,
        }),
        (Err(e @ FetchError::Other(_)), _) | (_, Err(e @ FetchError::Other(_))) => Err(e),
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

async fn fetch_worker<S: AppearanceSource>(
    source: Arc<S>,
    blocks: Arc<Mutex<mpsc::Receiver<u64>>>,
    payloads: mpsc::Sender<BlockPayload>,
    cancel: CancellationToken,
) -> WorkerOutcome {
    let mut outcome = WorkerOutcome::default();
    while let Some(block_number) = next(&blocks, &cancel).await {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            fetched = fetch_payload(source.as_ref(), block_number) => fetched,
        };
        match fetched {
            Ok(payload) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = payloads.send(payload) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(FetchError::NotFound(what)) => {
                info!("block {block_number}: skipped, {what} not found");
                outcome.report.skipped.push(block_number);
            }
            Err(FetchError::Other(e)) => {
                outcome.fail(block_number, e, &cancel);
                break;
            }
        }
    }
    outcome
}

async fn extract_worker<S: AppearanceSource, F: AddressFilter>(
    source: Arc<S>,
    filter: Arc<F>,
    payloads: Arc<Mutex<mpsc::Receiver<BlockPayload>>>,
    sink: Arc<OutputSink>,
    cancel: CancellationToken,
) -> WorkerOutcome {
    let mut outcome = WorkerOutcome::default();
    while let Some(payload) = next(&payloads, &cancel).await {
        let block_number = payload.block_number;
        let extracted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            extracted = extract_block(source.as_ref(), filter.as_ref(), payload) => extracted,
        };
        match extracted {
            Ok(block) if block.is_empty => match sink.write_empty(&block).await {
                Ok(()) => {
                    debug!("block {block_number}: no traces or logs");
                    outcome.report.empty.push(block_number);
                }
                Err(e) => {
                    outcome.fail(block_number, e, &cancel);
                    break;
                }
            },
            Ok(block) => match sink.write(&block).await {
                Ok(()) => {
                    info!(
                        "block {block_number}: {} appearances",
                        block.appearances.len()
                    );
                    outcome.report.written.push(block_number);
                }
                Err(e) => {
                    outcome.fail(block_number, e, &cancel);
                    break;
                }
            },
            Err(FetchError::NotFound(what)) => {
                info!("block {block_number}: skipped, {what} not found");
                outcome.report.skipped.push(block_number);
            }
            Err(FetchError::Other(e)) => {
                outcome.fail(block_number, e, &cancel);
                break;
            }
        }
    }
    outcome
}

/// Scrapes `config.block_count` blocks starting at `config.first_block`.
///
/// Blocks finish in no particular order. On a fatal error the returned error
/// names the first block that was not handled, from which a new run can
/// resume.
pub async fn scrape<S, F>(
    source: Arc<S>,
    filter: Arc<F>,
    index: &IndexConfig,
    config: &ScrapeConfig,
) -> anyhow::Result<ScrapeReport>
where
    S: AppearanceSource + 'static,
    F: AddressFilter + 'static,
{
    let end = config
        .first_block
        .checked_add(config.block_count)
        .ok_or_else(|| anyhow!("block range starting at {} overflows", config.first_block))?;
    let blocks = config.first_block..end;
    let channel_size = config.channel_size.max(1);

    let sink = Arc::new(OutputSink {
        mode: config.output,
        cache_logs: config.cache_logs,
        text_dir: index.text_sink_dir(),
        cache: index.cache_store(),
    });
    let cancel = CancellationToken::new();
    let (block_tx, block_rx) = mpsc::channel(channel_size);
    let (payload_tx, payload_rx) = mpsc::channel(channel_size);
    let block_rx = Arc::new(Mutex::new(block_rx));
    let payload_rx = Arc::new(Mutex::new(payload_rx));

    info!(
        "scraping blocks {}..{} of {} with {} fetch and {} extract workers",
        blocks.start, blocks.end, index.chain, config.fetch_workers, config.extract_workers
    );

    let feeder = tokio::spawn(feed(blocks.clone(), block_tx, cancel.clone()));
    let mut workers = JoinSet::new();
    for _ in 0..config.fetch_workers.max(1) {
        workers.spawn(fetch_worker(
            source.clone(),
            block_rx.clone(),
            payload_tx.clone(),
            cancel.clone(),
        ));
    }
    // Extract workers see the payload queue close once every fetch worker is
    // gone.
    drop(payload_tx);
    for _ in 0..config.extract_workers.max(1) {
        workers.spawn(extract_worker(
            source.clone(),
            filter.clone(),
            payload_rx.clone(),
            sink.clone(),
            cancel.clone(),
        ));
    }

    let mut outcome = WorkerOutcome::default();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(worker) => outcome.merge(worker),
            Err(e) => {
                cancel.cancel();
                outcome.merge(WorkerOutcome {
                    report: ScrapeReport::default(),
                    failure: Some((blocks.start, anyhow!(e).context("scrape worker panicked"))),
                });
            }
        }
    }
    feeder.await.context("block feeder panicked")?;

    let WorkerOutcome { mut report, failure } = outcome;
    report.written.sort_unstable();
    report.skipped.sort_unstable();
    report.empty.sort_unstable();

    if let Some((block_number, err)) = failure {
        let handled: BTreeSet<u64> = report
            .written
            .iter()
            .chain(&report.skipped)
            .chain(&report.empty)
            .copied()
            .collect();
        let resume_from = blocks
            .clone()
            .find(|it| !handled.contains(it))
            .unwrap_or(block_number);
        return Err(err.context(format!(
            "scrape aborted at block {block_number}; {} blocks written, resume from block {resume_from}",
            report.written.len()
        )));
    }

    info!(
        "scraped {} blocks ({} written, {} skipped, {} empty)",
        blocks.end - blocks.start,
        report.written.len(),
        report.skipped.len(),
        report.empty.len()
    );
    Ok(report)
}
