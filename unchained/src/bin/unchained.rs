use std::sync::Arc;

use alloy::providers::RootProvider;
use alloy::transports::http::ReqwestTransport;
use anyhow::{bail, Context as _, Result};
use clap::Parser;
use cli::Command;
use tracing::info;
use unchained::chunk::consolidate;
use unchained::config::{CliRpcConfig, IndexConfig};
use unchained::env::load_dotenvy_vars_if_present;
use unchained::extract::ConservativeFilter;
use unchained::header::read_header_from_file;
use unchained::meta::MetaData;
use unchained::range::FileRange;
use unchained::rpc::retry::{build_http_retry_provider, RetryService};
use unchained::rpc::RpcSource;
use unchained::scrape::{scrape, ScrapeConfig};
use unchained::walk::CacheKind;

#[path = "unchained/cli.rs"]
mod cli;

type HttpSource =
    RpcSource<RootProvider<RetryService<ReqwestTransport>>, RetryService<ReqwestTransport>>;

fn rpc_source(rpc: &CliRpcConfig) -> HttpSource {
    RpcSource::new(
        build_http_retry_provider(rpc.rpc_url.clone(), rpc.backoff, rpc.max_retries),
        rpc.max_parallel_requests,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenvy_vars_if_present();
    unchained::tracing::init();

    let args = cli::Cli::parse();
    let index = IndexConfig::from(args.index);

    match args.command {
        Command::Scrape {
            rpc,
            first_block,
            block_count,
            fetch_workers,
            extract_workers,
            channel_size,
            output,
            cache_logs,
        } => {
            let config = ScrapeConfig {
                first_block,
                block_count,
                fetch_workers,
                extract_workers,
                channel_size,
                output,
                cache_logs,
            };
            let report = scrape(
                Arc::new(rpc_source(&rpc)),
                Arc::new(ConservativeFilter),
                &index,
                &config,
            )
            .await?;
            if let Some(last) = report.written.last() {
                info!("last block written: {last}");
            }
        }
        Command::Meta { rpc, test_mode } => {
            let meta = MetaData::fetch(&rpc_source(&rpc), &index.layout(), test_mode).await?;
            println!("{meta}");
        }
        Command::Chunk { first, last } => {
            if last < first {
                bail!("chunk range ends ({last}) before it starts ({first})");
            }
            let range = FileRange::new(first, last);
            let chunk = consolidate(&index.cache_store(), &index.chain, index.era, range)
                .await
                .with_context(|| {
                    format!(
                        "consolidating blocks {range}; every block must first be scraped with \
                         `--output cache` or `--output both`"
                    )
                })?;
            let path = chunk
                .write(&index.layout().folder(CacheKind::Final))
                .await?;
            println!("{}", path.display());
        }
        Command::Header { path } => {
            let header = read_header_from_file(&path, &index.chain, index.era)?;
            println!(
                "magic: {:#x}\nhash: {}\naddresses: {}\nappearances: {}",
                header.magic, header.hash, header.address_count, header.appearance_count
            );
        }
    }

    Ok(())
}
