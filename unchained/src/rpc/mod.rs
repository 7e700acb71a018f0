use std::future::Future;

use alloy::primitives::B256;
use alloy::rpc::json_rpc::RpcParam;
use alloy::transports::RpcError;
use alloy::{providers::Provider, transports::Transport};
use anyhow::Context as _;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;

pub mod retry;

/// Upper bound on in-flight requests per [`RpcSource`], unless configured.
pub const MAX_NUMBER_OF_PARALLEL_REQUESTS: usize = 128;

#[derive(Error, Debug)]
pub enum FetchError {
    /// The node does not (yet) have the requested data. The unit of work is
    /// skipped and the run continues.
    #[error("{0} not found")]
    NotFound(String),
    /// Anything else. The run is aborted.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound(_))
    }
}

/// Raw per-block payloads the appearance pipeline consumes.
pub trait AppearanceSource: Send + Sync {
    /// JSON array of trace objects for every transaction in the block.
    fn traces_for_block(
        &self,
        block_number: u64,
    ) -> impl Future<Output = Result<Value, FetchError>> + Send;

    /// JSON array of log objects emitted in the block.
    fn logs_for_block(
        &self,
        block_number: u64,
    ) -> impl Future<Output = Result<Value, FetchError>> + Send;

    /// JSON receipt; only needed to recover the address of a contract whose
    /// construction failed.
    fn receipt_for_transaction(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Value, FetchError>> + Send;
}

/// Chain identity and head, for freshness reports.
pub trait ChainClient: Send + Sync {
    fn latest_block_number(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    /// `(chain id, network id)`
    fn client_ids(&self) -> impl Future<Output = anyhow::Result<(u64, u64)>> + Send;
}

/// [`AppearanceSource`] and [`ChainClient`] over an alloy provider.
pub struct RpcSource<ProviderT, TransportT> {
    provider: ProviderT,
    // The HTTP transport has an unbounded connection pool, so concurrency is
    // bounded here instead.
    semaphore: Semaphore,
    _phantom: std::marker::PhantomData<TransportT>,
}

impl<ProviderT, TransportT> RpcSource<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    pub fn new(provider: ProviderT, max_parallel_requests: usize) -> Self {
        Self {
            provider,
            semaphore: Semaphore::new(max_parallel_requests.max(1)),
            _phantom: std::marker::PhantomData,
        }
    }

    async fn request<P: RpcParam>(
        &self,
        method: &'static str,
        params: P,
        what: impl FnOnce() -> String,
    ) -> Result<Value, FetchError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .context("rpc request semaphore closed")?;
        match self.provider.raw_request::<_, Value>(method.into(), params).await {
            Ok(Value::Null) | Err(RpcError::NullResp) => Err(FetchError::NotFound(what())),
            Err(RpcError::ErrorResp(payload))
                if payload.message.to_lowercase().contains("not found") =>
            {
                Err(FetchError::NotFound(what()))
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("{method} failed for {}", what()))
                .into()),
            Ok(value) => Ok(value),
        }
    }
}

impl<ProviderT, TransportT> AppearanceSource for RpcSource<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    async fn traces_for_block(&self, block_number: u64) -> Result<Value, FetchError> {
        self.request("trace_block", (format!("{block_number:#x}"),), || {
            format!("traces for block {block_number}")
        })
        .await
    }

    async fn logs_for_block(&self, block_number: u64) -> Result<Value, FetchError> {
        let hex_block = format!("{block_number:#x}");
        let filter = json!({ "fromBlock": hex_block, "toBlock": hex_block });
        self.request("eth_getLogs", (filter,), || {
            format!("logs for block {block_number}")
        })
        .await
    }

    async fn receipt_for_transaction(&self, hash: B256) -> Result<Value, FetchError> {
        self.request("eth_getTransactionReceipt", (hash,), || {
            format!("receipt for transaction {hash}")
        })
        .await
    }
}

impl<ProviderT, TransportT> ChainClient for RpcSource<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    async fn latest_block_number(&self) -> anyhow::Result<u64> {
        let _permit = self.semaphore.acquire().await?;
        self.provider
            .get_block_number()
            .await
            .context("could not retrieve latest block number from the provider")
    }

    async fn client_ids(&self) -> anyhow::Result<(u64, u64)> {
        let _permit = self.semaphore.acquire().await?;
        let chain_id = self
            .provider
            .get_chain_id()
            .await
            .context("could not retrieve chain id from the provider")?;
        let network_id = self
            .provider
            .get_net_version()
            .await
            .context("could not retrieve network id from the provider")?;
        Ok((chain_id, network_id))
    }
}
