//! EVM JSON-RPC implementation of [`ChainClient`] built on `jsonrpsee`.

use super::chain::{BlockWrapper, ChainClient};
use super::helpers::{block_from_value, block_number, parse_hex_quantity, to_hex_quantity};
use crate::processor::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use crate::rpc::auth::build_auth_headers;
use crate::rpc::metrics::{RpcMetrics, RpcMetricsSnapshot};
use crate::rpc::options::RpcClientOptions;
use crate::runtime::config::IndexerConfig;
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use jsonrpsee::core::client::{ClientT, Error as JsonRpcError};
use jsonrpsee::core::params::{ArrayParams, BatchRequestBuilder};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use jsonrpsee::types::ErrorObject;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::{timeout, Instant};

#[derive(Debug)]
pub enum RpcError {
    Timeout { method: &'static str },
    InvalidQuantity { value: String },
    MissingBlock { height: u64 },
    Cancelled,
}

impl RpcError {
    /// Whether `err` only reports that the run was shutting down.
    pub fn is_cancellation(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<RpcError>(), Some(RpcError::Cancelled))
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout { method } => write!(f, "rpc method {method} timed out"),
            RpcError::InvalidQuantity { value } => {
                write!(f, "malformed hex quantity {value:?} in rpc response")
            }
            RpcError::MissingBlock { height } => {
                write!(f, "node returned no block at height {height}")
            }
            RpcError::Cancelled => f.write_str("chain call cancelled by shutdown"),
        }
    }
}

impl std::error::Error for RpcError {}

#[derive(Debug, Clone)]
pub struct JsonRpcChainClient {
    rpc_url: Arc<String>,
    client: HttpClient,
    options: RpcClientOptions,
    metrics: Arc<RpcMetrics>,
    genesis: Arc<OnceCell<String>>,
}

impl ChainClient for JsonRpcChainClient {
    fn finalized_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.finalized_height())
    }

    fn best_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.best_height())
    }

    fn genesis_hash(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(self.genesis_hash())
    }

    fn fetch_blocks<'a>(&'a self, heights: &'a [u64]) -> BoxFuture<'a, Result<Vec<BlockWrapper>>> {
        Box::pin(self.fetch_blocks(heights))
    }

    fn estimated_block_interval(&self) -> Duration {
        self.options.block_interval
    }
}

impl JsonRpcChainClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_options(url, None, None, RpcClientOptions::default())
    }

    pub fn with_options(
        url: impl Into<String>,
        user: Option<&str>,
        password: Option<&str>,
        options: RpcClientOptions,
    ) -> Result<Self> {
        options.validate()?;

        let rpc_url = url.into();
        let headers = build_auth_headers(user, password)?;
        let max_request_body_size = options.max_request_body_bytes.min(u32::MAX as usize) as u32;
        let max_response_body_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .max_request_size(max_request_body_size)
            .max_response_size(max_response_body_size)
            .build(&rpc_url)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;

        Ok(Self {
            rpc_url: Arc::new(rpc_url),
            client,
            options,
            metrics: Arc::new(RpcMetrics::default()),
            genesis: Arc::new(OnceCell::new()),
        })
    }

    pub fn from_config(config: &IndexerConfig) -> Result<Self> {
        let options = RpcClientOptions {
            request_timeout: config.rpc_timeout(),
            block_interval: config.block_interval(),
            ..RpcClientOptions::default()
        };
        Self::with_options(
            config.rpc_url().to_owned(),
            config.rpc_user(),
            config.rpc_password(),
            options,
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.rpc_url
    }

    pub fn metrics(&self) -> RpcMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn best_height(&self) -> Result<u64> {
        const METHOD: &str = "eth_blockNumber";
        let raw: String = self
            .call_with_retry(METHOD, || self.request_once(METHOD, rpc_params![]))
            .await?;
        parse_hex_quantity(&raw)
    }

    pub async fn finalized_height(&self) -> Result<u64> {
        const METHOD: &str = "eth_getBlockByNumber";
        let block: Value = self
            .call_with_retry(METHOD, || {
                self.request_once(METHOD, rpc_params!["finalized", false])
            })
            .await?;
        if block.is_null() {
            bail!("node returned no finalized block");
        }
        block_number(&block)
    }

    /// Hash of block zero, fetched once and cached for the client's lifetime.
    pub async fn genesis_hash(&self) -> Result<String> {
        const METHOD: &str = "eth_getBlockByNumber";
        self.genesis
            .get_or_try_init(|| async {
                let block: Value = self
                    .call_with_retry(METHOD, || {
                        self.request_once(METHOD, rpc_params![to_hex_quantity(0), false])
                    })
                    .await?;
                let genesis = block_from_value(0, block)?;
                if genesis.hash.is_empty() {
                    bail!("genesis block has no hash");
                }
                Ok::<_, anyhow::Error>(genesis.hash.to_ascii_lowercase())
            })
            .await
            .cloned()
    }

    pub async fn fetch_blocks(&self, heights: &[u64]) -> Result<Vec<BlockWrapper>> {
        if heights.is_empty() {
            return Ok(Vec::new());
        }

        let bodies = self
            .call_with_retry("eth_getBlockByNumber", || self.fetch_batch_once(heights))
            .await?;

        if bodies.len() != heights.len() {
            bail!(
                "RPC returned mismatched block count (expected {}, got {})",
                heights.len(),
                bodies.len()
            );
        }

        heights
            .iter()
            .copied()
            .zip(bodies)
            .map(|(height, body)| block_from_value(height, body))
            .collect()
    }

    async fn fetch_batch_once(&self, heights: &[u64]) -> Result<Vec<Value>> {
        const METHOD: &str = "eth_getBlockByNumber";
        let mut batch = BatchRequestBuilder::new();
        for height in heights {
            batch
                .insert(METHOD, rpc_params![to_hex_quantity(*height), true])
                .context("failed to serialize eth_getBlockByNumber params")?;
        }

        let response = timeout(
            self.options.request_timeout,
            self.client.batch_request(batch),
        )
        .await
        .map_err(|_| RpcError::Timeout { method: METHOD })?
        .map_err(|err| map_rpc_error(METHOD, err))?;

        let mut values: Vec<Value> = Vec::with_capacity(heights.len());
        for entry in response.into_iter() {
            match entry {
                Ok(value) => values.push(value),
                Err(err) => return Err(map_rpc_batch_error(METHOD, &err)),
            }
        }

        tracing::debug!(
            method = METHOD,
            count = values.len(),
            "batch RPC call completed"
        );
        Ok(values)
    }

    async fn request_once<R>(&self, method: &'static str, params: ArrayParams) -> Result<R>
    where
        R: DeserializeOwned,
    {
        timeout(self.options.request_timeout, self.client.request(method, params))
            .await
            .map_err(|_| RpcError::Timeout { method })?
            .map_err(|err| map_rpc_error(method, err))
    }

    /// Retries transient failures with exponential backoff, recording latency and outcome of
    /// every attempt. Malformed responses are not retried.
    async fn call_with_retry<T, F, Fut>(&self, method: &'static str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backoff = RetryBackoff::new(self.options.initial_backoff, self.options.max_backoff)
            .with_max_attempts(self.options.max_attempts);

        retry_with_backoff(
            backoff,
            |_| self.timed(operation()),
            |attempt, delay, err, will_retry| {
                if will_retry {
                    tracing::debug!(
                        method,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "rpc call failed; retrying"
                    );
                } else {
                    tracing::warn!(method, attempt, error = %err, "rpc call failed; giving up");
                }
            },
            |_, err| match err.downcast_ref::<RpcError>() {
                Some(RpcError::InvalidQuantity { .. }) | Some(RpcError::MissingBlock { .. }) => {
                    RetryDisposition::Abort
                }
                _ => RetryDisposition::Retry,
            },
        )
        .await
    }

    async fn timed<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let start = Instant::now();
        let result = operation.await;
        let elapsed = start.elapsed();
        match &result {
            Ok(_) => self.metrics.record_success(elapsed),
            Err(err)
                if matches!(
                    err.downcast_ref::<RpcError>(),
                    Some(RpcError::Timeout { .. })
                ) =>
            {
                self.metrics.record_timeout(elapsed)
            }
            Err(_) => self.metrics.record_failure(elapsed),
        }
        result
    }
}

fn map_rpc_error(label: &'static str, err: JsonRpcError) -> anyhow::Error {
    if let JsonRpcError::RequestTimeout = err {
        return RpcError::Timeout { method: label }.into();
    }
    anyhow!("rpc {label} call failed: {err}")
}

fn map_rpc_batch_error(label: &str, err: &ErrorObject<'_>) -> anyhow::Error {
    if let Some(data) = err.data() {
        anyhow!(
            "rpc {label} call failed (code={}, message={}, data={})",
            err.code(),
            err.message(),
            data.get()
        )
    } else {
        anyhow!(
            "rpc {label} call failed (code={}, message={})",
            err.code(),
            err.message()
        )
    }
}
