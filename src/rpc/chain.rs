use super::client::RpcError;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A fetched block. The body is kept as raw JSON; decoding it is the handler's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockWrapper {
    pub height: u64,
    pub hash: String,
    pub body: serde_json::Value,
}

/// Chain access needed by the fetch pipeline. Every call may fail transiently.
pub trait ChainClient: Send + Sync {
    fn finalized_height(&self) -> BoxFuture<'_, Result<u64>>;

    fn best_height(&self) -> BoxFuture<'_, Result<u64>>;

    fn genesis_hash(&self) -> BoxFuture<'_, Result<String>>;

    /// Fetches the blocks at `heights`, returned in the same order.
    fn fetch_blocks<'a>(&'a self, heights: &'a [u64]) -> BoxFuture<'a, Result<Vec<BlockWrapper>>>;

    /// Expected time between blocks, read once at startup to size the head polling interval.
    fn estimated_block_interval(&self) -> Duration;
}

/// Run-scoped view of a [`ChainClient`]: every call resolves to [`RpcError::Cancelled`] as
/// soon as `token` fires, abandoning whatever retry ladder the inner client was on.
pub struct CancellableChain {
    inner: Arc<dyn ChainClient>,
    token: CancellationToken,
}

impl CancellableChain {
    pub fn new(inner: Arc<dyn ChainClient>, token: CancellationToken) -> Self {
        Self { inner, token }
    }

    async fn guard<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(RpcError::Cancelled.into()),
            result = call => result,
        }
    }
}

impl ChainClient for CancellableChain {
    fn finalized_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.guard(self.inner.finalized_height()))
    }

    fn best_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.guard(self.inner.best_height()))
    }

    fn genesis_hash(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(self.guard(self.inner.genesis_hash()))
    }

    fn fetch_blocks<'a>(&'a self, heights: &'a [u64]) -> BoxFuture<'a, Result<Vec<BlockWrapper>>> {
        Box::pin(self.guard(self.inner.fetch_blocks(heights)))
    }

    fn estimated_block_interval(&self) -> Duration {
        self.inner.estimated_block_interval()
    }
}
