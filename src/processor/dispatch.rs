//! Downstream sink for planned heights and the single-consumer dispatch loop.
//!
//! The fetch service only sees [`BlockDispatcher`]: it enqueues heights, moves the buffered
//! watermark and flushes after a datasource reset. [`InlineBlockDispatcher`] backs that contract
//! with two bounded buffers. A fetch task drains planned heights, pulls the blocks from the chain
//! and hands them to [`DispatchLoop`], which runs the user handler one block at a time.

use super::lifecycle::Scheduler;
use super::scale::{effective_batch_size, BatchScale};
use super::tip::HeightState;
use crate::buffer::BoundedBuffer;
use crate::project::DatasourceRegistry;
use crate::rpc::{BlockWrapper, ChainClient, RpcError};
use crate::runtime::events::{EventBus, IndexerEvent};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::handler::BlockHandler;
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Invoked with the processed height after a handler registered new datasources.
pub type ResetCallback = Arc<dyn Fn(u64) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub trait BlockDispatcher: Send + Sync {
    /// Starts background work on `scheduler`. `on_reset` is called after dynamic datasources
    /// were registered so the caller can recompute its plan and flush.
    fn init(&self, on_reset: ResetCallback, scheduler: &mut Scheduler) -> Result<()>;

    /// Highest height handed downstream or skipped over.
    fn latest_buffered_height(&self) -> Option<u64>;

    fn set_latest_buffered_height(&self, height: u64);

    /// Room left for planned heights.
    fn free_size(&self) -> usize;

    /// Queues ascending heights. Fails without queuing anything if they do not fit.
    fn enqueue_blocks(&self, heights: Vec<u64>) -> Result<()>;

    /// Drops everything not yet dispatched and moves the watermark to `height`.
    fn flush_queue(&self, height: u64);
}

struct FetchedBlock {
    generation: u64,
    block: BlockWrapper,
}

#[derive(Debug, Default)]
struct QueueState {
    latest_buffered: Option<u64>,
}

pub struct InlineDispatcherParams {
    pub chain: Arc<dyn ChainClient>,
    pub registry: Arc<DatasourceRegistry>,
    pub heights: Arc<HeightState>,
    pub scale: Arc<BatchScale>,
    pub events: EventBus,
    pub telemetry: Arc<Telemetry>,
    pub fatal: FatalErrorHandler,
    pub batch_size: usize,
    pub idle_delay: Duration,
}

struct DispatcherInner {
    chain: Arc<dyn ChainClient>,
    registry: Arc<DatasourceRegistry>,
    heights: Arc<HeightState>,
    scale: Arc<BatchScale>,
    events: EventBus,
    telemetry: Arc<Telemetry>,
    fatal: FatalErrorHandler,
    batch_size: usize,
    idle_delay: Duration,
    height_buffer: BoundedBuffer<u64>,
    block_buffer: BoundedBuffer<FetchedBlock>,
    queue: Mutex<QueueState>,
    generation: AtomicU64,
    handler: Mutex<Option<Box<dyn BlockHandler>>>,
}

/// Fetches and dispatches blocks inside this process.
#[derive(Clone)]
pub struct InlineBlockDispatcher {
    inner: Arc<DispatcherInner>,
}

impl InlineBlockDispatcher {
    pub fn new(params: InlineDispatcherParams, handler: Box<dyn BlockHandler>) -> Self {
        let batch_size = params.batch_size.max(1);
        let capacity = batch_size.saturating_mul(3);
        Self {
            inner: Arc::new(DispatcherInner {
                chain: params.chain,
                registry: params.registry,
                heights: params.heights,
                scale: params.scale,
                events: params.events,
                telemetry: params.telemetry,
                fatal: params.fatal,
                batch_size,
                idle_delay: params.idle_delay,
                height_buffer: BoundedBuffer::new(capacity),
                block_buffer: BoundedBuffer::new(capacity),
                queue: Mutex::new(QueueState::default()),
                generation: AtomicU64::new(0),
                handler: Mutex::new(Some(handler)),
            }),
        }
    }

    /// Planned heights waiting to be fetched.
    pub fn queued_heights(&self) -> usize {
        self.inner.height_buffer.size()
    }

    /// Fetched blocks waiting for the handler.
    pub fn buffered_blocks(&self) -> usize {
        self.inner.block_buffer.size()
    }

    /// Returns the handler once the dispatch loop has exited.
    pub fn take_handler(&self) -> Option<Box<dyn BlockHandler>> {
        self.inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl DispatcherInner {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn publish_queue_size(&self) {
        self.events
            .publish(IndexerEvent::BlockQueueSize(self.height_buffer.size()));
    }
}

impl BlockDispatcher for InlineBlockDispatcher {
    fn init(&self, on_reset: ResetCallback, scheduler: &mut Scheduler) -> Result<()> {
        let handler = self
            .inner
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("dispatcher already running or its handler was lost")?;

        let token = scheduler.token();
        scheduler.adopt(
            "block-fetch",
            tokio::spawn(run_fetch_task(self.inner.clone(), token.clone())),
        );

        let dispatch = DispatchLoop {
            inner: self.inner.clone(),
            on_reset,
            token,
        };
        let inner = self.inner.clone();
        scheduler.adopt(
            "block-dispatch",
            tokio::spawn(async move {
                let fatal = inner.fatal.clone();
                match std::panic::AssertUnwindSafe(dispatch.run(handler))
                    .catch_unwind()
                    .await
                {
                    Ok(handler) => {
                        *inner.handler.lock().unwrap_or_else(PoisonError::into_inner) =
                            Some(handler);
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        fatal.trigger_external(
                            "dispatch loop panicked",
                            anyhow!("dispatch loop panicked: {message}"),
                        );
                    }
                }
            }),
        );

        tracing::debug!(
            batch_size = self.inner.batch_size,
            capacity = self.inner.height_buffer.capacity(),
            "inline block dispatcher started"
        );
        Ok(())
    }

    fn latest_buffered_height(&self) -> Option<u64> {
        self.inner.lock_queue().latest_buffered
    }

    fn set_latest_buffered_height(&self, height: u64) {
        self.inner.lock_queue().latest_buffered = Some(height);
    }

    fn free_size(&self) -> usize {
        self.inner.height_buffer.free_size()
    }

    fn enqueue_blocks(&self, heights: Vec<u64>) -> Result<()> {
        let Some(&last) = heights.last() else {
            return Ok(());
        };
        debug_assert!(heights.windows(2).all(|pair| pair[0] < pair[1]));
        let count = heights.len();

        {
            let mut queue = self.inner.lock_queue();
            if let Some(latest) = queue.latest_buffered {
                if heights[0] <= latest {
                    bail!(
                        "height {} is at or below the buffered watermark {latest}",
                        heights[0]
                    );
                }
            }
            self.inner
                .height_buffer
                .try_put_all(heights)
                .context("failed to enqueue planned heights")?;
            queue.latest_buffered = Some(last);
        }

        self.inner.telemetry.record_enqueued_heights(count as u64);
        self.inner.publish_queue_size();
        Ok(())
    }

    fn flush_queue(&self, height: u64) {
        let (dropped_heights, dropped_blocks) = {
            let mut queue = self.inner.lock_queue();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            queue.latest_buffered = Some(height);
            (
                self.inner.height_buffer.clear(),
                self.inner.block_buffer.clear(),
            )
        };
        tracing::info!(
            height,
            dropped_heights,
            dropped_blocks,
            "flushed block queue"
        );
        self.inner.events.publish(IndexerEvent::BlockQueueSize(0));
    }
}

async fn run_fetch_task(inner: Arc<DispatcherInner>, token: CancellationToken) {
    let mut pending: Vec<u64> = Vec::new();
    let mut pending_generation = inner.current_generation();

    while !token.is_cancelled() {
        if pending_generation != inner.current_generation() {
            pending.clear();
        }

        if pending.is_empty() {
            let take = inner
                .block_buffer
                .free_size()
                .min(effective_batch_size(inner.scale.get(), inner.batch_size));
            let _queue = inner.lock_queue();
            pending = inner.height_buffer.take_all(take);
            pending_generation = inner.current_generation();
        }

        let (Some(&start), Some(&end)) = (pending.first(), pending.last()) else {
            idle(&token, inner.idle_delay).await;
            continue;
        };

        match inner.chain.fetch_blocks(&pending).await {
            Ok(blocks) => {
                tracing::info!(
                    start_height = start,
                    end_height = end,
                    count = blocks.len(),
                    "fetched blocks"
                );
                pending.clear();
                if pending_generation != inner.current_generation() {
                    tracing::debug!(
                        start_height = start,
                        end_height = end,
                        "queue flushed while fetching; dropping blocks"
                    );
                    continue;
                }

                let batch: Vec<FetchedBlock> = blocks
                    .into_iter()
                    .map(|block| FetchedBlock {
                        generation: pending_generation,
                        block,
                    })
                    .collect();
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = inner.block_buffer.put_all(batch) => {
                        if let Err(err) = result {
                            inner.fatal.trigger_external(
                                "block buffer rejected fetched blocks",
                                anyhow!(err),
                            );
                            break;
                        }
                    }
                }
                inner.publish_queue_size();
            }
            Err(err) if RpcError::is_cancellation(&err) => break,
            Err(err) => {
                inner.telemetry.record_rpc_failure(&err);
                tracing::warn!(
                    start_height = start,
                    end_height = end,
                    error = %err,
                    "failed to fetch blocks; retrying"
                );
                idle(&token, inner.idle_delay).await;
            }
        }
    }

    tracing::debug!("block fetch task stopped");
}

async fn idle(token: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

/// Drains fetched blocks into the handler. The first handler error is fatal.
pub struct DispatchLoop {
    inner: Arc<DispatcherInner>,
    on_reset: ResetCallback,
    token: CancellationToken,
}

impl DispatchLoop {
    async fn run(self, mut handler: Box<dyn BlockHandler>) -> Box<dyn BlockHandler> {
        let inner = &self.inner;
        loop {
            let fetched = tokio::select! {
                _ = self.token.cancelled() => break,
                fetched = inner.block_buffer.take() => fetched,
            };
            if fetched.generation != inner.current_generation() {
                continue;
            }

            let height = fetched.block.height;
            inner.publish_queue_size();
            inner.events.publish(IndexerEvent::BlockProcessing {
                height,
                timestamp: unix_millis(),
            });

            match handler.process(fetched.block).await {
                Ok(outcome) => {
                    inner.heights.record_processed(height);
                    inner.telemetry.record_processed_blocks(1);

                    if outcome.dynamic_datasources.is_empty() {
                        continue;
                    }
                    let added = inner.registry.register_dynamic(outcome.dynamic_datasources);
                    tracing::info!(height, added, "registered dynamic datasources");
                    if let Err(err) = (self.on_reset)(height).await {
                        inner.fatal.trigger_external(
                            "failed to reset queue for new datasources",
                            err.context(format!("reset at height {height}")),
                        );
                        break;
                    }
                }
                Err(err) => {
                    if err.height() != height {
                        tracing::debug!(
                            height,
                            reported_height = err.height(),
                            "handler error names another height"
                        );
                    }
                    inner.fatal.trigger(err.at_height(height));
                    break;
                }
            }
        }

        if let Err(err) = handler.shutdown().await {
            tracing::warn!(error = %err, "block handler shutdown failed");
        }
        tracing::debug!("dispatch loop stopped");
        handler
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
