//! Fetch orchestration.
//!
//! `FetchService` owns the planning loop and composes the focused modules:
//! - `tip` keeps best/finalized heights fresh on a fixed interval.
//! - `scale` shrinks or grows the batch under memory pressure.
//! - `dictionary::planner` picks dense ranges or sparse dictionary heights.
//! - `dispatch` receives the planned heights and owns the buffered watermark.
//! - `lifecycle` registers and cancels every background task together.

use super::dispatch::{BlockDispatcher, ResetCallback};
use super::lifecycle::Scheduler;
use super::scale::{effective_batch_size, BatchScale, BatchScaleController};
use super::tip::{ChainHeadTracker, HeightState};
use crate::dictionary::{DictionaryPlanner, Plan, PlanRequest};
use crate::project::DatasourceRegistry;
use crate::rpc::{ChainClient, RpcError};
use crate::runtime::events::{EventBus, IndexerEvent};
use crate::runtime::monitor::ResourceMonitor;
use crate::runtime::telemetry::Telemetry;
use anyhow::{Context, Result};
use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Result of a single planning cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStep {
    /// Nothing to do yet: the sink is full or the chain has not advanced.
    Idle,
    Enqueued(usize),
    /// Watermark moved to `to` without enqueuing.
    Skipped { to: u64 },
    /// The watermark moved underneath the cycle; its plan was dropped.
    Discarded,
}

pub struct FetchServiceParams {
    pub chain: Arc<dyn ChainClient>,
    pub dispatcher: Arc<dyn BlockDispatcher>,
    pub planner: Arc<DictionaryPlanner>,
    pub registry: Arc<DatasourceRegistry>,
    pub heights: Arc<HeightState>,
    pub scale: Arc<BatchScale>,
    pub events: EventBus,
    pub telemetry: Arc<Telemetry>,
    /// Enables memory-pressure batch scaling when present.
    pub monitor: Option<Arc<dyn ResourceMonitor>>,
    pub batch_size: usize,
    pub idle_delay: Duration,
    pub block_time_variance: Duration,
}

#[derive(Clone)]
pub struct FetchService {
    inner: Arc<FetchInner>,
}

struct FetchInner {
    chain: Arc<dyn ChainClient>,
    dispatcher: Arc<dyn BlockDispatcher>,
    planner: Arc<DictionaryPlanner>,
    registry: Arc<DatasourceRegistry>,
    heights: Arc<HeightState>,
    scale: Arc<BatchScale>,
    events: EventBus,
    telemetry: Arc<Telemetry>,
    tracker: Arc<ChainHeadTracker>,
    scale_controller: Option<Arc<BatchScaleController>>,
    batch_size: usize,
    idle_delay: Duration,
    genesis: OnceCell<String>,
    apply_lock: Mutex<()>,
}

impl FetchService {
    pub fn new(params: FetchServiceParams) -> Self {
        let tracker = Arc::new(ChainHeadTracker::new(
            params.chain.clone(),
            params.heights.clone(),
            params.events.clone(),
            params.telemetry.clone(),
            params.block_time_variance,
        ));
        let scale_controller = params
            .monitor
            .map(|monitor| Arc::new(BatchScaleController::new(params.scale.clone(), monitor)));

        Self {
            inner: Arc::new(FetchInner {
                chain: params.chain,
                dispatcher: params.dispatcher,
                planner: params.planner,
                registry: params.registry,
                heights: params.heights,
                scale: params.scale,
                events: params.events,
                telemetry: params.telemetry,
                tracker,
                scale_controller,
                batch_size: params.batch_size.max(1),
                idle_delay: params.idle_delay,
                genesis: OnceCell::new(),
                apply_lock: Mutex::new(()),
            }),
        }
    }

    pub fn heights(&self) -> &Arc<HeightState> {
        &self.inner.heights
    }

    pub fn tracker(&self) -> &Arc<ChainHeadTracker> {
        &self.inner.tracker
    }

    /// Batch size for the next cycle after scaling.
    pub fn effective_batch_size(&self) -> usize {
        effective_batch_size(self.inner.scale.get(), self.inner.batch_size)
    }

    /// Compiles predicates, reads the chain head once, starts the dispatcher and registers the
    /// periodic tasks. Does not start the planning loop.
    pub async fn init(&self, scheduler: &mut Scheduler) -> Result<()> {
        let inner = &self.inner;
        let using_dictionary = inner.planner.update_datasources(&inner.registry.all());
        inner
            .events
            .publish(IndexerEvent::UsingDictionary(using_dictionary));

        inner.tracker.poll_once().await;

        let weak = Arc::downgrade(&self.inner);
        let on_reset: ResetCallback = Arc::new(move |height: u64| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.reset_for_new_ds(height),
                    None => Ok(()),
                }
            }
            .boxed()
        });
        inner
            .dispatcher
            .init(on_reset, scheduler)
            .context("failed to start block dispatcher")?;

        inner.tracker.register(scheduler);
        if let Some(controller) = &inner.scale_controller {
            controller.register(scheduler);
        }

        tracing::info!(
            using_dictionary,
            batch_size = inner.batch_size,
            finalized_height = ?inner.heights.finalized(),
            "fetch service initialized"
        );
        Ok(())
    }

    /// Initializes and spawns the planning loop on `scheduler`.
    pub async fn start(&self, init_height: u64, scheduler: &mut Scheduler) -> Result<()> {
        self.init(scheduler).await?;
        let service = self.clone();
        let token = scheduler.token();
        scheduler.adopt(
            "fetch-loop",
            tokio::spawn(async move { service.run(init_height, token).await }),
        );
        Ok(())
    }

    /// Plans until `shutdown` is cancelled. A cycle in flight always completes first.
    pub async fn run(&self, init_height: u64, shutdown: CancellationToken) {
        tracing::info!(start_height = init_height, "fetch loop started");
        while !shutdown.is_cancelled() {
            let idle = match self.fill_once(init_height).await {
                Ok(FillStep::Idle) => true,
                Ok(step) => {
                    tracing::trace!(?step, "planning cycle finished");
                    false
                }
                Err(err) if RpcError::is_cancellation(&err) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "planning cycle failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.inner.idle_delay) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }
        tracing::debug!("fetch loop stopped");
    }

    /// Runs one planning cycle starting right after the buffered watermark.
    pub async fn fill_once(&self, init_height: u64) -> Result<FillStep> {
        let inner = &self.inner;
        let start = inner.next_start(init_height);

        let Some(finalized_height) = inner.heights.finalized() else {
            return Ok(FillStep::Idle);
        };
        let batch_size = self.effective_batch_size();
        let free_size = inner.dispatcher.free_size();
        if free_size < batch_size || start > finalized_height {
            return Ok(FillStep::Idle);
        }

        let genesis = if inner.planner.is_enabled() {
            inner.genesis_hash().await?
        } else {
            ""
        };
        let request = PlanRequest {
            start,
            batch_size,
            free_size,
            finalized_height,
            chain_genesis: genesis,
        };
        let plan = inner
            .planner
            .plan(request, || inner.next_start(init_height))
            .await;

        let _guard = inner.apply_guard();
        if inner.next_start(init_height) != start {
            return Ok(FillStep::Discarded);
        }

        match plan {
            Plan::Range { start, end } => inner.enqueue((start..=end).collect()),
            Plan::Heights(heights) => inner.enqueue(heights),
            Plan::SkipTo(height) => {
                inner.dispatcher.set_latest_buffered_height(height);
                inner
                    .telemetry
                    .record_skipped_heights(height.saturating_add(1).saturating_sub(start));
                tracing::debug!(
                    start_height = start,
                    end_height = height,
                    "dictionary reports no matching blocks; skipping ahead"
                );
                Ok(FillStep::Skipped { to: height })
            }
            Plan::Stale => Ok(FillStep::Discarded),
        }
    }

    /// Recompiles predicates and flushes every height after `height`.
    pub fn reset_for_new_ds(&self, height: u64) -> Result<()> {
        self.inner.reset_for_new_ds(height)
    }

    /// Clears a latched dictionary genesis mismatch.
    pub fn resync_dictionary(&self) -> bool {
        let enabled = self.inner.planner.resync();
        self.inner
            .events
            .publish(IndexerEvent::UsingDictionary(enabled));
        enabled
    }
}

impl FetchInner {
    fn next_start(&self, init_height: u64) -> u64 {
        self.dispatcher
            .latest_buffered_height()
            .map(|height| height.saturating_add(1))
            .unwrap_or(init_height)
    }

    async fn genesis_hash(&self) -> Result<&str> {
        let genesis = self
            .genesis
            .get_or_try_init(|| async {
                self.chain
                    .genesis_hash()
                    .await
                    .context("failed to read chain genesis hash")
            })
            .await?;
        Ok(genesis.as_str())
    }

    fn apply_guard(&self) -> MutexGuard<'_, ()> {
        self.apply_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, heights: Vec<u64>) -> Result<FillStep> {
        let count = heights.len();
        if let (Some(first), Some(last)) = (heights.first(), heights.last()) {
            tracing::debug!(
                start_height = first,
                end_height = last,
                count,
                "enqueueing heights"
            );
        }
        self.dispatcher.enqueue_blocks(heights)?;
        Ok(FillStep::Enqueued(count))
    }

    fn reset_for_new_ds(&self, height: u64) -> Result<()> {
        let _guard = self.apply_guard();
        let using_dictionary = self.planner.update_datasources(&self.registry.all());
        self.events
            .publish(IndexerEvent::UsingDictionary(using_dictionary));
        self.dispatcher.flush_queue(height);
        tracing::info!(
            height,
            using_dictionary,
            datasources = self.registry.dynamic_count(),
            "queue reset for new dynamic datasources"
        );
        Ok(())
    }
}
