//! Chain head tracking: shared height state and the poller that refreshes it.

use super::lifecycle::Scheduler;
use crate::rpc::{ChainClient, RpcError};
use crate::runtime::events::{EventBus, IndexerEvent};
use crate::runtime::telemetry::Telemetry;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

/// Share of the chain's block interval used as the head polling period.
pub const INTERVAL_PERCENT: f64 = 0.9;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A height that is unknown until first observed.
#[derive(Debug, Default)]
pub struct TrackedHeight {
    value: AtomicU64,
    ready: AtomicBool,
}

impl TrackedHeight {
    pub fn new(initial: Option<u64>) -> Self {
        Self {
            value: AtomicU64::new(initial.unwrap_or(0)),
            ready: AtomicBool::new(initial.is_some()),
        }
    }

    /// Stores `height` and reports whether it differs from the previous observation.
    pub fn update(&self, height: u64) -> bool {
        let previous = self.value.swap(height, Ordering::SeqCst);
        let was_ready = self.ready.swap(true, Ordering::SeqCst);
        !was_ready || previous != height
    }

    pub fn current(&self) -> Option<u64> {
        if self.ready.load(Ordering::SeqCst) {
            Some(self.value.load(Ordering::SeqCst))
        } else {
            None
        }
    }
}

/// Heights shared between the head tracker, the fetch loop, and the dispatch loop.
#[derive(Debug, Default)]
pub struct HeightState {
    best: TrackedHeight,
    finalized: TrackedHeight,
    processed: TrackedHeight,
}

impl HeightState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn best(&self) -> Option<u64> {
        self.best.current()
    }

    pub fn finalized(&self) -> Option<u64> {
        self.finalized.current()
    }

    pub fn processed(&self) -> Option<u64> {
        self.processed.current()
    }

    pub fn update_best(&self, height: u64) -> bool {
        self.best.update(height)
    }

    pub fn update_finalized(&self, height: u64) -> bool {
        self.finalized.update(height)
    }

    pub fn record_processed(&self, height: u64) {
        self.processed.update(height);
    }
}

/// Polls best and finalized heights and publishes an event only when one changes.
pub struct ChainHeadTracker {
    client: Arc<dyn ChainClient>,
    heights: Arc<HeightState>,
    events: EventBus,
    telemetry: Arc<Telemetry>,
    interval: Duration,
}

impl ChainHeadTracker {
    pub fn new(
        client: Arc<dyn ChainClient>,
        heights: Arc<HeightState>,
        events: EventBus,
        telemetry: Arc<Telemetry>,
        block_time_variance: Duration,
    ) -> Self {
        let interval = Self::poll_interval(block_time_variance, client.estimated_block_interval());
        Self {
            client,
            heights,
            events,
            telemetry,
            interval,
        }
    }

    /// `min(variance, 0.9 × block interval)`.
    pub fn poll_interval(block_time_variance: Duration, block_interval: Duration) -> Duration {
        block_time_variance
            .min(block_interval.mul_f64(INTERVAL_PERCENT))
            .max(MIN_POLL_INTERVAL)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn heights(&self) -> &Arc<HeightState> {
        &self.heights
    }

    /// Refreshes both heights once. Failures keep the previous values.
    pub async fn poll_once(&self) {
        match self.client.finalized_height().await {
            Ok(height) => {
                if self.heights.update_finalized(height) {
                    tracing::trace!(height, "finalized height changed");
                    self.events.publish(IndexerEvent::BlockTarget(height));
                }
            }
            Err(err) if RpcError::is_cancellation(&err) => return,
            Err(err) => {
                self.telemetry.record_rpc_failure(&err);
                tracing::warn!(error = %err, "failed to refresh finalized height");
            }
        }

        match self.client.best_height().await {
            Ok(height) => {
                if self.heights.update_best(height) {
                    self.events.publish(IndexerEvent::BlockBest(height));
                }
            }
            Err(err) if RpcError::is_cancellation(&err) => {}
            Err(err) => {
                self.telemetry.record_rpc_failure(&err);
                tracing::warn!(error = %err, "failed to refresh best height");
            }
        }
    }

    pub fn register(self: &Arc<Self>, scheduler: &mut Scheduler) {
        let tracker = self.clone();
        scheduler.every("chain-head", self.interval, move || {
            let tracker = tracker.clone();
            async move { tracker.poll_once().await }
        });
        tracing::debug!(
            interval_ms = self.interval.as_millis() as u64,
            "chain head polling registered"
        );
    }
}
