use crate::processor::dispatch::BlockDispatcher;
use crate::rpc::RpcError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    processed_blocks: AtomicU64,
    enqueued_heights: AtomicU64,
    skipped_heights: AtomicU64,
    dictionary_queries: AtomicU64,
    dictionary_skips: AtomicU64,
    rpc_errors: AtomicU64,
    rpc_timeouts: AtomicU64,
}

impl Telemetry {
    pub fn record_processed_blocks(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.processed_blocks.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_enqueued_heights(&self, count: u64) {
        self.enqueued_heights.fetch_add(count, Ordering::Relaxed);
    }

    /// Heights jumped over by a dictionary skip-ahead.
    pub fn record_skipped_heights(&self, count: u64) {
        self.skipped_heights.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dictionary_query(&self) {
        self.dictionary_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dictionary_skip(&self) {
        self.dictionary_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc_error(&self) {
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rpc_timeout(&self) {
        self.rpc_timeouts.fetch_add(1, Ordering::Relaxed);
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed chain call, classifying timeouts separately. Calls abandoned at
    /// shutdown are not failures.
    pub fn record_rpc_failure(&self, err: &anyhow::Error) {
        match err.downcast_ref::<RpcError>() {
            Some(RpcError::Cancelled) => {}
            Some(RpcError::Timeout { .. }) => self.record_rpc_timeout(),
            _ => self.record_rpc_error(),
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            processed_blocks: self.processed_blocks.load(Ordering::Relaxed),
            enqueued_heights: self.enqueued_heights.load(Ordering::Relaxed),
            skipped_heights: self.skipped_heights.load(Ordering::Relaxed),
            dictionary_queries: self.dictionary_queries.load(Ordering::Relaxed),
            dictionary_skips: self.dictionary_skips.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
            rpc_timeouts: self.rpc_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks.load(Ordering::Relaxed)
    }

    pub fn rpc_errors(&self) -> u64 {
        self.rpc_errors.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub processed_blocks: u64,
    pub enqueued_heights: u64,
    pub skipped_heights: u64,
    pub dictionary_queries: u64,
    pub dictionary_skips: u64,
    pub rpc_errors: u64,
    pub rpc_timeouts: u64,
}

/// Spawns a background task that periodically logs throughput, dispatcher occupancy and
/// dictionary/RPC counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    dispatcher: Arc<dyn BlockDispatcher>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "blockfeed::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let processed_delta = current_snapshot
                        .processed_blocks
                        .saturating_sub(last_snapshot.processed_blocks);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        processed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "blockfeed::metrics",
                        throughput = format!("{throughput:.2}"),
                        processed = current_snapshot.processed_blocks,
                        enqueued = current_snapshot.enqueued_heights,
                        skipped = current_snapshot.skipped_heights,
                        buffered_height = ?dispatcher.latest_buffered_height(),
                        free_slots = dispatcher.free_size(),
                        dictionary_queries = current_snapshot.dictionary_queries,
                        dictionary_skips = current_snapshot.dictionary_skips,
                        rpc_errors = current_snapshot.rpc_errors,
                        rpc_timeouts = current_snapshot.rpc_timeouts,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
