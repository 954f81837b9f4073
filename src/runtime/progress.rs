//! Indexing speed and time-to-target reporting driven by processing events.

use crate::runtime::events::{EventBus, IndexerEvent};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observation {
    height: u64,
    timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BenchmarkSample {
    pub blocks_per_second: f64,
    pub target_height: Option<u64>,
    pub current_height: u64,
    /// `None` while the rate is zero or the target is unknown.
    pub eta: Option<Duration>,
}

/// Tracks the latest processed block and compares it with the previous sample.
#[derive(Debug, Default)]
pub struct BenchmarkState {
    current: Option<Observation>,
    registered: Option<Observation>,
    target_height: Option<u64>,
}

impl BenchmarkState {
    pub fn observe(&mut self, event: &IndexerEvent) {
        match *event {
            IndexerEvent::BlockProcessing { height, timestamp } => {
                self.current = Some(Observation {
                    height,
                    timestamp_ms: timestamp,
                });
            }
            IndexerEvent::BlockTarget(height) => self.target_height = Some(height),
            _ => {}
        }
    }

    /// Rate since the previous call. The first call only registers a baseline.
    pub fn sample(&mut self) -> Option<BenchmarkSample> {
        let current = self.current?;
        let previous = self.registered.replace(current)?;

        let elapsed_ms = current.timestamp_ms.checked_sub(previous.timestamp_ms)?;
        if elapsed_ms == 0 {
            return None;
        }
        let blocks = current.height.saturating_sub(previous.height) as f64;
        let blocks_per_second = blocks / (elapsed_ms as f64 / 1000.0);

        let eta = match self.target_height {
            Some(target) if blocks_per_second > 0.0 => Some(Duration::from_secs_f64(
                target.saturating_sub(current.height) as f64 / blocks_per_second,
            )),
            _ => None,
        };

        Some(BenchmarkSample {
            blocks_per_second,
            target_height: self.target_height,
            current_height: current.height,
            eta,
        })
    }
}

/// `D days HH hours mm mins`.
pub fn format_eta(eta: Duration) -> String {
    let total_minutes = eta.as_secs() / 60;
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes / 60) % 24;
    let minutes = total_minutes % 60;
    format!("{days} days {hours:02} hours {minutes:02} mins")
}

/// Logs throughput and estimated time to the finalized target every `interval`.
pub fn spawn_benchmark_reporter(
    events: &EventBus,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = BenchmarkState::default();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => state.observe(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::trace!(skipped, "benchmark reporter lagged behind events");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    let Some(sample) = state.sample() else {
                        continue;
                    };
                    let estimate = sample
                        .eta
                        .map(format_eta)
                        .unwrap_or_else(|| "unknown".to_string());
                    tracing::info!(
                        target: "blockfeed::benchmark",
                        bps = format!("{:.2}", sample.blocks_per_second),
                        target_height = ?sample.target_height,
                        current_height = sample.current_height,
                        estimate = %estimate,
                        "indexing speed"
                    );
                }
            }
        }
        tracing::debug!(target: "blockfeed::benchmark", "benchmark reporter stopped");
    })
}
