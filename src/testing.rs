//! Test doubles shared by unit tests across modules.

use crate::dictionary::{Dictionary, DictionaryMetadata, DictionaryResult, QueryPredicate};
use crate::processor::dispatch::{BlockDispatcher, ResetCallback};
use crate::processor::lifecycle::Scheduler;
use crate::rpc::{to_hex_quantity, BlockWrapper, ChainClient};
use crate::runtime::handler::{BlockHandler, HandlerError, HandlerFuture, ProcessOutcome};
use crate::runtime::monitor::ResourceMonitor;
use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MOCK_GENESIS: &str =
    "0x88e96d4537bea4d9c05d12549907b32561d3bf31f45aae734cdc119f13406cb6";

/// Polls `condition` until it holds, panicking after `limit`.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub struct MockChain {
    finalized: AtomicU64,
    best: AtomicU64,
    failing: AtomicBool,
    fetched: Mutex<Vec<Vec<u64>>>,
}

impl MockChain {
    pub fn new(finalized: u64, best: u64) -> Self {
        Self {
            finalized: AtomicU64::new(finalized),
            best: AtomicU64::new(best),
            failing: AtomicBool::new(false),
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn set_heights(&self, finalized: u64, best: u64) {
        self.finalized.store(finalized, Ordering::SeqCst);
        self.best.store(best, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Height batches passed to successful `fetch_blocks` calls.
    pub fn fetched(&self) -> Vec<Vec<u64>> {
        self.fetched.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("mock chain unavailable");
        }
        Ok(())
    }
}

impl ChainClient for MockChain {
    fn finalized_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.finalized.load(Ordering::SeqCst))
        })
    }

    fn best_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.best.load(Ordering::SeqCst))
        })
    }

    fn genesis_hash(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.check()?;
            Ok(MOCK_GENESIS.to_string())
        })
    }

    fn fetch_blocks<'a>(&'a self, heights: &'a [u64]) -> BoxFuture<'a, Result<Vec<BlockWrapper>>> {
        Box::pin(async move {
            self.check()?;
            self.fetched.lock().unwrap().push(heights.to_vec());
            Ok(heights
                .iter()
                .map(|&height| BlockWrapper {
                    height,
                    hash: format!("0x{height:064x}"),
                    body: json!({ "number": to_hex_quantity(height) }),
                })
                .collect())
        })
    }

    fn estimated_block_interval(&self) -> Duration {
        Duration::from_secs(2)
    }
}

pub fn dictionary_result(heights: Vec<u64>, genesis: &str, last_indexed: u64) -> DictionaryResult {
    let mut candidate_heights = heights;
    candidate_heights.sort_unstable();
    candidate_heights.dedup();
    DictionaryResult {
        candidate_heights,
        metadata: DictionaryMetadata {
            genesis_hash: genesis.to_string(),
            last_indexed_height: last_indexed,
        },
    }
}

/// Replays queued responses in order, then answers `Ok(None)`.
#[derive(Default)]
pub struct ScriptedDictionary {
    responses: Mutex<VecDeque<Result<Option<DictionaryResult>>>>,
    calls: Mutex<Vec<(u64, u64, usize)>>,
}

impl ScriptedDictionary {
    pub fn push(&self, response: Result<Option<DictionaryResult>>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<(u64, u64, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Dictionary for ScriptedDictionary {
    fn query<'a>(
        &'a self,
        start_height: u64,
        end_height: u64,
        batch_size: usize,
        _predicates: &'a [QueryPredicate],
    ) -> BoxFuture<'a, Result<Option<DictionaryResult>>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((start_height, end_height, batch_size));
            self.responses.lock().unwrap().pop_front().unwrap_or(Ok(None))
        })
    }
}

/// Sink that records what the fetch service asks of it.
pub struct RecordingDispatcher {
    free_size: AtomicUsize,
    latest: Mutex<Option<u64>>,
    enqueued: Mutex<Vec<Vec<u64>>>,
    flushes: Mutex<Vec<u64>>,
    on_reset: Mutex<Option<ResetCallback>>,
}

impl RecordingDispatcher {
    pub fn new(free_size: usize) -> Self {
        Self {
            free_size: AtomicUsize::new(free_size),
            latest: Mutex::new(None),
            enqueued: Mutex::new(Vec::new()),
            flushes: Mutex::new(Vec::new()),
            on_reset: Mutex::new(None),
        }
    }

    pub fn set_free_size(&self, free_size: usize) {
        self.free_size.store(free_size, Ordering::SeqCst);
    }

    pub fn enqueued(&self) -> Vec<Vec<u64>> {
        self.enqueued.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> Vec<u64> {
        self.flushes.lock().unwrap().clone()
    }

    pub async fn trigger_reset(&self, height: u64) -> Result<()> {
        let callback = self
            .on_reset
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("dispatcher not initialized"))?;
        callback(height).await
    }
}

impl BlockDispatcher for RecordingDispatcher {
    fn init(&self, on_reset: ResetCallback, _scheduler: &mut Scheduler) -> Result<()> {
        *self.on_reset.lock().unwrap() = Some(on_reset);
        Ok(())
    }

    fn latest_buffered_height(&self) -> Option<u64> {
        *self.latest.lock().unwrap()
    }

    fn set_latest_buffered_height(&self, height: u64) {
        *self.latest.lock().unwrap() = Some(height);
    }

    fn free_size(&self) -> usize {
        self.free_size.load(Ordering::SeqCst)
    }

    fn enqueue_blocks(&self, heights: Vec<u64>) -> Result<()> {
        if let Some(&last) = heights.last() {
            *self.latest.lock().unwrap() = Some(last);
            self.enqueued.lock().unwrap().push(heights);
        }
        Ok(())
    }

    fn flush_queue(&self, height: u64) {
        *self.latest.lock().unwrap() = Some(height);
        self.flushes.lock().unwrap().push(height);
    }
}

/// Returns queued pressure samples, then errors.
pub struct ScriptedMonitor {
    samples: Mutex<VecDeque<f64>>,
}

impl ScriptedMonitor {
    pub fn new(samples: Vec<f64>) -> Self {
        Self {
            samples: Mutex::new(samples.into()),
        }
    }
}

impl ResourceMonitor for ScriptedMonitor {
    fn pressure_ratio(&self) -> Result<f64> {
        self.samples
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no more samples"))
    }
}

/// Records processed heights; can fail or return an outcome at chosen heights.
#[derive(Default)]
pub struct RecordingHandler {
    processed: Arc<Mutex<Vec<u64>>>,
    fail_at: Option<u64>,
    reported_height: Option<u64>,
    outcomes: HashMap<u64, ProcessOutcome>,
}

impl RecordingHandler {
    pub fn failing_at(height: u64) -> Self {
        Self {
            fail_at: Some(height),
            ..Self::default()
        }
    }

    /// Puts `height` into the failure instead of the height of the failing block.
    pub fn reporting_height(mut self, height: u64) -> Self {
        self.reported_height = Some(height);
        self
    }

    pub fn with_outcome(mut self, height: u64, outcome: ProcessOutcome) -> Self {
        self.outcomes.insert(height, outcome);
        self
    }

    pub fn processed(&self) -> Arc<Mutex<Vec<u64>>> {
        self.processed.clone()
    }
}

impl BlockHandler for RecordingHandler {
    fn process<'a>(&'a mut self, block: BlockWrapper) -> HandlerFuture<'a> {
        Box::pin(async move {
            if self.fail_at == Some(block.height) {
                let height = self.reported_height.unwrap_or(block.height);
                return Err(
                    HandlerError::new(height, anyhow!("handler rejected block"))
                        .with_handler("recording"),
                );
            }
            self.processed.lock().unwrap().push(block.height);
            Ok(self.outcomes.remove(&block.height).unwrap_or_default())
        })
    }
}
