use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use blockfeed::{
    BlockHandler, BlockWrapper, Datasource, Handler, HandlerError, HandlerFuture, LogFilter,
    ProcessOutcome,
};
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Datasource with one event handler watching logs emitted by `address`.
pub fn log_datasource(name: &str, address: &str) -> Datasource {
    Datasource::new(vec![Handler::event(
        format!("handle_{name}"),
        Some(LogFilter {
            address: Some(address.to_owned()),
            topics: Vec::new(),
        }),
    )])
    .named(name)
}

#[derive(Default)]
pub struct SharedHandlerState {
    pub processed: Vec<u64>,
    pub shutdowns: usize,
}

/// Records processed heights into state the test keeps a handle to.
#[derive(Clone)]
pub struct SharedRecordingHandler {
    state: Arc<Mutex<SharedHandlerState>>,
    fail_at: Option<u64>,
    registrations: HashMap<u64, Vec<Datasource>>,
}

impl SharedRecordingHandler {
    pub fn new() -> (Self, Arc<Mutex<SharedHandlerState>>) {
        let state = Arc::new(Mutex::new(SharedHandlerState::default()));
        (
            Self {
                state: state.clone(),
                fail_at: None,
                registrations: HashMap::new(),
            },
            state,
        )
    }

    pub fn failing_at(mut self, height: u64) -> Self {
        self.fail_at = Some(height);
        self
    }

    /// Registers `datasources` as dynamic datasources once `height` is processed.
    pub fn registering_at(mut self, height: u64, datasources: Vec<Datasource>) -> Self {
        self.registrations.insert(height, datasources);
        self
    }
}

impl BlockHandler for SharedRecordingHandler {
    fn process<'a>(&'a mut self, block: BlockWrapper) -> HandlerFuture<'a> {
        Box::pin(async move {
            if self.fail_at == Some(block.height) {
                return Err(HandlerError::new(block.height, anyhow!("mapping panicked on purpose"))
                    .with_handler("handle_transfer"));
            }
            assert!(!block.hash.is_empty(), "blocks must carry their hash");
            self.state.lock().await.processed.push(block.height);
            Ok(match self.registrations.remove(&block.height) {
                Some(datasources) => ProcessOutcome::with_datasources(datasources),
                None => ProcessOutcome::default(),
            })
        })
    }

    fn shutdown<'a>(&'a mut self) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.state.lock().await.shutdowns += 1;
            Ok(())
        })
    }
}

pub async fn wait_for_processed(
    state: &Arc<Mutex<SharedHandlerState>>,
    last_height: u64,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        {
            let guard = state.lock().await;
            if guard.processed.last().is_some_and(|height| *height >= last_height) {
                return Ok(());
            }
        }

        if start.elapsed() > timeout {
            let guard = state.lock().await;
            bail!(
                "handler did not reach height {last_height} within {:?} (processed: {:?})",
                timeout,
                guard.processed
            );
        }

        sleep(Duration::from_millis(20)).await;
    }
}

pub fn assert_is_contiguous(heights: &[u64]) {
    for window in heights.windows(2) {
        if let [lhs, rhs] = window {
            assert_eq!(rhs, &(lhs + 1), "heights must increase monotonically");
        }
    }
}
