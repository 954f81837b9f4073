use std::time::Duration;

use crate::support::{
    helpers::{assert_is_contiguous, init_tracing, wait_for_processed, SharedRecordingHandler},
    mock_rpc::{MockChain, MockHttpServer},
};
use anyhow::{Context, Result};
use blockfeed::{Datasource, Handler, IndexerConfig, Runner};
use tokio::time::{sleep, timeout};

fn config(rpc_url: &str) -> Result<IndexerConfig> {
    IndexerConfig::builder()
        .rpc_url(rpc_url)
        .batch_size(8)
        .start_height(1)
        .idle_delay(Duration::from_millis(20))
        .block_time_variance(Duration::from_millis(50))
        .rpc_timeout(Duration::from_secs(2))
        .build()
}

fn every_block() -> Vec<Datasource> {
    vec![Datasource::new(vec![Handler::block("handle_block", None)])]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_failure_stops_the_runner() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(60, 60);
    let server = MockHttpServer::start(chain).await?;

    let (handler, state) = SharedRecordingHandler::new();
    let mut runner = Runner::new(config(server.url())?, every_block(), handler.failing_at(42))?;

    let err = timeout(Duration::from_secs(10), runner.run_until_ctrl_c())
        .await
        .context("runner did not exit after the handler failed")?
        .expect_err("handler failure should surface from the runner");
    let message = format!("{err:#}");
    assert!(
        message.contains("block processing pipeline aborted"),
        "expected handler failure to cancel pipeline, got {message}"
    );
    assert!(message.contains("height 42"), "{message}");
    assert!(message.contains("handle_transfer"), "{message}");

    sleep(Duration::from_millis(100)).await;
    let guard = state.lock().await;
    assert_eq!(guard.processed.last(), Some(&41), "nothing after the failing block");
    assert_is_contiguous(&guard.processed);
    assert_eq!(guard.shutdowns, 1);
    drop(guard);
    assert_eq!(runner.heights().processed(), Some(41));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_token_stops_the_runner_cleanly() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(30, 30);
    let server = MockHttpServer::start(chain).await?;

    let (handler, state) = SharedRecordingHandler::new();
    let mut runner = Runner::new(config(server.url())?, every_block(), handler)?;
    let token = runner.cancellation_token();

    let watcher_state = state.clone();
    let watcher = tokio::spawn(async move {
        let reached = wait_for_processed(&watcher_state, 10, Duration::from_secs(10)).await;
        token.cancel();
        reached
    });

    timeout(Duration::from_secs(10), runner.run_until_ctrl_c())
        .await
        .context("runner did not exit after cancellation")??;
    watcher.await??;

    let guard = state.lock().await;
    assert!(guard.processed.len() >= 10);
    assert_is_contiguous(&guard.processed);
    assert_eq!(guard.shutdowns, 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_runner_resumes_after_last_processed_block() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(12, 12);
    let server = MockHttpServer::start(chain.clone()).await?;

    let (handler, state) = SharedRecordingHandler::new();
    let mut runner = Runner::new(config(server.url())?, every_block(), handler)?;

    runner.start().await?;
    wait_for_processed(&state, 12, Duration::from_secs(10)).await?;
    runner.stop().await?;

    chain.set_heights(20, 20);
    runner.start().await?;
    wait_for_processed(&state, 20, Duration::from_secs(10)).await?;
    runner.stop().await?;

    let guard = state.lock().await;
    assert_eq!(guard.processed, (1..=20).collect::<Vec<_>>());
    assert_eq!(guard.shutdowns, 2);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_does_not_wait_for_rpc_retries() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(10, 10);
    let server = MockHttpServer::start(chain.clone()).await?;

    let (handler, state) = SharedRecordingHandler::new();
    let mut runner = Runner::new(config(server.url())?, every_block(), handler)?;

    runner.start().await?;
    wait_for_processed(&state, 10, Duration::from_secs(10)).await?;

    // Head polling is now deep in a retry ladder that takes seconds to exhaust.
    chain.set_failing(true);
    sleep(Duration::from_millis(300)).await;

    timeout(Duration::from_secs(1), runner.stop())
        .await
        .context("stop waited for the failing node")??;

    let guard = state.lock().await;
    assert_eq!(guard.processed, (1..=10).collect::<Vec<_>>());
    assert_eq!(guard.shutdowns, 1);
    drop(guard);
    assert_eq!(runner.telemetry().snapshot().processed_blocks, 10);

    server.shutdown().await;
    Ok(())
}
