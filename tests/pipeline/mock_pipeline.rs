use std::time::Duration;

use crate::support::{
    helpers::{
        assert_is_contiguous, init_tracing, log_datasource, wait_for_processed,
        SharedRecordingHandler,
    },
    mock_rpc::{MockChain, MockDictionary, MockHttpServer},
};
use anyhow::Result;
use blockfeed::{Datasource, Handler, IndexerConfig, IndexerEvent, Runner};
use tokio::sync::broadcast::Receiver;
use tokio::time::sleep;

const TOKEN_A: &str = "0x1111111111111111111111111111111111111111";
const TOKEN_B: &str = "0x2222222222222222222222222222222222222222";

fn config(rpc_url: &str, dictionary_url: Option<&str>) -> Result<IndexerConfig> {
    let mut builder = IndexerConfig::builder()
        .rpc_url(rpc_url)
        .batch_size(5)
        .start_height(1)
        .idle_delay(Duration::from_millis(20))
        .block_time_variance(Duration::from_millis(50))
        .rpc_timeout(Duration::from_secs(2));
    if let Some(url) = dictionary_url {
        builder = builder.dictionary_url(url);
    }
    builder.build()
}

fn every_block() -> Datasource {
    Datasource::new(vec![Handler::block("handle_block", None)]).named("blocks")
}

fn drain(rx: &mut Receiver<IndexerEvent>) -> Vec<IndexerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dense_pipeline_follows_the_finalized_head() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(25, 30);
    let server = MockHttpServer::start(chain.clone()).await?;

    let (handler, state) = SharedRecordingHandler::new();
    let mut runner = Runner::new(config(server.url(), None)?, vec![every_block()], handler)?;
    let mut events = runner.events().subscribe();
    runner.start().await?;

    wait_for_processed(&state, 25, Duration::from_secs(10)).await?;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        state.lock().await.processed,
        (1..=25).collect::<Vec<_>>(),
        "blocks past the finalized height must not be dispatched"
    );

    chain.set_heights(40, 45);
    wait_for_processed(&state, 40, Duration::from_secs(10)).await?;
    runner.stop().await?;

    let guard = state.lock().await;
    assert_eq!(guard.processed.first(), Some(&1));
    assert_eq!(guard.processed.last(), Some(&40));
    assert_is_contiguous(&guard.processed);
    assert_eq!(guard.shutdowns, 1);
    drop(guard);

    let observed = drain(&mut events);
    assert!(observed.contains(&IndexerEvent::UsingDictionary(false)));
    assert!(observed.contains(&IndexerEvent::BlockTarget(25)));
    assert!(observed.contains(&IndexerEvent::BlockTarget(40)));
    assert_eq!(runner.heights().processed(), Some(40));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dictionary_limits_fetching_to_matching_blocks() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(60, 60);
    let rpc = MockHttpServer::start(chain.clone()).await?;
    let dictionary =
        MockDictionary::new(chain.genesis_hash(), 60).with_logs(TOKEN_A, vec![5, 17, 33]);
    let dictionary_server = MockHttpServer::start_dictionary(dictionary.clone()).await?;

    let (handler, state) = SharedRecordingHandler::new();
    let mut runner = Runner::new(
        config(rpc.url(), Some(dictionary_server.url()))?,
        vec![log_datasource("token_a", TOKEN_A)],
        handler,
    )?;
    let mut events = runner.events().subscribe();
    runner.start().await?;

    wait_for_processed(&state, 33, Duration::from_secs(10)).await?;
    sleep(Duration::from_millis(200)).await;
    runner.stop().await?;

    assert_eq!(state.lock().await.processed, vec![5, 17, 33]);
    assert!(dictionary.queries() >= 1);
    assert!(
        chain.block_requests() < 10,
        "only genesis and matching blocks should be fetched, saw {} requests",
        chain.block_requests()
    );
    assert!(drain(&mut events).contains(&IndexerEvent::UsingDictionary(true)));

    dictionary_server.shutdown().await;
    rpc.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn foreign_dictionary_falls_back_to_dense_fetching() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(20, 20);
    let rpc = MockHttpServer::start(chain.clone()).await?;
    let dictionary = MockDictionary::new(format!("0x{}", "ab".repeat(32)), 20)
        .with_logs(TOKEN_A, vec![7]);
    let dictionary_server = MockHttpServer::start_dictionary(dictionary).await?;

    let (handler, state) = SharedRecordingHandler::new();
    let mut runner = Runner::new(
        config(rpc.url(), Some(dictionary_server.url()))?,
        vec![log_datasource("token_a", TOKEN_A)],
        handler,
    )?;
    runner.start().await?;

    wait_for_processed(&state, 20, Duration::from_secs(10)).await?;
    runner.stop().await?;

    assert_eq!(state.lock().await.processed, (1..=20).collect::<Vec<_>>());

    dictionary_server.shutdown().await;
    rpc.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dynamic_datasource_replans_after_its_creation_height() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(100, 100);
    let rpc = MockHttpServer::start(chain.clone()).await?;
    let dictionary = MockDictionary::new(chain.genesis_hash(), 100)
        .with_logs(TOKEN_A, vec![5, 50, 90])
        .with_logs(TOKEN_B, vec![20, 60]);
    let dictionary_server = MockHttpServer::start_dictionary(dictionary).await?;

    let (handler, state) = SharedRecordingHandler::new();
    let handler = handler.registering_at(5, vec![log_datasource("token_b", TOKEN_B)]);
    let mut runner = Runner::new(
        config(rpc.url(), Some(dictionary_server.url()))?,
        vec![log_datasource("token_a", TOKEN_A)],
        handler,
    )?;
    runner.start().await?;

    wait_for_processed(&state, 90, Duration::from_secs(10)).await?;
    sleep(Duration::from_millis(200)).await;
    runner.stop().await?;

    assert_eq!(state.lock().await.processed, vec![5, 20, 50, 60, 90]);
    assert_eq!(runner.registry().dynamic_count(), 1);

    dictionary_server.shutdown().await;
    rpc.shutdown().await;
    Ok(())
}
