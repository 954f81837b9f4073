use crate::dictionary::{Dictionary, DictionaryPlanner, GraphqlDictionary};
use crate::processor::dispatch::{BlockDispatcher, InlineBlockDispatcher, InlineDispatcherParams};
use crate::processor::fetcher::{FetchService, FetchServiceParams};
use crate::processor::lifecycle::Scheduler;
use crate::processor::scale::BatchScale;
use crate::processor::tip::HeightState;
use crate::project::{Datasource, DatasourceRegistry};
use crate::rpc::{CancellableChain, ChainClient, JsonRpcChainClient};
use crate::runtime::config::IndexerConfig;
use crate::runtime::events::EventBus;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::handler::BlockHandler;
use crate::runtime::monitor::{ProcessMemoryMonitor, ResourceMonitor};
use crate::runtime::progress::spawn_benchmark_reporter;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

struct RunningPipeline {
    scheduler: Scheduler,
    dispatcher: InlineBlockDispatcher,
    service: FetchService,
    fatal: FatalErrorHandler,
}

/// Wires the pipeline together, owns its lifecycle and handles OS signals for graceful
/// shutdowns.
pub struct Runner {
    config: IndexerConfig,
    chain: Arc<dyn ChainClient>,
    dictionary: Option<Arc<dyn Dictionary>>,
    monitor: Arc<dyn ResourceMonitor>,
    registry: Arc<DatasourceRegistry>,
    heights: Arc<HeightState>,
    events: EventBus,
    telemetry: Arc<Telemetry>,
    handler: Option<Box<dyn BlockHandler>>,
    shutdown: CancellationToken,
    running: Option<RunningPipeline>,
}

impl Runner {
    /// Builds the JSON-RPC chain client, the GraphQL dictionary (when configured) and the
    /// process memory monitor from `config`.
    pub fn new(
        config: IndexerConfig,
        datasources: Vec<Datasource>,
        handler: impl BlockHandler,
    ) -> Result<Self> {
        let chain = Arc::new(
            JsonRpcChainClient::from_config(&config).context("failed to build chain client")?,
        );
        let dictionary = match config.dictionary_url() {
            Some(url) => Some(Arc::new(
                GraphqlDictionary::new(url, config.rpc_timeout())
                    .context("failed to build dictionary client")?,
            ) as Arc<dyn Dictionary>),
            None => None,
        };
        Ok(Self::from_parts(
            config,
            chain,
            dictionary,
            datasources,
            Box::new(handler),
        ))
    }

    /// Uses caller-provided chain and dictionary clients.
    pub fn from_parts(
        config: IndexerConfig,
        chain: Arc<dyn ChainClient>,
        dictionary: Option<Arc<dyn Dictionary>>,
        datasources: Vec<Datasource>,
        handler: Box<dyn BlockHandler>,
    ) -> Self {
        let monitor = Arc::new(ProcessMemoryMonitor::new(config.memory_limit_bytes()));
        Self {
            config,
            chain,
            dictionary,
            monitor,
            registry: Arc::new(DatasourceRegistry::new(datasources)),
            heights: Arc::new(HeightState::new()),
            events: EventBus::default(),
            telemetry: Arc::new(Telemetry::default()),
            handler: Some(handler),
            shutdown: CancellationToken::new(),
            running: None,
        }
    }

    /// Replaces the memory pressure source used when batch scaling is enabled.
    pub fn with_monitor(mut self, monitor: Arc<dyn ResourceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn heights(&self) -> Arc<HeightState> {
        self.heights.clone()
    }

    pub fn registry(&self) -> Arc<DatasourceRegistry> {
        self.registry.clone()
    }

    /// Clears a latched dictionary genesis mismatch on the running pipeline.
    pub fn resync_dictionary(&self) -> bool {
        self.running
            .as_ref()
            .map(|running| running.service.resync_dictionary())
            .unwrap_or(false)
    }

    /// Configured start height, raised to the first height any static datasource wants.
    fn first_height(&self) -> u64 {
        let configured = self.config.start_height();
        self.registry
            .earliest_start_block()
            .map_or(configured, |start_block| start_block.max(configured))
    }

    /// Starts the pipeline after the last processed height, or at the first height wanted.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }
        let Some(handler) = self.handler.take() else {
            bail!("block handler is unavailable; the previous run lost it");
        };

        let run_token = self.shutdown.child_token();
        let fatal = FatalErrorHandler::new(self.shutdown.clone(), run_token.clone());
        let mut scheduler = Scheduler::new(&run_token);
        let scale = Arc::new(BatchScale::new());
        // Shutdown must not wait out a retry ladder against a failing node.
        let chain: Arc<dyn ChainClient> =
            Arc::new(CancellableChain::new(self.chain.clone(), scheduler.token()));

        let dispatcher = InlineBlockDispatcher::new(
            InlineDispatcherParams {
                chain: chain.clone(),
                registry: self.registry.clone(),
                heights: self.heights.clone(),
                scale: scale.clone(),
                events: self.events.clone(),
                telemetry: self.telemetry.clone(),
                fatal: fatal.clone(),
                batch_size: self.config.batch_size(),
                idle_delay: self.config.idle_delay(),
            },
            handler,
        );
        let planner = Arc::new(DictionaryPlanner::new(
            self.dictionary.clone(),
            self.events.clone(),
            self.telemetry.clone(),
        ));
        let service = FetchService::new(FetchServiceParams {
            chain,
            dispatcher: Arc::new(dispatcher.clone()),
            planner,
            registry: self.registry.clone(),
            heights: self.heights.clone(),
            scale,
            events: self.events.clone(),
            telemetry: self.telemetry.clone(),
            monitor: self
                .config
                .scale_batch_size()
                .then(|| self.monitor.clone()),
            batch_size: self.config.batch_size(),
            idle_delay: self.config.idle_delay(),
            block_time_variance: self.config.block_time_variance(),
        });

        let start_height = self
            .heights
            .processed()
            .map(|height| height.saturating_add(1))
            .unwrap_or_else(|| self.first_height());
        tracing::info!(
            start_height,
            batch_size = self.config.batch_size(),
            dictionary = self.dictionary.is_some(),
            "starting indexer"
        );

        if let Err(err) = service.start(start_height, &mut scheduler).await {
            scheduler.shutdown().await;
            self.handler = dispatcher.take_handler();
            return Err(err);
        }

        let metrics_dispatcher: Arc<dyn BlockDispatcher> = Arc::new(dispatcher.clone());
        scheduler.adopt(
            "metrics-reporter",
            spawn_metrics_reporter(
                self.telemetry.clone(),
                metrics_dispatcher,
                scheduler.token(),
                self.config.metrics_interval(),
            ),
        );
        scheduler.adopt(
            "benchmark-reporter",
            spawn_benchmark_reporter(
                &self.events,
                scheduler.token(),
                self.config.benchmark_interval(),
            ),
        );

        self.running = Some(RunningPipeline {
            scheduler,
            dispatcher,
            service,
            fatal,
        });
        Ok(())
    }

    /// Stops every task and returns the fatal error of the run, if one was captured.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        tracing::info!("stopping indexer");
        running.scheduler.shutdown().await;
        self.handler = running.dispatcher.take_handler();
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        match running.fatal.error() {
            Some(err) => Err(err.context("block processing pipeline aborted")),
            None => Ok(()),
        }
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere,
    /// including by a fatal pipeline error.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await
    }
}
