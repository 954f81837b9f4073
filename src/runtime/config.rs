use crate::rpc::options::DEFAULT_BLOCK_INTERVAL;
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::time::Duration;

const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BLOCK_TIME_VARIANCE_SECS: u64 = 5;
const DEFAULT_IDLE_DELAY_SECS: u64 = 1;
const DEFAULT_BENCHMARK_INTERVAL_SECS: u64 = 15;

/// Runtime configuration for the indexing pipeline.
///
/// All instances must be constructed via [`IndexerConfig::builder`] or [`IndexerConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerConfig {
    rpc_url: String,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
    dictionary_url: Option<String>,
    batch_size: usize,
    scale_batch_size: bool,
    start_height: u64,
    block_time_variance: Duration,
    block_interval: Duration,
    idle_delay: Duration,
    rpc_timeout: Duration,
    metrics_interval: Duration,
    benchmark_interval: Duration,
    memory_limit_bytes: Option<u64>,
}

pub struct IndexerConfigParams {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub dictionary_url: Option<String>,
    pub batch_size: usize,
    pub scale_batch_size: bool,
    pub start_height: u64,
    pub block_time_variance: Duration,
    pub block_interval: Duration,
    pub idle_delay: Duration,
    pub rpc_timeout: Duration,
    pub metrics_interval: Duration,
    pub benchmark_interval: Duration,
    pub memory_limit_bytes: Option<u64>,
}

impl IndexerConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> IndexerConfigBuilder {
        IndexerConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`IndexerConfig::builder`] when most values use defaults.
    pub fn new(params: IndexerConfigParams) -> Result<Self> {
        let IndexerConfigParams {
            rpc_url,
            rpc_user,
            rpc_password,
            dictionary_url,
            batch_size,
            scale_batch_size,
            start_height,
            block_time_variance,
            block_interval,
            idle_delay,
            rpc_timeout,
            metrics_interval,
            benchmark_interval,
            memory_limit_bytes,
        } = params;

        let config = Self {
            rpc_url: rpc_url.trim().to_owned(),
            rpc_user: non_empty(rpc_user),
            rpc_password: non_empty(rpc_password),
            dictionary_url: non_empty(dictionary_url),
            batch_size,
            scale_batch_size,
            start_height,
            block_time_variance,
            block_interval,
            idle_delay,
            rpc_timeout,
            metrics_interval,
            benchmark_interval,
            memory_limit_bytes,
        };

        config.validate()?;
        Ok(config)
    }

    /// Full chain RPC URL, including scheme.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Basic-auth user; no auth header is sent without one.
    pub fn rpc_user(&self) -> Option<&str> {
        self.rpc_user.as_deref()
    }

    pub fn rpc_password(&self) -> Option<&str> {
        self.rpc_password.as_deref()
    }

    /// GraphQL dictionary endpoint. Dictionary acceleration is off without one.
    pub fn dictionary_url(&self) -> Option<&str> {
        self.dictionary_url.as_deref()
    }

    /// Target number of heights planned per cycle.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether memory pressure may shrink the batch.
    pub fn scale_batch_size(&self) -> bool {
        self.scale_batch_size
    }

    /// First height indexed when nothing has been buffered yet.
    pub fn start_height(&self) -> u64 {
        self.start_height
    }

    /// Upper bound on the chain head polling interval.
    pub fn block_time_variance(&self) -> Duration {
        self.block_time_variance
    }

    /// Expected time between blocks of the indexed chain; head polling runs at 90% of it.
    pub fn block_interval(&self) -> Duration {
        self.block_interval
    }

    /// Pause between planning cycles that found nothing to do.
    pub fn idle_delay(&self) -> Duration {
        self.idle_delay
    }

    /// Per-request timeout for chain RPC calls and dictionary queries.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn benchmark_interval(&self) -> Duration {
        self.benchmark_interval
    }

    /// Memory budget for pressure sampling; detected from the host when unset.
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.memory_limit_bytes
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.rpc_url, "rpc_url")?;
        if let Some(url) = &self.dictionary_url {
            validate_url(url, "dictionary_url")?;
        }

        if self.rpc_password.is_some() && self.rpc_user.is_none() {
            bail!("rpc_password requires rpc_user");
        }

        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }

        if self.block_time_variance.is_zero() {
            bail!("block_time_variance must be greater than 0");
        }

        if self.block_interval.is_zero() {
            bail!("block_interval must be greater than 0");
        }

        if self.idle_delay.is_zero() {
            bail!("idle_delay must be greater than 0");
        }

        if self.rpc_timeout.is_zero() {
            bail!("rpc_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.benchmark_interval.is_zero() {
            bail!("benchmark_interval must be greater than 0");
        }

        if self.memory_limit_bytes == Some(0) {
            bail!("memory_limit_bytes must be greater than 0 when set");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct IndexerConfigBuilder {
    rpc_url: Option<String>,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
    dictionary_url: Option<String>,
    batch_size: Option<usize>,
    scale_batch_size: Option<bool>,
    start_height: Option<u64>,
    block_time_variance: Option<Duration>,
    block_interval: Option<Duration>,
    idle_delay: Option<Duration>,
    rpc_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
    benchmark_interval: Option<Duration>,
    memory_limit_bytes: Option<u64>,
}

impl IndexerConfigBuilder {
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn rpc_user(mut self, user: impl Into<String>) -> Self {
        self.rpc_user = Some(user.into());
        self
    }

    pub fn rpc_password(mut self, password: impl Into<String>) -> Self {
        self.rpc_password = Some(password.into());
        self
    }

    pub fn dictionary_url(mut self, url: impl Into<String>) -> Self {
        self.dictionary_url = Some(url.into());
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn scale_batch_size(mut self, enabled: bool) -> Self {
        self.scale_batch_size = Some(enabled);
        self
    }

    pub fn start_height(mut self, height: u64) -> Self {
        self.start_height = Some(height);
        self
    }

    pub fn block_time_variance(mut self, variance: Duration) -> Self {
        self.block_time_variance = Some(variance);
        self
    }

    pub fn block_interval(mut self, interval: Duration) -> Self {
        self.block_interval = Some(interval);
        self
    }

    pub fn idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = Some(delay);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn benchmark_interval(mut self, interval: Duration) -> Self {
        self.benchmark_interval = Some(interval);
        self
    }

    pub fn memory_limit_bytes(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn build(self) -> Result<IndexerConfig> {
        let params = IndexerConfigParams {
            rpc_url: self.rpc_url.context("rpc_url is required")?,
            rpc_user: self.rpc_user,
            rpc_password: self.rpc_password,
            dictionary_url: self.dictionary_url,
            batch_size: self.batch_size.context("batch_size is required")?,
            scale_batch_size: self.scale_batch_size.unwrap_or(false),
            start_height: self.start_height.context("start_height is required")?,
            block_time_variance: self
                .block_time_variance
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_BLOCK_TIME_VARIANCE_SECS)),
            block_interval: self.block_interval.unwrap_or(DEFAULT_BLOCK_INTERVAL),
            idle_delay: self
                .idle_delay
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_IDLE_DELAY_SECS)),
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
            benchmark_interval: self
                .benchmark_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_BENCHMARK_INTERVAL_SECS)),
            memory_limit_bytes: self.memory_limit_bytes,
        };

        IndexerConfig::new(params)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn validate_url(url: &str, field: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("{field} must start with http:// or https://");
    }
    Ok(())
}
