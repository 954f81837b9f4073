use crate::project::Datasource;
use crate::rpc::BlockWrapper;
use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;
use futures::future::BoxFuture;

pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ProcessOutcome, HandlerError>> + Send + 'a>>;

/// What a processed block asks of the fetch pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Datasources created while processing the block. They govern every height after it.
    pub dynamic_datasources: Vec<Datasource>,
}

impl ProcessOutcome {
    pub fn with_datasources(dynamic_datasources: Vec<Datasource>) -> Self {
        Self {
            dynamic_datasources,
        }
    }
}

/// Error surfaced by a [`BlockHandler`]. Every instance is considered fatal.
#[derive(Debug)]
pub struct HandlerError {
    height: u64,
    handler: Option<String>,
    source: AnyError,
}

impl HandlerError {
    pub fn new(height: u64, source: AnyError) -> Self {
        Self {
            height,
            handler: None,
            source,
        }
    }

    /// Attributes the failure to a named mapping handler.
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Replaces the reported height with the one the block actually had.
    pub(crate) fn at_height(mut self, height: u64) -> Self {
        self.height = height;
        self
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl core::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.handler {
            Some(handler) => write!(
                f,
                "handler {handler} failed at height {}: {}",
                self.height, self.source
            ),
            None => write!(
                f,
                "block processing failed at height {}: {}",
                self.height, self.source
            ),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// User pipeline fed one block at a time, in height order.
pub trait BlockHandler: Send + 'static {
    fn process<'a>(&'a mut self, block: BlockWrapper) -> HandlerFuture<'a>;

    /// Called once when the dispatch loop exits, including after a fatal error.
    fn shutdown<'a>(&'a mut self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
