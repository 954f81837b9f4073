pub mod buffer;
pub mod dictionary;
pub mod processor;
pub mod project;
pub mod rpc;
pub mod runtime;

#[cfg(test)]
mod testing;

pub use buffer::{BoundedBuffer, BufferError};
pub use dictionary::{Dictionary, DictionaryPlanner, DictionaryResult, GraphqlDictionary, Plan};
pub use processor::dispatch::{BlockDispatcher, InlineBlockDispatcher};
pub use processor::fetcher::{FetchService, FillStep};
pub use processor::scale::{BatchScale, BatchScaleController};
pub use processor::tip::{ChainHeadTracker, HeightState};
pub use project::{
    BlockFilter, CallFilter, Datasource, DatasourceRegistry, Handler, HandlerKind, LogFilter,
};
pub use rpc::{BlockWrapper, CancellableChain, ChainClient, JsonRpcChainClient, RpcError};
pub use runtime::config::{IndexerConfig, IndexerConfigBuilder, IndexerConfigParams};
pub use runtime::events::{EventBus, IndexerEvent};
pub use runtime::handler::{BlockHandler, HandlerError, HandlerFuture, ProcessOutcome};
pub use runtime::monitor::{ProcessMemoryMonitor, ResourceMonitor};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
