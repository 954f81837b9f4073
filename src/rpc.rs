//! Chain access: the `ChainClient` capability, its EVM JSON-RPC implementation,
//! authentication, metrics, options, and hex helpers.

pub mod auth;
pub mod chain;
pub mod client;
pub mod helpers;
pub mod metrics;
pub mod options;

pub use chain::{BlockWrapper, CancellableChain, ChainClient};
pub use client::{JsonRpcChainClient, RpcError};
pub use helpers::{parse_hex_quantity, to_hex_quantity};
pub use metrics::RpcMetricsSnapshot;
pub use options::RpcClientOptions;
