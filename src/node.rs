//! Remote blockchain node contract and its JSON-RPC implementation.
//!
//! Every call is a single attempt bounded by a timeout. A timeout or
//! connection failure surfaces as a transient node error; retrying is the job
//! queue's business.

pub mod circuit_breaker;
pub mod client;
pub mod metrics;
pub mod options;

pub use circuit_breaker::{CircuitBreakerSnapshot, CircuitState, NodeCircuitBreaker};
pub use client::JsonRpcNodeClient;
pub use metrics::NodeMetricsSnapshot;
pub use options::NodeClientOptions;

use crate::error::IndexerResult;
use crate::model::{NodeValidator, RawBlock};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

pub type NodeFuture<'a, T> = BoxFuture<'a, IndexerResult<T>>;

/// Chain position as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub height: u64,
    #[serde(default)]
    pub finalized_height: u64,
    #[serde(default)]
    pub genesis_height: u64,
    #[serde(rename = "lastBlockID", default)]
    pub last_block_id: String,
}

pub trait NodeClient: Send + Sync {
    fn get_network_status(&self) -> NodeFuture<'_, NetworkStatus>;

    /// Addresses of the current generator/proposer rotation, in slot order.
    fn get_generator_list(&self) -> NodeFuture<'_, Vec<String>>;

    fn get_registered_modules(&self) -> NodeFuture<'_, Vec<String>>;

    fn get_block_by_height(&self, height: u64) -> NodeFuture<'_, Option<RawBlock>>;

    fn get_block_by_id<'a>(&'a self, id: &'a str) -> NodeFuture<'a, Option<RawBlock>>;

    fn get_validator<'a>(&'a self, address: &'a str) -> NodeFuture<'a, Option<NodeValidator>>;

    fn get_all_validators(&self) -> NodeFuture<'_, Vec<NodeValidator>>;
}
