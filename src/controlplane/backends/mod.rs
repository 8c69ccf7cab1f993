//! Node RPC Adapters
//!
//! Provides adapters behind the [`NodeRpc`](crate::domain::ports::NodeRpc) port:
//! - Simulated: in-memory node fleet
//! - Timeout: deadline guard around any other adapter

pub mod simulated;
pub mod timeout;

pub use simulated::*;
pub use timeout::*;

use crate::config::ClusterConfig;
use crate::domain::ports::NodeRpcRef;
use std::sync::Arc;
use std::time::Duration;

/// Factory for node RPC adapters
pub struct BackendFactory;

impl BackendFactory {
    /// A simulated fleet mirroring the config, optionally behind a deadline
    pub fn simulated(config: &ClusterConfig, spec: &SimNodeSpec, timeout: Option<Duration>) -> NodeRpcRef {
        let fleet: NodeRpcRef = Arc::new(SimulatedCluster::from_config(config, spec));
        match timeout {
            Some(timeout) => TimeoutRpc::wrap(fleet, timeout),
            None => fleet,
        }
    }
}
