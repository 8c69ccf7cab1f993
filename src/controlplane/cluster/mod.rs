//! Cluster-wide Operations
//!
//! Read-only verification of every node and instance, queries and node
//! maintenance.

pub mod query;
pub mod verify;

pub use query::{InstanceSummary, NodeSummary, QueryInstances, QueryNodes, RemoveNode};
pub use verify::{VerifyCluster, VerifyReport};
