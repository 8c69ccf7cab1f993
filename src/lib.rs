//! VM Cluster Manager - Control Plane Core
//!
//! Manages virtual machine instances across a cluster of hypervisor nodes:
//! generates the block-device trees backing each instance, drives the nodes
//! to create, assemble, mirror and remove them, and keeps an authoritative
//! cluster config consistent with what the nodes actually hold.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          Operation Processor                                 │
//! │        opcode → gates → locks → CheckPrereq → hooks → Exec → hooks           │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    Instance     │  │     Mirror      │  │         Cluster             │  │
//! │  │   Lifecycle     │  │   Management    │  │   Verify / Query / Nodes    │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │ Block Device          │     ┌──────────────────────┐   │
//! │                    │ Orchestrator          │     │  Disk Templates      │   │
//! │                    └───────────┬───────────┘     └──────────────────────┘   │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │  ConfigStore (JSON, serial)    │   NodeRpc port → simulated fleet / timeout │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: Cluster config model and its store
//! - [`storage`]: Disk template generation, placement and block device orchestration
//! - [`controlplane`]: Operation framework, opcodes and all cluster operations
//! - [`domain`]: Node RPC port
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod storage;

// Re-export commonly used types
pub use config::{
    ClusterConfig, ConfigEvent, ConfigStore, DeviceKind, Disk, DiskTemplate, Instance,
    InstanceStatus, LogicalId, Nic, Node, NodeRole,
};

pub use controlplane::{
    BackendFactory, CollectingFeedback, Context, Feedback, LogFeedback, OpCode, OpResult,
    Processor, SimNodeSpec, SimulatedCluster, VerifyReport,
};

pub use domain::ports::{DeviceStatus, NodeInfo, NodeRpc, NodeRpcRef};

pub use error::{Error, Result};

pub use storage::{
    generate_disk_template, required_free_space, BlockDeviceOrchestrator, SyncPolicy,
};

/// Library version, also the protocol version nodes must report
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
