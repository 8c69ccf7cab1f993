//! Cluster Control Plane
//!
//! Turns opcodes into validated, locked and hooked logical operations that
//! drive nodes through the [`NodeRpc`](crate::domain::ports::NodeRpc) port
//! and record the outcome in the cluster config.

pub mod backends;
pub mod cluster;
pub mod hooks;
pub mod instance;
pub mod locks;
pub mod opcodes;
pub mod operation;
pub mod processor;
pub mod undo;

pub use backends::{BackendFactory, RpcCall, SimNodeSpec, SimulatedCluster, TimeoutRpc};
pub use cluster::{InstanceSummary, NodeSummary, VerifyReport};
pub use hooks::{HookPhase, HooksEnv, HooksRunner, HooksRunnerRef, NoopHooks};
pub use locks::{LockGuard, LockManager, LockScope};
pub use opcodes::{OpCode, OpSchema};
pub use operation::{CollectingFeedback, Context, Feedback, LogFeedback, LogicalOperation, OpResult};
pub use processor::Processor;
pub use undo::{UndoAction, UndoStack};
