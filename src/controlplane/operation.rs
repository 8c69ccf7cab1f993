//! Logical Operation Framework
//!
//! Every cluster operation is a [`LogicalOperation`]: a read-only
//! `check_prereq` that validates and canonicalizes the request, an `exec`
//! that performs node-side effects before writing the config, and a hooks
//! environment. All working state lives in the operation value itself.

use super::cluster::query::{InstanceSummary, NodeSummary};
use super::cluster::verify::VerifyReport;
use super::hooks::HooksEnv;
use super::locks::LockScope;
use crate::config::{ClusterConfig, ConfigStore};
use crate::domain::ports::{NodeRpc, NodeRpcRef};
use crate::error::{Error, Result};
use crate::storage::{BlockDeviceOrchestrator, DiskDevice, SyncPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

// =============================================================================
// Context
// =============================================================================

/// Everything an operation may touch
#[derive(Clone)]
pub struct Context {
    pub config: Arc<ConfigStore>,
    pub rpc: NodeRpcRef,
    pub blockdev: BlockDeviceOrchestrator,
}

impl Context {
    pub fn new(config: Arc<ConfigStore>, rpc: NodeRpcRef, policy: SyncPolicy) -> Self {
        let blockdev = BlockDeviceOrchestrator::new(rpc.clone(), policy);
        Self {
            config,
            rpc,
            blockdev,
        }
    }

    pub fn rpc(&self) -> &dyn NodeRpc {
        self.rpc.as_ref()
    }
}

// =============================================================================
// Feedback
// =============================================================================

/// Sink for human-readable progress lines
pub trait Feedback: Send + Sync {
    fn feedback(&self, msg: &str);
}

/// Forwards progress to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFeedback;

impl Feedback for LogFeedback {
    fn feedback(&self, msg: &str) {
        info!("{}", msg);
    }
}

/// Buffers progress lines
#[derive(Debug, Default)]
pub struct CollectingFeedback {
    lines: Mutex<Vec<String>>,
}

impl CollectingFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}

impl Feedback for CollectingFeedback {
    fn feedback(&self, msg: &str) {
        self.lines.lock().push(msg.to_string());
    }
}

// =============================================================================
// Results
// =============================================================================

/// What a successful operation hands back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum OpResult {
    /// Nothing beyond success
    Done,
    /// Device paths of assembled disks
    Disks(Vec<DiskDevice>),
    /// Cluster verification outcome
    Verify(VerifyReport),
    Instances(Vec<InstanceSummary>),
    Nodes(Vec<NodeSummary>),
}

// =============================================================================
// Logical Operation
// =============================================================================

/// One cluster operation
#[async_trait]
pub trait LogicalOperation: Send + Sync {
    /// Opcode name, for logging
    fn name(&self) -> &'static str;

    /// Hooks directory of the operation; `None` runs no hooks
    fn hooks_path(&self) -> Option<&'static str> {
        None
    }

    /// Objects to lock, derived from the (not yet canonical) request
    fn lock_scope(&self, config: &ClusterConfig) -> LockScope;

    /// Validate against the current config and node state; never mutates
    async fn check_prereq(&mut self, ctx: &Context) -> Result<()>;

    /// Perform the operation
    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult>;

    /// Hooks environment; called after a successful `check_prereq`
    fn build_hooks_env(&self, _config: &ClusterConfig) -> HooksEnv {
        HooksEnv::default()
    }
}

/// Resolved state an operation stores during `check_prereq`
pub(crate) fn checked<'a, T>(state: &'a Option<T>, op: &str) -> Result<&'a T> {
    state
        .as_ref()
        .ok_or_else(|| Error::Invariant(format!("{} executed before its prerequisites were checked", op)))
}

/// Resolve a short node name or fail the prerequisites
pub(crate) fn expand_node(config: &ConfigStore, name: &str) -> Result<String> {
    config
        .expand_node_name(name)
        .ok_or_else(|| Error::prereq(format!("Node '{}' is unknown", name)))
}

/// Resolve a short instance name or fail the prerequisites
pub(crate) fn expand_instance(config: &ConfigStore, name: &str) -> Result<crate::config::Instance> {
    config
        .expand_instance_name(name)
        .and_then(|full| config.instance(&full))
        .ok_or_else(|| Error::prereq(format!("Instance '{}' not known", name)))
}
