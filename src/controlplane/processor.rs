//! Operation Processor
//!
//! Runs one opcode end to end: cluster and master gates, locks,
//! prerequisite checks, pre-hooks, execution and post-hooks.

use super::hooks::{HookPhase, HooksEnv, HooksRunnerRef, NoopHooks};
use super::locks::LockManager;
use super::opcodes::OpCode;
use super::operation::{Context, Feedback, OpResult};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Executes opcodes against a cluster
pub struct Processor {
    ctx: Context,
    locks: LockManager,
    hooks: HooksRunnerRef,
    /// Node this processor runs on
    local_node: String,
}

impl Processor {
    /// Processor running on `local_node`, with no hooks
    pub fn new(ctx: Context, local_node: impl Into<String>) -> Self {
        Self {
            ctx,
            locks: LockManager::new(),
            hooks: Arc::new(NoopHooks),
            local_node: local_node.into(),
        }
    }

    pub fn with_hooks(mut self, hooks: HooksRunnerRef) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Parse and run a JSON request
    pub async fn submit_json(&self, raw: &str, feedback: &dyn Feedback) -> Result<OpResult> {
        let op = OpCode::from_json(raw)?;
        self.submit(op, feedback).await
    }

    /// Run one opcode
    pub async fn submit(&self, op: OpCode, feedback: &dyn Feedback) -> Result<OpResult> {
        let schema = op.schema()?;
        let started = Instant::now();

        if schema.needs_cluster && !self.ctx.config.is_initialized() {
            return Err(Error::prereq(
                "Cluster not initialized yet, use 'cluster init' first",
            ));
        }
        if schema.needs_master {
            let master = self.ctx.config.master_node();
            if master != self.local_node {
                return Err(Error::prereq(format!(
                    "Commands must be run on the master node {}",
                    master
                )));
            }
        }

        let mut operation = op.into_operation();
        let scope = self.ctx.config.read(|cfg| operation.lock_scope(cfg));
        let _guard = self.locks.acquire(&scope).await;

        debug!("Checking prerequisites of {}", schema.name);
        if let Err(e) = operation.check_prereq(&self.ctx).await {
            warn!("{} rejected: {}", schema.name, e);
            return Err(e);
        }

        let hooks = match operation.hooks_path() {
            Some(path) => {
                let env = self.ctx.config.read(|cfg| operation.build_hooks_env(cfg));
                self.run_hooks(HookPhase::Pre, path, &env).await;
                Some((path, env))
            }
            None => None,
        };

        info!("Executing {}", schema.name);
        let result = operation.exec(&self.ctx, feedback).await;
        match &result {
            Ok(_) => {
                if let Some((path, env)) = &hooks {
                    self.run_hooks(HookPhase::Post, path, env).await;
                }
                info!("{} finished in {:?}", schema.name, started.elapsed());
            }
            Err(e) => error!("{} failed after {:?}: {}", schema.name, started.elapsed(), e),
        }
        result
    }

    async fn run_hooks(&self, phase: HookPhase, path: &str, env: &HooksEnv) {
        if let Err(e) = self.hooks.run(phase, path, env).await {
            warn!("{} hooks for {} failed: {}", phase, path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, ConfigStore, Node};
    use crate::controlplane::backends::{SimNodeSpec, SimulatedCluster};
    use crate::controlplane::hooks::RecordingHooks;
    use crate::controlplane::opcodes::{Empty, InstanceName};
    use crate::controlplane::operation::CollectingFeedback;
    use crate::storage::SyncPolicy;
    use assert_matches::assert_matches;

    fn processor(local: &str, master: &str) -> Processor {
        let config = ClusterConfig {
            nodes: vec![Node::new("node1", "192.0.2.1"), Node::new("node2", "192.0.2.2")],
            master_node: master.into(),
            ..Default::default()
        };
        let fleet = Arc::new(SimulatedCluster::from_config(&config, &SimNodeSpec::default()));
        let ctx = Context::new(ConfigStore::new(config), fleet, SyncPolicy::immediate());
        Processor::new(ctx, local)
    }

    #[tokio::test]
    async fn test_uninitialized_cluster_is_refused() {
        let processor = processor("node1", "");
        let result = processor
            .submit(OpCode::ClusterVerify(Empty {}), &CollectingFeedback::new())
            .await;
        assert_matches!(result, Err(Error::Prereq(msg)) if msg.contains("not initialized"));
    }

    #[tokio::test]
    async fn test_non_master_is_refused() {
        let processor = processor("node2", "node1");
        let result = processor
            .submit(OpCode::ClusterVerify(Empty {}), &CollectingFeedback::new())
            .await;
        assert_matches!(result, Err(Error::Prereq(msg)) if msg.contains("master node node1"));

        // queries may run anywhere
        let result = processor
            .submit_json(r#"{"op":"node_query"}"#, &CollectingFeedback::new())
            .await;
        assert_matches!(result, Ok(OpResult::Nodes(nodes)) if nodes.len() == 2);
    }

    #[tokio::test]
    async fn test_prereq_failure_runs_no_hooks() {
        let hooks = Arc::new(RecordingHooks::new());
        let processor = processor("node1", "node1").with_hooks(hooks.clone());
        let result = processor
            .submit(
                OpCode::InstanceShutdown(InstanceName {
                    instance_name: "missing".into(),
                }),
                &CollectingFeedback::new(),
            )
            .await;
        assert_matches!(result, Err(Error::Prereq(_)));
        assert!(hooks.runs().is_empty());
        assert!(!processor.locks().is_locked("instance/missing"));
        assert!(processor.locks().is_empty());
    }
}
