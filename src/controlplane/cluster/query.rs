//! Queries and Node Maintenance
//!
//! Instance and node listings combining the config with live node data, and
//! removal of an idle node from the cluster.

use crate::config::{ClusterConfig, DiskTemplate, InstanceStatus, Node, NodeRole};
use crate::controlplane::hooks::HooksEnv;
use crate::controlplane::locks::LockScope;
use crate::controlplane::opcodes::{NameFilter, NodeRemove};
use crate::controlplane::operation::{
    checked, expand_instance, expand_node, Context, Feedback, LogicalOperation, OpResult,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

// =============================================================================
// Instances
// =============================================================================

/// One row of an instance listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub name: String,
    pub primary_node: String,
    pub secondary_nodes: Vec<String>,
    /// Administrative status
    pub status: InstanceStatus,
    /// Whether the hypervisor runs it; `None` when the primary did not answer
    pub running: Option<bool>,
    pub memory: u64,
    pub vcpus: u32,
    pub disk_template: DiskTemplate,
    pub os: String,
}

pub struct QueryInstances {
    req: NameFilter,
    names: Option<Vec<String>>,
}

impl QueryInstances {
    pub fn new(req: NameFilter) -> Self {
        Self { req, names: None }
    }
}

#[async_trait]
impl LogicalOperation for QueryInstances {
    fn name(&self) -> &'static str {
        "instance_query"
    }

    fn lock_scope(&self, _config: &ClusterConfig) -> LockScope {
        LockScope::new()
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        let names = if self.req.names.is_empty() {
            ctx.config.instance_names()
        } else {
            self.req
                .names
                .iter()
                .map(|name| expand_instance(&ctx.config, name).map(|i| i.name))
                .collect::<Result<Vec<_>>>()?
        };
        self.names = Some(names);
        Ok(())
    }

    async fn exec(&mut self, ctx: &Context, _feedback: &dyn Feedback) -> Result<OpResult> {
        let names = checked(&self.names, self.name())?;
        let config = ctx.config.snapshot();

        // one listing per primary node
        let mut running: BTreeMap<String, Option<Vec<String>>> = BTreeMap::new();
        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            let Some(instance) = config.instance(name) else {
                continue;
            };
            let node = &instance.primary_node;
            if !running.contains_key(node) {
                let listing = match ctx.rpc.instance_list(node).await {
                    Ok(list) => Some(list),
                    Err(e) => {
                        warn!("Cannot list instances on node {}: {}", node, e);
                        None
                    }
                };
                running.insert(node.clone(), listing);
            }
            let is_running = running
                .get(node)
                .and_then(|l| l.as_ref())
                .map(|l| l.contains(&instance.name));

            rows.push(InstanceSummary {
                name: instance.name.clone(),
                primary_node: instance.primary_node.clone(),
                secondary_nodes: instance.secondary_nodes.clone(),
                status: instance.status,
                running: is_running,
                memory: instance.memory,
                vcpus: instance.vcpus,
                disk_template: instance.disk_template,
                os: instance.os.clone(),
            });
        }
        Ok(OpResult::Instances(rows))
    }
}

// =============================================================================
// Nodes
// =============================================================================

/// One row of a node listing; live figures are `None` when the node did not
/// answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub name: String,
    pub primary_ip: String,
    pub secondary_ip: Option<String>,
    pub role: NodeRole,
    pub memory_total: Option<u64>,
    pub memory_free: Option<u64>,
    pub disk_total: Option<u64>,
    pub disk_free: Option<u64>,
    /// Instances using the node as primary
    pub primary_instances: usize,
    /// Instances replicating to the node
    pub secondary_instances: usize,
}

pub struct QueryNodes {
    req: NameFilter,
    names: Option<Vec<String>>,
}

impl QueryNodes {
    pub fn new(req: NameFilter) -> Self {
        Self { req, names: None }
    }
}

#[async_trait]
impl LogicalOperation for QueryNodes {
    fn name(&self) -> &'static str {
        "node_query"
    }

    fn lock_scope(&self, _config: &ClusterConfig) -> LockScope {
        LockScope::new()
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        let names = if self.req.names.is_empty() {
            ctx.config.node_names()
        } else {
            self.req
                .names
                .iter()
                .map(|name| expand_node(&ctx.config, name))
                .collect::<Result<Vec<_>>>()?
        };
        self.names = Some(names);
        Ok(())
    }

    async fn exec(&mut self, ctx: &Context, _feedback: &dyn Feedback) -> Result<OpResult> {
        let names = checked(&self.names, self.name())?;
        let config = ctx.config.snapshot();

        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            let Some(node) = config.node(name) else {
                continue;
            };
            let live = match ctx.rpc.node_info(name, &config.vg_name).await {
                Ok(info) => info,
                Err(e) => {
                    warn!("Cannot get information from node {}: {}", name, e);
                    None
                }
            };
            let (primary, secondary) = config.instances_on_node(name);
            rows.push(NodeSummary {
                name: node.name.clone(),
                primary_ip: node.primary_ip.clone(),
                secondary_ip: node.secondary_ip.clone(),
                role: config.node_role(name),
                memory_total: live.map(|i| i.memory_total),
                memory_free: live.map(|i| i.memory_free),
                disk_total: live.map(|i| i.vg_size),
                disk_free: live.map(|i| i.vg_free),
                primary_instances: primary.len(),
                secondary_instances: secondary.len(),
            });
        }
        Ok(OpResult::Nodes(rows))
    }
}

// =============================================================================
// Node Removal
// =============================================================================

pub struct RemoveNode {
    req: NodeRemove,
    node: Option<Node>,
}

impl RemoveNode {
    pub fn new(req: NodeRemove) -> Self {
        Self { req, node: None }
    }
}

#[async_trait]
impl LogicalOperation for RemoveNode {
    fn name(&self) -> &'static str {
        "node_remove"
    }

    fn hooks_path(&self) -> Option<&'static str> {
        Some("node-remove")
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        let name = config
            .expand_node_name(&self.req.node_name)
            .unwrap_or_else(|| self.req.node_name.clone());
        LockScope::new().node(name)
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        let name = expand_node(&ctx.config, &self.req.node_name)?;
        let config = ctx.config.snapshot();
        if config.master_node == name {
            return Err(Error::prereq(
                "Node is the master node, you need to failover first.",
            ));
        }
        if let Some(instance) = config.instances.iter().find(|i| i.uses_node(&name)) {
            return Err(Error::prereq(format!(
                "Instance {} still uses the node, please remove it first.",
                instance.name
            )));
        }
        self.node = config.node(&name).cloned();
        if self.node.is_none() {
            return Err(Error::prereq(format!("Node '{}' is unknown", name)));
        }
        Ok(())
    }

    fn build_hooks_env(&self, config: &ClusterConfig) -> HooksEnv {
        let Some(node) = &self.node else {
            return HooksEnv::default();
        };
        let mut env = HooksEnv::new();
        env.set("OP_TARGET", &node.name)
            .set("NODE_NAME", &node.name);
        let others: Vec<String> = config
            .node_names()
            .into_iter()
            .filter(|n| *n != node.name)
            .collect();
        env.pre_nodes = others.clone();
        env.post_nodes = others;
        env
    }

    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult> {
        let node = checked(&self.node, self.name())?;
        feedback.feedback(&format!("* removing node {} from the cluster", node.name));
        ctx.config.remove_node(&node.name)?;
        info!("Node {} removed", node.name);
        Ok(OpResult::Done)
    }
}
