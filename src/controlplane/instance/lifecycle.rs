//! Instance Lifecycle
//!
//! Start, shutdown and removal of instances, plus explicit activation and
//! deactivation of their disks.

use super::{instance_env_from, instance_scope};
use crate::config::{ClusterConfig, Instance};
use crate::controlplane::hooks::HooksEnv;
use crate::controlplane::locks::LockScope;
use crate::controlplane::opcodes::{InstanceName, InstanceRemove, InstanceStart};
use crate::controlplane::operation::{
    checked, expand_instance, Context, Feedback, LogicalOperation, OpResult,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Check bridges and free memory on the node the instance will run on
async fn check_node_can_run(ctx: &Context, instance: &Instance, node: &str) -> Result<()> {
    let bridges: Vec<String> = instance.nics.iter().map(|n| n.bridge.clone()).collect();
    if !ctx.rpc.bridges_exist(node, &bridges).await.unwrap_or(false) {
        return Err(Error::prereq(format!(
            "One or more target bridges {:?} does not exist on destination node '{}'",
            bridges, node
        )));
    }

    let info = ctx
        .rpc
        .node_info(node, &ctx.config.vg_name())
        .await
        .ok()
        .flatten()
        .ok_or_else(|| Error::prereq(format!("Cannot get current information from node '{}'", node)))?;
    if info.memory_free < instance.memory {
        return Err(Error::prereq(format!(
            "Not enough memory to start instance {} on node {} needed {} MiB, available {} MiB",
            instance.name, node, instance.memory, info.memory_free
        )));
    }
    Ok(())
}

// =============================================================================
// Start
// =============================================================================

pub struct StartInstance {
    req: InstanceStart,
    instance: Option<Instance>,
}

impl StartInstance {
    pub fn new(req: InstanceStart) -> Self {
        Self { req, instance: None }
    }
}

#[async_trait]
impl LogicalOperation for StartInstance {
    fn name(&self) -> &'static str {
        "instance_start"
    }

    fn hooks_path(&self) -> Option<&'static str> {
        Some("instance-start")
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        instance_scope(config, &self.req.instance_name)
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        let instance = expand_instance(&ctx.config, &self.req.instance_name)?;
        check_node_can_run(ctx, &instance, &instance.primary_node).await?;
        self.instance = Some(instance);
        Ok(())
    }

    fn build_hooks_env(&self, config: &ClusterConfig) -> HooksEnv {
        let Some(instance) = &self.instance else {
            return HooksEnv::default();
        };
        let mut env = instance_env_from(config, instance);
        env.set("INSTANCE_FORCE", self.req.force);
        env
    }

    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult> {
        let instance = checked(&self.instance, self.name())?;
        let node = &instance.primary_node;

        feedback.feedback(&format!("* activating disks of {}", instance.name));
        ctx.blockdev.start_disks(instance, Some(self.req.force)).await?;

        feedback.feedback(&format!("* starting instance {} on node {}", instance.name, node));
        let started = ctx
            .rpc
            .instance_start(node, instance, self.req.extra_args.as_deref())
            .await
            .unwrap_or_else(|e| {
                error!("{}", e);
                false
            });
        if !started {
            ctx.blockdev.shutdown_disks(instance, false).await?;
            return Err(Error::exec("Could not start instance"));
        }

        ctx.config.mark_instance_up(&instance.name)?;
        Ok(OpResult::Done)
    }
}

// =============================================================================
// Shutdown
// =============================================================================

pub struct ShutdownInstance {
    req: InstanceName,
    instance: Option<Instance>,
}

impl ShutdownInstance {
    pub fn new(req: InstanceName) -> Self {
        Self { req, instance: None }
    }
}

#[async_trait]
impl LogicalOperation for ShutdownInstance {
    fn name(&self) -> &'static str {
        "instance_shutdown"
    }

    fn hooks_path(&self) -> Option<&'static str> {
        Some("instance-stop")
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        instance_scope(config, &self.req.instance_name)
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        self.instance = Some(expand_instance(&ctx.config, &self.req.instance_name)?);
        Ok(())
    }

    fn build_hooks_env(&self, config: &ClusterConfig) -> HooksEnv {
        self.instance
            .as_ref()
            .map(|instance| instance_env_from(config, instance))
            .unwrap_or_default()
    }

    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult> {
        let instance = checked(&self.instance, self.name())?;
        let node = &instance.primary_node;

        feedback.feedback(&format!("* shutting down instance {} on node {}", instance.name, node));
        match ctx.rpc.instance_shutdown(node, instance).await {
            Ok(true) => {}
            Ok(false) => error!("could not shutdown instance {} on node {}", instance.name, node),
            Err(e) => error!("could not shutdown instance {}: {}", instance.name, e),
        }

        if !ctx.blockdev.shutdown_disks(instance, false).await? {
            warn!("Not all disks of {} could be shut down", instance.name);
        }
        ctx.config.mark_instance_down(&instance.name)?;
        Ok(OpResult::Done)
    }
}

// =============================================================================
// Remove
// =============================================================================

pub struct RemoveInstance {
    req: InstanceRemove,
    instance: Option<Instance>,
}

impl RemoveInstance {
    pub fn new(req: InstanceRemove) -> Self {
        Self { req, instance: None }
    }
}

#[async_trait]
impl LogicalOperation for RemoveInstance {
    fn name(&self) -> &'static str {
        "instance_remove"
    }

    fn hooks_path(&self) -> Option<&'static str> {
        Some("instance-remove")
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        instance_scope(config, &self.req.instance_name)
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        self.instance = Some(expand_instance(&ctx.config, &self.req.instance_name)?);
        Ok(())
    }

    fn build_hooks_env(&self, config: &ClusterConfig) -> HooksEnv {
        let Some(instance) = &self.instance else {
            return HooksEnv::default();
        };
        let mut env = instance_env_from(config, instance);
        // the instance's nodes are gone by the time post hooks run
        env.post_nodes = vec![config.master_node.clone()];
        env
    }

    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult> {
        let instance = checked(&self.instance, self.name())?;
        let node = &instance.primary_node;

        info!("shutting down instance {} on node {}", instance.name, node);
        let stopped = ctx
            .rpc
            .instance_shutdown(node, instance)
            .await
            .unwrap_or_else(|e| {
                error!("{}", e);
                false
            });
        if !stopped {
            if self.req.ignore_failures {
                feedback.feedback("Warning: can't shutdown instance");
            } else {
                return Err(Error::exec(format!(
                    "Could not shutdown instance {} on node {}",
                    instance.name, node
                )));
            }
        }

        info!("removing block devices for instance {}", instance.name);
        if !ctx.blockdev.remove_disks(instance).await? {
            feedback.feedback("Warning: can't remove all of the instance's disks");
        }

        info!("removing instance {} out of cluster config", instance.name);
        ctx.config.remove_instance(&instance.name)?;
        Ok(OpResult::Done)
    }
}

// =============================================================================
// Disk Activation
// =============================================================================

pub struct ActivateDisks {
    req: InstanceName,
    instance: Option<Instance>,
}

impl ActivateDisks {
    pub fn new(req: InstanceName) -> Self {
        Self { req, instance: None }
    }
}

#[async_trait]
impl LogicalOperation for ActivateDisks {
    fn name(&self) -> &'static str {
        "instance_activate_disks"
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        instance_scope(config, &self.req.instance_name)
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        self.instance = Some(expand_instance(&ctx.config, &self.req.instance_name)?);
        Ok(())
    }

    async fn exec(&mut self, ctx: &Context, _feedback: &dyn Feedback) -> Result<OpResult> {
        let instance = checked(&self.instance, self.name())?;
        let (disks_ok, devices) = ctx.blockdev.assemble_disks(instance, false).await?;
        if !disks_ok {
            return Err(Error::exec("Cannot activate block devices"));
        }
        Ok(OpResult::Disks(devices))
    }
}

pub struct DeactivateDisks {
    req: InstanceName,
    instance: Option<Instance>,
}

impl DeactivateDisks {
    pub fn new(req: InstanceName) -> Self {
        Self { req, instance: None }
    }
}

#[async_trait]
impl LogicalOperation for DeactivateDisks {
    fn name(&self) -> &'static str {
        "instance_deactivate_disks"
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        instance_scope(config, &self.req.instance_name)
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        self.instance = Some(expand_instance(&ctx.config, &self.req.instance_name)?);
        Ok(())
    }

    async fn exec(&mut self, ctx: &Context, _feedback: &dyn Feedback) -> Result<OpResult> {
        let instance = checked(&self.instance, self.name())?;
        let node = &instance.primary_node;

        let running = ctx
            .rpc
            .instance_list(node)
            .await
            .map_err(|e| Error::exec(format!("Can't contact node {}: {}", node, e)))?;
        if running.contains(&instance.name) {
            return Err(Error::exec("Instance is running, can't shutdown block devices."));
        }
        if !ctx.blockdev.shutdown_disks(instance, false).await? {
            return Err(Error::exec("Could not shut down all block devices"));
        }
        Ok(OpResult::Done)
    }
}
