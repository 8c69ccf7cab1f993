//! Live Mirror Management
//!
//! Adding, removing and replacing the replicated legs of a running
//! network-mirrored instance. New legs are built next to the old ones and
//! attached to the mirror on the primary; old legs are only dropped once
//! the new ones are in place.

use super::{instance_env_from, instance_scope};
use crate::config::{ClusterConfig, DeviceKind, Disk, DiskTemplate, Instance};
use crate::controlplane::hooks::HooksEnv;
use crate::controlplane::locks::LockScope;
use crate::controlplane::opcodes::{
    InstanceAddMirrorLeg, InstanceRemoveMirrorLeg, InstanceReplaceDisks,
};
use crate::controlplane::operation::{
    checked, expand_instance, expand_node, Context, Feedback, LogicalOperation, OpResult,
};
use crate::controlplane::undo::{UndoAction, UndoStack};
use crate::error::{Error, Result};
use crate::storage::{generate_replicated_branch, BlockDeviceOrchestrator};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Load an instance and check its mirrors can be managed live
fn mirrored_instance(ctx: &Context, name: &str) -> Result<Instance> {
    let instance = expand_instance(&ctx.config, name)?;
    if instance.disk_template != DiskTemplate::RemoteRaid1 {
        return Err(Error::prereq("Instance's disk layout is not remote_raid1."));
    }
    if !instance.is_up() {
        return Err(Error::prereq(format!(
            "Instance {} is not running, its mirrors cannot be changed",
            instance.name
        )));
    }
    Ok(instance)
}

/// Resolve the requested remote node, refusing the instance's primary
fn remote_node(ctx: &Context, instance: &Instance, name: &str) -> Result<String> {
    let node = expand_node(&ctx.config, name)?;
    if node == instance.primary_node {
        return Err(Error::prereq("The specified node is the primary node of the instance."));
    }
    Ok(node)
}

/// Recompute the secondary nodes from the replicated pairs still in use,
/// keeping the existing order
fn refresh_secondary_nodes(instance: &mut Instance) {
    let mut peers = Vec::new();
    for disk in &instance.disks {
        collect_peers(disk, &instance.primary_node, &mut peers);
    }
    let mut nodes: Vec<String> = instance
        .secondary_nodes
        .iter()
        .filter(|n| peers.contains(n))
        .cloned()
        .collect();
    for peer in peers {
        if !nodes.contains(&peer) {
            nodes.push(peer);
        }
    }
    instance.secondary_nodes = nodes;
}

fn collect_peers(disk: &Disk, primary: &str, peers: &mut Vec<String>) {
    if let Some((a, b)) = disk.replicated_nodes() {
        for node in [a, b] {
            if node != primary && !peers.iter().any(|p| p == node) {
                peers.push(node.to_string());
            }
        }
    }
    for child in &disk.children {
        collect_peers(child, primary, peers);
    }
}

/// Build a new replicated leg for `disk` and attach it to the mirror on the
/// primary. Everything done is recorded on `undo`.
async fn add_leg(
    ctx: &Context,
    instance: &Instance,
    disk: &Disk,
    remote: &str,
    undo: &mut UndoStack,
) -> Result<Disk> {
    let primary = &instance.primary_node;
    let port = ctx.config.allocate_port()?;
    let base = format!("{}-{}-{}", instance.name, disk.iv_name(), port);
    let mut leg =
        generate_replicated_branch(&ctx.config.vg_name(), primary, remote, disk.size, &base, port);
    let info = BlockDeviceOrchestrator::info_text(instance);

    info!("Adding leg {} to {} of {}", leg.key(), disk.iv_name(), instance.name);
    if !ctx
        .blockdev
        .create_on_secondary(remote, &mut leg, false, &info, undo)
        .await
    {
        return Err(Error::exec(format!(
            "Failed to create new component on secondary node {}",
            remote
        )));
    }
    if !ctx
        .blockdev
        .create_on_primary(primary, &mut leg, &info, undo)
        .await
    {
        return Err(Error::exec(format!(
            "Failed to create new component on primary node {}",
            primary
        )));
    }

    let attached = ctx
        .rpc
        .blockdev_addchild(primary, disk, &leg)
        .await
        .unwrap_or_else(|e| {
            error!("{}", e);
            false
        });
    if !attached {
        return Err(Error::exec(format!(
            "Can't add mirror component to md array {}",
            disk.iv_name()
        )));
    }
    undo.push(UndoAction::DetachChild {
        node: primary.clone(),
        parent: disk.clone(),
        child: leg.clone(),
    });
    Ok(leg)
}

/// Detach a leg from the mirror on the primary and remove it from both of
/// its endpoints. Only the detach is fatal.
async fn drop_leg(ctx: &Context, instance: &Instance, disk: &Disk, leg: &Disk) -> Result<()> {
    let primary = &instance.primary_node;
    let detached = ctx
        .rpc
        .blockdev_removechild(primary, disk, leg)
        .await
        .unwrap_or_else(|e| {
            error!("{}", e);
            false
        });
    if !detached {
        return Err(Error::exec(format!(
            "Can't remove child {} from mirror {}",
            leg.key(),
            disk.iv_name()
        )));
    }

    if let Some((a, b)) = leg.replicated_nodes() {
        for node in [a, b] {
            match ctx.rpc.blockdev_remove(node, leg).await {
                Ok(true) => {}
                Ok(false) => warn!("Can't remove child {} on node {}", leg.key(), node),
                Err(e) => warn!("Can't remove child {} on node {}: {}", leg.key(), node, e),
            }
        }
    }
    Ok(())
}

async fn wait_for_sync_logged(ctx: &Context, instance: &Instance) {
    match ctx.blockdev.wait_for_sync(instance, false).await {
        Ok(true) => {}
        Ok(false) => warn!("Some disks of {} are degraded after the sync", instance.name),
        Err(e) => warn!("Could not wait for the disks of {} to sync: {}", instance.name, e),
    }
}

// =============================================================================
// Add Mirror Leg
// =============================================================================

pub struct AddMirrorLeg {
    req: InstanceAddMirrorLeg,
    instance: Option<Instance>,
    remote: Option<String>,
}

impl AddMirrorLeg {
    pub fn new(req: InstanceAddMirrorLeg) -> Self {
        Self {
            req,
            instance: None,
            remote: None,
        }
    }
}

#[async_trait]
impl LogicalOperation for AddMirrorLeg {
    fn name(&self) -> &'static str {
        "instance_add_mirror_leg"
    }

    fn hooks_path(&self) -> Option<&'static str> {
        Some("mirror-add")
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        let remote = config
            .expand_node_name(&self.req.remote_node)
            .unwrap_or_else(|| self.req.remote_node.clone());
        instance_scope(config, &self.req.instance_name).node(remote)
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        let instance = mirrored_instance(ctx, &self.req.instance_name)?;
        let remote = remote_node(ctx, &instance, &self.req.remote_node)?;
        let disk = instance.find_disk(&self.req.disk_name).ok_or_else(|| {
            Error::prereq(format!(
                "Can't find this device ('{}') in the instance.",
                self.req.disk_name
            ))
        })?;
        if disk.children.len() > 1 {
            return Err(Error::prereq(
                "The device already has two slave devices. This would create a 3-disk raid1 which we don't allow.",
            ));
        }
        self.remote = Some(remote);
        self.instance = Some(instance);
        Ok(())
    }

    fn build_hooks_env(&self, config: &ClusterConfig) -> HooksEnv {
        let Some(instance) = &self.instance else {
            return HooksEnv::default();
        };
        let mut env = instance_env_from(config, instance);
        env.set("NEW_SECONDARY", self.remote.as_deref().unwrap_or(""))
            .set("DISK_NAME", &self.req.disk_name);
        if let Some(remote) = &self.remote {
            env.pre_nodes.push(remote.clone());
            env.post_nodes.push(remote.clone());
        }
        env
    }

    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult> {
        let mut instance = checked(&self.instance, self.name())?.clone();
        let remote = checked(&self.remote, self.name())?;
        let disk = instance
            .find_disk(&self.req.disk_name)
            .cloned()
            .ok_or_else(|| Error::Invariant(format!("disk {} vanished", self.req.disk_name)))?;

        feedback.feedback(&format!("* adding new mirror component on {}", remote));
        let mut undo = UndoStack::new();
        let leg = match add_leg(ctx, &instance, &disk, remote, &mut undo).await {
            Ok(leg) => leg,
            Err(e) => {
                undo.unwind(ctx.rpc(), &ctx.config).await;
                return Err(e);
            }
        };
        undo.commit();

        if let Some(target) = instance.find_disk_mut(&self.req.disk_name) {
            target.children.push(leg);
        }
        refresh_secondary_nodes(&mut instance);
        ctx.config.update_instance(instance.clone())?;

        wait_for_sync_logged(ctx, &instance).await;
        Ok(OpResult::Done)
    }
}

// =============================================================================
// Remove Mirror Leg
// =============================================================================

pub struct RemoveMirrorLeg {
    req: InstanceRemoveMirrorLeg,
    instance: Option<Instance>,
}

impl RemoveMirrorLeg {
    pub fn new(req: InstanceRemoveMirrorLeg) -> Self {
        Self { req, instance: None }
    }
}

#[async_trait]
impl LogicalOperation for RemoveMirrorLeg {
    fn name(&self) -> &'static str {
        "instance_remove_mirror_leg"
    }

    fn hooks_path(&self) -> Option<&'static str> {
        Some("mirror-remove")
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        instance_scope(config, &self.req.instance_name)
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        let instance = mirrored_instance(ctx, &self.req.instance_name)?;
        let disk = instance.find_disk(&self.req.disk_name).ok_or_else(|| {
            Error::prereq(format!(
                "Can't find this device ('{}') in the instance.",
                self.req.disk_name
            ))
        })?;
        let leg = disk
            .children
            .iter()
            .find(|c| c.kind == DeviceKind::Replicated && c.port() == Some(self.req.disk_id))
            .ok_or_else(|| Error::prereq("Can't find the device with this port."))?;
        if disk.children.len() < 2 {
            return Err(Error::prereq("Cannot remove the last component from a mirror."));
        }
        info!("Will remove leg {} from {}", leg.key(), disk.iv_name());
        self.instance = Some(instance);
        Ok(())
    }

    fn build_hooks_env(&self, config: &ClusterConfig) -> HooksEnv {
        let Some(instance) = &self.instance else {
            return HooksEnv::default();
        };
        let mut env = instance_env_from(config, instance);
        env.set("DISK_NAME", &self.req.disk_name)
            .set("DISK_ID", self.req.disk_id);
        env
    }

    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult> {
        let mut instance = checked(&self.instance, self.name())?.clone();
        let port = self.req.disk_id;
        let (disk, leg) = instance
            .find_disk(&self.req.disk_name)
            .and_then(|d| {
                d.children
                    .iter()
                    .find(|c| c.port() == Some(port))
                    .map(|leg| (d.clone(), leg.clone()))
            })
            .ok_or_else(|| Error::Invariant(format!("leg {} vanished", port)))?;

        feedback.feedback(&format!("* removing mirror component {}", leg.key()));
        drop_leg(ctx, &instance, &disk, &leg).await?;

        if let Some(target) = instance.find_disk_mut(&self.req.disk_name) {
            target.children.retain(|c| c.port() != Some(port));
        }
        refresh_secondary_nodes(&mut instance);
        ctx.config.update_instance(instance)?;
        Ok(OpResult::Done)
    }
}

// =============================================================================
// Replace Disks
// =============================================================================

pub struct ReplaceDisks {
    req: InstanceReplaceDisks,
    instance: Option<Instance>,
    remote: Option<String>,
}

impl ReplaceDisks {
    pub fn new(req: InstanceReplaceDisks) -> Self {
        Self {
            req,
            instance: None,
            remote: None,
        }
    }
}

#[async_trait]
impl LogicalOperation for ReplaceDisks {
    fn name(&self) -> &'static str {
        "instance_replace_disks"
    }

    fn hooks_path(&self) -> Option<&'static str> {
        Some("mirrors-replace")
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        let scope = instance_scope(config, &self.req.instance_name);
        match &self.req.remote_node {
            Some(remote) => scope.node(
                config
                    .expand_node_name(remote)
                    .unwrap_or_else(|| remote.clone()),
            ),
            None => scope,
        }
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        let instance = mirrored_instance(ctx, &self.req.instance_name)?;
        let remote = match &self.req.remote_node {
            Some(name) => remote_node(ctx, &instance, name)?,
            None => instance
                .secondary_nodes
                .first()
                .cloned()
                .ok_or_else(|| Error::prereq("The instance has no secondary node"))?,
        };
        for disk in &instance.disks {
            if disk.children.len() != 1 {
                return Err(Error::prereq(format!(
                    "The device {} has more than one component (or none), cannot replace",
                    disk.iv_name()
                )));
            }
        }
        self.remote = Some(remote);
        self.instance = Some(instance);
        Ok(())
    }

    fn build_hooks_env(&self, config: &ClusterConfig) -> HooksEnv {
        let Some(instance) = &self.instance else {
            return HooksEnv::default();
        };
        let mut env = instance_env_from(config, instance);
        let remote = self.remote.clone().unwrap_or_default();
        env.set("NEW_SECONDARY", &remote)
            .set("OLD_SECONDARY", instance.secondary_nodes.join(" "));
        if !remote.is_empty() && !env.pre_nodes.contains(&remote) {
            env.pre_nodes.push(remote.clone());
            env.post_nodes.push(remote);
        }
        env
    }

    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult> {
        let mut instance = checked(&self.instance, self.name())?.clone();
        let remote = checked(&self.remote, self.name())?;
        let primary = instance.primary_node.clone();

        // old leg and new leg, per disk
        let mut legs: Vec<(String, Disk, Disk)> = Vec::with_capacity(instance.disks.len());
        let mut undo = UndoStack::new();
        for disk in &instance.disks {
            feedback.feedback(&format!("* adding new mirror component to {}", disk.iv_name()));
            let old = disk.children.first().cloned().ok_or_else(|| {
                Error::Invariant(format!("mirror {} has no children", disk.key()))
            })?;
            match add_leg(ctx, &instance, disk, remote, &mut undo).await {
                Ok(new) => legs.push((disk.iv_name().to_string(), old, new)),
                Err(e) => {
                    undo.unwind(ctx.rpc(), &ctx.config).await;
                    return Err(e);
                }
            }
        }
        undo.commit();

        for (iv_name, _, new) in &legs {
            if let Some(disk) = instance.find_disk_mut(iv_name) {
                disk.children.push(new.clone());
            }
        }
        refresh_secondary_nodes(&mut instance);
        ctx.config.update_instance(instance.clone())?;

        wait_for_sync_logged(ctx, &instance).await;

        for (iv_name, _, new) in &legs {
            let disk = instance
                .find_disk(iv_name)
                .ok_or_else(|| Error::Invariant(format!("disk {} vanished", iv_name)))?;
            for (device, what) in [(disk, "Mirror"), (new, "New replicated device")] {
                match ctx.rpc.blockdev_find(&primary, device).await {
                    Ok(Some(status)) if !status.is_degraded => {}
                    Ok(Some(_)) => {
                        return Err(Error::exec(format!("{} {} is degraded!", what, device.key())))
                    }
                    Ok(None) => {
                        return Err(Error::exec(format!("Can't find device {}", device.key())))
                    }
                    Err(e) => return Err(Error::exec(format!("Can't check {}: {}", device.key(), e))),
                }
            }
        }

        for (iv_name, old, _) in &legs {
            feedback.feedback(&format!("* removing old mirror component of {}", iv_name));
            let disk = instance
                .find_disk(iv_name)
                .cloned()
                .ok_or_else(|| Error::Invariant(format!("disk {} vanished", iv_name)))?;
            if let Err(e) = drop_leg(ctx, &instance, &disk, old).await {
                warn!("{}, leaving it in place", e);
                continue;
            }
            if let Some(disk) = instance.find_disk_mut(iv_name) {
                disk.children.retain(|c| c.key() != old.key());
            }
            refresh_secondary_nodes(&mut instance);
            ctx.config.update_instance(instance.clone())?;
        }
        Ok(OpResult::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::RpcCall;
    use crate::controlplane::instance::testutil::Harness;
    use crate::controlplane::opcodes::{InstanceName, OpCode};
    use assert_matches::assert_matches;

    fn add(remote: &str, disk: &str) -> OpCode {
        OpCode::InstanceAddMirrorLeg(InstanceAddMirrorLeg {
            instance_name: "web1".into(),
            remote_node: remote.into(),
            disk_name: disk.into(),
        })
    }

    fn remove(disk: &str, port: u16) -> OpCode {
        OpCode::InstanceRemoveMirrorLeg(InstanceRemoveMirrorLeg {
            instance_name: "web1".into(),
            disk_name: disk.into(),
            disk_id: port,
        })
    }

    /// Running web1, with room on the primary for a second set of legs
    async fn setup() -> (Harness, Instance) {
        let h = Harness::new();
        let web1 = h.create_web1().await;
        h.fleet.set_vg_free("n1.example.com", 20000);
        (h, web1)
    }

    fn replace(remote: Option<&str>) -> OpCode {
        OpCode::InstanceReplaceDisks(InstanceReplaceDisks {
            instance_name: "web1".into(),
            remote_node: remote.map(String::from),
        })
    }

    #[tokio::test]
    async fn test_add_then_remove_restores_children() {
        let (h, before) = setup().await;
        let sda = before.find_disk("sda").unwrap().clone();

        h.run(add("n3", "sda")).await.unwrap();
        let grown = h.instance("web1");
        let disk = grown.find_disk("sda").unwrap();
        assert_eq!(disk.children.len(), 2);
        let leg = &disk.children[1];
        assert_eq!(leg.replicated_nodes(), Some(("n1.example.com", "n3.example.com")));
        assert_eq!(
            grown.secondary_nodes,
            vec!["n2.example.com".to_string(), "n3.example.com".to_string()]
        );
        assert_eq!(
            h.fleet.attached_children("n1.example.com", &sda).map(|c| c.len()),
            Some(2)
        );
        assert_eq!(h.fleet.vg_free("n3.example.com"), Some(20000 - 10240 - 128));

        let port = leg.port().unwrap();
        h.run(remove("sda", port)).await.unwrap();
        let after = h.instance("web1");
        assert_eq!(after.disks, before.disks);
        assert_eq!(after.secondary_nodes, before.secondary_nodes);
        assert_eq!(
            h.fleet.attached_children("n1.example.com", &sda),
            Some(vec![sda.children[0].key()])
        );
        assert_eq!(h.fleet.vg_free("n3.example.com"), Some(20000));
    }

    #[tokio::test]
    async fn test_remove_last_leg_is_refused() {
        let (h, web1) = setup().await;
        let port = web1.disks[0].children[0].port().unwrap();

        assert_matches!(
            h.run(remove("sda", port)).await,
            Err(Error::Prereq(msg)) if msg.contains("last component")
        );
        assert_matches!(h.run(remove("sda", 9)).await, Err(Error::Prereq(_)));
    }

    #[tokio::test]
    async fn test_swap_leg_to_new_node() {
        let (h, web1) = setup().await;
        let old_port = web1.disks[0].children[0].port().unwrap();

        h.run(add("n3", "sda")).await.unwrap();
        h.run(remove("sda", old_port)).await.unwrap();

        let after = h.instance("web1");
        let sda = after.find_disk("sda").unwrap();
        assert_eq!(sda.children.len(), 1);
        assert_eq!(
            sda.children[0].replicated_nodes(),
            Some(("n1.example.com", "n3.example.com"))
        );
        // sdb still replicates to n2
        assert_eq!(
            after.secondary_nodes,
            vec!["n2.example.com".to_string(), "n3.example.com".to_string()]
        );
        assert_eq!(h.fleet.vg_free("n2.example.com"), Some(20000 - 1024 - 128));
    }

    #[tokio::test]
    async fn test_add_prereqs() {
        let (h, _) = setup().await;

        assert_matches!(
            h.run(add("n1", "sda")).await,
            Err(Error::Prereq(msg)) if msg.contains("primary node")
        );
        assert_matches!(h.run(add("n3", "sdz")).await, Err(Error::Prereq(_)));
        assert_matches!(h.run(add("n9", "sda")).await, Err(Error::Prereq(_)));

        h.run(add("n3", "sda")).await.unwrap();
        assert_matches!(
            h.run(add("n3", "sda")).await,
            Err(Error::Prereq(msg)) if msg.contains("two slave devices")
        );

        h.run(OpCode::InstanceShutdown(InstanceName {
            instance_name: "web1".into(),
        }))
        .await
        .unwrap();
        assert_matches!(
            h.run(add("n3", "sdb")).await,
            Err(Error::Prereq(msg)) if msg.contains("not running")
        );
    }

    #[tokio::test]
    async fn test_add_failures_are_reverted() {
        let (h, before) = setup().await;
        let n1_free = h.fleet.vg_free("n1.example.com");

        h.fleet.fail("n1.example.com", RpcCall::BlockdevCreate);
        assert_matches!(h.run(add("n3", "sda")).await, Err(Error::Exec(_)));
        assert_eq!(h.fleet.vg_free("n3.example.com"), Some(20000));
        assert_eq!(h.instance("web1").disks, before.disks);
        h.fleet.heal("n1.example.com", RpcCall::BlockdevCreate);

        h.fleet.fail("n1.example.com", RpcCall::BlockdevAddChild);
        assert_matches!(
            h.run(add("n3", "sda")).await,
            Err(Error::Exec(msg)) if msg.contains("md array")
        );
        assert_eq!(h.fleet.vg_free("n3.example.com"), Some(20000));
        assert_eq!(h.fleet.vg_free("n1.example.com"), n1_free);
        assert_eq!(h.instance("web1").disks, before.disks);
    }

    #[tokio::test]
    async fn test_replace_disks_to_new_secondary() {
        let (h, before) = setup().await;

        h.run(replace(Some("n3"))).await.unwrap();

        let after = h.instance("web1");
        assert_eq!(after.secondary_nodes, vec!["n3.example.com".to_string()]);
        for (old, new) in before.disks.iter().zip(&after.disks) {
            assert_eq!(new.children.len(), 1);
            assert_eq!(
                new.children[0].replicated_nodes(),
                Some(("n1.example.com", "n3.example.com"))
            );
            assert_ne!(new.children[0].port(), old.children[0].port());
            assert_eq!(
                h.fleet.attached_children("n1.example.com", new),
                Some(vec![new.children[0].key()])
            );
        }
        assert_eq!(h.fleet.device_count("n2.example.com", DeviceKind::Replicated), 0);
        assert_eq!(h.fleet.vg_free("n2.example.com"), Some(20000));
        assert_eq!(h.fleet.vg_free("n1.example.com"), Some(20000));
        assert_eq!(h.fleet.vg_free("n3.example.com"), Some(20000 - 11520));
    }

    #[tokio::test]
    async fn test_replace_disks_on_current_secondary() {
        let (h, before) = setup().await;
        h.fleet.set_vg_free("n2.example.com", 20000);

        let result = h
            .run_json(r#"{"op":"instance_replace_disks","instance_name":"web1"}"#)
            .await;
        assert_matches!(result, Ok(OpResult::Done));

        let after = h.instance("web1");
        assert_eq!(after.secondary_nodes, vec!["n2.example.com".to_string()]);
        for (old, new) in before.disks.iter().zip(&after.disks) {
            assert_eq!(new.children.len(), 1);
            assert_eq!(
                new.children[0].replicated_nodes(),
                Some(("n1.example.com", "n2.example.com"))
            );
            assert_ne!(new.children[0].port(), old.children[0].port());
            assert!(!h.fleet.has_device("n2.example.com", &old.children[0]));
            assert_eq!(
                h.fleet.attached_children("n1.example.com", new),
                Some(vec![new.children[0].key()])
            );
        }
        // the new legs took what the old ones gave back
        assert_eq!(h.fleet.device_count("n2.example.com", DeviceKind::Replicated), 2);
        assert_eq!(h.fleet.vg_free("n2.example.com"), Some(20000));
        assert_eq!(h.fleet.vg_free("n1.example.com"), Some(20000));
    }

    #[tokio::test]
    async fn test_replace_disks_is_all_or_nothing() {
        let (h, before) = setup().await;
        // room for the new sda leg but not for sdb
        h.fleet.set_vg_free("n3.example.com", 10400);

        assert_matches!(h.run(replace(Some("n3"))).await, Err(Error::Exec(_)));

        assert_eq!(h.instance("web1"), before);
        assert_eq!(h.fleet.vg_free("n3.example.com"), Some(10400));
        assert_eq!(h.fleet.vg_free("n1.example.com"), Some(20000));
        for disk in &before.disks {
            assert_eq!(
                h.fleet.attached_children("n1.example.com", disk),
                Some(vec![disk.children[0].key()])
            );
        }
    }

    #[tokio::test]
    async fn test_replace_disks_prereqs() {
        let (h, _) = setup().await;
        assert_matches!(h.run(replace(Some("n1"))).await, Err(Error::Prereq(_)));

        h.run(add("n3", "sdb")).await.unwrap();
        assert_matches!(
            h.run(replace(None)).await,
            Err(Error::Prereq(msg)) if msg.contains("sdb")
        );
    }
}
