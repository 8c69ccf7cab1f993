//! Block Device Orchestrator
//!
//! Walks disk trees and the node placement derived from them to create,
//! assemble, tear down, check and remove devices through [`NodeRpc`].
//!
//! Node failures are logged where they happen and folded into a boolean or
//! an `Error::Exec`; only the placement functions can raise invariant errors.

use super::placement::{instance_placements, node_tree, DeviceRole};
use crate::config::{Disk, Instance};
use crate::controlplane::undo::{UndoAction, UndoStack};
use crate::domain::ports::{NodeRpc, NodeRpcRef};
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::time::Duration;
use tracing::{debug, error, info, warn};

// =============================================================================
// Sync Policy
// =============================================================================

/// Timing knobs of the disk-sync wait loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Upper bound of the sleep between two polls
    pub max_poll_interval: Duration,
    /// Sleep after a failed poll
    pub retry_delay: Duration,
    /// Consecutive failed polls before giving up
    pub max_retries: u32,
    /// Grace time before the one-shot check of a freshly created mirror
    pub grace_period: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_poll_interval: Duration::from_secs(60),
            retry_delay: Duration::from_secs(6),
            max_retries: 10,
            grace_period: Duration::from_secs(15),
        }
    }
}

impl SyncPolicy {
    /// No sleeping at all; used against simulated nodes
    pub fn immediate() -> Self {
        Self {
            max_poll_interval: Duration::ZERO,
            retry_delay: Duration::ZERO,
            max_retries: 10,
            grace_period: Duration::ZERO,
        }
    }
}

/// Device path of one instance disk after assembly
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DiskDevice {
    pub node: String,
    pub iv_name: String,
    pub dev_path: Option<String>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Cross-node block device operations for instance disk trees
#[derive(Clone)]
pub struct BlockDeviceOrchestrator {
    rpc: NodeRpcRef,
    policy: SyncPolicy,
}

impl BlockDeviceOrchestrator {
    pub fn new(rpc: NodeRpcRef, policy: SyncPolicy) -> Self {
        Self { rpc, policy }
    }

    pub fn rpc(&self) -> &dyn NodeRpc {
        self.rpc.as_ref()
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Text stored alongside created devices to identify their owner
    pub fn info_text(instance: &Instance) -> String {
        format!("originstname+{}", instance.name)
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a device tree on the primary node, children first
    pub fn create_on_primary<'a>(
        &'a self,
        node: &'a str,
        disk: &'a mut Disk,
        info: &'a str,
        undo: &'a mut UndoStack,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            for child in disk.children.iter_mut() {
                if !self.create_on_primary(node, child, info, undo).await {
                    return false;
                }
            }
            self.create_one(node, disk, true, info, undo).await
        })
    }

    /// Create the parts of a device tree that must exist on a secondary node
    ///
    /// Once a device needs to live on the secondary, all of its descendants
    /// are forced to be created there too.
    pub fn create_on_secondary<'a>(
        &'a self,
        node: &'a str,
        disk: &'a mut Disk,
        force: bool,
        info: &'a str,
        undo: &'a mut UndoStack,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let force = force || disk.kind.create_on_secondary();
            for child in disk.children.iter_mut() {
                if !self.create_on_secondary(node, child, force, info, undo).await {
                    return false;
                }
            }
            if !force {
                return true;
            }
            self.create_one(node, disk, false, info, undo).await
        })
    }

    async fn create_one(
        &self,
        node: &str,
        disk: &mut Disk,
        on_primary: bool,
        info: &str,
        undo: &mut UndoStack,
    ) -> bool {
        let created = match self
            .rpc
            .blockdev_create(node, disk, disk.size, on_primary, info)
            .await
        {
            Ok(Some(physical_id)) => physical_id,
            Ok(None) => {
                error!("Failed to create device {} on node {}", disk.key(), node);
                return false;
            }
            Err(e) => {
                error!("Failed to create device {} on node {}: {}", disk.key(), node, e);
                return false;
            }
        };
        debug!("Created device {} on node {} as {}", disk.key(), node, created);
        if disk.physical_id.is_none() {
            disk.physical_id = Some(created);
        }
        undo.push(UndoAction::RemoveDevice {
            node: node.to_string(),
            disk: disk.clone(),
        });
        true
    }

    /// Create every disk of an instance: on each secondary first, then on
    /// the primary. Every created device is recorded on `undo`.
    pub async fn create_disks(&self, instance: &mut Instance, undo: &mut UndoStack) -> Result<()> {
        let info = Self::info_text(instance);
        let primary = instance.primary_node.clone();
        let secondaries = instance.secondary_nodes.clone();
        let name = instance.name.clone();

        for disk in instance.disks.iter_mut() {
            info!("Creating volume {} for instance {}", disk.iv_name(), name);
            for secondary in &secondaries {
                if !self
                    .create_on_secondary(secondary, disk, false, &info, undo)
                    .await
                {
                    return Err(Error::exec(format!(
                        "Failed to create volume {} ({}) on secondary node {}",
                        disk.iv_name(),
                        disk.key(),
                        secondary
                    )));
                }
            }
            if !self.create_on_primary(&primary, disk, &info, undo).await {
                return Err(Error::exec(format!(
                    "Failed to create volume {} on primary node {}",
                    disk.iv_name(),
                    primary
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Assembly / Shutdown / Removal
    // =========================================================================

    /// Assemble every disk on every node it lives on
    ///
    /// Returns whether assembly succeeded, plus the primary-side device of
    /// each disk. Secondary failures only count when `ignore_secondaries` is
    /// false.
    pub async fn assemble_disks(
        &self,
        instance: &Instance,
        ignore_secondaries: bool,
    ) -> Result<(bool, Vec<DiskDevice>)> {
        let mut disks_ok = true;
        let mut devices = Vec::with_capacity(instance.disks.len());

        for disk in &instance.disks {
            let mut primary_path = None;
            for (node, top) in node_tree(disk, &instance.primary_node)? {
                let is_primary = node == instance.primary_node;
                let result = match self.rpc.blockdev_assemble(&node, top, is_primary).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("Assembly of {} on node {} failed: {}", top.key(), node, e);
                        None
                    }
                };
                if result.is_none() {
                    error!(
                        "Could not prepare block device {} on node {} (is_primary={})",
                        disk.iv_name(),
                        node,
                        is_primary
                    );
                    if is_primary || !ignore_secondaries {
                        disks_ok = false;
                    }
                }
                if is_primary {
                    primary_path = result;
                }
            }
            devices.push(DiskDevice {
                node: instance.primary_node.clone(),
                iv_name: disk.iv_name().to_string(),
                dev_path: primary_path,
            });
        }
        Ok((disks_ok, devices))
    }

    /// Assemble the disks for starting the instance, tearing them back down
    /// on failure
    pub async fn start_disks(&self, instance: &Instance, force: Option<bool>) -> Result<()> {
        let (disks_ok, _) = self
            .assemble_disks(instance, force.unwrap_or(false))
            .await?;
        if !disks_ok {
            self.shutdown_disks(instance, false).await?;
            if force == Some(false) {
                warn!("If the failure above refers to a secondary node, you can retry the operation with force");
            }
            return Err(Error::exec("Disk consistency error"));
        }
        Ok(())
    }

    /// Deactivate every disk on every node it lives on
    ///
    /// Primary-side failures are ignored when `ignore_primary` is set.
    pub async fn shutdown_disks(&self, instance: &Instance, ignore_primary: bool) -> Result<bool> {
        let mut all_ok = true;
        for placement in instance_placements(instance)? {
            let done = match self
                .rpc
                .blockdev_shutdown(&placement.node, placement.disk)
                .await
            {
                Ok(done) => done,
                Err(e) => {
                    warn!("Shutdown of {} on node {} failed: {}", placement.disk.key(), placement.node, e);
                    false
                }
            };
            if !done {
                error!(
                    "Could not shutdown block device {} on node {}",
                    placement.disk.key(),
                    placement.node
                );
                if !ignore_primary || placement.role != DeviceRole::Primary {
                    all_ok = false;
                }
            }
        }
        Ok(all_ok)
    }

    /// Remove every device of every disk; keeps going past failures
    pub async fn remove_disks(&self, instance: &Instance) -> Result<bool> {
        info!("Removing block devices for instance {}", instance.name);
        let mut all_ok = true;
        for placement in instance_placements(instance)? {
            let done = self
                .rpc
                .blockdev_remove(&placement.node, placement.disk)
                .await
                .unwrap_or_else(|e| {
                    warn!("{}", e);
                    false
                });
            if !done {
                warn!(
                    "Could not remove block device {} on node {}, continuing anyway",
                    placement.disk.key(),
                    placement.node
                );
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Whether a device tree is non-degraded on a node
    ///
    /// Devices are only queried where they must be assembled: always on the
    /// primary, only replicated pairs on a secondary.
    pub fn check_disk_consistency<'a>(
        &'a self,
        disk: &'a Disk,
        node: &'a str,
        on_primary: bool,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let mut result = true;
            if on_primary || disk.kind.assemble_on_secondary() {
                match self.rpc.blockdev_find(node, disk).await {
                    Ok(Some(status)) => result = !status.is_degraded,
                    Ok(None) => {
                        warn!("Device {} not found on node {}", disk.key(), node);
                        result = false;
                    }
                    Err(e) => {
                        warn!("Can't get any data from node {}: {}", node, e);
                        result = false;
                    }
                }
            }
            for child in &disk.children {
                result = self.check_disk_consistency(child, node, on_primary).await && result;
            }
            result
        })
    }

    /// Poll the primary until no disk is resyncing (or once, with `oneshot`)
    ///
    /// Returns whether the final state is free of broken mirrors.
    pub async fn wait_for_sync(&self, instance: &Instance, oneshot: bool) -> Result<bool> {
        if instance.disks.is_empty() {
            return Ok(true);
        }
        let node = &instance.primary_node;
        if !oneshot {
            info!("Waiting for instance {} to sync disks", instance.name);
        }

        let mut retries = 0;
        loop {
            let polled = match self.rpc.blockdev_mirror_status(node, &instance.disks).await {
                Ok(stats) if stats.len() == instance.disks.len() => Ok(stats),
                Ok(stats) => Err(format!(
                    "expected {} mirror statuses, got {}",
                    instance.disks.len(),
                    stats.len()
                )),
                Err(e) => Err(e.to_string()),
            };
            let stats = match polled {
                Ok(stats) => stats,
                Err(reason) => {
                    retries += 1;
                    warn!("Can't get any data from node {} ({}/{}): {}", node, retries, self.policy.max_retries, reason);
                    if retries >= self.policy.max_retries {
                        return Err(Error::remote(
                            node.clone(),
                            "can't contact node for mirror data, aborting",
                        ));
                    }
                    tokio::time::sleep(self.policy.retry_delay).await;
                    continue;
                }
            };
            retries = 0;

            let mut done = true;
            let mut degraded = false;
            let mut max_time = 0u64;
            for (disk, status) in instance.disks.iter().zip(stats) {
                let status = match status {
                    Some(status) => status,
                    None => {
                        warn!("Can't compute sync data for {}/{}", node, disk.iv_name());
                        continue;
                    }
                };
                degraded = degraded || status.is_broken();
                if let Some(percent) = status.sync_percent {
                    done = false;
                    match status.estimated_time {
                        Some(secs) => {
                            max_time = max_time.max(secs);
                            info!("- device {}: {:5.2}% done, {} estimated seconds remaining", disk.iv_name(), percent, secs);
                        }
                        None => info!("- device {}: {:5.2}% done, no time estimate", disk.iv_name(), percent),
                    }
                }
            }

            if done || oneshot {
                if done {
                    info!("Instance {}'s disks are in sync", instance.name);
                }
                return Ok(!degraded);
            }
            let pause = Duration::from_secs(max_time).min(self.policy.max_poll_interval);
            tokio::time::sleep(pause).await;
        }
    }
}
