//! Domain Ports - Node RPC boundary
//!
//! The orchestration core never talks to a hypervisor node directly: every
//! block-device and instance action goes through [`NodeRpc`]. Adapters
//! implement it for a concrete transport (or a simulated fleet in tests).
//!
//! Conventions: `Err(Error::Remote { .. })` means the node could not be
//! reached at all; a reachable node that failed the action answers
//! `Ok(false)` / `Ok(None)`.

use crate::config::{Disk, Instance};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Node Information
// =============================================================================

/// Resource snapshot reported by a node (all sizes in MiB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Total memory of the node
    pub memory_total: u64,
    /// Memory available for new instances
    pub memory_free: u64,
    /// Size of the cluster volume group
    pub vg_size: u64,
    /// Unallocated space in the cluster volume group
    pub vg_free: u64,
}

// =============================================================================
// Block Device Status
// =============================================================================

/// Status of an assembled block device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device path on the node, if assembled
    pub dev_path: Option<String>,
    /// Resync progress, `None` when no resync is running
    pub sync_percent: Option<f32>,
    /// Estimated seconds until resync completes
    pub estimated_time: Option<u64>,
    /// Whether at least one member is out of sync
    pub is_degraded: bool,
}

impl DeviceStatus {
    /// A healthy, fully synced device
    pub fn healthy(dev_path: impl Into<String>) -> Self {
        Self {
            dev_path: Some(dev_path.into()),
            sync_percent: None,
            estimated_time: None,
            is_degraded: false,
        }
    }

    /// Degraded and not recovering by itself
    pub fn is_broken(&self) -> bool {
        self.is_degraded && self.sync_percent.is_none()
    }
}

// =============================================================================
// Instance Runtime
// =============================================================================

/// What the hypervisor reports about a running instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRuntime {
    pub name: String,
    /// Memory in MiB
    pub memory: u64,
    pub vcpus: u32,
    /// Hypervisor-specific state string
    pub state: String,
}

/// Metadata of an exported instance image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    /// Guest OS the image was exported with
    pub os: String,
    /// Name of the exported instance
    pub instance: String,
}

// =============================================================================
// Node Verification
// =============================================================================

/// What a node should check about itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeVerifyParams {
    /// Files to checksum
    pub file_list: Vec<String>,
    /// Peers to test connectivity to
    pub node_list: Vec<String>,
    /// Whether to run the hypervisor self-check
    pub hypervisor: bool,
}

/// Result of a node self-check; a missing section means the node did not
/// return it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeVerifyResult {
    /// Checksums of the requested files that exist on the node
    pub file_list: Option<BTreeMap<String, String>>,
    /// Peers the node failed to reach, with the failure message
    pub node_list: Option<BTreeMap<String, String>>,
    /// Hypervisor self-check failure, if any
    pub hypervisor: Option<String>,
}

// =============================================================================
// Node RPC Port
// =============================================================================

/// Port for actions executed on a named node
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Protocol version spoken by the node daemon
    async fn version(&self, node: &str) -> Result<String>;

    /// Memory and volume group usage; `None` if the node could not compute it
    async fn node_info(&self, node: &str, vg_name: &str) -> Result<Option<NodeInfo>>;

    /// Volume groups and their sizes
    async fn vg_list(&self, node: &str) -> Result<BTreeMap<String, u64>>;

    /// Logical volumes present in a volume group, with sizes
    async fn volume_list(&self, node: &str, vg_name: &str) -> Result<BTreeMap<String, u64>>;

    /// Whether all the bridges exist on the node
    async fn bridges_exist(&self, node: &str, bridges: &[String]) -> Result<bool>;

    /// Create a single device (children must already exist); returns the
    /// physical identifier
    async fn blockdev_create(
        &self,
        node: &str,
        disk: &Disk,
        size: u64,
        on_primary: bool,
        info: &str,
    ) -> Result<Option<String>>;

    /// Assemble a device tree; returns the device path
    async fn blockdev_assemble(&self, node: &str, disk: &Disk, on_primary: bool)
        -> Result<Option<String>>;

    /// Deactivate a device tree
    async fn blockdev_shutdown(&self, node: &str, disk: &Disk) -> Result<bool>;

    /// Remove a device tree; missing devices count as removed
    async fn blockdev_remove(&self, node: &str, disk: &Disk) -> Result<bool>;

    /// Status of a single device; `None` if it is not present
    async fn blockdev_find(&self, node: &str, disk: &Disk) -> Result<Option<DeviceStatus>>;

    /// Mirror status of several devices at once
    async fn blockdev_mirror_status(
        &self,
        node: &str,
        disks: &[Disk],
    ) -> Result<Vec<Option<DeviceStatus>>>;

    /// Attach a new member to an assembled mirror
    async fn blockdev_addchild(&self, node: &str, parent: &Disk, child: &Disk) -> Result<bool>;

    /// Detach a member from an assembled mirror
    async fn blockdev_removechild(&self, node: &str, parent: &Disk, child: &Disk)
        -> Result<bool>;

    /// Start an instance whose disks are assembled on the node
    async fn instance_start(
        &self,
        node: &str,
        instance: &Instance,
        extra_args: Option<&str>,
    ) -> Result<bool>;

    /// Stop an instance
    async fn instance_shutdown(&self, node: &str, instance: &Instance) -> Result<bool>;

    /// Names of the instances the hypervisor is running
    async fn instance_list(&self, node: &str) -> Result<Vec<String>>;

    /// Runtime information of one instance; `None` if not running
    async fn instance_info(&self, node: &str, name: &str) -> Result<Option<InstanceRuntime>>;

    /// Whether the guest OS definition exists on the node
    async fn os_get(&self, node: &str, os: &str) -> Result<bool>;

    /// Install the guest OS onto the instance's disks
    async fn os_add(&self, node: &str, instance: &Instance, os_disk: &str, swap_disk: &str)
        -> Result<bool>;

    /// Import an exported image onto the instance's disks
    async fn os_import(
        &self,
        node: &str,
        instance: &Instance,
        os_disk: &str,
        swap_disk: &str,
        src_node: &str,
        src_path: &str,
    ) -> Result<bool>;

    /// Metadata of an export stored on the node
    async fn export_info(&self, node: &str, path: &str) -> Result<Option<ExportInfo>>;

    /// Checksums of the cluster's configuration files on the node
    async fn config_file_list(&self, node: &str) -> Result<BTreeMap<String, String>>;

    /// Node self-check
    async fn node_verify(&self, node: &str, params: &NodeVerifyParams) -> Result<NodeVerifyResult>;
}

/// Shared handle to a node RPC adapter
pub type NodeRpcRef = Arc<dyn NodeRpc>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status_broken() {
        let healthy = DeviceStatus::healthy("/dev/md0");
        assert!(!healthy.is_broken());

        let syncing = DeviceStatus {
            dev_path: Some("/dev/drbd0".into()),
            sync_percent: Some(42.0),
            estimated_time: Some(30),
            is_degraded: true,
        };
        assert!(!syncing.is_broken());

        let broken = DeviceStatus {
            sync_percent: None,
            ..syncing
        };
        assert!(broken.is_broken());
    }
}
