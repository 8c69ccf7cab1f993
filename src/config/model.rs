//! Cluster Configuration Model
//!
//! The authoritative record of nodes, instances and their disk trees. The
//! model is plain data; mutation goes through [`super::ConfigStore`].

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Constants
// =============================================================================

/// First port handed out to replicated pairs
pub const FIRST_DRBD_PORT: u16 = 11000;

/// Last usable replication port
pub const LAST_DRBD_PORT: u16 = 14999;

/// Size of the metadata volume of every replicated pair, in MiB
pub const DRBD_META_SIZE: u64 = 128;

/// Default MAC prefix for new clusters
pub const DEFAULT_MAC_PREFIX: &str = "aa:00:00";

// =============================================================================
// Disk Template
// =============================================================================

/// Storage redundancy scheme of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskTemplate {
    /// No disks at all
    Diskless,
    /// Bare logical volumes on the primary
    Plain,
    /// Software RAID1 over two local volumes
    LocalRaid1,
    /// Software RAID1 over a network-replicated pair
    RemoteRaid1,
}

impl DiskTemplate {
    /// Whether the template keeps a replica on a secondary node
    pub fn has_secondary(&self) -> bool {
        matches!(self, DiskTemplate::RemoteRaid1)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskTemplate::Diskless => "diskless",
            DiskTemplate::Plain => "plain",
            DiskTemplate::LocalRaid1 => "local_raid1",
            DiskTemplate::RemoteRaid1 => "remote_raid1",
        }
    }
}

impl fmt::Display for DiskTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiskTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "diskless" => Ok(DiskTemplate::Diskless),
            "plain" => Ok(DiskTemplate::Plain),
            "local_raid1" | "local-mirror" => Ok(DiskTemplate::LocalRaid1),
            "remote_raid1" | "remote-mirror" => Ok(DiskTemplate::RemoteRaid1),
            other => Err(Error::prereq(format!("Invalid disk template name '{}'", other))),
        }
    }
}

// =============================================================================
// Disk
// =============================================================================

/// Kind of block device making up one level of a disk tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Leaf logical volume
    #[serde(rename = "lvm")]
    LogicalVolume,
    /// Software RAID1 mirror
    #[serde(rename = "md_raid1")]
    Mirror,
    /// Two-node replicated pair (data + metadata leaves)
    #[serde(rename = "drbd")]
    Replicated,
}

impl DeviceKind {
    /// Whether the device must exist on the secondary node as well
    pub fn create_on_secondary(&self) -> bool {
        matches!(self, DeviceKind::Replicated)
    }

    /// Whether the device must be assembled (and queried) on the secondary
    pub fn assemble_on_secondary(&self) -> bool {
        matches!(self, DeviceKind::Replicated)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::LogicalVolume => write!(f, "lvm"),
            DeviceKind::Mirror => write!(f, "md_raid1"),
            DeviceKind::Replicated => write!(f, "drbd"),
        }
    }
}

/// Stable identity of a device, independent of where it has been assembled
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogicalId {
    Volume { vg: String, name: String },
    Mirror { name: String },
    Replicated { node_a: String, node_b: String, port: u16 },
}

/// One node of a disk tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Device kind
    pub kind: DeviceKind,
    /// Size in MiB
    pub size: u64,
    /// Logical identifier
    pub logical_id: LogicalId,
    /// Physical identifier assigned by the node at first creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Child devices
    #[serde(default)]
    pub children: Vec<Disk>,
    /// Name the instance sees ("sda", "sdb"); only set on top-level disks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv_name: Option<String>,
}

impl Disk {
    /// Build a leaf logical volume
    pub fn volume(vg: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            kind: DeviceKind::LogicalVolume,
            size,
            logical_id: LogicalId::Volume {
                vg: vg.into(),
                name: name.into(),
            },
            physical_id: None,
            children: Vec::new(),
            iv_name: None,
        }
    }

    /// Build a software mirror over the given children
    pub fn mirror(name: impl Into<String>, size: u64, children: Vec<Disk>) -> Self {
        Self {
            kind: DeviceKind::Mirror,
            size,
            logical_id: LogicalId::Mirror { name: name.into() },
            physical_id: None,
            children,
            iv_name: None,
        }
    }

    /// Build a replicated pair between two nodes
    pub fn replicated(
        node_a: impl Into<String>,
        node_b: impl Into<String>,
        port: u16,
        size: u64,
        children: Vec<Disk>,
    ) -> Self {
        Self {
            kind: DeviceKind::Replicated,
            size,
            logical_id: LogicalId::Replicated {
                node_a: node_a.into(),
                node_b: node_b.into(),
                port,
            },
            physical_id: None,
            children,
            iv_name: None,
        }
    }

    /// Set the instance-visible name
    pub fn with_iv_name(mut self, iv_name: impl Into<String>) -> Self {
        self.iv_name = Some(iv_name.into());
        self
    }

    /// Instance-visible name, or an empty string for inner devices
    pub fn iv_name(&self) -> &str {
        self.iv_name.as_deref().unwrap_or("")
    }

    /// Replication port of a replicated pair
    pub fn port(&self) -> Option<u16> {
        match &self.logical_id {
            LogicalId::Replicated { port, .. } => Some(*port),
            _ => None,
        }
    }

    /// Endpoints of a replicated pair
    pub fn replicated_nodes(&self) -> Option<(&str, &str)> {
        match &self.logical_id {
            LogicalId::Replicated { node_a, node_b, .. } => Some((node_a, node_b)),
            _ => None,
        }
    }

    /// Volume name of a leaf
    pub fn volume_name(&self) -> Option<&str> {
        match &self.logical_id {
            LogicalId::Volume { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Stable key identifying the device on a node
    pub fn key(&self) -> String {
        match &self.logical_id {
            LogicalId::Volume { vg, name } => format!("{}/{}", vg, name),
            LogicalId::Mirror { name } => format!("md:{}", name),
            LogicalId::Replicated {
                node_a,
                node_b,
                port,
            } => format!("drbd:{}:{}:{}", node_a, node_b, port),
        }
    }

    /// Check the structural invariants of this device and its descendants
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            DeviceKind::LogicalVolume => {
                if !self.children.is_empty() {
                    return Err(Error::Invariant(format!(
                        "leaf volume {} has children",
                        self.key()
                    )));
                }
            }
            DeviceKind::Replicated => {
                let leaves = self
                    .children
                    .iter()
                    .all(|c| c.kind == DeviceKind::LogicalVolume);
                if self.children.len() != 2 || !leaves {
                    return Err(Error::Invariant(format!(
                        "replicated pair {} must have exactly a data and a meta volume",
                        self.key()
                    )));
                }
                if !matches!(self.logical_id, LogicalId::Replicated { .. }) {
                    return Err(Error::Invariant(format!(
                        "replicated pair {} has a non-replicated logical id",
                        self.key()
                    )));
                }
            }
            DeviceKind::Mirror => {
                if self.children.is_empty() {
                    return Err(Error::Invariant(format!("mirror {} has no children", self.key())));
                }
                if self.children.iter().any(|c| c.size != self.size) {
                    return Err(Error::Invariant(format!(
                        "mirror {} has children of differing sizes",
                        self.key()
                    )));
                }
            }
        }
        for child in &self.children {
            child.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Instance
// =============================================================================

/// Virtual network interface of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nic {
    pub mac: String,
    pub bridge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Administrative status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Up,
    Down,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Up => write!(f, "up"),
            InstanceStatus::Down => write!(f, "down"),
        }
    }
}

/// A virtual machine and its storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub primary_node: String,
    #[serde(default)]
    pub secondary_nodes: Vec<String>,
    /// Memory in MiB
    pub memory: u64,
    pub vcpus: u32,
    pub disk_template: DiskTemplate,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub nics: Vec<Nic>,
    pub status: InstanceStatus,
    pub os: String,
}

impl Instance {
    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }

    /// Find a top-level disk by its instance-visible name
    pub fn find_disk(&self, iv_name: &str) -> Option<&Disk> {
        self.disks.iter().find(|d| d.iv_name.as_deref() == Some(iv_name))
    }

    pub fn find_disk_mut(&mut self, iv_name: &str) -> Option<&mut Disk> {
        self.disks
            .iter_mut()
            .find(|d| d.iv_name.as_deref() == Some(iv_name))
    }

    /// Primary followed by all secondaries
    pub fn all_nodes(&self) -> Vec<String> {
        let mut nodes = vec![self.primary_node.clone()];
        nodes.extend(self.secondary_nodes.iter().cloned());
        nodes
    }

    /// Whether the instance uses the given node in any role
    pub fn uses_node(&self, node: &str) -> bool {
        self.primary_node == node || self.secondary_nodes.iter().any(|n| n == node)
    }
}

// =============================================================================
// Node
// =============================================================================

/// A hypervisor node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub primary_ip: String,
    /// Address used for storage replication, when it differs from the primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_ip: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, primary_ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_ip: primary_ip.into(),
            secondary_ip: None,
        }
    }

    /// Address replication traffic should use
    pub fn replication_ip(&self) -> &str {
        self.secondary_ip.as_deref().unwrap_or(&self.primary_ip)
    }
}

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Member,
}

// =============================================================================
// Cluster Config
// =============================================================================

/// The authoritative cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<Node>,
    pub instances: Vec<Instance>,
    /// Volume group all logical volumes are carved from
    pub vg_name: String,
    /// First three octets of generated MAC addresses
    pub mac_prefix: String,
    /// Name of the master node; empty when the cluster is not initialized
    pub master_node: String,
    /// Bridge used for NICs created without an explicit one
    pub default_bridge: String,
    /// Next replication port to hand out
    pub next_drbd_port: u16,
    /// Incremented on every write
    #[serde(default)]
    pub serial_no: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            instances: Vec::new(),
            vg_name: "xenvg".to_string(),
            mac_prefix: DEFAULT_MAC_PREFIX.to_string(),
            master_node: String::new(),
            default_bridge: "xen-br0".to_string(),
            next_drbd_port: FIRST_DRBD_PORT,
            serial_no: 0,
            modified_at: None,
        }
    }
}

impl ClusterConfig {
    /// A cluster exists once it has a master that is one of its nodes
    pub fn is_initialized(&self) -> bool {
        !self.master_node.is_empty() && self.node(&self.master_node).is_some()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.iter().map(|n| n.name.clone()).collect();
        names.sort();
        names
    }

    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.iter().map(|i| i.name.clone()).collect();
        names.sort();
        names
    }

    pub fn node_role(&self, name: &str) -> NodeRole {
        if self.master_node == name {
            NodeRole::Master
        } else {
            NodeRole::Member
        }
    }

    /// Resolve a possibly shortened node name to its canonical form
    pub fn expand_node_name(&self, short: &str) -> Option<String> {
        match_name_component(short, self.nodes.iter().map(|n| n.name.as_str()))
    }

    /// Resolve a possibly shortened instance name to its canonical form
    pub fn expand_instance_name(&self, short: &str) -> Option<String> {
        match_name_component(short, self.instances.iter().map(|i| i.name.as_str()))
    }

    /// Instances using the node as primary and as secondary
    pub fn instances_on_node(&self, node: &str) -> (Vec<String>, Vec<String>) {
        let primary = self
            .instances
            .iter()
            .filter(|i| i.primary_node == node)
            .map(|i| i.name.clone())
            .collect();
        let secondary = self
            .instances
            .iter()
            .filter(|i| i.secondary_nodes.iter().any(|n| n == node))
            .map(|i| i.name.clone())
            .collect();
        (primary, secondary)
    }
}

/// A name matches a candidate when it is equal to it or is its first
/// dot-separated component(s). Ambiguous short names resolve to nothing.
fn match_name_component<'a>(key: &str, candidates: impl Iterator<Item = &'a str>) -> Option<String> {
    let candidates: Vec<&str> = candidates.collect();
    if candidates.contains(&key) {
        return Some(key.to_string());
    }
    let prefix = format!("{}.", key);
    let mut matches = candidates.into_iter().filter(|name| name.starts_with(&prefix));
    match (matches.next(), matches.next()) {
        (Some(name), None) => Some(name.to_string()),
        _ => None,
    }
}
