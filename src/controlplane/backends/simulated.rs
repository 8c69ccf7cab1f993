//! Simulated Node Fleet
//!
//! In-memory [`NodeRpc`] adapter modelling the volume group, block devices
//! and hypervisor of every node. Backs the test-suite and the CLI's dry runs.
//!
//! Faults are injected per node and call; every call is counted so callers
//! can assert that a node was (or was not) touched.

use crate::config::{ClusterConfig, DeviceKind, Disk, Instance};
use crate::controlplane::cluster::verify::{CLUSTER_CONFIG_FILE, CLUSTER_FILES};
use crate::domain::ports::{
    DeviceStatus, ExportInfo, InstanceRuntime, NodeInfo, NodeRpc, NodeVerifyParams,
    NodeVerifyResult,
};
use crate::error::{Error, Result};
use crate::storage::placement::nodes_for;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

// =============================================================================
// Calls
// =============================================================================

/// Every call of the node RPC surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RpcCall {
    Version,
    NodeInfo,
    VgList,
    VolumeList,
    BridgesExist,
    BlockdevCreate,
    BlockdevAssemble,
    BlockdevShutdown,
    BlockdevRemove,
    BlockdevFind,
    BlockdevMirrorStatus,
    BlockdevAddChild,
    BlockdevRemoveChild,
    InstanceStart,
    InstanceShutdown,
    InstanceList,
    InstanceInfo,
    OsGet,
    OsAdd,
    OsImport,
    ExportInfo,
    ConfigFileList,
    NodeVerify,
}

// =============================================================================
// Node Spec
// =============================================================================

/// Initial resources of a simulated node (sizes in MiB)
#[derive(Debug, Clone)]
pub struct SimNodeSpec {
    pub version: String,
    pub memory_total: u64,
    pub memory_free: u64,
    pub vg_name: String,
    pub vg_size: u64,
    pub vg_free: u64,
    pub bridges: Vec<String>,
    pub os_list: Vec<String>,
    /// Path to checksum of the cluster files present on the node
    pub files: BTreeMap<String, String>,
}

impl Default for SimNodeSpec {
    fn default() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            memory_total: 4096,
            memory_free: 4096,
            vg_name: "xenvg".to_string(),
            vg_size: 102_400,
            vg_free: 102_400,
            bridges: vec!["xen-br0".to_string()],
            os_list: vec!["linux".to_string(), "debian-etch".to_string()],
            files: BTreeMap::new(),
        }
    }
}

impl SimNodeSpec {
    pub fn with_vg_free(mut self, vg_free: u64) -> Self {
        self.vg_free = vg_free;
        self
    }

    pub fn with_memory_free(mut self, memory_free: u64) -> Self {
        self.memory_free = memory_free;
        self
    }

    pub fn with_vg_size(mut self, vg_size: u64) -> Self {
        self.vg_size = vg_size;
        self.vg_free = self.vg_free.min(vg_size);
        self
    }

    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridges.push(bridge.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, checksum: impl Into<String>) -> Self {
        self.files.insert(path.into(), checksum.into());
        self
    }
}

// =============================================================================
// Node State
// =============================================================================

#[derive(Debug, Clone)]
struct SimDevice {
    kind: DeviceKind,
    size: u64,
    minor: u32,
    assembled: bool,
    degraded: bool,
    /// Status polls left before a running resync completes
    resync_polls: u32,
    /// Keys of the attached children
    children: Vec<String>,
}

#[derive(Debug)]
struct SimNode {
    spec: SimNodeSpec,
    reachable: bool,
    devices: BTreeMap<String, SimDevice>,
    next_minor: u32,
    running: BTreeMap<String, InstanceRuntime>,
    exports: BTreeMap<String, ExportInfo>,
    unreachable_peers: BTreeMap<String, String>,
    hypervisor_error: Option<String>,
    /// Answer mirror status polls with one entry missing
    short_mirror_status: bool,
    faults: HashSet<RpcCall>,
}

impl SimNode {
    fn new(spec: SimNodeSpec) -> Self {
        Self {
            spec,
            reachable: true,
            devices: BTreeMap::new(),
            next_minor: 0,
            running: BTreeMap::new(),
            exports: BTreeMap::new(),
            unreachable_peers: BTreeMap::new(),
            hypervisor_error: None,
            short_mirror_status: false,
            faults: HashSet::new(),
        }
    }

    fn dev_path(key: &str, device: &SimDevice) -> String {
        match device.kind {
            DeviceKind::LogicalVolume => format!("/dev/{}", key),
            DeviceKind::Mirror => format!("/dev/md{}", device.minor),
            DeviceKind::Replicated => format!("/dev/drbd{}", device.minor),
        }
    }

    fn insert_device(&mut self, disk: &Disk, size: u64) -> Option<String> {
        let key = disk.key();
        if self.devices.contains_key(&key) {
            debug!("Device {} already exists", key);
            return None;
        }
        let children: Vec<String> = disk.children.iter().map(Disk::key).collect();
        if children.iter().any(|c| !self.devices.contains_key(c)) {
            debug!("Children of {} are missing", key);
            return None;
        }
        if disk.kind == DeviceKind::LogicalVolume {
            if self.spec.vg_free < size {
                debug!("Not enough space for {} ({} < {})", key, self.spec.vg_free, size);
                return None;
            }
            self.spec.vg_free -= size;
        }
        let device = SimDevice {
            kind: disk.kind,
            size,
            minor: self.next_minor,
            assembled: true,
            degraded: false,
            resync_polls: 0,
            children,
        };
        self.next_minor += 1;
        let path = Self::dev_path(&key, &device);
        self.devices.insert(key, device);
        Some(path)
    }

    fn assemble(&mut self, disk: &Disk) -> Option<String> {
        for child in &disk.children {
            self.assemble(child)?;
        }
        let key = disk.key();
        if disk.kind == DeviceKind::Mirror && !self.devices.contains_key(&key) {
            // mirror superblocks live on the members
            self.insert_device(disk, disk.size)?;
        }
        let device = self.devices.get_mut(&key)?;
        device.assembled = true;
        Some(Self::dev_path(&key, device))
    }

    fn shutdown(&mut self, disk: &Disk) {
        if let Some(device) = self.devices.get_mut(&disk.key()) {
            device.assembled = false;
        }
        for child in &disk.children {
            self.shutdown(child);
        }
    }

    fn remove(&mut self, disk: &Disk) {
        if let Some(device) = self.devices.remove(&disk.key()) {
            if device.kind == DeviceKind::LogicalVolume {
                self.spec.vg_free += device.size;
            }
        }
        for child in &disk.children {
            self.remove(child);
        }
    }

    /// Status of a device and everything attached below it
    fn status(&mut self, key: &str, tick: bool) -> Option<DeviceStatus> {
        let device = self.devices.get(key)?.clone();
        let mut degraded = device.degraded;
        let mut resync = device.resync_polls;
        for child in &device.children {
            if let Some(status) = self.status(child, tick) {
                degraded = degraded || status.is_degraded;
                resync = resync.max(status.estimated_time.unwrap_or(0) as u32);
            }
        }
        if tick && device.resync_polls > 0 {
            if let Some(device) = self.devices.get_mut(key) {
                device.resync_polls -= 1;
            }
        }
        Some(DeviceStatus {
            dev_path: device.assembled.then(|| Self::dev_path(key, &device)),
            sync_percent: (resync > 0).then(|| 100.0 / (resync as f32 + 1.0)),
            estimated_time: (resync > 0).then_some(resync as u64),
            is_degraded: degraded || resync > 0,
        })
    }
}

// =============================================================================
// Simulated Cluster
// =============================================================================

/// A fleet of simulated nodes behind the [`NodeRpc`] port
#[derive(Debug, Default)]
pub struct SimulatedCluster {
    nodes: RwLock<BTreeMap<String, SimNode>>,
    calls: DashMap<(String, RpcCall), u64>,
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fleet matching a config: one node per configured node, every
    /// instance's devices in place and running instances started
    pub fn from_config(config: &ClusterConfig, spec: &SimNodeSpec) -> Self {
        let fleet = Self::new();
        for node in &config.nodes {
            let mut node_spec = spec.clone();
            node_spec.vg_name = config.vg_name.clone();
            if !node_spec.bridges.contains(&config.default_bridge) {
                node_spec.bridges.push(config.default_bridge.clone());
            }
            for file in CLUSTER_FILES {
                node_spec
                    .files
                    .entry(file.to_string())
                    .or_insert_with(|| format!("{}-v1", file));
            }
            if node.name == config.master_node {
                node_spec
                    .files
                    .insert(CLUSTER_CONFIG_FILE.to_string(), format!("serial-{}", config.serial_no));
            }
            fleet.add_node(&node.name, node_spec);
        }
        for instance in &config.instances {
            fleet.seed_instance(instance);
        }
        fleet
    }

    pub fn add_node(&self, name: &str, spec: SimNodeSpec) {
        self.nodes.write().insert(name.to_string(), SimNode::new(spec));
    }

    /// Put an instance's devices in place, starting it if it is marked up
    pub fn seed_instance(&self, instance: &Instance) {
        let mut nodes = self.nodes.write();
        for disk in &instance.disks {
            seed_tree(&mut nodes, disk, &instance.primary_node);
        }
        if instance.is_up() {
            if let Some(node) = nodes.get_mut(&instance.primary_node) {
                node.spec.memory_free = node.spec.memory_free.saturating_sub(instance.memory);
                node.running.insert(instance.name.clone(), runtime_of(instance));
            }
        }
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    fn update(&self, node: &str, f: impl FnOnce(&mut SimNode)) {
        if let Some(state) = self.nodes.write().get_mut(node) {
            f(state);
        }
    }

    pub fn set_reachable(&self, node: &str, reachable: bool) {
        self.update(node, |n| n.reachable = reachable);
    }

    /// Make a call fail on a node (reachable nodes answer with a failure)
    pub fn fail(&self, node: &str, call: RpcCall) {
        self.update(node, |n| {
            n.faults.insert(call);
        });
    }

    pub fn heal(&self, node: &str, call: RpcCall) {
        self.update(node, |n| {
            n.faults.remove(&call);
        });
    }

    pub fn set_degraded(&self, node: &str, disk: &Disk, degraded: bool) {
        self.update(node, |n| {
            if let Some(device) = n.devices.get_mut(&disk.key()) {
                device.degraded = degraded;
            }
        });
    }

    /// Start a resync on a device that finishes after `polls` status polls
    pub fn set_resync(&self, node: &str, disk: &Disk, polls: u32) {
        self.update(node, |n| {
            if let Some(device) = n.devices.get_mut(&disk.key()) {
                device.resync_polls = polls;
            }
        });
    }

    pub fn set_short_mirror_status(&self, node: &str, short: bool) {
        self.update(node, |n| n.short_mirror_status = short);
    }

    pub fn set_version(&self, node: &str, version: &str) {
        self.update(node, |n| n.spec.version = version.to_string());
    }

    pub fn set_vg_free(&self, node: &str, vg_free: u64) {
        self.update(node, |n| n.spec.vg_free = vg_free);
    }

    pub fn set_vg_size(&self, node: &str, vg_size: u64) {
        self.update(node, |n| n.spec.vg_size = vg_size);
    }

    pub fn set_memory_free(&self, node: &str, memory_free: u64) {
        self.update(node, |n| n.spec.memory_free = memory_free);
    }

    pub fn set_hypervisor_error(&self, node: &str, error: Option<&str>) {
        self.update(node, |n| n.hypervisor_error = error.map(String::from));
    }

    pub fn set_unreachable_peer(&self, node: &str, peer: &str, reason: &str) {
        self.update(node, |n| {
            n.unreachable_peers.insert(peer.to_string(), reason.to_string());
        });
    }

    pub fn set_file(&self, node: &str, path: &str, checksum: Option<&str>) {
        self.update(node, |n| match checksum {
            Some(sum) => {
                n.spec.files.insert(path.to_string(), sum.to_string());
            }
            None => {
                n.spec.files.remove(path);
            }
        });
    }

    pub fn add_export(&self, node: &str, path: &str, export: ExportInfo) {
        self.update(node, |n| {
            n.exports.insert(path.to_string(), export);
        });
    }

    /// Create a volume no instance knows about
    pub fn add_stray_volume(&self, node: &str, name: &str, size: u64) {
        self.update(node, |n| {
            let vg = n.spec.vg_name.clone();
            n.insert_device(&Disk::volume(vg, name, size), size);
        });
    }

    /// Run an instance the config knows nothing about
    pub fn add_stray_instance(&self, node: &str, name: &str) {
        self.update(node, |n| {
            n.running.insert(
                name.to_string(),
                InstanceRuntime {
                    name: name.to_string(),
                    memory: 0,
                    vcpus: 1,
                    state: "running".to_string(),
                },
            );
        });
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// How often a call reached (or tried to reach) a node
    pub fn call_count(&self, node: &str, call: RpcCall) -> u64 {
        self.calls
            .get(&(node.to_string(), call))
            .map(|c| *c)
            .unwrap_or(0)
    }

    /// How often a call was made across the fleet
    pub fn total_calls(&self, call: RpcCall) -> u64 {
        self.calls
            .iter()
            .filter(|entry| entry.key().1 == call)
            .map(|entry| *entry.value())
            .sum()
    }

    pub fn has_device(&self, node: &str, disk: &Disk) -> bool {
        self.nodes
            .read()
            .get(node)
            .map(|n| n.devices.contains_key(&disk.key()))
            .unwrap_or(false)
    }

    pub fn is_assembled(&self, node: &str, disk: &Disk) -> bool {
        self.nodes
            .read()
            .get(node)
            .and_then(|n| n.devices.get(&disk.key()).map(|d| d.assembled))
            .unwrap_or(false)
    }

    /// Keys of the children attached to a device
    pub fn attached_children(&self, node: &str, disk: &Disk) -> Option<Vec<String>> {
        self.nodes
            .read()
            .get(node)
            .and_then(|n| n.devices.get(&disk.key()).map(|d| d.children.clone()))
    }

    /// Number of devices of a kind present on a node
    pub fn device_count(&self, node: &str, kind: DeviceKind) -> usize {
        self.nodes
            .read()
            .get(node)
            .map(|n| n.devices.values().filter(|d| d.kind == kind).count())
            .unwrap_or(0)
    }

    pub fn vg_free(&self, node: &str) -> Option<u64> {
        self.nodes.read().get(node).map(|n| n.spec.vg_free)
    }

    pub fn is_running(&self, node: &str, instance: &str) -> bool {
        self.nodes
            .read()
            .get(node)
            .map(|n| n.running.contains_key(instance))
            .unwrap_or(false)
    }

    // =========================================================================
    // Plumbing
    // =========================================================================

    /// Count the call and check the node can be reached; returns whether
    /// the call has a fault injected
    fn enter(&self, node: &str, call: RpcCall) -> Result<bool> {
        *self.calls.entry((node.to_string(), call)).or_insert(0) += 1;
        let nodes = self.nodes.read();
        let state = nodes
            .get(node)
            .ok_or_else(|| Error::remote(node, "unknown node"))?;
        if !state.reachable {
            return Err(Error::remote(node, "node is unreachable"));
        }
        Ok(state.faults.contains(&call))
    }

    fn with_node<R>(&self, node: &str, f: impl FnOnce(&mut SimNode) -> R) -> Result<R> {
        let mut nodes = self.nodes.write();
        let state = nodes
            .get_mut(node)
            .ok_or_else(|| Error::remote(node, "unknown node"))?;
        Ok(f(state))
    }
}

fn seed_tree(nodes: &mut BTreeMap<String, SimNode>, disk: &Disk, parent_node: &str) {
    let Ok(owners) = nodes_for(disk, parent_node) else {
        return;
    };
    for owner in owners {
        for child in &disk.children {
            seed_tree(nodes, child, owner);
        }
        if let Some(node) = nodes.get_mut(owner) {
            if !node.devices.contains_key(&disk.key()) {
                node.insert_device(disk, disk.size);
            }
        }
    }
}

fn runtime_of(instance: &Instance) -> InstanceRuntime {
    InstanceRuntime {
        name: instance.name.clone(),
        memory: instance.memory,
        vcpus: instance.vcpus,
        state: "running".to_string(),
    }
}

fn failed(node: &str, call: RpcCall) -> Error {
    Error::remote(node, format!("{:?} failed", call))
}

// =============================================================================
// NodeRpc
// =============================================================================

#[async_trait]
impl NodeRpc for SimulatedCluster {
    async fn version(&self, node: &str) -> Result<String> {
        if self.enter(node, RpcCall::Version)? {
            return Err(failed(node, RpcCall::Version));
        }
        self.with_node(node, |n| n.spec.version.clone())
    }

    async fn node_info(&self, node: &str, vg_name: &str) -> Result<Option<NodeInfo>> {
        if self.enter(node, RpcCall::NodeInfo)? {
            return Ok(None);
        }
        self.with_node(node, |n| {
            (n.spec.vg_name == vg_name).then_some(NodeInfo {
                memory_total: n.spec.memory_total,
                memory_free: n.spec.memory_free,
                vg_size: n.spec.vg_size,
                vg_free: n.spec.vg_free,
            })
        })
    }

    async fn vg_list(&self, node: &str) -> Result<BTreeMap<String, u64>> {
        if self.enter(node, RpcCall::VgList)? {
            return Ok(BTreeMap::new());
        }
        self.with_node(node, |n| BTreeMap::from([(n.spec.vg_name.clone(), n.spec.vg_size)]))
    }

    async fn volume_list(&self, node: &str, vg_name: &str) -> Result<BTreeMap<String, u64>> {
        if self.enter(node, RpcCall::VolumeList)? {
            return Err(failed(node, RpcCall::VolumeList));
        }
        let prefix = format!("{}/", vg_name);
        self.with_node(node, |n| {
            n.devices
                .iter()
                .filter(|(_, d)| d.kind == DeviceKind::LogicalVolume)
                .filter_map(|(key, d)| key.strip_prefix(&prefix).map(|name| (name.to_string(), d.size)))
                .collect()
        })
    }

    async fn bridges_exist(&self, node: &str, bridges: &[String]) -> Result<bool> {
        if self.enter(node, RpcCall::BridgesExist)? {
            return Ok(false);
        }
        self.with_node(node, |n| bridges.iter().all(|b| n.spec.bridges.contains(b)))
    }

    async fn blockdev_create(
        &self,
        node: &str,
        disk: &Disk,
        size: u64,
        _on_primary: bool,
        _info: &str,
    ) -> Result<Option<String>> {
        if self.enter(node, RpcCall::BlockdevCreate)? {
            return Ok(None);
        }
        self.with_node(node, |n| n.insert_device(disk, size))
    }

    async fn blockdev_assemble(
        &self,
        node: &str,
        disk: &Disk,
        _on_primary: bool,
    ) -> Result<Option<String>> {
        if self.enter(node, RpcCall::BlockdevAssemble)? {
            return Ok(None);
        }
        self.with_node(node, |n| n.assemble(disk))
    }

    async fn blockdev_shutdown(&self, node: &str, disk: &Disk) -> Result<bool> {
        if self.enter(node, RpcCall::BlockdevShutdown)? {
            return Ok(false);
        }
        self.with_node(node, |n| {
            n.shutdown(disk);
            true
        })
    }

    async fn blockdev_remove(&self, node: &str, disk: &Disk) -> Result<bool> {
        if self.enter(node, RpcCall::BlockdevRemove)? {
            return Ok(false);
        }
        self.with_node(node, |n| {
            n.remove(disk);
            true
        })
    }

    async fn blockdev_find(&self, node: &str, disk: &Disk) -> Result<Option<DeviceStatus>> {
        if self.enter(node, RpcCall::BlockdevFind)? {
            return Ok(None);
        }
        self.with_node(node, |n| n.status(&disk.key(), false))
    }

    async fn blockdev_mirror_status(
        &self,
        node: &str,
        disks: &[Disk],
    ) -> Result<Vec<Option<DeviceStatus>>> {
        if self.enter(node, RpcCall::BlockdevMirrorStatus)? {
            return Err(failed(node, RpcCall::BlockdevMirrorStatus));
        }
        self.with_node(node, |n| {
            let mut stats: Vec<_> = disks.iter().map(|d| n.status(&d.key(), true)).collect();
            if n.short_mirror_status {
                stats.pop();
            }
            stats
        })
    }

    async fn blockdev_addchild(&self, node: &str, parent: &Disk, child: &Disk) -> Result<bool> {
        if self.enter(node, RpcCall::BlockdevAddChild)? {
            return Ok(false);
        }
        let child_key = child.key();
        self.with_node(node, |n| {
            if !n.devices.contains_key(&child_key) {
                return false;
            }
            match n.devices.get_mut(&parent.key()) {
                Some(device) if device.kind == DeviceKind::Mirror => {
                    if !device.children.contains(&child_key) {
                        device.children.push(child_key);
                    }
                    true
                }
                _ => false,
            }
        })
    }

    async fn blockdev_removechild(&self, node: &str, parent: &Disk, child: &Disk) -> Result<bool> {
        if self.enter(node, RpcCall::BlockdevRemoveChild)? {
            return Ok(false);
        }
        let child_key = child.key();
        self.with_node(node, |n| match n.devices.get_mut(&parent.key()) {
            Some(device) if device.children.contains(&child_key) => {
                device.children.retain(|c| *c != child_key);
                true
            }
            _ => false,
        })
    }

    async fn instance_start(
        &self,
        node: &str,
        instance: &Instance,
        _extra_args: Option<&str>,
    ) -> Result<bool> {
        if self.enter(node, RpcCall::InstanceStart)? {
            return Ok(false);
        }
        self.with_node(node, |n| {
            if n.running.contains_key(&instance.name) {
                return true;
            }
            let disks_ready = instance.disks.iter().all(|d| {
                n.devices
                    .get(&d.key())
                    .map(|dev| dev.assembled)
                    .unwrap_or(false)
            });
            if !disks_ready || n.spec.memory_free < instance.memory {
                return false;
            }
            n.spec.memory_free -= instance.memory;
            n.running.insert(instance.name.clone(), runtime_of(instance));
            true
        })
    }

    async fn instance_shutdown(&self, node: &str, instance: &Instance) -> Result<bool> {
        if self.enter(node, RpcCall::InstanceShutdown)? {
            return Ok(false);
        }
        self.with_node(node, |n| {
            if let Some(runtime) = n.running.remove(&instance.name) {
                n.spec.memory_free += runtime.memory;
            }
            true
        })
    }

    async fn instance_list(&self, node: &str) -> Result<Vec<String>> {
        if self.enter(node, RpcCall::InstanceList)? {
            return Err(failed(node, RpcCall::InstanceList));
        }
        self.with_node(node, |n| n.running.keys().cloned().collect())
    }

    async fn instance_info(&self, node: &str, name: &str) -> Result<Option<InstanceRuntime>> {
        if self.enter(node, RpcCall::InstanceInfo)? {
            return Err(failed(node, RpcCall::InstanceInfo));
        }
        self.with_node(node, |n| n.running.get(name).cloned())
    }

    async fn os_get(&self, node: &str, os: &str) -> Result<bool> {
        if self.enter(node, RpcCall::OsGet)? {
            return Ok(false);
        }
        self.with_node(node, |n| n.spec.os_list.iter().any(|o| o == os))
    }

    async fn os_add(
        &self,
        node: &str,
        instance: &Instance,
        _os_disk: &str,
        _swap_disk: &str,
    ) -> Result<bool> {
        if self.enter(node, RpcCall::OsAdd)? {
            return Ok(false);
        }
        self.with_node(node, |n| n.spec.os_list.contains(&instance.os))
    }

    async fn os_import(
        &self,
        node: &str,
        _instance: &Instance,
        _os_disk: &str,
        _swap_disk: &str,
        _src_node: &str,
        _src_path: &str,
    ) -> Result<bool> {
        Ok(!self.enter(node, RpcCall::OsImport)?)
    }

    async fn export_info(&self, node: &str, path: &str) -> Result<Option<ExportInfo>> {
        if self.enter(node, RpcCall::ExportInfo)? {
            return Ok(None);
        }
        self.with_node(node, |n| n.exports.get(path).cloned())
    }

    async fn config_file_list(&self, node: &str) -> Result<BTreeMap<String, String>> {
        if self.enter(node, RpcCall::ConfigFileList)? {
            return Err(failed(node, RpcCall::ConfigFileList));
        }
        self.with_node(node, |n| n.spec.files.clone())
    }

    async fn node_verify(&self, node: &str, params: &NodeVerifyParams) -> Result<NodeVerifyResult> {
        if self.enter(node, RpcCall::NodeVerify)? {
            return Ok(NodeVerifyResult::default());
        }
        self.with_node(node, |n| NodeVerifyResult {
            file_list: Some(
                params
                    .file_list
                    .iter()
                    .filter_map(|f| n.spec.files.get(f).map(|sum| (f.clone(), sum.clone())))
                    .collect(),
            ),
            node_list: Some(
                params
                    .node_list
                    .iter()
                    .filter_map(|p| n.unreachable_peers.get(p).map(|r| (p.clone(), r.clone())))
                    .collect(),
            ),
            hypervisor: if params.hypervisor {
                n.hypervisor_error.clone()
            } else {
                None
            },
        })
    }
}
