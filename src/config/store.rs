//! Cluster Config Store
//!
//! Holds the single authoritative [`ClusterConfig`] in memory, persists it as
//! JSON after every write and broadcasts a [`ConfigEvent`] per change.
//!
//! Writes are applied to a draft copy which replaces the live config only
//! once it has been persisted, so a failed write leaves the store untouched.

use super::events::ConfigEvent;
use super::model::{ClusterConfig, Instance, InstanceStatus, Node, LAST_DRBD_PORT};
use crate::error::{Error, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Thread-safe owner of the cluster configuration
pub struct ConfigStore {
    /// Live configuration
    config: RwLock<ClusterConfig>,
    /// Where to persist the config, if anywhere
    path: Option<PathBuf>,
    /// MACs handed out but not yet written into an instance
    reserved_macs: Mutex<HashSet<String>>,
    /// Event broadcaster
    event_sender: broadcast::Sender<ConfigEvent>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config.read();
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .field("serial_no", &config.serial_no)
            .field("nodes", &config.nodes.len())
            .field("instances", &config.instances.len())
            .finish()
    }
}

impl ConfigStore {
    /// Create an in-memory store
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        Self::build(config, None)
    }

    /// Create a store that persists to `path` on every write
    pub fn with_path(config: ClusterConfig, path: impl Into<PathBuf>) -> Arc<Self> {
        Self::build(config, Some(path.into()))
    }

    /// Load a persisted config
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Could not read config file {}: {}", path.display(), e))
        })?;
        let config: ClusterConfig = serde_json::from_str(&raw)?;
        info!(
            "Loaded cluster config from {} (serial {}, {} nodes, {} instances)",
            path.display(),
            config.serial_no,
            config.nodes.len(),
            config.instances.len()
        );
        Ok(Self::build(config, Some(path.to_path_buf())))
    }

    fn build(config: ClusterConfig, path: Option<PathBuf>) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config: RwLock::new(config),
            path,
            reserved_macs: Mutex::new(HashSet::new()),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.event_sender.subscribe()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Copy of the whole config
    pub fn snapshot(&self) -> ClusterConfig {
        self.config.read().clone()
    }

    /// Run a closure against the live config
    pub fn read<R>(&self, f: impl FnOnce(&ClusterConfig) -> R) -> R {
        f(&self.config.read())
    }

    pub fn is_initialized(&self) -> bool {
        self.read(|c| c.is_initialized())
    }

    pub fn master_node(&self) -> String {
        self.read(|c| c.master_node.clone())
    }

    pub fn vg_name(&self) -> String {
        self.read(|c| c.vg_name.clone())
    }

    pub fn default_bridge(&self) -> String {
        self.read(|c| c.default_bridge.clone())
    }

    pub fn node_names(&self) -> Vec<String> {
        self.read(|c| c.node_names())
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.read(|c| c.instance_names())
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.read(|c| c.node(name).cloned())
    }

    pub fn instance(&self, name: &str) -> Option<Instance> {
        self.read(|c| c.instance(name).cloned())
    }

    pub fn expand_node_name(&self, short: &str) -> Option<String> {
        self.read(|c| c.expand_node_name(short))
    }

    pub fn expand_instance_name(&self, short: &str) -> Option<String> {
        self.read(|c| c.expand_instance_name(short))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply `f` to a draft, persist it and swap it in
    ///
    /// Persistence is synchronous and happens under the write lock, so that
    /// the file never lags behind the live config. Writes are a handful per
    /// operation; move `persist` to `spawn_blocking` before putting the store
    /// on a hot path.
    fn write<R>(
        &self,
        f: impl FnOnce(&mut ClusterConfig) -> Result<(R, Vec<ConfigEvent>)>,
    ) -> Result<R> {
        let mut live = self.config.write();
        let mut draft = live.clone();
        let (value, events) = f(&mut draft)?;

        draft.serial_no += 1;
        draft.modified_at = Some(Utc::now());
        self.persist(&draft)?;
        *live = draft;
        drop(live);

        for event in events {
            debug!("config event: {:?}", event);
            let _ = self.event_sender.send(event);
        }
        Ok(value)
    }

    fn persist(&self, config: &ClusterConfig) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let data = serde_json::to_vec_pretty(config)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Hand out the next replication port from the cluster-wide counter
    pub fn allocate_port(&self) -> Result<u16> {
        self.write(|cfg| {
            let port = cfg.next_drbd_port;
            if port > LAST_DRBD_PORT {
                return Err(Error::exec(format!(
                    "The replication port range is exhausted (last port {})",
                    LAST_DRBD_PORT
                )));
            }
            cfg.next_drbd_port = port + 1;
            Ok((port, vec![ConfigEvent::PortAllocated { port }]))
        })
    }

    /// Generate a MAC address not used by any instance nor reserved earlier
    pub fn generate_mac(&self) -> Result<String> {
        let used: HashSet<String> = self.read(|cfg| {
            cfg.instances
                .iter()
                .flat_map(|i| i.nics.iter().map(|n| n.mac.clone()))
                .collect()
        });
        let prefix = self.read(|cfg| cfg.mac_prefix.clone());

        let mut reserved = self.reserved_macs.lock();
        for suffix in 1u32..0x0100_0000 {
            let mac = format!(
                "{}:{:02x}:{:02x}:{:02x}",
                prefix,
                (suffix >> 16) & 0xff,
                (suffix >> 8) & 0xff,
                suffix & 0xff
            );
            if !used.contains(&mac) && !reserved.contains(&mac) {
                reserved.insert(mac.clone());
                return Ok(mac);
            }
        }
        Err(Error::exec("No free MAC addresses left"))
    }

    /// Give back a MAC from [`generate_mac`](Self::generate_mac) that never
    /// made it into an instance
    pub fn release_mac(&self, mac: &str) {
        if self.reserved_macs.lock().remove(mac) {
            debug!("Released MAC {}", mac);
        }
    }

    /// Number of MACs handed out and not yet registered or released
    pub fn reserved_mac_count(&self) -> usize {
        self.reserved_macs.lock().len()
    }

    /// Register a new instance
    pub fn add_instance(&self, instance: Instance) -> Result<()> {
        let macs: Vec<String> = instance.nics.iter().map(|n| n.mac.clone()).collect();
        self.write(|cfg| {
            if cfg.instance(&instance.name).is_some() {
                return Err(Error::Invariant(format!(
                    "instance {} is already in the config",
                    instance.name
                )));
            }
            let event = ConfigEvent::InstanceAdded {
                instance: instance.name.clone(),
                primary_node: instance.primary_node.clone(),
            };
            cfg.instances.push(instance);
            Ok(((), vec![event]))
        })?;
        let mut reserved = self.reserved_macs.lock();
        for mac in macs {
            reserved.remove(&mac);
        }
        Ok(())
    }

    /// Replace the record of an existing instance
    pub fn update_instance(&self, instance: Instance) -> Result<()> {
        self.write(|cfg| {
            let slot = cfg
                .instances
                .iter_mut()
                .find(|i| i.name == instance.name)
                .ok_or_else(|| Error::InstanceNotFound {
                    name: instance.name.clone(),
                })?;
            let event = ConfigEvent::InstanceUpdated {
                instance: instance.name.clone(),
            };
            *slot = instance;
            Ok(((), vec![event]))
        })
    }

    /// Set an instance's administrative status
    pub fn set_instance_status(&self, name: &str, status: InstanceStatus) -> Result<()> {
        self.write(|cfg| {
            let slot = cfg
                .instances
                .iter_mut()
                .find(|i| i.name == name)
                .ok_or_else(|| Error::InstanceNotFound { name: name.into() })?;
            slot.status = status;
            Ok((
                (),
                vec![ConfigEvent::InstanceStatusChanged {
                    instance: name.into(),
                    up: status == InstanceStatus::Up,
                }],
            ))
        })
    }

    pub fn mark_instance_up(&self, name: &str) -> Result<()> {
        self.set_instance_status(name, InstanceStatus::Up)
    }

    pub fn mark_instance_down(&self, name: &str) -> Result<()> {
        self.set_instance_status(name, InstanceStatus::Down)
    }

    /// Delete an instance
    pub fn remove_instance(&self, name: &str) -> Result<Instance> {
        self.write(|cfg| {
            let idx = cfg
                .instances
                .iter()
                .position(|i| i.name == name)
                .ok_or_else(|| Error::InstanceNotFound { name: name.into() })?;
            let removed = cfg.instances.remove(idx);
            Ok((removed, vec![ConfigEvent::InstanceRemoved { instance: name.into() }]))
        })
    }

    /// Add a node to the cluster
    pub fn add_node(&self, node: Node) -> Result<()> {
        self.write(|cfg| {
            if cfg.node(&node.name).is_some() {
                return Err(Error::prereq(format!(
                    "Node {} is already in the configuration",
                    node.name
                )));
            }
            let event = ConfigEvent::NodeAdded {
                node: node.name.clone(),
            };
            cfg.nodes.push(node);
            Ok(((), vec![event]))
        })
    }

    /// Remove a node that is neither master nor used by any instance
    pub fn remove_node(&self, name: &str) -> Result<Node> {
        self.write(|cfg| {
            if cfg.master_node == name {
                return Err(Error::prereq(format!(
                    "Node {} is the master node, you need to failover first",
                    name
                )));
            }
            if let Some(inst) = cfg.instances.iter().find(|i| i.uses_node(name)) {
                return Err(Error::prereq(format!(
                    "Instance {} still uses node {}, please remove it first",
                    inst.name, name
                )));
            }
            let idx = cfg
                .nodes
                .iter()
                .position(|n| n.name == name)
                .ok_or_else(|| Error::NodeNotFound {
                    node_id: name.into(),
                })?;
            let removed = cfg.nodes.remove(idx);
            Ok((removed, vec![ConfigEvent::NodeRemoved { node: name.into() }]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{DiskTemplate, Nic, FIRST_DRBD_PORT};
    use assert_matches::assert_matches;

    fn base_config() -> ClusterConfig {
        ClusterConfig {
            nodes: vec![
                Node::new("node1.example.com", "192.0.2.1"),
                Node::new("node2.example.com", "192.0.2.2"),
            ],
            master_node: "node1.example.com".into(),
            ..Default::default()
        }
    }

    fn instance(name: &str, primary: &str, secondary: Option<&str>) -> Instance {
        Instance {
            name: name.into(),
            primary_node: primary.into(),
            secondary_nodes: secondary.into_iter().map(String::from).collect(),
            memory: 128,
            vcpus: 1,
            disk_template: DiskTemplate::Diskless,
            disks: vec![],
            nics: vec![],
            status: InstanceStatus::Down,
            os: "debian".into(),
        }
    }

    #[test]
    fn test_allocate_port_is_monotonic() {
        let store = ConfigStore::new(base_config());
        let a = store.allocate_port().unwrap();
        let b = store.allocate_port().unwrap();
        assert_eq!(a, FIRST_DRBD_PORT);
        assert_eq!(b, FIRST_DRBD_PORT + 1);
        assert_eq!(store.snapshot().next_drbd_port, FIRST_DRBD_PORT + 2);
    }

    #[test]
    fn test_port_range_exhausted() {
        let mut cfg = base_config();
        cfg.next_drbd_port = LAST_DRBD_PORT + 1;
        let store = ConfigStore::new(cfg);
        assert_matches!(store.allocate_port(), Err(Error::Exec(_)));
    }

    #[test]
    fn test_generate_mac_skips_used_and_reserved() {
        let mut cfg = base_config();
        let mut inst = instance("web1", "node1.example.com", None);
        inst.nics.push(Nic {
            mac: "aa:00:00:00:00:01".into(),
            bridge: "xen-br0".into(),
            ip: None,
        });
        cfg.instances.push(inst);
        let store = ConfigStore::new(cfg);

        assert_eq!(store.generate_mac().unwrap(), "aa:00:00:00:00:02");
        assert_eq!(store.generate_mac().unwrap(), "aa:00:00:00:00:03");
        assert_eq!(store.reserved_mac_count(), 2);
    }

    #[test]
    fn test_release_mac_makes_it_available_again() {
        let store = ConfigStore::new(base_config());
        let mac = store.generate_mac().unwrap();
        store.release_mac(&mac);
        assert_eq!(store.reserved_mac_count(), 0);
        assert_eq!(store.generate_mac().unwrap(), mac);

        // unknown MACs are ignored
        store.release_mac("aa:ff:ff:ff:ff:ff");
        assert_eq!(store.reserved_mac_count(), 1);
    }

    #[test]
    fn test_write_bumps_serial_and_emits_event() {
        let store = ConfigStore::new(base_config());
        let mut rx = store.subscribe();

        store
            .add_instance(instance("web1", "node1.example.com", None))
            .unwrap();
        assert_eq!(store.snapshot().serial_no, 1);
        assert_matches!(rx.try_recv(), Ok(ConfigEvent::InstanceAdded { .. }));

        store.mark_instance_up("web1").unwrap();
        assert!(store.instance("web1").unwrap().is_up());
        assert_matches!(
            rx.try_recv(),
            Ok(ConfigEvent::InstanceStatusChanged { up: true, .. })
        );
    }

    #[test]
    fn test_failed_write_leaves_config_untouched() {
        let store = ConfigStore::new(base_config());
        store
            .add_instance(instance("web1", "node1.example.com", None))
            .unwrap();
        let before = store.snapshot();

        let result = store.add_instance(instance("web1", "node2.example.com", None));
        assert_matches!(result, Err(Error::Invariant(_)));
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_remove_node_checks() {
        let store = ConfigStore::new(base_config());
        store
            .add_instance(instance("web1", "node1.example.com", Some("node2.example.com")))
            .unwrap();

        assert_matches!(store.remove_node("node1.example.com"), Err(Error::Prereq(_)));
        assert_matches!(store.remove_node("node2.example.com"), Err(Error::Prereq(_)));

        store.remove_instance("web1").unwrap();
        let removed = store.remove_node("node2.example.com").unwrap();
        assert_eq!(removed.name, "node2.example.com");
        assert_matches!(
            store.remove_node("node2.example.com"),
            Err(Error::NodeNotFound { .. })
        );
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.data");
        let store = ConfigStore::with_path(base_config(), &path);
        store
            .add_instance(instance("web1", "node1.example.com", None))
            .unwrap();

        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(reopened.snapshot(), store.snapshot());
        assert!(reopened.instance("web1").is_some());
    }
}
