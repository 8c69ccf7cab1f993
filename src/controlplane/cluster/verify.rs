//! Cluster Verification
//!
//! Asks every node about itself and compares the answers with the config:
//! software versions, volume group, distributed files, connectivity,
//! expected volumes and running instances. Nothing is changed; every
//! problem, including an unreachable node, becomes a finding.

use crate::config::{ClusterConfig, Instance};
use crate::controlplane::locks::LockScope;
use crate::controlplane::operation::{Context, Feedback, LogicalOperation, OpResult};
use crate::domain::ports::NodeVerifyParams;
use crate::error::Result;
use crate::storage::volumes_by_node;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Authoritative copy of the cluster config, kept on the master only
pub const CLUSTER_CONFIG_FILE: &str = "/var/lib/vmcluster/config.data";

/// Node daemon certificate
pub const SSL_CERT_FILE: &str = "/var/lib/vmcluster/server.pem";

/// Host keys of all nodes
pub const KNOWN_HOSTS_FILE: &str = "/var/lib/vmcluster/known_hosts";

/// Files every node must hold with the master's content
pub const CLUSTER_FILES: [&str; 2] = [SSL_CERT_FILE, KNOWN_HOSTS_FILE];

/// Files that must exist on the master and nowhere else
pub const MASTER_ONLY_FILES: [&str; 1] = [CLUSTER_CONFIG_FILE];

/// Smallest acceptable volume group, in MiB
pub const MIN_VG_SIZE: u64 = 20480;

/// Outcome of a verification run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Whether any problem was found
    pub bad: bool,
    pub findings: Vec<String>,
}

impl VerifyReport {
    fn node_error(&mut self, node: &str, msg: impl AsRef<str>) {
        self.push(format!("node {}: {}", node, msg.as_ref()));
    }

    fn instance_error(&mut self, instance: &str, msg: impl AsRef<str>) {
        self.push(format!("instance {}: {}", instance, msg.as_ref()));
    }

    fn push(&mut self, finding: String) {
        warn!("verify: {}", finding);
        self.bad = true;
        self.findings.push(finding);
    }
}

/// What the nodes reported, for the instance and orphan checks. A node is
/// missing from a map when it could not report.
#[derive(Debug, Default)]
struct NodeState {
    volumes: BTreeMap<String, BTreeMap<String, u64>>,
    running: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
pub struct VerifyCluster;

impl VerifyCluster {
    pub fn new() -> Self {
        Self
    }

    async fn verify_node(
        ctx: &Context,
        config: &ClusterConfig,
        node: &str,
        master_files: &BTreeMap<String, String>,
        report: &mut VerifyReport,
    ) {
        match ctx.rpc.version(node).await {
            Ok(version) if version == crate::VERSION => {}
            Ok(version) => report.node_error(
                node,
                format!(
                    "software version mismatch: master {}, node {}",
                    crate::VERSION,
                    version
                ),
            ),
            Err(e) => {
                report.node_error(node, format!("unable to verify node: {}", e));
                return;
            }
        }

        match ctx.rpc.vg_list(node).await {
            Ok(vgs) => match vgs.get(&config.vg_name) {
                None => report.node_error(node, format!("volume group '{}' missing", config.vg_name)),
                Some(size) if *size < MIN_VG_SIZE => report.node_error(
                    node,
                    format!(
                        "volume group '{}' too small ({} MiB, minimum {} MiB)",
                        config.vg_name, size, MIN_VG_SIZE
                    ),
                ),
                Some(_) => {}
            },
            Err(e) => report.node_error(node, format!("unable to list volume groups: {}", e)),
        }

        let params = NodeVerifyParams {
            file_list: CLUSTER_FILES
                .iter()
                .chain(MASTER_ONLY_FILES.iter())
                .map(|f| f.to_string())
                .collect(),
            node_list: config.node_names(),
            hypervisor: true,
        };
        let result = match ctx.rpc.node_verify(node, &params).await {
            Ok(result) => result,
            Err(e) => {
                report.node_error(node, format!("node verify failed: {}", e));
                return;
            }
        };

        match &result.file_list {
            None => report.node_error(node, "node hasn't returned file checksum data"),
            Some(files) => {
                for file in CLUSTER_FILES {
                    match (files.get(file), master_files.get(file)) {
                        (None, _) => report.node_error(node, format!("file '{}' missing", file)),
                        (Some(sum), Some(master_sum)) if sum != master_sum => {
                            report.node_error(node, format!("file '{}' has wrong checksum", file))
                        }
                        _ => {}
                    }
                }
                let is_master = node == config.master_node;
                for file in MASTER_ONLY_FILES {
                    match (is_master, files.contains_key(file)) {
                        (true, false) => {
                            report.node_error(node, format!("file '{}' missing", file))
                        }
                        (false, true) => report.node_error(
                            node,
                            format!("file '{}' should not exist on non-master nodes", file),
                        ),
                        _ => {}
                    }
                }
            }
        }

        match &result.node_list {
            None => report.node_error(node, "node hasn't returned node connectivity data"),
            Some(failures) => {
                for (peer, reason) in failures {
                    report.node_error(node, format!("communication with node '{}': {}", peer, reason));
                }
            }
        }

        if let Some(error) = &result.hypervisor {
            report.node_error(node, format!("hypervisor verify failure: '{}'", error));
        }
    }

    fn verify_instance(instance: &Instance, state: &NodeState, report: &mut VerifyReport) {
        for (node, volumes) in volumes_by_node(instance) {
            let Some(present) = state.volumes.get(&node) else {
                continue;
            };
            for volume in volumes {
                if !present.contains_key(&volume) {
                    report.instance_error(
                        &instance.name,
                        format!("volume {} missing on node {}", volume, node),
                    );
                }
            }
        }

        let primary = &instance.primary_node;
        if let Some(running) = state.running.get(primary) {
            let is_running = running.contains(&instance.name);
            if instance.is_up() && !is_running {
                report.instance_error(&instance.name, format!("not running on node {}", primary));
            }
            if !instance.is_up() && is_running {
                report.instance_error(
                    &instance.name,
                    format!("running on node {} but marked down", primary),
                );
            }
        }
        for (node, running) in &state.running {
            if node != primary && running.contains(&instance.name) {
                report.instance_error(&instance.name, format!("should not run on node {}", node));
            }
        }
    }

    fn verify_orphans(config: &ClusterConfig, state: &NodeState, report: &mut VerifyReport) {
        let mut expected: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for instance in &config.instances {
            for (node, volumes) in volumes_by_node(instance) {
                expected.entry(node).or_default().extend(volumes);
            }
        }
        for (node, volumes) in &state.volumes {
            for volume in volumes.keys() {
                let known = expected
                    .get(node)
                    .map(|v| v.contains(volume))
                    .unwrap_or(false);
                if !known {
                    report.push(format!("volume {} on node {} should not exist", volume, node));
                }
            }
        }

        for (node, running) in &state.running {
            for name in running {
                if config.instance(name).is_none() {
                    report.push(format!("instance {} on node {} should not exist", name, node));
                }
            }
        }
    }
}

#[async_trait]
impl LogicalOperation for VerifyCluster {
    fn name(&self) -> &'static str {
        "cluster_verify"
    }

    fn lock_scope(&self, _config: &ClusterConfig) -> LockScope {
        LockScope::new()
    }

    async fn check_prereq(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult> {
        let config = ctx.config.snapshot();
        let mut report = VerifyReport::default();

        let master_files = match ctx.rpc.config_file_list(&config.master_node).await {
            Ok(files) => files,
            Err(e) => {
                report.node_error(&config.master_node, format!("cannot list cluster files: {}", e));
                BTreeMap::new()
            }
        };

        let mut state = NodeState::default();
        for node in config.node_names() {
            feedback.feedback(&format!("* Verifying node {}", node));
            Self::verify_node(ctx, &config, &node, &master_files, &mut report).await;

            match ctx.rpc.volume_list(&node, &config.vg_name).await {
                Ok(volumes) => {
                    state.volumes.insert(node.clone(), volumes);
                }
                Err(e) => report.node_error(&node, format!("unable to list volumes: {}", e)),
            }
            match ctx.rpc.instance_list(&node).await {
                Ok(running) => {
                    state.running.insert(node.clone(), running);
                }
                Err(e) => report.node_error(&node, format!("unable to list instances: {}", e)),
            }
        }

        for instance in &config.instances {
            feedback.feedback(&format!("* Verifying instance {}", instance.name));
            Self::verify_instance(instance, &state, &mut report);
        }

        feedback.feedback("* Verifying orphan volumes and instances");
        Self::verify_orphans(&config, &state, &mut report);

        debug!("Verification found {} problems", report.findings.len());
        Ok(OpResult::Verify(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, DiskTemplate, InstanceStatus, Nic, Node};
    use crate::controlplane::backends::{SimNodeSpec, SimulatedCluster};
    use crate::controlplane::opcodes::{Empty, OpCode};
    use crate::controlplane::operation::CollectingFeedback;
    use crate::controlplane::processor::Processor;
    use crate::domain::ports::NodeRpc;
    use crate::storage::{generate_disk_template, SyncPolicy};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn cluster() -> (Arc<SimulatedCluster>, Processor) {
        let mut next_port = 11000;
        let disks = generate_disk_template(
            DiskTemplate::RemoteRaid1,
            "web1",
            "node1",
            &["node2".to_string()],
            10240,
            1024,
            "xenvg",
            || {
                next_port += 1;
                Ok(next_port)
            },
        )
        .unwrap();
        let config = ClusterConfig {
            nodes: vec![
                Node::new("node1", "192.0.2.1"),
                Node::new("node2", "192.0.2.2"),
                Node::new("node3", "192.0.2.3"),
            ],
            instances: vec![Instance {
                name: "web1".into(),
                primary_node: "node1".into(),
                secondary_nodes: vec!["node2".into()],
                memory: 512,
                vcpus: 1,
                disk_template: DiskTemplate::RemoteRaid1,
                disks,
                nics: vec![Nic {
                    mac: "aa:00:00:00:00:01".into(),
                    bridge: "xen-br0".into(),
                    ip: None,
                }],
                status: InstanceStatus::Up,
                os: "linux".into(),
            }],
            master_node: "node1".into(),
            next_drbd_port: 11003,
            ..Default::default()
        };
        let fleet = Arc::new(SimulatedCluster::from_config(&config, &SimNodeSpec::default()));
        let ctx = Context::new(ConfigStore::new(config), fleet.clone(), SyncPolicy::immediate());
        (fleet, Processor::new(ctx, "node1"))
    }

    async fn verify(processor: &Processor) -> VerifyReport {
        let result = processor
            .submit(OpCode::ClusterVerify(Empty {}), &CollectingFeedback::new())
            .await
            .unwrap();
        assert_matches!(result, OpResult::Verify(report) => report)
    }

    fn has(report: &VerifyReport, needle: &str) -> bool {
        report.findings.iter().any(|f| f.contains(needle))
    }

    #[tokio::test]
    async fn test_healthy_cluster() {
        let (_, processor) = cluster();
        let report = verify(&processor).await;
        assert!(!report.bad, "unexpected findings: {:?}", report.findings);
        assert!(report.findings.is_empty());
    }

    #[tokio::test]
    async fn test_node_problems() {
        let (fleet, processor) = cluster();
        fleet.set_version("node2", "0.0.1");
        fleet.set_file("node3", KNOWN_HOSTS_FILE, None);
        fleet.set_file("node2", SSL_CERT_FILE, Some("tampered"));
        fleet.set_file("node3", CLUSTER_CONFIG_FILE, Some("serial-0"));
        fleet.set_unreachable_peer("node3", "node1", "connection refused");
        fleet.set_hypervisor_error("node2", Some("xend not running"));
        fleet.set_vg_size("node3", 10240);

        let report = verify(&processor).await;
        assert!(report.bad);
        assert!(has(&report, "node node2: software version mismatch"));
        assert!(has(&report, &format!("node node3: file '{}' missing", KNOWN_HOSTS_FILE)));
        assert!(has(&report, &format!("node node2: file '{}' has wrong checksum", SSL_CERT_FILE)));
        assert!(has(&report, "should not exist on non-master nodes"));
        assert!(has(&report, "communication with node 'node1': connection refused"));
        assert!(has(&report, "xend not running"));
        assert!(has(&report, "too small"));
    }

    #[tokio::test]
    async fn test_instance_problems() {
        let (fleet, processor) = cluster();
        let web1 = processor.context().config.instance("web1").unwrap();
        let data = web1.disks[0].children[0].children[0].clone();
        fleet.blockdev_remove("node2", &data).await.unwrap();
        fleet.instance_shutdown("node1", &web1).await.unwrap();
        fleet.add_stray_instance("node3", "web1");

        let report = verify(&processor).await;
        assert!(report.bad);
        assert!(has(&report, "instance web1: volume web1-sda.data missing on node node2"));
        assert!(has(&report, "instance web1: not running on node node1"));
        assert!(has(&report, "instance web1: should not run on node node3"));
    }

    #[tokio::test]
    async fn test_orphans() {
        let (fleet, processor) = cluster();
        fleet.add_stray_volume("node3", "old-backup", 1024);
        fleet.add_stray_instance("node2", "ghost");

        let report = verify(&processor).await;
        assert!(report.bad);
        assert_eq!(
            report.findings,
            vec![
                "volume old-backup on node node3 should not exist".to_string(),
                "instance ghost on node node2 should not exist".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_is_a_finding() {
        let (fleet, processor) = cluster();
        fleet.set_reachable("node3", false);

        let report = verify(&processor).await;
        assert!(report.bad);
        assert!(has(&report, "node node3: unable to verify node"));
        assert!(!has(&report, "instance web1"));
    }
}
