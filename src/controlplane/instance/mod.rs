//! Instance Operations
//!
//! Lifecycle (create, start, shutdown, remove, failover, disk activation)
//! and live mirror management of instances.

pub mod create;
pub mod failover;
pub mod lifecycle;
pub mod mirror;

pub use create::CreateInstance;
pub use failover::FailoverInstance;
pub use lifecycle::{ActivateDisks, DeactivateDisks, RemoveInstance, ShutdownInstance, StartInstance};
pub use mirror::{AddMirrorLeg, RemoveMirrorLeg, ReplaceDisks};

use super::hooks::HooksEnv;
use crate::config::{ClusterConfig, Instance, Nic};

/// Hook variables describing an instance
#[allow(clippy::too_many_arguments)]
pub(crate) fn instance_env(
    name: &str,
    primary: &str,
    secondaries: &[String],
    os: &str,
    status: &str,
    memory: u64,
    vcpus: u32,
    nics: &[Nic],
) -> HooksEnv {
    let mut env = HooksEnv::new();
    env.set("OP_TARGET", name)
        .set("INSTANCE_NAME", name)
        .set("INSTANCE_PRIMARY", primary)
        .set("INSTANCE_SECONDARIES", secondaries.join(" "))
        .set("INSTANCE_OS_TYPE", os)
        .set("INSTANCE_STATUS", status)
        .set("INSTANCE_MEMORY", memory)
        .set("INSTANCE_VCPUS", vcpus)
        .set("INSTANCE_NIC_COUNT", nics.len());
    for (idx, nic) in nics.iter().enumerate() {
        env.set(
            &format!("INSTANCE_NIC{}_IP", idx),
            nic.ip.as_deref().unwrap_or(""),
        )
        .set(&format!("INSTANCE_NIC{}_BRIDGE", idx), &nic.bridge)
        .set(&format!("INSTANCE_NIC{}_HWADDR", idx), &nic.mac);
    }
    env
}

/// Hook variables of an existing instance, run on the master and all of the
/// instance's nodes
pub(crate) fn instance_env_from(config: &ClusterConfig, instance: &Instance) -> HooksEnv {
    let mut env = instance_env(
        &instance.name,
        &instance.primary_node,
        &instance.secondary_nodes,
        &instance.os,
        &instance.status.to_string(),
        instance.memory,
        instance.vcpus,
        &instance.nics,
    );
    let mut nodes = vec![config.master_node.clone()];
    for node in instance.all_nodes() {
        if !nodes.contains(&node) {
            nodes.push(node);
        }
    }
    env.pre_nodes = nodes.clone();
    env.post_nodes = nodes;
    env
}

/// Instance and node names to lock for an operation on an existing
/// instance, resolving short names where possible
pub(crate) fn instance_scope(config: &ClusterConfig, name: &str) -> super::locks::LockScope {
    let full = config
        .expand_instance_name(name)
        .unwrap_or_else(|| name.to_string());
    let scope = super::locks::LockScope::new().instance(full.clone());
    match config.instance(&full) {
        Some(instance) => scope.nodes(instance.all_nodes()),
        None => scope,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared fixture: a three-node cluster on a simulated fleet

    use crate::config::{ClusterConfig, ConfigStore, Instance, Node};
    use crate::controlplane::backends::{SimNodeSpec, SimulatedCluster};
    use crate::controlplane::opcodes::{InstanceCreate, OpCode};
    use crate::controlplane::operation::{CollectingFeedback, Context, OpResult};
    use crate::controlplane::processor::Processor;
    use crate::error::Result;
    use crate::storage::SyncPolicy;
    use std::sync::Arc;

    pub struct Harness {
        pub fleet: Arc<SimulatedCluster>,
        pub processor: Processor,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_specs(&[
                ("n1.example.com", SimNodeSpec::default().with_vg_free(20000)),
                ("n2.example.com", SimNodeSpec::default().with_vg_free(20000)),
                ("n3.example.com", SimNodeSpec::default().with_vg_free(20000)),
            ])
        }

        pub fn with_specs(specs: &[(&str, SimNodeSpec)]) -> Self {
            let config = ClusterConfig {
                nodes: specs
                    .iter()
                    .enumerate()
                    .map(|(i, (name, _))| Node::new(*name, format!("192.0.2.{}", i + 1)))
                    .collect(),
                master_node: specs[0].0.to_string(),
                ..Default::default()
            };
            let fleet = Arc::new(SimulatedCluster::new());
            for (name, spec) in specs {
                fleet.add_node(name, spec.clone());
            }
            let ctx = Context::new(ConfigStore::new(config), fleet.clone(), SyncPolicy::immediate());
            let processor = Processor::new(ctx, specs[0].0);
            Self { fleet, processor }
        }

        pub fn config(&self) -> &ConfigStore {
            &self.processor.context().config
        }

        pub fn instance(&self, name: &str) -> Instance {
            self.config().instance(name).unwrap()
        }

        pub async fn run(&self, op: OpCode) -> Result<OpResult> {
            self.processor.submit(op, &CollectingFeedback::new()).await
        }

        pub async fn run_json(&self, raw: &str) -> Result<OpResult> {
            self.processor.submit_json(raw, &CollectingFeedback::new()).await
        }

        /// Create request for web1 on n1 (+ n2 for remote_raid1)
        pub fn create_request(template: &str) -> InstanceCreate {
            InstanceCreate {
                instance_name: "web1".into(),
                mem_size: 512,
                disk_size: 10240,
                swap_size: 1024,
                primary_node: "n1".into(),
                disk_template: template.into(),
                mode: "create".into(),
                start: true,
                vcpus: 1,
                wait_for_sync: true,
                secondary_node: (template == "remote-mirror" || template == "remote_raid1")
                    .then(|| "n2".to_string()),
                os_type: Some("linux".into()),
                src_node: None,
                src_path: None,
                ip: None,
                bridge: None,
            }
        }

        /// Create web1 as a running remote_raid1 instance
        pub async fn create_web1(&self) -> Instance {
            self.run(OpCode::InstanceCreate(Self::create_request("remote-mirror")))
                .await
                .unwrap();
            self.instance("web1")
        }
    }
}
