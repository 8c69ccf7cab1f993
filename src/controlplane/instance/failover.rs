//! Instance Failover
//!
//! Moves a network-mirrored instance to its secondary node. The swap of
//! primary and secondary is only written to the config once the disks are
//! usable on the target.

use super::{instance_env_from, instance_scope};
use crate::config::{ClusterConfig, DiskTemplate, Instance};
use crate::controlplane::hooks::HooksEnv;
use crate::controlplane::locks::LockScope;
use crate::controlplane::opcodes::InstanceFailover;
use crate::controlplane::operation::{
    checked, expand_instance, Context, Feedback, LogicalOperation, OpResult,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tracing::{error, info, warn};

pub struct FailoverInstance {
    req: InstanceFailover,
    instance: Option<Instance>,
    target: Option<String>,
}

impl FailoverInstance {
    pub fn new(req: InstanceFailover) -> Self {
        Self {
            req,
            instance: None,
            target: None,
        }
    }
}

#[async_trait]
impl LogicalOperation for FailoverInstance {
    fn name(&self) -> &'static str {
        "instance_failover"
    }

    fn hooks_path(&self) -> Option<&'static str> {
        Some("instance-failover")
    }

    fn lock_scope(&self, config: &ClusterConfig) -> LockScope {
        instance_scope(config, &self.req.instance_name)
    }

    async fn check_prereq(&mut self, ctx: &Context) -> Result<()> {
        let instance = expand_instance(&ctx.config, &self.req.instance_name)?;
        if instance.disk_template != DiskTemplate::RemoteRaid1 {
            return Err(Error::prereq(
                "Instance's disk layout is not remote_raid1, cannot failover.",
            ));
        }
        let target = match instance.secondary_nodes.as_slice() {
            [target] => target.clone(),
            [] => return Err(Error::prereq("The instance has no secondary node")),
            many => {
                return Err(Error::prereq(format!(
                    "The instance replicates to {} nodes; remove the extra mirror legs before failing over",
                    many.len()
                )))
            }
        };
        // the swapped instance must still describe every pair correctly
        for disk in &instance.disks {
            let single_pair = match disk.children.as_slice() {
                [leg] => leg.replicated_nodes().is_some_and(|(a, b)| {
                    let ends = [a, b];
                    ends.contains(&instance.primary_node.as_str()) && ends.contains(&target.as_str())
                }),
                _ => false,
            };
            if !single_pair {
                return Err(Error::prereq(format!(
                    "Disk {} does not have exactly one mirror leg to node {}",
                    disk.iv_name(),
                    target
                )));
            }
        }

        let info = ctx
            .rpc
            .node_info(&target, &ctx.config.vg_name())
            .await
            .ok()
            .flatten()
            .ok_or_else(|| {
                Error::prereq(format!("Cannot get current information from node '{}'", target))
            })?;
        if info.memory_free < instance.memory {
            return Err(Error::prereq(format!(
                "Not enough memory on target node {}. {} MiB available, {} MiB required",
                target, info.memory_free, instance.memory
            )));
        }

        let bridges: Vec<String> = instance.nics.iter().map(|n| n.bridge.clone()).collect();
        if !ctx.rpc.bridges_exist(&target, &bridges).await.unwrap_or(false) {
            return Err(Error::prereq(format!(
                "One or more target bridges {:?} does not exist on destination node '{}'",
                bridges, target
            )));
        }
        // an unreachable primary is the usual reason to fail over
        match ctx.rpc.bridges_exist(&instance.primary_node, &bridges).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(Error::prereq(format!(
                    "One or more bridges {:?} does not exist on node '{}'",
                    bridges, instance.primary_node
                )))
            }
            Err(e) => warn!("Cannot check bridges on the primary node: {}", e),
        }

        self.target = Some(target);
        self.instance = Some(instance);
        Ok(())
    }

    fn build_hooks_env(&self, config: &ClusterConfig) -> HooksEnv {
        let Some(instance) = &self.instance else {
            return HooksEnv::default();
        };
        let mut env = instance_env_from(config, instance);
        env.set("IGNORE_CONSISTENCY", self.req.ignore_consistency);
        env
    }

    async fn exec(&mut self, ctx: &Context, feedback: &dyn Feedback) -> Result<OpResult> {
        let instance = checked(&self.instance, self.name())?;
        let target = checked(&self.target, self.name())?;
        let source = &instance.primary_node;

        feedback.feedback("* checking disk consistency between source and target");
        for disk in &instance.disks {
            if !ctx.blockdev.check_disk_consistency(disk, target, false).await {
                if self.req.ignore_consistency {
                    warn!("Disk {} is degraded on target node, ignoring", disk.iv_name());
                } else {
                    return Err(Error::exec(format!(
                        "Disk {} is degraded on target node, aborting failover.",
                        disk.iv_name()
                    )));
                }
            }
        }

        feedback.feedback(&format!("* shutting down instance on source node {}", source));
        let stopped = ctx
            .rpc
            .instance_shutdown(source, instance)
            .await
            .unwrap_or_else(|e| {
                error!("{}", e);
                false
            });
        if !stopped {
            error!(
                "Could not shutdown instance {} on node {}. Proceeding anyway. Please make sure node {} is down.",
                instance.name, source, source
            );
        }

        feedback.feedback("* deactivating the instance's disks on source node");
        if !ctx.blockdev.shutdown_disks(instance, true).await? {
            return Err(Error::exec("Can't shut down the instance's disks."));
        }

        let mut moved = instance.clone();
        moved.primary_node = target.clone();
        moved.secondary_nodes = vec![source.clone()];

        if instance.is_up() {
            feedback.feedback(&format!("* activating the instance's disks on target node {}", target));
            let (disks_ok, _) = ctx.blockdev.assemble_disks(&moved, true).await?;
            if !disks_ok {
                ctx.blockdev.shutdown_disks(&moved, false).await?;
                return Err(Error::exec("Can't activate the instance's disks"));
            }
        }

        ctx.config.update_instance(moved.clone())?;
        info!("Instance {} now has primary node {}", moved.name, target);

        if instance.is_up() {
            feedback.feedback(&format!("* starting the instance on the target node {}", target));
            let started = ctx
                .rpc
                .instance_start(target, &moved, None)
                .await
                .unwrap_or_else(|e| {
                    error!("{}", e);
                    false
                });
            if !started {
                ctx.blockdev.shutdown_disks(&moved, false).await?;
                ctx.config.mark_instance_down(&moved.name)?;
                return Err(Error::exec(format!(
                    "Could not start instance {} on node {}.",
                    moved.name, target
                )));
            }
        }
        Ok(OpResult::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::RpcCall;
    use crate::controlplane::instance::testutil::Harness;
    use crate::controlplane::opcodes::{InstanceAddMirrorLeg, InstanceCreate, InstanceName, OpCode};
    use assert_matches::assert_matches;

    fn failover(ignore_consistency: bool) -> OpCode {
        OpCode::InstanceFailover(InstanceFailover {
            instance_name: "web1".into(),
            ignore_consistency,
        })
    }

    #[tokio::test]
    async fn test_failover_running_instance() {
        let h = Harness::new();
        let before = h.create_web1().await;

        h.run(failover(false)).await.unwrap();

        let after = h.instance("web1");
        assert_eq!(after.primary_node, "n2.example.com");
        assert_eq!(after.secondary_nodes, vec!["n1.example.com".to_string()]);
        assert!(after.is_up());
        assert_eq!(after.disks, before.disks);
        assert!(h.fleet.is_running("n2.example.com", "web1"));
        assert!(!h.fleet.is_running("n1.example.com", "web1"));
        assert!(h.fleet.is_assembled("n2.example.com", &after.disks[0]));
    }

    #[tokio::test]
    async fn test_failover_stopped_instance_stays_down() {
        let h = Harness::new();
        h.create_web1().await;
        h.run(OpCode::InstanceShutdown(InstanceName {
            instance_name: "web1".into(),
        }))
        .await
        .unwrap();

        h.run(failover(false)).await.unwrap();
        let after = h.instance("web1");
        assert_eq!(after.primary_node, "n2.example.com");
        assert!(!after.is_up());
        assert_eq!(h.fleet.call_count("n2.example.com", RpcCall::InstanceStart), 0);
    }

    #[tokio::test]
    async fn test_failover_degraded_target_aborts() {
        let h = Harness::new();
        let web1 = h.create_web1().await;
        h.fleet.set_degraded("n2.example.com", &web1.disks[0].children[0], true);

        assert_matches!(
            h.run(failover(false)).await,
            Err(Error::Exec(msg)) if msg.contains("degraded")
        );
        assert_eq!(h.instance("web1").primary_node, "n1.example.com");
        assert!(h.fleet.is_running("n1.example.com", "web1"));

        h.run(failover(true)).await.unwrap();
        assert_eq!(h.instance("web1").primary_node, "n2.example.com");
    }

    #[tokio::test]
    async fn test_failover_survives_dead_primary() {
        let h = Harness::new();
        h.create_web1().await;
        h.fleet.set_reachable("n1.example.com", false);

        h.run(failover(false)).await.unwrap();
        assert_eq!(h.instance("web1").primary_node, "n2.example.com");
        assert!(h.fleet.is_running("n2.example.com", "web1"));
    }

    #[tokio::test]
    async fn test_failover_assembly_failure_keeps_config() {
        let h = Harness::new();
        h.create_web1().await;
        h.fleet.fail("n2.example.com", RpcCall::BlockdevAssemble);

        assert_matches!(h.run(failover(false)).await, Err(Error::Exec(_)));
        assert_eq!(h.instance("web1").primary_node, "n1.example.com");
    }

    #[tokio::test]
    async fn test_failover_start_failure_marks_down() {
        let h = Harness::new();
        h.create_web1().await;
        h.fleet.fail("n2.example.com", RpcCall::InstanceStart);

        assert_matches!(h.run(failover(false)).await, Err(Error::Exec(_)));
        let after = h.instance("web1");
        assert_eq!(after.primary_node, "n2.example.com");
        assert!(!after.is_up());
        assert!(!h.fleet.is_assembled("n2.example.com", &after.disks[0]));
    }

    #[tokio::test]
    async fn test_failover_with_extra_mirror_leg_is_refused() {
        let h = Harness::new();
        h.create_web1().await;
        h.fleet.set_vg_free("n1.example.com", 20000);
        h.run(OpCode::InstanceAddMirrorLeg(InstanceAddMirrorLeg {
            instance_name: "web1".into(),
            remote_node: "n3".into(),
            disk_name: "sda".into(),
        }))
        .await
        .unwrap();
        let before = h.instance("web1");

        assert_matches!(
            h.run(failover(true)).await,
            Err(Error::Prereq(msg)) if msg.contains("mirror legs")
        );
        assert_eq!(h.instance("web1"), before);
        assert!(h.fleet.is_running("n1.example.com", "web1"));
        assert_eq!(h.fleet.call_count("n1.example.com", RpcCall::InstanceShutdown), 0);
        assert_eq!(h.fleet.call_count("n1.example.com", RpcCall::BlockdevShutdown), 0);
    }

    #[tokio::test]
    async fn test_failover_needs_single_pair_per_disk() {
        let h = Harness::new();
        let mut web1 = h.create_web1().await;
        // sda re-pointed at n3 while secondary_nodes still lists n2
        let sda = &mut web1.disks[0];
        sda.children[0] = crate::storage::generate_replicated_branch(
            "xenvg",
            "n1.example.com",
            "n3.example.com",
            sda.size,
            "web1-sda-x",
            11099,
        );
        h.config().update_instance(web1).unwrap();

        assert_matches!(
            h.run(failover(true)).await,
            Err(Error::Prereq(msg)) if msg.contains("sda") && msg.contains("n2.example.com")
        );
        assert_eq!(h.instance("web1").primary_node, "n1.example.com");
        assert_eq!(h.fleet.call_count("n1.example.com", RpcCall::InstanceShutdown), 0);
    }

    #[tokio::test]
    async fn test_failover_prereqs() {
        let h = Harness::new();
        h.run(OpCode::InstanceCreate(InstanceCreate {
            instance_name: "db1".into(),
            primary_node: "n3".into(),
            ..Harness::create_request("plain")
        }))
        .await
        .unwrap();
        assert_matches!(
            h.run(OpCode::InstanceFailover(InstanceFailover {
                instance_name: "db1".into(),
                ignore_consistency: false,
            }))
            .await,
            Err(Error::Prereq(msg)) if msg.contains("remote_raid1")
        );

        h.create_web1().await;
        h.fleet.set_memory_free("n2.example.com", 128);
        assert_matches!(
            h.run(failover(false)).await,
            Err(Error::Prereq(msg)) if msg.contains("memory")
        );
        assert_eq!(h.fleet.call_count("n1.example.com", RpcCall::InstanceShutdown), 0);
    }
}
