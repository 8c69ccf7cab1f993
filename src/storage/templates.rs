//! Disk Template Generator
//!
//! Builds the disk tree for a template without touching any node. The only
//! side effect is asking the caller for fresh replication ports.

use crate::config::{Disk, DiskTemplate, DRBD_META_SIZE};
use crate::error::{Error, Result};

/// Extra space a replicated template needs on every node (metadata volumes)
pub const REPLICATION_OVERHEAD: u64 = 2 * DRBD_META_SIZE;

/// Free volume group space a template needs on each participating node, in MiB
pub fn required_free_space(template: DiskTemplate, disk_size: u64, swap_size: u64) -> u64 {
    match template {
        DiskTemplate::Diskless => 0,
        DiskTemplate::Plain => disk_size + swap_size,
        DiskTemplate::LocalRaid1 => 2 * (disk_size + swap_size),
        DiskTemplate::RemoteRaid1 => disk_size + swap_size + REPLICATION_OVERHEAD,
    }
}

/// Build one replicated pair between `primary` and `secondary`, with its data
/// and metadata volumes named after `base`
pub fn generate_replicated_branch(
    vg_name: &str,
    primary: &str,
    secondary: &str,
    size: u64,
    base: &str,
    port: u16,
) -> Disk {
    let data = Disk::volume(vg_name, format!("{}.data", base), size);
    let meta = Disk::volume(vg_name, format!("{}.meta", base), DRBD_META_SIZE);
    Disk::replicated(primary, secondary, port, size, vec![data, meta])
}

/// Generate the disk tree of a new instance
///
/// `allocate_port` is called once per replicated pair and must hand out a
/// port no other pair in the cluster uses.
#[allow(clippy::too_many_arguments)]
pub fn generate_disk_template(
    template: DiskTemplate,
    instance_name: &str,
    primary: &str,
    secondaries: &[String],
    disk_size: u64,
    swap_size: u64,
    vg_name: &str,
    mut allocate_port: impl FnMut() -> Result<u16>,
) -> Result<Vec<Disk>> {
    if !template.has_secondary() && !secondaries.is_empty() {
        return Err(Error::Invariant(format!(
            "template {} does not take secondary nodes",
            template
        )));
    }

    let disks = match template {
        DiskTemplate::Diskless => Vec::new(),
        DiskTemplate::Plain => vec![
            Disk::volume(vg_name, format!("{}.sda", instance_name), disk_size).with_iv_name("sda"),
            Disk::volume(vg_name, format!("{}.sdb", instance_name), swap_size).with_iv_name("sdb"),
        ],
        DiskTemplate::LocalRaid1 => ["sda", "sdb"]
            .iter()
            .zip([disk_size, swap_size])
            .map(|(iv_name, size)| {
                let legs = vec![
                    Disk::volume(vg_name, format!("{}.{}_m1", instance_name, iv_name), size),
                    Disk::volume(vg_name, format!("{}.{}_m2", instance_name, iv_name), size),
                ];
                Disk::mirror(format!("{}.{}", instance_name, iv_name), size, legs)
                    .with_iv_name(*iv_name)
            })
            .collect(),
        DiskTemplate::RemoteRaid1 => {
            let secondary = match secondaries {
                [secondary] => secondary,
                _ => {
                    return Err(Error::Invariant(format!(
                        "template {} needs exactly one secondary node, got {}",
                        template,
                        secondaries.len()
                    )))
                }
            };
            let mut disks = Vec::with_capacity(2);
            for (iv_name, size) in [("sda", disk_size), ("sdb", swap_size)] {
                let port = allocate_port()?;
                let base = format!("{}-{}", instance_name, iv_name);
                let branch =
                    generate_replicated_branch(vg_name, primary, secondary, size, &base, port);
                disks.push(
                    Disk::mirror(format!("{}.{}", instance_name, iv_name), size, vec![branch])
                        .with_iv_name(iv_name),
                );
            }
            disks
        }
    };

    for disk in &disks {
        disk.validate()?;
    }
    Ok(disks)
}
