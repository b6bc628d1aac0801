//! Rebuilds the host-local volume view from what the kernel actually has:
//! the mapped-device table joined with the mount table. The daemon keeps no
//! volume registry of its own; this join is recomputed on every operation
//! that needs it.

use crate::{
    hostfs::{self, HostFsError, MountRow},
    rbd::{MappedDevice, RbdClient, RbdError},
};
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ReconcileError {
    #[snafu(display("error getting mapped devices: {source}"))]
    MappedDevices { source: RbdError },
    #[snafu(display("error getting current mounts: {source}"))]
    Mounts { source: HostFsError },
    #[snafu(display(
        "error on unmapping of unmounted rbd device {device}, image {pool}/{name}: {source}"
    ))]
    Heal {
        device: String,
        pool: String,
        name: String,
        source: RbdError,
    },
}

/// A live volume: an image mapped to a device and mounted on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub pool: String,
    pub name: String,
    pub device: String,
    pub mountpath: String,
}

/// Join mapped devices with the mount table on the device path. Returns the
/// mounted volumes keyed by mountpath, plus the stray mappings: devices the
/// kernel holds that nothing mounts, left over from an interrupted mount.
fn correlate(
    mapped: Vec<MappedDevice>,
    mounts: Vec<MountRow>,
) -> (HashMap<String, Volume>, Vec<MappedDevice>) {
    let device_to_path: HashMap<&str, &str> = mounts
        .iter()
        .map(|m| (m.device.as_str(), m.mountpath.as_str()))
        .collect();

    let mut volumes = HashMap::new();
    let mut strays = Vec::new();
    for mapping in mapped {
        match device_to_path.get(mapping.device.as_str()) {
            Some(mountpath) => {
                volumes.insert(
                    mountpath.to_string(),
                    Volume {
                        pool: mapping.pool,
                        name: mapping.name,
                        device: mapping.device,
                        mountpath: mountpath.to_string(),
                    },
                );
            }
            None => strays.push(mapping),
        }
    }
    (volumes, strays)
}

/// The authoritative `mountpath → Volume` map, healing as it goes: a device
/// mapped but not mounted is unmapped, because leaving it pins the image's
/// exclusive lease on the cluster.
pub async fn current_volumes(rbd: &RbdClient) -> Result<HashMap<String, Volume>, ReconcileError> {
    let mapped = rbd.list_mapped_devices().await.context(MappedDevicesSnafu)?;
    tracing::debug!("system mapped rbd devices: {mapped:?}");
    let mounts = hostfs::list_mounts().await.context(MountsSnafu)?;

    let (volumes, strays) = correlate(mapped, mounts);
    for stray in strays {
        tracing::debug!(
            "image {}/{} is mapped to {} but not mounted, unmapping it",
            stray.pool,
            stray.name,
            stray.device
        );
        rbd.unmap_device(&stray.device).await.context(HealSnafu {
            device: stray.device.clone(),
            pool: stray.pool.clone(),
            name: stray.name.clone(),
        })?;
    }
    Ok(volumes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(pool: &str, name: &str, device: &str) -> MappedDevice {
        MappedDevice {
            pool: pool.into(),
            name: name.into(),
            device: device.into(),
        }
    }

    fn mount(device: &str, mountpath: &str) -> MountRow {
        MountRow {
            device: device.into(),
            mountpath: mountpath.into(),
        }
    }

    #[test]
    fn correlate_joins_on_the_device() {
        let mapped = vec![
            mapping("volumes", "rw-1", "/dev/nbd0"),
            mapping("volumes", "r-1", "/dev/nbd1"),
        ];
        let mounts = vec![
            mount("proc", "/proc"),
            mount("/dev/nbd0", "/mnt/cepher/volumes/rw-1:rw"),
            mount("/dev/nbd1", "/mnt/cepher/volumes/r-1:ro"),
        ];
        let (volumes, strays) = correlate(mapped, mounts);
        assert!(strays.is_empty());
        assert_eq!(volumes.len(), 2);
        let vol = &volumes["/mnt/cepher/volumes/rw-1:rw"];
        assert_eq!(vol.pool, "volumes");
        assert_eq!(vol.name, "rw-1");
        assert_eq!(vol.device, "/dev/nbd0");
    }

    #[test]
    fn correlate_reports_unmounted_mappings_as_strays() {
        let mapped = vec![mapping("volumes", "x", "/dev/nbd7")];
        let (volumes, strays) = correlate(mapped, vec![mount("proc", "/proc")]);
        assert!(volumes.is_empty());
        assert_eq!(strays, vec![mapping("volumes", "x", "/dev/nbd7")]);
    }

    #[test]
    fn correlate_of_nothing_is_empty() {
        let (volumes, strays) = correlate(Vec::new(), Vec::new());
        assert!(volumes.is_empty());
        assert!(strays.is_empty());
    }
}
