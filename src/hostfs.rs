//! Host filesystem operations: probing, formatting, mounting and the mount
//! table. Everything goes through the host's own tools so that what the
//! driver sees is exactly what the administrator sees.

use crate::shell::{Sh, ShellError};
use snafu::{ResultExt, Snafu};
use std::{path::PathBuf, time::Duration};

/// mkfs can legitimately take minutes on a large image.
const MKFS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors which can be encountered whilst handling host filesystems.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HostFsError {
    #[snafu(display("{source}"))]
    Shell { source: ShellError },
    #[snafu(display("unable to determine the filesystem type of {device} from blkid"))]
    UnknownFsType { device: String },
    #[snafu(display("unable to find mkfs.{fstype} in PATH: {source}"))]
    MkfsMissing {
        fstype: String,
        source: which::Error,
    },
    #[snafu(display("cannot get mount fields from line {line}"))]
    MountListParse { line: String },
}

impl HostFsError {
    /// True when the wrapped command exceeded its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, HostFsError::Shell { source } if source.is_timeout())
    }
}

/// One row of the host mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRow {
    pub device: String,
    pub mountpath: String,
}

/// Filesystem type on a formatted device, from blkid. Empty output means
/// the device carries no recognizable filesystem.
pub async fn detect_fs_type(device: &str) -> Result<String, HostFsError> {
    let output = Sh::new("blkid")
        .args(["-o", "value", "-s", "TYPE", device])
        .output()
        .await
        .context(ShellSnafu)?;
    if output.is_empty() {
        return UnknownFsTypeSnafu { device }.fail();
    }
    Ok(output)
}

/// Resolve `mkfs.<fstype>` on PATH. Checked before image creation so that
/// a missing tool fails the request before anything is provisioned.
pub fn lookup_mkfs(fstype: &str) -> Result<PathBuf, HostFsError> {
    which::which(format!("mkfs.{fstype}")).context(MkfsMissingSnafu { fstype })
}

/// Format a device, with the long mkfs deadline.
pub async fn make_filesystem(fstype: &str, device: &str) -> Result<(), HostFsError> {
    let mkfs = lookup_mkfs(fstype)?;
    Sh::new(&mkfs.to_string_lossy())
        .arg(device)
        .timeout(MKFS_TIMEOUT)
        .output()
        .await
        .map(|_| ())
        .context(ShellSnafu)
}

pub async fn mount_device(fstype: &str, device: &str, path: &str) -> Result<(), HostFsError> {
    Sh::new("mount")
        .args(["-t", fstype, device, path])
        .output()
        .await
        .map(|_| ())
        .context(ShellSnafu)
}

pub async fn unmount_path(path: &str) -> Result<(), HostFsError> {
    Sh::new("umount")
        .arg(path)
        .output()
        .await
        .map(|_| ())
        .context(ShellSnafu)
}

/// Dry-run XFS check. xfs_repair -n exits 1 when it suspects corruption
/// and 0 when the filesystem is clean.
pub async fn xfs_check(device: &str) -> Result<(), HostFsError> {
    Sh::new("xfs_repair")
        .args(["-n", device])
        .output()
        .await
        .map(|_| ())
        .context(ShellSnafu)
}

/// Snapshot of the host mount table, via the `mount` command.
pub async fn list_mounts() -> Result<Vec<MountRow>, HostFsError> {
    let output = Sh::new("mount").output().await.context(ShellSnafu)?;
    parse_mount_list(&output)
}

/// `mount` prints `<device> on <path> type <fs> (<options>)` rows; only the
/// device and path columns matter here.
fn parse_mount_list(output: &str) -> Result<Vec<MountRow>, HostFsError> {
    let mut mounts = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return MountListParseSnafu { line }.fail();
        }
        mounts.push(MountRow {
            device: fields[0].to_string(),
            mountpath: fields[2].to_string(),
        });
    }
    Ok(mounts)
}
