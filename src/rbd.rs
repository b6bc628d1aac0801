//! Typed wrappers around the `rbd`, `rbd-nbd` and `ceph` command line
//! tools. The driver never links a Ceph client library; every cluster
//! operation goes through these executables.

use crate::{
    config::Config,
    shell::{Sh, ShellError},
};
use snafu::Snafu;

/// Errors which can be encountered whilst driving the Ceph tools.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RbdError {
    #[snafu(display("{source}"))]
    Shell { source: ShellError },
    #[snafu(display("unmap of device {device} has failed due to 'busy device'"))]
    DeviceBusy { device: String },
    #[snafu(display("cannot get mapped devices from line {line}"))]
    DeviceListParse { line: String },
    #[snafu(display(
        "only exclusive write access (single mapping of a volume) is supported at a \
         time. For shared read-only mappings, specify an etcd server for distributed \
         RW lock management (--lock-etcd)"
    ))]
    ReadOnlyNeedsLockService {},
}

impl RbdError {
    /// True when the wrapped command exceeded its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RbdError::Shell { source } if source.is_timeout())
    }
}

/// An RBD image currently mapped to a local block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedDevice {
    pub pool: String,
    pub name: String,
    pub device: String,
}

/// Client for the cluster-side and kernel-side RBD operations.
#[derive(Debug, Clone)]
pub struct RbdClient {
    ceph_config_file: String,
    ceph_user: String,
    use_kernel_module: bool,
    /// Read-only nbd mappings are only safe when a distributed lock
    /// coordinator arbitrates them against exclusive writers.
    shared_locking: bool,
}

impl RbdClient {
    pub fn new(config: &Config, shared_locking: bool) -> Self {
        Self {
            ceph_config_file: config.ceph_config_file.clone(),
            ceph_user: config.ceph_user.clone(),
            use_kernel_module: config.use_kernel_module,
            shared_locking,
        }
    }

    /// `rbd` invocation carrying the cluster config, user and optional pool.
    fn rbd(&self, pool: Option<&str>) -> Sh {
        let mut sh = Sh::new("rbd");
        if let Some(pool) = pool {
            sh = sh.args(["--pool", pool]);
        }
        sh.args(["--conf", &self.ceph_config_file, "--id", &self.ceph_user])
    }

    fn rbd_nbd(&self) -> Sh {
        Sh::new("rbd-nbd").args(["--conf", &self.ceph_config_file, "--id", &self.ceph_user])
    }

    /// True iff the pool answers `ceph osd pool get <pool> size`. An ENOENT
    /// in the failure output means "no such pool", not an error.
    pub async fn pool_exists(&self, pool: &str) -> Result<bool, RbdError> {
        match Sh::new("ceph")
            .args(["osd", "pool", "get", pool, "size"])
            .output()
            .await
        {
            Ok(_) => Ok(true),
            Err(error) => {
                if error.to_string().contains("ENOENT") {
                    Ok(false)
                } else {
                    Err(RbdError::Shell { source: error })
                }
            }
        }
    }

    /// All pool names known to the cluster.
    pub async fn pool_list(&self) -> Result<Vec<String>, RbdError> {
        let output = Sh::new("ceph")
            .args(["osd", "pool", "ls"])
            .output()
            .await
            .map_err(|source| RbdError::Shell { source })?;
        Ok(lines(&output))
    }

    /// Create a pool and initialize it for RBD use.
    pub async fn pool_create(&self, pool: &str, pg_num: u32) -> Result<(), RbdError> {
        Sh::new("ceph")
            .args(["osd", "pool", "create", pool, &pg_num.to_string()])
            .output()
            .await
            .map_err(|source| RbdError::Shell { source })?;
        self.rbd(Some(pool))
            .args(["pool", "init", pool])
            .output()
            .await
            .map_err(|source| RbdError::Shell { source })?;
        Ok(())
    }

    /// True iff `rbd info` succeeds. Failure is taken as "no such image";
    /// no error surfaces from here.
    pub async fn image_exists(&self, pool: &str, name: &str) -> bool {
        match self.rbd(Some(pool)).args(["info", name]).output().await {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!("rbd info returned an error, assuming image absent: {error}");
                false
            }
        }
    }

    /// Image names in the pool, possibly empty.
    pub async fn image_list(&self, pool: &str) -> Result<Vec<String>, RbdError> {
        let output = self
            .rbd(Some(pool))
            .arg("ls")
            .output()
            .await
            .map_err(|source| RbdError::Shell { source })?;
        Ok(lines(&output))
    }

    /// Create an image with format 2, the given size in MB and one
    /// `--image-feature` per comma separated feature.
    pub async fn image_create(
        &self,
        pool: &str,
        name: &str,
        size_mb: u32,
        features: &str,
    ) -> Result<(), RbdError> {
        let mut sh = self.rbd(Some(pool)).args([
            "create",
            name,
            "--image-format",
            "2",
            "--size",
            &size_mb.to_string(),
        ]);
        for feature in features.split(',').filter(|f| !f.is_empty()) {
            sh = sh.args(["--image-feature", feature]);
        }
        sh.output()
            .await
            .map(|_| ())
            .map_err(|source| RbdError::Shell { source })
    }

    pub async fn image_remove(&self, pool: &str, name: &str) -> Result<(), RbdError> {
        self.rbd(Some(pool))
            .args(["rm", name])
            .output()
            .await
            .map(|_| ())
            .map_err(|source| RbdError::Shell { source })
    }

    pub async fn image_rename(&self, pool: &str, from: &str, to: &str) -> Result<(), RbdError> {
        self.rbd(Some(pool))
            .args(["rename", from, to])
            .output()
            .await
            .map(|_| ())
            .map_err(|source| RbdError::Shell { source })
    }

    /// Map an image to a local block device and return the device path.
    ///
    /// With the kernel module the mapping is the same for both modes. With
    /// rbd-nbd a writer maps `--exclusive`; a reader maps `--read-only`,
    /// which is refused unless a lock coordinator arbitrates readers
    /// against exclusive writers on other hosts.
    pub async fn map_image(
        &self,
        pool: &str,
        name: &str,
        readonly: bool,
    ) -> Result<String, RbdError> {
        if self.use_kernel_module {
            tracing::debug!("mapping image {pool}/{name} using the kernel RBD module");
            return self
                .rbd(Some(pool))
                .args(["map", name])
                .output()
                .await
                .map_err(|source| RbdError::Shell { source });
        }
        tracing::debug!("mapping image {pool}/{name} using rbd-nbd, readonly={readonly}");
        let image = format!("{pool}/{name}");
        if readonly {
            if !self.shared_locking {
                return ReadOnlyNeedsLockServiceSnafu {}.fail();
            }
            self.rbd_nbd()
                .args(["--read-only", "map", &image])
                .output()
                .await
                .map_err(|source| RbdError::Shell { source })
        } else {
            self.rbd_nbd()
                .args(["--exclusive", "map", &image])
                .output()
                .await
                .map_err(|source| RbdError::Shell { source })
        }
    }

    /// Release a mapped device. A busy device (exit status 16) surfaces as
    /// a distinguishable error.
    pub async fn unmap_device(&self, device: &str) -> Result<(), RbdError> {
        let result = if self.use_kernel_module {
            self.rbd(None).args(["unmap", device]).output().await
        } else {
            self.rbd_nbd()
                .args(["--timeout", "60", "unmap", device])
                .output()
                .await
        };
        match result {
            Ok(_) => Ok(()),
            Err(error) if error.is_busy() => DeviceBusySnafu { device }.fail(),
            Err(source) => Err(RbdError::Shell { source }),
        }
    }

    /// All images currently mapped on this host.
    pub async fn list_mapped_devices(&self) -> Result<Vec<MappedDevice>, RbdError> {
        let output = if self.use_kernel_module {
            self.rbd(None)
                .args(["device", "list"])
                .output()
                .await
                .map_err(|source| RbdError::Shell { source })?
        } else {
            // rbd-nbd exits nonzero when nothing is mapped
            match self.rbd_nbd().arg("list-mapped").output().await {
                Ok(output) => output,
                Err(error) => {
                    tracing::debug!("error listing mapped nbd devices, assuming none: {error}");
                    String::new()
                }
            }
        };
        parse_device_list(&output)
    }
}

/// Parse the tabular `rbd device list` / `rbd-nbd list-mapped` output. The
/// first line is the header; every following line must carry exactly the
/// id, pool, name, snap and device columns.
fn parse_device_list(output: &str) -> Result<Vec<MappedDevice>, RbdError> {
    let mut mappings = Vec::new();
    for line in output.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            return DeviceListParseSnafu { line }.fail();
        }
        mappings.push(MappedDevice {
            pool: fields[1].to_string(),
            name: fields[2].to_string(),
            device: fields[4].to_string(),
        });
    }
    Ok(mappings)
}

/// Newline-split output with empties dropped.
fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_list_parses_rows_after_the_header() {
        let output = "id pool    image   snap device\n\
                      0  volumes rw-1    -    /dev/nbd0\n\
                      1  volumes r-1     -    /dev/nbd1";
        let devices = parse_device_list(output).unwrap();
        assert_eq!(
            devices,
            vec![
                MappedDevice {
                    pool: "volumes".into(),
                    name: "rw-1".into(),
                    device: "/dev/nbd0".into(),
                },
                MappedDevice {
                    pool: "volumes".into(),
                    name: "r-1".into(),
                    device: "/dev/nbd1".into(),
                },
            ]
        );
    }

    #[test]
    fn device_list_of_header_only_is_empty() {
        assert!(parse_device_list("id pool image snap device").unwrap().is_empty());
        assert!(parse_device_list("").unwrap().is_empty());
    }

    #[test]
    fn device_list_rejects_malformed_rows() {
        let output = "id pool image snap device\n0 volumes rw-1 /dev/nbd0";
        let error = parse_device_list(output).unwrap_err();
        assert!(matches!(error, RbdError::DeviceListParse { .. }));
    }

    #[test]
    fn pool_listing_splits_lines() {
        assert_eq!(lines("volumes\nbackup\n"), vec!["volumes", "backup"]);
        assert!(lines("").is_empty());
    }
}
