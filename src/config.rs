//! Command line arguments and the immutable runtime configuration built
//! from them.

use clap::Parser;
use std::{path::Path, time::Duration};
use strum_macros::{AsRefStr, Display, EnumString};

/// What `Remove` does to the backing RBD image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RemoveAction {
    /// Leave the image untouched.
    Ignore,
    /// Delete the image from the cluster. Irreversible.
    Delete,
    /// Rename the image to a `trash_<N>_<name>` backup name.
    Rename,
}

#[derive(Debug, Clone, Parser)]
#[clap(name = "cepher")]
pub struct CliArgs {
    /// Print the version and exit.
    #[clap(long)]
    pub version: bool,
    /// Log level: trace, debug, info, warning or error.
    #[clap(long, default_value = "debug")]
    pub loglevel: String,
    /// Ceph cluster name.
    #[clap(long, default_value = "")]
    pub cluster: String,
    /// Ceph user.
    #[clap(long, default_value = "admin")]
    pub user: String,
    /// Default Ceph pool for RBD operations.
    #[clap(long, default_value = "volumes")]
    pub pool: String,
    /// Mount directory for volumes on the host.
    #[clap(long, default_value = "/mnt/cepher")]
    pub mount: String,
    /// Ceph cluster config file.
    #[clap(long, default_value = "/etc/ceph/ceph.conf")]
    pub config: String,
    /// Allow automatic creation of RBD images.
    #[clap(long)]
    pub create: bool,
    /// Allow automatic creation of missing pools.
    #[clap(long = "create-pools")]
    pub create_pools: bool,
    /// RBD image size to create, in MB.
    #[clap(long, default_value = "3072")]
    pub size: u32,
    /// Filesystem type for created RBD images (must have mkfs.<type>).
    #[clap(long, default_value = "xfs")]
    pub fs: String,
    /// Initial RBD image features for new images, comma separated.
    #[clap(long, default_value = "layering,striping,exclusive-lock,object-map")]
    pub features: String,
    /// Action taken on Remove: ignore, delete or rename.
    #[clap(long = "remove-action", default_value = "rename")]
    pub remove_action: RemoveAction,
    /// Number of placement groups for pools created by the driver.
    #[clap(long = "poolPgNum", default_value = "100")]
    pub pool_pg_num: u32,
    /// Map images through the kernel RBD module instead of rbd-nbd. Faster,
    /// but supports only the layering, striping and exclusive-lock features.
    #[clap(long = "kernel-module")]
    pub kernel_module: bool,
    /// etcd endpoints for distributed lock management, comma separated,
    /// e.g. 192.168.1.1:2379,192.168.1.2:2379.
    #[clap(long = "lock-etcd", env = "ETCD_URL")]
    pub lock_etcd: Option<String>,
    /// A host that stops refreshing its mount lease releases the image to
    /// other hosts after this many milliseconds.
    #[clap(long = "lock-timeout", default_value = "10000")]
    pub lock_timeout: u64,
}

/// Driver configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub ceph_cluster: String,
    pub ceph_user: String,
    pub default_pool: String,
    pub root_mount_dir: String,
    pub ceph_config_file: String,
    pub can_create_volumes: bool,
    pub can_create_pools: bool,
    pub default_image_size_mb: u32,
    pub default_image_fs_type: String,
    pub default_image_features: String,
    pub default_remove_action: RemoveAction,
    pub default_pool_pg_num: u32,
    pub use_kernel_module: bool,
    pub lock_endpoints: Vec<String>,
    pub lock_timeout: Duration,
}

impl From<&CliArgs> for Config {
    fn from(args: &CliArgs) -> Self {
        Self {
            ceph_cluster: args.cluster.clone(),
            ceph_user: args.user.clone(),
            default_pool: args.pool.clone(),
            root_mount_dir: args.mount.clone(),
            ceph_config_file: args.config.clone(),
            can_create_volumes: args.create,
            can_create_pools: args.create_pools,
            default_image_size_mb: args.size,
            default_image_fs_type: args.fs.clone(),
            default_image_features: args.features.clone(),
            default_remove_action: args.remove_action,
            default_pool_pg_num: args.pool_pg_num,
            use_kernel_module: args.kernel_module,
            lock_endpoints: args
                .lock_etcd
                .iter()
                .flat_map(|s| s.split(','))
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            lock_timeout: Duration::from_millis(args.lock_timeout),
        }
    }
}

impl Config {
    /// Where `pool/name` mounts on this host. The `:ro`/`:rw` suffix keeps
    /// the read-only and read-write mounts of one image distinct on disk.
    pub fn mountpoint(&self, pool: &str, name: &str, readonly: bool) -> String {
        let path = Path::new(&self.root_mount_dir).join(pool).join(name);
        let mode = if readonly { ":ro" } else { ":rw" };
        format!("{}{}", path.display(), mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::from(&CliArgs::parse_from(["cepher"]))
    }

    #[test]
    fn mountpoint_carries_the_mode_suffix() {
        let config = config();
        assert_eq!(
            config.mountpoint("volumes", "rw-1", false),
            "/mnt/cepher/volumes/rw-1:rw"
        );
        assert_eq!(
            config.mountpoint("volumes", "r-1", true),
            "/mnt/cepher/volumes/r-1:ro"
        );
    }

    #[test]
    fn defaults_match_the_daemon_flags() {
        let config = config();
        assert_eq!(config.default_pool, "volumes");
        assert_eq!(config.default_image_size_mb, 3072);
        assert_eq!(config.default_image_fs_type, "xfs");
        assert_eq!(config.default_remove_action, RemoveAction::Rename);
        assert_eq!(config.lock_timeout, Duration::from_millis(10_000));
        assert!(!config.can_create_volumes);
    }

    #[test]
    fn lock_endpoints_split_on_commas() {
        let args = CliArgs::parse_from(["cepher", "--lock-etcd", "10.0.0.1:2379,10.0.0.2:2379"]);
        let config = Config::from(&args);
        assert_eq!(
            config.lock_endpoints,
            vec!["10.0.0.1:2379".to_string(), "10.0.0.2:2379".to_string()]
        );
    }

    #[test]
    fn remove_action_parses_from_flag_values() {
        for (value, expected) in [
            ("ignore", RemoveAction::Ignore),
            ("delete", RemoveAction::Delete),
            ("rename", RemoveAction::Rename),
        ] {
            let args = CliArgs::parse_from(["cepher", "--remove-action", value]);
            assert_eq!(args.remove_action, expected);
        }
    }
}
