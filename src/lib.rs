//! Cepher: a volume plugin daemon bridging a container runtime and a Ceph
//! RBD cluster.
//!
//! For every volume request the driver ensures the named image exists in
//! the named pool, maps it to a local block device, verifies and mounts its
//! filesystem at a deterministic host path, and reverses those steps on
//! teardown. Concurrent mounts of one image across hosts are arbitrated by
//! etcd-backed read/write leases: one writer, or any number of readers.
//!
//! The daemon holds no state of its own; the kernel's device table and the
//! host mount table are re-read on every operation.

pub mod api;
pub mod config;
pub mod driver;
pub mod error;
pub mod hostfs;
pub mod lock;
pub mod name;
pub mod rbd;
pub mod reconcile;
pub mod server;
pub mod shell;

/// Daemon version, reported by `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
