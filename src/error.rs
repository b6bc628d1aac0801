//! Driver level errors. Adapter errors nest here with their own variants
//! kept distinguishable, because callers and tests match on some of them:
//! lock timeouts must read "deadline exceeded", a busy unmap must stay
//! separate from other unmap failures, and policy refusals must not look
//! like cluster failures.

use crate::{
    hostfs::HostFsError, lock::LockError, name::NameError, rbd::RbdError,
    reconcile::ReconcileError,
};
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("error parsing volume name: {source}"))]
    Parse { source: NameError },
    #[snafu(display("{source}"))]
    Rbd { source: RbdError },
    #[snafu(display("{source}"))]
    HostFs { source: HostFsError },
    #[snafu(display("{source}"))]
    Lock { source: LockError },
    #[snafu(display("{source}"))]
    Reconcile { source: ReconcileError },
    #[snafu(display(
        "the pool '{pool}' does not exist and the driver is not allowed to auto create it"
    ))]
    PoolCreateDenied { pool: String },
    #[snafu(display(
        "RBD image {pool}/{name} not found and the driver is not enabled for automatic \
         image creation"
    ))]
    ImageCreateDenied { pool: String, name: String },
    #[snafu(display("RBD image {pool}/{name} not found"))]
    ImageNotFound { pool: String, name: String },
    #[snafu(display("volume {pool}/{name} mount not found at {mountpath}"))]
    MountNotFound {
        pool: String,
        name: String,
        mountpath: String,
    },
    #[snafu(display("volume not found for {name}"))]
    VolumeNotFound { name: String },
    #[snafu(display(
        "filesystem on image {pool}/{name} has errors. Mount it in a separate machine \
         and perform manual repairs: {source}"
    ))]
    FilesystemCorrupt {
        pool: String,
        name: String,
        source: HostFsError,
    },
    #[snafu(display("unable to create mount directory {mountpath}: {source}"))]
    CreateMountpoint {
        mountpath: String,
        source: std::io::Error,
    },
    #[snafu(display("unable to parse size option '{value}': {source}"))]
    InvalidSizeOption {
        value: String,
        source: std::num::ParseIntError,
    },
}
