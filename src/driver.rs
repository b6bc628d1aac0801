//! The volume driver core: the seven plugin operations, their per-step
//! sequences and the reverse-order unwinds when a step fails.
//!
//! Mutating operations serialize on a process-wide mutex; cluster-wide
//! arbitration of the same image across hosts is the lock coordinator's
//! job. Ground truth is never cached: the mapped-device and mount tables
//! are re-read through the reconciler on every operation that needs them.

use crate::{
    api::{
        CapabilitiesResponse, CreateRequest, GetRequest, GetResponse, ListResponse, MountRequest,
        MountResponse, PathRequest, PathResponse, RemoveRequest, UnmountRequest, VolumeInfo,
    },
    config::{Config, RemoveAction},
    error::{
        CreateMountpointSnafu, Error, FilesystemCorruptSnafu, HostFsSnafu, ImageCreateDeniedSnafu,
        ImageNotFoundSnafu, InvalidSizeOptionSnafu, LockSnafu, MountNotFoundSnafu, ParseSnafu,
        PoolCreateDeniedSnafu, RbdSnafu, ReconcileSnafu, VolumeNotFoundSnafu,
    },
    hostfs,
    lock::LockCoordinator,
    name::{self, VolumeName},
    rbd::RbdClient,
    reconcile,
};
use snafu::ResultExt;
use std::{collections::HashMap, os::unix::fs::DirBuilderExt};
use tokio::sync::Mutex;

/// No real creation time is tracked for RBD images; the protocol wants one,
/// so every volume reports this fixed instant.
const FIXED_CREATED_AT: &str = "2018-01-01T00:00:00-00:00";

pub struct CepherDriver {
    config: Config,
    rbd: RbdClient,
    locks: LockCoordinator,
    serial: Mutex<()>,
}

impl CepherDriver {
    pub fn new(config: Config, locks: LockCoordinator) -> Self {
        let rbd = RbdClient::new(&config, locks.is_enabled());
        Self {
            config,
            rbd,
            locks,
            serial: Mutex::new(()),
        }
    }

    /// Volume names are unique across the cluster.
    pub fn capabilities(&self) -> CapabilitiesResponse {
        CapabilitiesResponse::global()
    }

    /// Ensure the requested image exists, creating pool, image and
    /// filesystem as policy allows. Idempotent when the image exists.
    pub async fn create(&self, request: &CreateRequest) -> Result<(), Error> {
        let _serial = self.serial.lock().await;
        tracing::info!("volume api create({:?})", request.name);

        // a `#ro` suffix selects the mount mode, not the image; ignore it here
        let parsed =
            VolumeName::parse(&request.name, &self.config.default_pool).context(ParseSnafu)?;

        let lease = self.locks.lock_create(&parsed).await.context(LockSnafu)?;
        let result = self.create_locked(&parsed, &request.opts).await;
        if let Err(error) = self.locks.unlock_create(lease).await {
            tracing::error!(
                "error unlocking volume {} after create: {error}",
                request.name
            );
        }
        result
    }

    async fn create_locked(
        &self,
        parsed: &VolumeName,
        opts: &HashMap<String, String>,
    ) -> Result<(), Error> {
        let option = |key: &str| opts.get(key).filter(|v| !v.is_empty());

        let pool = option("pool").unwrap_or(&parsed.pool).clone();
        let name = option("name").unwrap_or(&parsed.image).clone();
        let fstype = option("fstype")
            .unwrap_or(&self.config.default_image_fs_type)
            .clone();
        let features = option("features")
            .unwrap_or(&self.config.default_image_features)
            .clone();
        let size = match option("size") {
            Some(value) => value
                .parse::<u32>()
                .context(InvalidSizeOptionSnafu { value })?,
            None => self.config.default_image_size_mb,
        };

        if !self.rbd.pool_exists(&pool).await.context(RbdSnafu)? {
            if !self.config.can_create_pools {
                return PoolCreateDeniedSnafu { pool }.fail();
            }
            tracing::info!("creating pool '{pool}'");
            self.rbd
                .pool_create(&pool, self.config.default_pool_pg_num)
                .await
                .context(RbdSnafu)?;
        }

        if self.rbd.image_exists(&pool, &name).await {
            tracing::info!("image {pool}/{name} already exists in the cluster, reusing it");
            return Ok(());
        }
        if !self.config.can_create_volumes {
            return ImageCreateDeniedSnafu { pool, name }.fail();
        }
        self.create_image(&pool, &name, size, &fstype, &features)
            .await
    }

    /// Create and format a fresh image: check the mkfs tool first so
    /// nothing is provisioned that cannot be finished, then create, map,
    /// mkfs, unmap. A failed mkfs unmaps before surfacing; a failed unmap
    /// surfaces as is (the image stays created).
    async fn create_image(
        &self,
        pool: &str,
        name: &str,
        size_mb: u32,
        fstype: &str,
        features: &str,
    ) -> Result<(), Error> {
        tracing::info!(
            "creating image pool={pool} name={name} size={size_mb}MB fs={fstype} \
             features={features}"
        );
        hostfs::lookup_mkfs(fstype).context(HostFsSnafu)?;

        self.rbd
            .image_create(pool, name, size_mb, features)
            .await
            .context(RbdSnafu)?;

        let device = self
            .rbd
            .map_image(pool, name, false)
            .await
            .context(RbdSnafu)?;

        tracing::debug!("formatting filesystem {fstype} on device {device}");
        if let Err(error) = hostfs::make_filesystem(fstype, &device).await {
            if let Err(unmap) = self.rbd.unmap_device(&device).await {
                tracing::error!("error unmapping device {device} after failed mkfs: {unmap}");
            }
            return Err(error).context(HostFsSnafu);
        }

        self.rbd.unmap_device(&device).await.context(RbdSnafu)?;
        tracing::info!("image {pool}/{name} created and filesystem prepared");
        Ok(())
    }

    /// Remove dispatches on the configured action: delete the image,
    /// rename it to a backup name, or leave it alone.
    pub async fn remove(&self, request: &RemoveRequest) -> Result<(), Error> {
        let _serial = self.serial.lock().await;
        tracing::info!("volume api remove({:?})", request.name);

        let parsed =
            VolumeName::parse(&request.name, &self.config.default_pool).context(ParseSnafu)?;
        let (pool, image) = (parsed.pool.as_str(), parsed.image.as_str());

        if !self.rbd.image_exists(pool, image).await {
            return ImageNotFoundSnafu { pool, name: image }.fail();
        }

        match self.config.default_remove_action {
            RemoveAction::Delete => {
                tracing::info!("deleting image {pool}/{image} from the cluster");
                self.rbd.image_remove(pool, image).await.context(RbdSnafu)?;
            }
            RemoveAction::Rename => {
                let images = self.rbd.image_list(pool).await.context(RbdSnafu)?;
                let backup = name::generate_backup_name(image, &images).context(ParseSnafu)?;
                tracing::info!("renaming image {pool}/{image} to {pool}/{backup}");
                self.rbd
                    .image_rename(pool, image, &backup)
                    .await
                    .context(RbdSnafu)?;
            }
            RemoveAction::Ignore => {
                tracing::info!(
                    "volume removal requested, but image {pool}/{image} will not be deleted"
                );
            }
        }
        Ok(())
    }

    /// Admit the mount through the lock coordinator, then make the image
    /// available at its deterministic mountpath, reusing an existing mount
    /// of the same image and mode. Any failure after admission releases the
    /// lease again.
    pub async fn mount(&self, request: &MountRequest) -> Result<MountResponse, Error> {
        let _serial = self.serial.lock().await;
        tracing::info!("volume api mount({:?}, id={:?})", request.name, request.id);

        let parsed =
            VolumeName::parse(&request.name, &self.config.default_pool).context(ParseSnafu)?;

        self.locks
            .lock_mount(&parsed, &request.id)
            .await
            .context(LockSnafu)?;

        match self.mount_locked(&parsed).await {
            Ok(mountpoint) => Ok(MountResponse { mountpoint }),
            Err(error) => {
                if let Err(unlock) = self.locks.unlock_mount(&parsed, &request.id).await {
                    tracing::error!(
                        "error unlocking volume {} for caller ID {} after failed mount: {unlock}",
                        parsed.qualified(),
                        request.id
                    );
                }
                Err(error)
            }
        }
    }

    async fn mount_locked(&self, parsed: &VolumeName) -> Result<String, Error> {
        let volumes = reconcile::current_volumes(&self.rbd)
            .await
            .context(ReconcileSnafu)?;
        let mountpath = self
            .config
            .mountpoint(&parsed.pool, &parsed.image, parsed.readonly);

        if volumes.contains_key(&mountpath) {
            tracing::info!("mountpoint {mountpath} already exists, reusing it");
            return Ok(mountpath);
        }

        tracing::debug!(
            "mapping image {} to a local device, readonly={}",
            parsed.qualified(),
            parsed.readonly
        );
        let device = self
            .rbd
            .map_image(&parsed.pool, &parsed.image, parsed.readonly)
            .await
            .context(RbdSnafu)?;

        match self.prepare_and_mount(parsed, &device, &mountpath).await {
            Ok(()) => Ok(mountpath),
            Err(error) => {
                tracing::debug!("unmapping device {device} after failed mount");
                if let Err(unmap) = self.rbd.unmap_device(&device).await {
                    tracing::error!("error unmapping device {device} during cleanup: {unmap}");
                }
                Err(error)
            }
        }
    }

    async fn prepare_and_mount(
        &self,
        parsed: &VolumeName,
        device: &str,
        mountpath: &str,
    ) -> Result<(), Error> {
        let fstype = match hostfs::detect_fs_type(device).await {
            Ok(fstype) => fstype,
            Err(error) => {
                tracing::warn!(
                    "unable to detect filesystem type of image {}: {error}",
                    parsed.image
                );
                self.config.default_image_fs_type.clone()
            }
        };

        self.verify_filesystem(parsed, device, mountpath, &fstype)
            .await?;

        create_mountpoint(mountpath)?;

        tracing::debug!(
            "mounting image {} from device {device} onto {mountpath}",
            parsed.qualified()
        );
        hostfs::mount_device(&fstype, device, mountpath)
            .await
            .context(HostFsSnafu)?;
        tracing::info!("mount to {mountpath} successful");
        Ok(())
    }

    /// Filesystem verification policy: only XFS has a cheap dry-run check.
    /// A check timeout aborts outright. Suspected corruption aborts a
    /// read-only mount; for a writer, one mount/unmount cycle replays the
    /// XFS log and the check runs once more.
    async fn verify_filesystem(
        &self,
        parsed: &VolumeName,
        device: &str,
        mountpath: &str,
        fstype: &str,
    ) -> Result<(), Error> {
        if fstype != "xfs" {
            return Ok(());
        }
        tracing::debug!("checking filesystem on device {device}");
        match hostfs::xfs_check(device).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_timeout() => {
                tracing::debug!("timeout checking filesystem on {device}");
                Err(error).context(HostFsSnafu)
            }
            Err(error) => {
                if parsed.readonly {
                    tracing::warn!(
                        "filesystem at {mountpath} seems to have errors but cannot be \
                         repaired on a read-only mount"
                    );
                    return Err(error).context(FilesystemCorruptSnafu {
                        pool: &parsed.pool,
                        name: &parsed.image,
                    });
                }
                self.attempt_limited_xfs_repair(parsed, device, mountpath, fstype)
                    .await
            }
        }
    }

    /// Mount and unmount once, which replays the XFS log, then re-check.
    async fn attempt_limited_xfs_repair(
        &self,
        parsed: &VolumeName,
        device: &str,
        mountpath: &str,
        fstype: &str,
    ) -> Result<(), Error> {
        tracing::warn!("attempting limited XFS repair (mount/unmount) of {device} {mountpath}");
        create_mountpoint(mountpath)?;
        hostfs::mount_device(fstype, device, mountpath)
            .await
            .context(HostFsSnafu)?;
        hostfs::unmount_path(mountpath).await.context(HostFsSnafu)?;
        hostfs::xfs_check(device).await.context(FilesystemCorruptSnafu {
            pool: &parsed.pool,
            name: &parsed.image,
        })
    }

    /// Release this caller's mount lease; the unmount itself only happens
    /// once the last local lease is gone.
    pub async fn unmount(&self, request: &UnmountRequest) -> Result<(), Error> {
        let _serial = self.serial.lock().await;
        tracing::info!("volume api unmount({:?}, id={:?})", request.name, request.id);

        let parsed =
            VolumeName::parse(&request.name, &self.config.default_pool).context(ParseSnafu)?;

        self.locks
            .unlock_mount(&parsed, &request.id)
            .await
            .context(LockSnafu)?;

        let remaining = self.locks.mount_lease_count(&parsed);
        if remaining != 0 {
            tracing::info!("skipping unmount, there are still {remaining} locks for this mount");
            return Ok(());
        }

        let mountpath = self
            .config
            .mountpoint(&parsed.pool, &parsed.image, parsed.readonly);
        let volumes = reconcile::current_volumes(&self.rbd)
            .await
            .context(ReconcileSnafu)?;
        let volume = volumes.get(&mountpath).ok_or_else(|| {
            MountNotFoundSnafu {
                pool: &parsed.pool,
                name: &parsed.image,
                mountpath: &mountpath,
            }
            .build()
        })?;

        tracing::debug!("unmounting {mountpath} from device {}", volume.device);
        hostfs::unmount_path(&mountpath).await.context(HostFsSnafu)?;

        tracing::info!(
            "unmapping device {} for image {}",
            volume.device,
            parsed.qualified()
        );
        self.rbd
            .unmap_device(&volume.device)
            .await
            .context(RbdSnafu)?;
        Ok(())
    }

    /// The mountpath of the volume, if it is currently mounted.
    pub async fn path(&self, request: &PathRequest) -> Result<PathResponse, Error> {
        tracing::info!("volume api path({:?})", request.name);

        let parsed =
            VolumeName::parse(&request.name, &self.config.default_pool).context(ParseSnafu)?;
        let mountpath = self
            .config
            .mountpoint(&parsed.pool, &parsed.image, parsed.readonly);

        let volumes = reconcile::current_volumes(&self.rbd)
            .await
            .context(ReconcileSnafu)?;
        if !volumes.contains_key(&mountpath) {
            return MountNotFoundSnafu {
                pool: parsed.pool,
                name: parsed.image,
                mountpath,
            }
            .fail();
        }
        Ok(PathResponse {
            mountpoint: mountpath,
        })
    }

    /// Find the volume in the listing; the response name carries the
    /// caller's `#ro` suffix back.
    pub async fn get(&self, request: &GetRequest) -> Result<GetResponse, Error> {
        let _serial = self.serial.lock().await;
        tracing::info!("volume api get({:?})", request.name);

        let parsed =
            VolumeName::parse(&request.name, &self.config.default_pool).context(ParseSnafu)?;

        let listing = self.list_internal().await?;
        let found = listing.volumes.into_iter().find(|volume| {
            match VolumeName::parse(&volume.name, &self.config.default_pool) {
                Ok(candidate) => candidate.pool == parsed.pool && candidate.image == parsed.image,
                Err(error) => {
                    tracing::warn!("skipping unparseable listed volume {}: {error}", volume.name);
                    false
                }
            }
        });

        match found {
            Some(volume) => {
                let name = if parsed.readonly {
                    format!("{}#ro", volume.name)
                } else {
                    volume.name
                };
                Ok(GetResponse {
                    volume: VolumeInfo {
                        name,
                        mountpoint: volume.mountpoint,
                        created_at: Some(FIXED_CREATED_AT.to_string()),
                    },
                })
            }
            None => VolumeNotFoundSnafu {
                name: &request.name,
            }
            .fail(),
        }
    }

    /// All images in all pools, with a mountpoint on the ones mounted here.
    pub async fn list(&self) -> Result<ListResponse, Error> {
        tracing::info!("volume api list");
        self.list_internal().await
    }

    async fn list_internal(&self) -> Result<ListResponse, Error> {
        let images = self.all_images().await?;
        let mounted = reconcile::current_volumes(&self.rbd)
            .await
            .context(ReconcileSnafu)?;

        let mut volumes = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for (mountpath, volume) in &mounted {
            let name = format!("{}/{}", volume.pool, volume.name);
            seen.insert(name.clone());
            volumes.push(VolumeInfo {
                name,
                mountpoint: Some(mountpath.clone()),
                created_at: None,
            });
        }
        for image in images {
            if !seen.contains(&image) {
                volumes.push(VolumeInfo {
                    name: image,
                    mountpoint: None,
                    created_at: None,
                });
            }
        }
        Ok(ListResponse { volumes })
    }

    async fn all_images(&self) -> Result<Vec<String>, Error> {
        let pools = self.rbd.pool_list().await.context(RbdSnafu)?;
        let mut all = Vec::new();
        for pool in pools {
            for image in self.rbd.image_list(&pool).await.context(RbdSnafu)? {
                all.push(format!("{pool}/{image}"));
            }
        }
        Ok(all)
    }
}

/// Mountpoints are created recursively with mode 0775.
fn create_mountpoint(path: &str) -> Result<(), Error> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o775)
        .create(path)
        .context(CreateMountpointSnafu { mountpath: path })
}
