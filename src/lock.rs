//! Distributed read/write leases over etcd.
//!
//! A session is an etcd lease kept alive in the background; every lock key
//! this daemon writes is attached to it, so a dead host releases all of its
//! locks after the lease TTL. A lock on `<prefix>` is an ephemeral key
//! `<prefix>/<role>/<unique>`: writers wait for every older key under the
//! prefix, readers wait only for older writer keys. Ordering is by etcd
//! create revision, so acquisition is first come, first served.
//!
//! With no endpoints configured the coordinator is inert: every operation
//! is a no-op and mount admission falls back to host-local serialization.

use crate::name::VolumeName;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use snafu::{ResultExt, Snafu};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};
use strum_macros::{AsRefStr, Display};

/// Lock keyspace for volume creation.
const CREATE_PREFIX: &str = "/cepher-create";
/// Lock keyspace for mount admission.
const MOUNT_PREFIX: &str = "/cepher-mount";

/// Errors which can be encountered whilst coordinating distributed locks.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LockError {
    #[snafu(display("failed to connect to etcd at {endpoints:?}: {source}"))]
    Connect {
        endpoints: Vec<String>,
        source: etcd_client::Error,
    },
    #[snafu(display("failed to establish an etcd lock session: {source}"))]
    Session { source: etcd_client::Error },
    #[snafu(display("failed to write lock key {key}: {source}"))]
    Put {
        key: String,
        source: etcd_client::Error,
    },
    #[snafu(display("failed to read lock keys under {key}: {source}"))]
    Get {
        key: String,
        source: etcd_client::Error,
    },
    #[snafu(display("failed to watch lock keys under {key}: {source}"))]
    Watch {
        key: String,
        source: etcd_client::Error,
    },
    #[snafu(display("failed to release lock key {key}: {source}"))]
    Release {
        key: String,
        source: etcd_client::Error,
    },
    #[snafu(display("lock key {key} disappeared while acquiring it"))]
    LostKey { key: String },
    #[snafu(display("deadline exceeded waiting for {role} lock on {key}"))]
    DeadlineExceeded { role: LeaseRole, key: String },
    #[snafu(display("caller ID cannot be an empty string for volume {volume}"))]
    EmptyCallerId { volume: String },
    #[snafu(display("cannot find locks for volume {volume} and caller ID {caller}"))]
    NotLocked { volume: String, caller: String },
}

/// Which side of the read/write lock a lease holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LeaseRole {
    Read,
    Write,
}

/// A held lease: the ephemeral etcd key this process owns.
#[derive(Debug)]
pub struct RwLease {
    key: String,
    role: LeaseRole,
}

impl RwLease {
    pub fn role(&self) -> LeaseRole {
        self.role
    }
}

/// In-memory record of the mount leases held by this daemon, keyed
/// `"<pool>/<name>" → caller id`. Empty inner maps are dropped so that the
/// key count mirrors the number of locked volumes.
#[derive(Debug, Default)]
struct MountLockTable {
    locks: HashMap<String, HashMap<String, RwLease>>,
}

impl MountLockTable {
    fn insert(&mut self, volume: &str, caller: &str, lease: RwLease) {
        self.locks
            .entry(volume.to_string())
            .or_default()
            .insert(caller.to_string(), lease);
    }

    fn remove(&mut self, volume: &str, caller: &str) -> Result<RwLease, LockError> {
        let holders = self.locks.get_mut(volume).ok_or_else(|| LockError::NotLocked {
            volume: volume.to_string(),
            caller: caller.to_string(),
        })?;
        let lease = holders.remove(caller).ok_or_else(|| LockError::NotLocked {
            volume: volume.to_string(),
            caller: caller.to_string(),
        })?;
        if holders.is_empty() {
            self.locks.remove(volume);
        }
        Ok(lease)
    }

    fn count(&self, volume: &str) -> usize {
        self.locks.get(volume).map(HashMap::len).unwrap_or(0)
    }
}

struct Session {
    client: Client,
    lease_id: i64,
    timeout: Duration,
    mount_locks: Mutex<MountLockTable>,
    sequence: AtomicU64,
}

/// Coordinates create and mount leases across the fleet.
pub struct LockCoordinator {
    session: Option<Session>,
}

impl LockCoordinator {
    /// A coordinator with no backing store; every operation is a no-op.
    pub fn disabled() -> Self {
        Self { session: None }
    }

    /// Connect to etcd and start the lease session. The session TTL is the
    /// lock timeout in whole seconds, and a background task refreshes the
    /// lease at a third of that.
    pub async fn connect(endpoints: &[String], timeout: Duration) -> Result<Self, LockError> {
        tracing::debug!("setting up etcd lock client to {endpoints:?}");
        let mut client = Client::connect(endpoints, None)
            .await
            .context(ConnectSnafu { endpoints })?;

        let ttl = timeout.as_secs().max(1) as i64;
        let lease = client
            .lease_grant(ttl, None)
            .await
            .context(SessionSnafu)?;
        let lease_id = lease.id();

        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease_id)
            .await
            .context(SessionSnafu)?;
        tokio::spawn(async move {
            let period = Duration::from_secs((ttl as u64 / 3).max(1));
            let mut tick = tokio::time::interval(period);
            loop {
                tick.tick().await;
                if let Err(error) = keeper.keep_alive().await {
                    tracing::warn!("etcd lease keep-alive failed, locks may expire: {error}");
                    break;
                }
                match stream.message().await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        tracing::warn!("etcd lease keep-alive stream closed");
                        break;
                    }
                    Err(error) => {
                        tracing::warn!("etcd lease keep-alive stream failed: {error}");
                        break;
                    }
                }
            }
        });
        tracing::debug!("etcd lock session established, lease={lease_id:x} ttl={ttl}s");

        Ok(Self {
            session: Some(Session {
                client,
                lease_id,
                timeout,
                mount_locks: Mutex::new(MountLockTable::default()),
                sequence: AtomicU64::new(0),
            }),
        })
    }

    /// Whether a lock service backs this coordinator.
    pub fn is_enabled(&self) -> bool {
        self.session.is_some()
    }

    /// Exclusive lease gating image creation. `None` when disabled.
    pub async fn lock_create(&self, volume: &VolumeName) -> Result<Option<RwLease>, LockError> {
        let Some(session) = &self.session else {
            return Ok(None);
        };
        let prefix = format!("{CREATE_PREFIX}/{}/{}", volume.pool, volume.image);
        let lease = session.acquire(&prefix, LeaseRole::Write).await?;
        tracing::info!("got {} lock for create volume {}", lease.role(), volume.image);
        Ok(Some(lease))
    }

    /// Release a create lease.
    pub async fn unlock_create(&self, lease: Option<RwLease>) -> Result<(), LockError> {
        let (Some(session), Some(lease)) = (&self.session, lease) else {
            return Ok(());
        };
        session.release(lease).await?;
        tracing::info!("released lock for create volume");
        Ok(())
    }

    /// Acquire the mount lease for `(volume, caller)`: shared for read-only
    /// mounts, exclusive otherwise. The caller id scopes the lease so that
    /// the matching unmount releases exactly this grant.
    pub async fn lock_mount(
        &self,
        volume: &VolumeName,
        caller: &str,
    ) -> Result<(), LockError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let qualified = volume.qualified();
        if caller.is_empty() {
            return EmptyCallerIdSnafu { volume: qualified }.fail();
        }
        let role = if volume.readonly {
            LeaseRole::Read
        } else {
            LeaseRole::Write
        };
        let prefix = format!("{MOUNT_PREFIX}/{qualified}");
        let lease = session.acquire(&prefix, role).await?;
        tracing::info!("got {role} lock for mount {}", volume.image);
        session
            .mount_locks
            .lock()
            .expect("mount lock table poisoned")
            .insert(&qualified, caller, lease);
        Ok(())
    }

    /// Release the mount lease held by `(volume, caller)`. Errors when no
    /// such lease is held.
    pub async fn unlock_mount(&self, volume: &VolumeName, caller: &str) -> Result<(), LockError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let qualified = volume.qualified();
        if caller.is_empty() {
            return EmptyCallerIdSnafu { volume: qualified }.fail();
        }
        let lease = session
            .mount_locks
            .lock()
            .expect("mount lock table poisoned")
            .remove(&qualified, caller)?;
        session.release(lease).await?;
        tracing::debug!("unlocked volume {qualified} for caller ID {caller}");
        Ok(())
    }

    /// Number of mount leases this daemon holds for the volume.
    pub fn mount_lease_count(&self, volume: &VolumeName) -> usize {
        match &self.session {
            Some(session) => session
                .mount_locks
                .lock()
                .expect("mount lock table poisoned")
                .count(&volume.qualified()),
            None => 0,
        }
    }
}

impl Session {
    /// Acquire a read or write lease under `prefix`, bounded by the
    /// configured timeout. On expiry the half-written lock key is removed
    /// and the error reads "deadline exceeded", which callers and tests
    /// match on.
    async fn acquire(&self, prefix: &str, role: LeaseRole) -> Result<RwLease, LockError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let own_key = format!("{prefix}/{role}/{:016x}-{sequence:08x}", self.lease_id);

        let mut client = self.client.clone();
        client
            .put(
                own_key.clone(),
                Vec::new(),
                Some(PutOptions::new().with_lease(self.lease_id)),
            )
            .await
            .context(PutSnafu { key: &own_key })?;

        let own = client
            .get(own_key.clone(), None)
            .await
            .context(GetSnafu { key: &own_key })?;
        let my_revision = own
            .kvs()
            .first()
            .ok_or_else(|| LockError::LostKey {
                key: own_key.clone(),
            })?
            .create_revision();

        let wait = self.wait_for_clearance(prefix, role, my_revision);
        match tokio::time::timeout(self.timeout, wait).await {
            Ok(Ok(())) => Ok(RwLease { key: own_key, role }),
            Ok(Err(error)) => {
                self.discard(&own_key).await;
                Err(error)
            }
            Err(_) => {
                self.discard(&own_key).await;
                DeadlineExceededSnafu { role, key: prefix }.fail()
            }
        }
    }

    /// Wait until no conflicting key predates ours. Writers conflict with
    /// every key under the prefix, readers only with writer keys.
    async fn wait_for_clearance(
        &self,
        prefix: &str,
        role: LeaseRole,
        my_revision: i64,
    ) -> Result<(), LockError> {
        let conflict_range = match role {
            LeaseRole::Write => format!("{prefix}/"),
            LeaseRole::Read => format!("{prefix}/{}/", LeaseRole::Write),
        };
        let mut client = self.client.clone();
        loop {
            let response = client
                .get(
                    conflict_range.clone(),
                    Some(GetOptions::new().with_prefix()),
                )
                .await
                .context(GetSnafu {
                    key: &conflict_range,
                })?;
            let blocked = response
                .kvs()
                .iter()
                .any(|kv| kv.create_revision() < my_revision);
            if !blocked {
                return Ok(());
            }

            // Resume watching from just past the snapshot we examined, so a
            // holder releasing in between cannot be missed.
            let revision = response.header().map(|h| h.revision()).unwrap_or(0);
            let (mut watcher, mut stream) = client
                .watch(
                    conflict_range.clone(),
                    Some(
                        WatchOptions::new()
                            .with_prefix()
                            .with_start_revision(revision + 1),
                    ),
                )
                .await
                .context(WatchSnafu {
                    key: &conflict_range,
                })?;
            loop {
                match stream.message().await.context(WatchSnafu {
                    key: &conflict_range,
                })? {
                    Some(response) => {
                        if response
                            .events()
                            .iter()
                            .any(|event| event.event_type() == EventType::Delete)
                        {
                            break;
                        }
                    }
                    None => break,
                }
            }
            let _ = watcher.cancel().await;
        }
    }

    async fn release(&self, lease: RwLease) -> Result<(), LockError> {
        let mut client = self.client.clone();
        client
            .delete(lease.key.clone(), None)
            .await
            .context(ReleaseSnafu { key: &lease.key })?;
        Ok(())
    }

    /// Best-effort removal of a lock key after a failed acquisition; the
    /// lease TTL reclaims it anyway if this fails.
    async fn discard(&self, key: &str) {
        let mut client = self.client.clone();
        if let Err(error) = client.delete(key, None).await {
            tracing::warn!("failed to discard lock key {key}: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(name: &str, readonly: bool) -> VolumeName {
        VolumeName {
            pool: "volumes".to_string(),
            image: name.to_string(),
            readonly,
        }
    }

    #[tokio::test]
    async fn disabled_coordinator_is_inert() {
        let locks = LockCoordinator::disabled();
        assert!(!locks.is_enabled());
        assert!(locks.lock_create(&volume("a", false)).await.unwrap().is_none());
        locks.unlock_create(None).await.unwrap();
        locks.lock_mount(&volume("a", false), "c1").await.unwrap();
        locks.unlock_mount(&volume("a", false), "c1").await.unwrap();
        assert_eq!(locks.mount_lease_count(&volume("a", false)), 0);
    }

    #[test]
    fn table_counts_and_drops_empty_entries() {
        let mut table = MountLockTable::default();
        let lease = |role| RwLease {
            key: "/cepher-mount/volumes/a/x".to_string(),
            role,
        };
        table.insert("volumes/a", "c1", lease(LeaseRole::Read));
        table.insert("volumes/a", "c2", lease(LeaseRole::Read));
        table.insert("volumes/b", "c1", lease(LeaseRole::Write));
        assert_eq!(table.count("volumes/a"), 2);
        assert_eq!(table.count("volumes/b"), 1);

        table.remove("volumes/a", "c1").unwrap();
        assert_eq!(table.count("volumes/a"), 1);
        table.remove("volumes/a", "c2").unwrap();
        assert_eq!(table.count("volumes/a"), 0);
        assert!(!table.locks.contains_key("volumes/a"));
    }

    #[test]
    fn removing_an_unknown_lease_names_volume_and_caller() {
        let mut table = MountLockTable::default();
        let error = table.remove("volumes/a", "c9").unwrap_err();
        assert_eq!(
            error.to_string(),
            "cannot find locks for volume volumes/a and caller ID c9"
        );
    }

    #[test]
    fn deadline_error_matches_the_contract_substring() {
        let error = LockError::DeadlineExceeded {
            role: LeaseRole::Write,
            key: "/cepher-mount/volumes/a".to_string(),
        };
        assert!(error.to_string().contains("deadline exceeded"));
    }
}
