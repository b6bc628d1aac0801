//! Full volume lifecycle tests against a live Ceph cluster and etcd.
//!
//! These need `rbd`, `rbd-nbd`, `ceph` and the mkfs tools on PATH, a
//! reachable cluster behind /etc/ceph/ceph.conf and, for the locking
//! scenarios, an etcd endpoint in ETCD_URL. They are ignored by default;
//! run them with `cargo test -- --ignored` on a prepared host.

use cepher::{
    api::{CreateRequest, MountRequest, RemoveRequest, UnmountRequest},
    config::{CliArgs, Config},
    driver::CepherDriver,
    lock::LockCoordinator,
    rbd::RbdClient,
};
use clap::Parser;
use std::collections::HashMap;
use uuid::Uuid;

fn test_config(extra: &[&str]) -> Config {
    let mut argv = vec![
        "cepher",
        "--create",
        "--create-pools",
        "--size",
        "100",
        "--remove-action",
        "delete",
    ];
    argv.extend_from_slice(extra);
    Config::from(&CliArgs::parse_from(argv))
}

async fn test_driver(extra: &[&str]) -> CepherDriver {
    let config = test_config(extra);
    let locks = match std::env::var("ETCD_URL") {
        Ok(url) if !url.is_empty() => {
            LockCoordinator::connect(&[url], config.lock_timeout)
                .await
                .expect("etcd lock session")
        }
        _ => LockCoordinator::disabled(),
    };
    CepherDriver::new(config, locks)
}

fn create_request(name: &str) -> CreateRequest {
    CreateRequest {
        name: name.to_string(),
        opts: HashMap::new(),
    }
}

fn mount_request(name: &str, id: &str) -> MountRequest {
    MountRequest {
        name: name.to_string(),
        id: id.to_string(),
    }
}

fn unmount_request(name: &str, id: &str) -> UnmountRequest {
    UnmountRequest {
        name: name.to_string(),
        id: id.to_string(),
    }
}

fn remove_request(name: &str) -> RemoveRequest {
    RemoveRequest {
        name: name.to_string(),
    }
}

async fn listed_names(driver: &CepherDriver) -> Vec<String> {
    driver
        .list()
        .await
        .expect("volume listing")
        .volumes
        .into_iter()
        .map(|volume| volume.name)
        .collect()
}

#[tokio::test]
#[ignore = "requires a ceph cluster and etcd"]
async fn writer_cycle_with_contention() {
    let driver = test_driver(&[]).await;
    let volume = "volumes/rw-1";
    let caller = Uuid::new_v4().to_string();

    driver.create(&create_request(volume)).await.expect("create");

    let response = driver
        .mount(&mount_request(volume, &caller))
        .await
        .expect("first mount");
    assert_eq!(response.mountpoint, "/mnt/cepher/volumes/rw-1:rw");

    // a second writer must time out on the lock, same caller id or not
    let error = driver
        .mount(&mount_request(volume, &caller))
        .await
        .expect_err("second mount with the same caller id");
    assert!(error.to_string().contains("deadline exceeded"), "{error}");

    let error = driver
        .mount(&mount_request(volume, &Uuid::new_v4().to_string()))
        .await
        .expect_err("second mount with a different caller id");
    assert!(error.to_string().contains("deadline exceeded"), "{error}");

    // unmount by a caller that never mounted must not alter anything
    let stranger = Uuid::new_v4().to_string();
    let error = driver
        .unmount(&unmount_request(volume, &stranger))
        .await
        .expect_err("unmount by a stranger");
    assert_eq!(
        error.to_string(),
        format!("cannot find locks for volume {volume} and caller ID {stranger}")
    );

    driver
        .unmount(&unmount_request(volume, &caller))
        .await
        .expect("unmount");
    driver.remove(&remove_request(volume)).await.expect("remove");

    assert!(!listed_names(&driver).await.contains(&volume.to_string()));
}

#[tokio::test]
#[ignore = "requires a ceph cluster and etcd"]
async fn readers_share_one_mountpoint() {
    let driver = test_driver(&[]).await;
    let volume = "volumes/r-1#ro";
    let caller1 = Uuid::new_v4().to_string();
    let caller2 = Uuid::new_v4().to_string();

    driver.create(&create_request(volume)).await.expect("create");

    let first = driver
        .mount(&mount_request(volume, &caller1))
        .await
        .expect("first reader mount");
    assert_eq!(first.mountpoint, "/mnt/cepher/volumes/r-1:ro");

    let second = driver
        .mount(&mount_request(volume, &caller2))
        .await
        .expect("second reader mount");
    assert_eq!(second.mountpoint, first.mountpoint);

    // a writer must not squeeze between the readers
    let error = driver
        .mount(&mount_request("volumes/r-1", &Uuid::new_v4().to_string()))
        .await
        .expect_err("writer mount while readers hold the lease");
    assert!(error.to_string().contains("deadline exceeded"), "{error}");

    driver
        .unmount(&unmount_request(volume, &caller1))
        .await
        .expect("first unmount (leases remain)");
    driver
        .unmount(&unmount_request(volume, &caller2))
        .await
        .expect("last unmount");
    driver
        .remove(&remove_request("volumes/r-1"))
        .await
        .expect("remove");
}

#[tokio::test]
#[ignore = "requires a ceph cluster"]
async fn rename_removal_picks_the_next_backup_name() {
    let renamer = test_driver(&["--remove-action", "rename"]).await;
    let deleter = test_driver(&[]).await;

    // seed the image and an existing trash_0 backup
    deleter
        .create(&create_request("volumes/image-A"))
        .await
        .expect("create image");
    deleter
        .create(&create_request("volumes/trash_0_image-A"))
        .await
        .expect("create existing backup");

    renamer
        .remove(&remove_request("volumes/image-A"))
        .await
        .expect("rename removal");

    let names = listed_names(&renamer).await;
    assert!(!names.contains(&"volumes/image-A".to_string()));
    assert!(names.contains(&"volumes/trash_1_image-A".to_string()));

    for leftover in ["volumes/trash_0_image-A", "volumes/trash_1_image-A"] {
        deleter
            .remove(&remove_request(leftover))
            .await
            .expect("cleanup");
    }
}

#[tokio::test]
#[ignore = "requires a ceph cluster"]
async fn stray_mapping_is_healed_on_list() {
    let driver = test_driver(&[]).await;
    let config = test_config(&[]);
    let rbd = RbdClient::new(&config, false);

    driver
        .create(&create_request("volumes/stray-x"))
        .await
        .expect("create");

    // simulate a crash-interrupted mount: mapped but never mounted
    let device = rbd
        .map_image("volumes", "stray-x", false)
        .await
        .expect("manual map");
    assert!(!device.is_empty());

    driver.list().await.expect("list heals strays");

    let mapped = rbd.list_mapped_devices().await.expect("device list");
    assert!(
        !mapped.iter().any(|m| m.name == "stray-x"),
        "stray mapping should have been unmapped, got {mapped:?}"
    );

    driver
        .remove(&remove_request("volumes/stray-x"))
        .await
        .expect("cleanup");
}

#[tokio::test]
#[ignore = "requires a ceph cluster"]
async fn pool_autocreation_follows_policy() {
    let volume = "nonexistent-pool/test-1";

    let denied = CepherDriver::new(
        Config::from(&CliArgs::parse_from([
            "cepher",
            "--create",
            "--size",
            "100",
            "--remove-action",
            "delete",
        ])),
        LockCoordinator::disabled(),
    );
    let error = denied
        .create(&create_request(volume))
        .await
        .expect_err("create into a missing pool without --create-pools");
    assert!(error.to_string().contains("not allowed to auto create"), "{error}");

    let allowed = test_driver(&[]).await;
    allowed
        .create(&create_request(volume))
        .await
        .expect("create with pool autocreation");
    assert!(listed_names(&allowed).await.contains(&volume.to_string()));

    allowed
        .remove(&remove_request(volume))
        .await
        .expect("cleanup");
}
