//! Tests against a real service manager.
//!
//! Run with `cargo test --features integration-tests` as root on a host
//! with a running systemd.

#![cfg(feature = "integration-tests")]

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use systemd_spawner::{
    IdentityMode, LaunchSpec, ServerStatus, ServiceManager, Spawner,
    Systemctl, TransientOptions, UnitIdentity, User,
};

fn unique_unit_name() -> String {
    format!("spawner-test-{}", uuid::Uuid::new_v4().simple())
}

fn sleep_spec(working_dir: &str) -> LaunchSpec {
    LaunchSpec {
        cmd: vec!["/bin/sleep".to_owned()],
        args: vec!["2000".to_owned()],
        working_dir: PathBuf::from(working_dir),
        environment: BTreeMap::new(),
        identity: UnitIdentity::Fixed { uid: 0, gid: 0 },
        memory_max: None,
        cpu_limit: None,
        private_tmp: false,
        private_devices: false,
        no_new_privileges: false,
        readonly_paths: None,
        readwrite_paths: None,
        slice: None,
        extra_properties: HashMap::new(),
    }
}

#[tokio::test]
async fn reports_a_version() {
    let version = Systemctl.version().await;
    assert!(version.unwrap_or(0) > 0);
}

#[tokio::test]
async fn absent_units_are_neither_active_nor_failed() {
    let unit = unique_unit_name();
    assert!(!Systemctl.is_active(&unit).await.unwrap());
    assert!(!Systemctl.is_failed(&unit).await.unwrap());
    // Stopping an absent unit is a non-zero status, not an error.
    assert!(!Systemctl.stop(&unit).await.unwrap().success());
}

#[tokio::test]
async fn starts_polls_and_stops_a_server() {
    let user = User {
        name: unique_unit_name(),
        id: 1,
    };
    let options = TransientOptions {
        unit_name_template: "{USERNAME}".to_owned(),
        identity: IdentityMode::System {
            username_template: "root".to_owned(),
        },
        ..TransientOptions::default()
    };
    let mut spawner = Spawner::transient(user, None, options)
        .unwrap()
        .cmd(["/bin/sleep"])
        .arg("2000")
        .environment([(
            "SPAWNER_TEST_MARKER".to_owned(),
            "integration test".to_owned(),
        )])
        .start_timeout(20)
        .poll_interval(Duration::from_millis(500));

    let (host, port) = spawner.start().await.unwrap();
    assert_eq!(host, "127.0.0.1");
    assert_ne!(port, 0);
    assert_eq!(spawner.poll().await, ServerStatus::Alive);

    let state = spawner.state();
    let env_file = state.credential_path.clone().unwrap();
    assert!(env_file.is_file());

    spawner.stop(false).await.unwrap();
    assert_eq!(spawner.poll().await, ServerStatus::NotAlive(1));
    assert!(!env_file.exists());
}

#[tokio::test]
async fn failed_units_can_be_reset() {
    let unit = unique_unit_name();
    // A nonexistent working directory makes the unit fail at exec time.
    let spec = sleep_spec("/spawner-test-does-not-exist");
    let (properties, _) = systemd_spawner::properties::build(
        &spec,
        std::path::Path::new("/run"),
        &unit,
    )
    .unwrap();
    Systemctl
        .start_transient(&unit, &spec, &properties)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(Systemctl.is_failed(&unit).await.unwrap());

    Systemctl.reset_failed(&unit).await.unwrap();
    assert!(!Systemctl.is_failed(&unit).await.unwrap());
}
