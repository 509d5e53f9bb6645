//! End-to-end control channel tests over the real Unix socket

use std::time::Duration;

use monet::{
    config::{DaemonConfig, PoolEntry, SegmentGroupConfig},
    Daemon, DaemonClient, MonetError, QueuePolicy, ServiceDescriptor,
};

fn test_config(dir: &std::path::Path) -> DaemonConfig {
    DaemonConfig {
        socket_path: dir.join("monet.control"),
        segment_dir: dir.to_path_buf(),
        liveness_threshold_ms: 2_000,
        monitor_tick_ms: 200,
        log_level: "warn".to_string(),
        groups: vec![SegmentGroupConfig {
            name: "default".to_string(),
            group: None,
            pools: vec![PoolEntry {
                chunk_size: 256,
                chunk_count: 8,
            }],
        }],
    }
}

#[test]
fn register_and_unregister_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(test_config(dir.path())).unwrap();

    let mut client = DaemonClient::connect(&daemon.config().socket_path).unwrap();
    let registration = client.register("socket_app").unwrap();
    assert!(registration.session > 0);
    assert!(!registration.segments.is_empty());

    client.keep_alive(registration.session).unwrap();

    let processes = client.introspect(registration.session).unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].name, "socket_app");

    client.unregister(registration.session).unwrap();
    assert!(daemon.registry().get("socket_app").is_none());

    daemon.shutdown().unwrap();
}

#[test]
fn ports_can_be_created_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = Daemon::start(test_config(dir.path())).unwrap();

    let mut client = DaemonClient::connect(&daemon.config().socket_path).unwrap();
    let registration = client.register("wire_app").unwrap();
    let descriptor = ServiceDescriptor::new("Lidar", "Roof", "PointCloud").unwrap();

    let (pub_port, _, _) = client
        .create_publisher(registration.session, descriptor.clone(), 0, 8)
        .unwrap();
    let (sub_port, _, _) = client
        .create_subscriber(
            registration.session,
            descriptor.clone(),
            8,
            QueuePolicy::DiscardOldest,
            0,
        )
        .unwrap();

    // A second publisher for the same descriptor is refused.
    let duplicate = client.create_publisher(registration.session, descriptor, 0, 8);
    assert!(matches!(
        duplicate,
        Err(MonetError::PublisherAlreadyExists { .. })
    ));

    client.destroy_port(registration.session, sub_port).unwrap();
    client.destroy_port(registration.session, pub_port).unwrap();
    client.unregister(registration.session).unwrap();

    daemon.shutdown().unwrap();
}

#[test]
fn missing_daemon_yields_daemon_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let absent = dir.path().join("nobody.control");
    assert!(matches!(
        DaemonClient::connect_with_timeout(&absent, Duration::from_millis(100)),
        Err(MonetError::DaemonUnavailable { .. })
    ));
}
