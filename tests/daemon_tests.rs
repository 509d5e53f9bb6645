//! Daemon control-plane tests: registration, matching, liveness, cleanup

use std::time::Duration;

use monet::{
    config::{DaemonConfig, PoolEntry, SegmentGroupConfig},
    daemon::{Reply, Request},
    port::{PublisherPortData, SubscriberPortData},
    Daemon, ErrorCode, ProcessState, PublisherPort, QueuePolicy, ServiceDescriptor,
    SubscriberPort,
};

fn test_config(dir: &std::path::Path) -> DaemonConfig {
    DaemonConfig {
        socket_path: dir.join("monet.control"),
        segment_dir: dir.to_path_buf(),
        liveness_threshold_ms: 150,
        monitor_tick_ms: 50,
        log_level: "warn".to_string(),
        groups: vec![SegmentGroupConfig {
            name: "default".to_string(),
            group: None,
            pools: vec![
                PoolEntry {
                    chunk_size: 128,
                    chunk_count: 4,
                },
                PoolEntry {
                    chunk_size: 1024,
                    chunk_count: 4,
                },
            ],
        }],
    }
}

fn start_daemon(dir: &tempfile::TempDir) -> Daemon {
    Daemon::start(test_config(dir.path())).expect("daemon failed to start")
}

fn register(daemon: &Daemon, name: &str) -> u64 {
    match daemon.handle(Request::Register {
        name: name.to_string(),
        pid: std::process::id(),
        uid: nix::unistd::getuid().as_raw(),
        abi_version: monet::layout::constants::ABI_VERSION,
    }) {
        Some(Reply::Registered { session, .. }) => session,
        other => panic!("registration failed: {:?}", other),
    }
}

fn descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new("Radar", "Front", "Object").unwrap()
}

fn create_publisher(daemon: &Daemon, session: u64, history: u32) -> PublisherPort {
    match daemon.handle(Request::CreatePublisher {
        session,
        descriptor: descriptor(),
        history_capacity: history,
        allocation_budget: 8,
    }) {
        Some(Reply::PortCreated {
            location,
            data_segment,
            ..
        }) => {
            let table = daemon.segments().table();
            let ptr = table.resolve(location).unwrap() as *mut PublisherPortData;
            unsafe { PublisherPort::attach(ptr, data_segment, table.clone()).unwrap() }
        }
        other => panic!("publisher creation failed: {:?}", other),
    }
}

fn create_subscriber(
    daemon: &Daemon,
    session: u64,
    queue_capacity: u32,
    history_request: u32,
) -> SubscriberPort {
    match daemon.handle(Request::CreateSubscriber {
        session,
        descriptor: descriptor(),
        queue_capacity,
        policy: QueuePolicy::DiscardOldest,
        history_request,
    }) {
        Some(Reply::PortCreated { location, .. }) => {
            let table = daemon.segments().table();
            let ptr = table.resolve(location).unwrap() as *mut SubscriberPortData;
            unsafe { SubscriberPort::attach(ptr, table.clone()).unwrap() }
        }
        other => panic!("subscriber creation failed: {:?}", other),
    }
}

fn publish(publisher: &PublisherPort, value: u8) {
    let mut sample = publisher.loan(1).unwrap();
    sample.write_payload(&[value]).unwrap();
    publisher.publish(sample).unwrap();
}

#[test]
fn register_unregister_register_yields_greater_session() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    let first = register(&daemon, "app");
    assert!(matches!(
        daemon.handle(Request::Unregister { session: first }),
        Some(Reply::Done)
    ));
    let second = register(&daemon, "app");
    assert!(second > first);

    daemon.shutdown().unwrap();
}

#[test]
fn live_name_collision_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    register(&daemon, "app");
    match daemon.handle(Request::Register {
        name: "app".to_string(),
        pid: 1,
        uid: 0,
        abi_version: monet::layout::constants::ABI_VERSION,
    }) {
        Some(Reply::Error { code }) => assert_eq!(code, ErrorCode::NameTaken),
        other => panic!("expected NameTaken, got {:?}", other),
    }

    daemon.shutdown().unwrap();
}

#[test]
fn abi_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    match daemon.handle(Request::Register {
        name: "old".to_string(),
        pid: 1,
        uid: 0,
        abi_version: monet::layout::constants::ABI_VERSION + 1,
    }) {
        Some(Reply::Error { code }) => assert_eq!(code, ErrorCode::VersionMismatch),
        other => panic!("expected VersionMismatch, got {:?}", other),
    }

    daemon.shutdown().unwrap();
}

#[test]
fn stale_session_is_discarded_and_successor_unaffected() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    let old_session = register(&daemon, "app");
    daemon.handle(Request::Unregister {
        session: old_session,
    });
    let new_session = register(&daemon, "app");

    // A message carrying the predecessor's session id bounces.
    match daemon.handle(Request::CreatePublisher {
        session: old_session,
        descriptor: descriptor(),
        history_capacity: 0,
        allocation_budget: 8,
    }) {
        Some(Reply::Error { code }) => assert_eq!(code, ErrorCode::StaleSession),
        other => panic!("expected StaleSession, got {:?}", other),
    }

    // The successor still works.
    let _publisher = create_publisher(&daemon, new_session, 0);
    assert_eq!(daemon.registry().state_of("app"), Some(ProcessState::Active));

    daemon.shutdown().unwrap();
}

#[test]
fn exclusive_publisher_per_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    let first = register(&daemon, "first");
    let second = register(&daemon, "second");

    let _publisher = create_publisher(&daemon, first, 0);
    match daemon.handle(Request::CreatePublisher {
        session: second,
        descriptor: descriptor(),
        history_capacity: 0,
        allocation_budget: 8,
    }) {
        Some(Reply::Error { code }) => assert_eq!(code, ErrorCode::PublisherAlreadyExists),
        other => panic!("expected PublisherAlreadyExists, got {:?}", other),
    }

    daemon.shutdown().unwrap();
}

#[test]
fn basic_one_to_one_flow() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    let pub_session = register(&daemon, "producer");
    let sub_session = register(&daemon, "consumer");

    let publisher = create_publisher(&daemon, pub_session, 0);
    let subscriber = create_subscriber(&daemon, sub_session, 8, 0);

    for value in [1u8, 2, 3] {
        publish(&publisher, value);
    }
    for expected in [1u8, 2, 3] {
        assert_eq!(subscriber.take().unwrap().payload()[0], expected);
    }
    assert!(subscriber.take().is_err());

    daemon.shutdown().unwrap();
}

#[test]
fn late_joiner_gets_history_through_matching() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    let pub_session = register(&daemon, "producer");
    let publisher = create_publisher(&daemon, pub_session, 2);
    for value in [10u8, 20, 30, 40] {
        publish(&publisher, value);
    }

    let sub_session = register(&daemon, "late");
    let subscriber = create_subscriber(&daemon, sub_session, 8, 3);

    assert_eq!(subscriber.take().unwrap().payload()[0], 30);
    assert_eq!(subscriber.take().unwrap().payload()[0], 40);
    assert!(subscriber.take().is_err());

    publish(&publisher, 50);
    assert_eq!(subscriber.take().unwrap().payload()[0], 50);

    daemon.shutdown().unwrap();
}

#[test]
fn lost_process_is_reaped_within_liveness_period() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    let pub_session = register(&daemon, "victim");
    let sub_session = register(&daemon, "watcher");

    let publisher = create_publisher(&daemon, pub_session, 2);
    let subscriber = create_subscriber(&daemon, sub_session, 8, 0);
    publish(&publisher, 7);

    // The watcher keeps sending keep-alives; the victim goes silent.
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(40));
        daemon.handle(Request::KeepAlive {
            session: sub_session,
        });
    }
    daemon.monitor_tick();

    assert!(daemon.registry().get("victim").is_none());
    assert!(!subscriber.is_publisher_connected());

    // Draining the queue reconciles the last references to zero.
    while subscriber.take().is_ok() {}
    let pool = daemon
        .segments()
        .mempool_for(daemon.registry().get("watcher").unwrap().data_segment, 1)
        .unwrap();
    assert_eq!(pool.used(), 0);

    daemon.shutdown().unwrap();
}

#[test]
fn lost_name_is_reaped_on_reregistration() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    let session = register(&daemon, "phoenix");
    let _publisher = create_publisher(&daemon, session, 0);

    daemon
        .registry()
        .set_state("phoenix", ProcessState::Lost)
        .unwrap();

    // Same name registers again: the lost predecessor is reaped first.
    let reborn = register(&daemon, "phoenix");
    assert!(reborn > session);
    assert_eq!(daemon.registry().port_count("phoenix"), 0);

    daemon.shutdown().unwrap();
}

#[test]
fn destroy_port_releases_and_forgets() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    let session = register(&daemon, "app");
    let port = match daemon.handle(Request::CreatePublisher {
        session,
        descriptor: descriptor(),
        history_capacity: 0,
        allocation_budget: 8,
    }) {
        Some(Reply::PortCreated { port, .. }) => port,
        other => panic!("unexpected: {:?}", other),
    };

    assert!(matches!(
        daemon.handle(Request::DestroyPort { session, port }),
        Some(Reply::Done)
    ));
    assert_eq!(daemon.registry().port_count("app"), 0);

    // Destroying it again reports an unknown port.
    match daemon.handle(Request::DestroyPort { session, port }) {
        Some(Reply::Error { code }) => assert_eq!(code, ErrorCode::UnknownPort),
        other => panic!("unexpected: {:?}", other),
    }

    daemon.shutdown().unwrap();
}

#[test]
fn introspection_lists_processes_and_ports() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);

    let session = register(&daemon, "app");
    let _publisher = create_publisher(&daemon, session, 0);

    match daemon.handle(Request::QueryIntrospection { session }) {
        Some(Reply::Introspection { processes }) => {
            assert_eq!(processes.len(), 1);
            assert_eq!(processes[0].name, "app");
            assert_eq!(processes[0].ports.len(), 1);
            assert_eq!(processes[0].ports[0].descriptor, "Radar/Front/Object");
        }
        other => panic!("unexpected: {:?}", other),
    }

    daemon.shutdown().unwrap();
}

#[test]
fn shutdown_unlinks_every_segment_and_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(&dir);
    let socket = daemon.config().socket_path.clone();

    register(&daemon, "app");
    daemon.shutdown().unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("monet_"))
        .collect();
    assert!(leftovers.is_empty(), "segments not unlinked: {:?}", leftovers);
    assert!(!socket.exists());
}

#[test]
fn stale_segment_files_are_purged_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("monet_default"), b"stale garbage").unwrap();

    let daemon = start_daemon(&dir);
    register(&daemon, "app");
    daemon.shutdown().unwrap();
}
