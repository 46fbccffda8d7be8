//! Discovery feed ordering, ADB feed restarts and handler fault isolation

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use devtun_agent::{AdbClient, AdbDiscovery, DeviceEvent, DeviceKey};
use devtun_e2e::{channel_feed, wait_until, TestAgent};

fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("devtun_agent=debug,devtun_e2e=debug")
        .with_test_writer()
        .try_init();
}

const WAIT: Duration = Duration::from_secs(5);

/// ADB server that answers one `host:track-devices` subscription per
/// snapshot, sends that snapshot and hangs up
async fn adb_server(snapshots: Vec<&'static str>) -> AdbClient {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        for snapshot in snapshots {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 22];
            socket.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, b"0012host:track-devices");

            let reply = format!("OKAY{:04x}{}", snapshot.len(), snapshot);
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        }
    });
    AdbClient::new(addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_event_wins_for_online_offline_online() {
    init_test();

    let agent = TestAgent::start().await;
    agent.resolver.add_device("dev-1", "SERIAL1", Some("cloud-1"));

    let (events, mut feed) = channel_feed();
    let manager = agent.manager.clone();
    tokio::spawn(async move { manager.run_discovery(&mut feed).await });

    let key = DeviceKey::from("dev-1");
    for round in 0..10 {
        events.send(DeviceEvent::online("dev-1")).unwrap();
        events.send(DeviceEvent::offline("dev-1")).unwrap();
        events.send(DeviceEvent::online("dev-1")).unwrap();

        assert!(
            wait_until(WAIT, || agent.manager.session(&key).is_some()).await,
            "Round {}: device never connected",
            round
        );
        // Let every handler of the round run to completion
        tokio::time::sleep(Duration::from_millis(300)).await;
        let session = agent.manager.session(&key);
        assert!(
            session.as_ref().is_some_and(|s| !s.is_closed()),
            "Round {}: no live session although the device was last seen online",
            round
        );

        // Reset for the next round
        events.send(DeviceEvent::offline("dev-1")).unwrap();
        assert!(
            wait_until(WAIT, || agent.manager.session(&key).is_none()
                && agent.manager.observed_devices() == 0)
            .await,
            "Round {}: device did not disconnect",
            round
        );
    }
}

#[tokio::test]
async fn test_adb_feed_restart_drops_vanished_devices() {
    init_test();

    let agent = TestAgent::start().await;
    agent.resolver.add_device("dev-1", "SERIAL1", Some("cloud-1"));
    agent.resolver.add_device("dev-2", "SERIAL2", Some("cloud-2"));

    let adb = adb_server(vec!["dev-1\tdevice\ndev-2\tdevice\n", "dev-2\tdevice\n"]).await;
    let mut discovery = AdbDiscovery::new(adb);

    // First subscription sees both devices, then the ADB server goes away
    discovery.run_once(&agent.manager).await.unwrap();
    let both = wait_until(WAIT, || {
        agent.manager.session(&"dev-1".into()).is_some()
            && agent.manager.session(&"dev-2".into()).is_some()
    })
    .await;
    assert!(both, "Devices did not connect");
    assert!(agent.access_point.wait_for_upgrades(2, WAIT).await);

    // dev-1 was unplugged while nobody was listening
    discovery.run_once(&agent.manager).await.unwrap();
    assert!(
        wait_until(WAIT, || agent.manager.session(&"dev-1".into()).is_none()).await,
        "Vanished device kept its tunnel"
    );

    // dev-2 is untouched: no extra handshake, same session
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(agent.manager.session(&"dev-2".into()).is_some());
    assert_eq!(agent.access_point.upgrade_count(), 2);
    assert_eq!(agent.manager.registry().len(), 1);
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_discovery() {
    init_test();

    let agent = TestAgent::start().await;
    agent.resolver.panic_on("bad-1");
    agent.resolver.add_device("dev-1", "SERIAL1", Some("cloud-1"));
    agent.resolver.add_device("dev-2", "SERIAL2", Some("cloud-2"));

    let (events, mut feed) = channel_feed();
    let manager = agent.manager.clone();
    let discovery = tokio::spawn(async move { manager.run_discovery(&mut feed).await });

    events.send(DeviceEvent::online("bad-1")).unwrap();
    events.send(DeviceEvent::online("dev-1")).unwrap();
    assert!(
        wait_until(WAIT, || agent.manager.session(&"dev-1".into()).is_some()).await,
        "Connect next to a panicking handler did not complete"
    );

    // The feed is still consumed after the panic
    events.send(DeviceEvent::online("dev-2")).unwrap();
    assert!(
        wait_until(WAIT, || agent.manager.session(&"dev-2".into()).is_some()).await,
        "Discovery stopped after a handler panicked"
    );
    assert!(agent.manager.session(&"bad-1".into()).is_none());
    assert_eq!(agent.resolver.resolve_calls(), 3);

    // The panicking key's lock was released
    assert!(!agent.manager.force_disconnect(&"bad-1".into()).await);

    drop(events);
    let result = tokio::time::timeout(WAIT, discovery)
        .await
        .expect("Discovery did not stop")
        .expect("Discovery task panicked");
    assert!(result.is_ok());
}
