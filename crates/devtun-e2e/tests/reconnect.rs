//! Session failure, reconnection and discovery end-to-end tests

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use devtun_agent::{CloudDeviceId, DeviceEvent, DeviceKey};
use devtun_e2e::{channel_feed, wait_until, LocalService, ServiceMode, TestAgent};
use devtun_protocol::ProxyHeader;

fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("devtun_agent=debug,devtun_e2e=debug")
        .with_test_writer()
        .try_init();
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_failed_session_reconnects_with_cached_identity() {
    init_test();

    let agent = TestAgent::start().await;
    agent.resolver.add_device("dev-1", "SERIAL1", Some("cloud-1"));
    let service = LocalService::start(ServiceMode::Echo).await;

    let key = DeviceKey::from("dev-1");
    let first = agent
        .manager
        .connect_by_key(&key)
        .await
        .expect("Failed to connect device");
    assert!(agent.access_point.wait_for_upgrades(1, WAIT).await);
    assert_eq!(agent.resolver.resolve_calls(), 1);

    // Access point goes away under the session
    agent.access_point.drop_sessions();

    let replaced = wait_until(WAIT, || {
        agent
            .manager
            .session(&key)
            .is_some_and(|s| s.token() != first.token() && !s.is_closed())
    })
    .await;
    assert!(replaced, "Session was not replaced");
    assert!(first.is_closed());
    assert!(agent.access_point.wait_for_upgrades(2, WAIT).await);

    // Identity came from the registry, not from the device
    assert_eq!(agent.resolver.resolve_calls(), 1);
    let cloud_id = CloudDeviceId::from("cloud-1");
    let tokens = agent.directory.issued_tokens();
    assert_eq!(tokens.len(), 2);
    assert!(tokens.iter().all(|t| t.device == cloud_id));
    assert_ne!(tokens[0].token, tokens[1].token);
    assert_eq!(agent.manager.device_key_for(&cloud_id), Some(key.clone()));

    let handshakes = agent.access_point.handshakes();
    let expected = format!("Bearer {}", tokens[1].token);
    assert_eq!(handshakes[1].authorization.as_deref(), Some(expected.as_str()));

    // The new session relays streams
    let destination = SocketAddr::from(([127, 0, 0, 1], service.port()));
    let source: SocketAddr = "198.51.100.1:40000".parse().unwrap();
    let mut stream = agent
        .access_point
        .open_stream(ProxyHeader::v2(source, destination))
        .await
        .expect("Failed to open stream");
    stream.write_all(b"after reconnect").await.unwrap();
    let mut buf = [0u8; 15];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("Timed out waiting for echo")
        .unwrap();
    assert_eq!(&buf, b"after reconnect");
}

#[tokio::test]
async fn test_failed_reconnect_tears_down_session() {
    init_test();

    let agent = TestAgent::start().await;
    agent.resolver.add_device("dev-1", "SERIAL1", Some("cloud-1"));

    let key = DeviceKey::from("dev-1");
    agent
        .manager
        .connect_by_key(&key)
        .await
        .expect("Failed to connect device");
    assert!(agent.access_point.wait_for_upgrades(1, WAIT).await);

    agent.directory.set_fail_tokens(true);
    agent.access_point.drop_sessions();

    assert!(
        wait_until(WAIT, || agent.manager.session(&key).is_none()).await,
        "Session was not torn down"
    );
    assert!(agent.manager.registry().cloud_id(&key).is_none());
    assert!(agent
        .manager
        .device_key_for(&CloudDeviceId::from("cloud-1"))
        .is_none());

    // Exactly one attempt, and no new tunnel
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.access_point.upgrade_count(), 1);
    assert_eq!(agent.directory.token_count(), 1);
}

#[tokio::test]
async fn test_discovery_events_drive_sessions() {
    init_test();

    let agent = TestAgent::start().await;
    agent.resolver.add_device("dev-1", "SERIAL1", Some("cloud-1"));

    let (events, mut feed) = channel_feed();
    let manager = agent.manager.clone();
    let discovery = tokio::spawn(async move { manager.run_discovery(&mut feed).await });

    let key = DeviceKey::from("dev-1");
    events.send(DeviceEvent::online("dev-1")).unwrap();
    assert!(
        wait_until(WAIT, || agent.manager.session(&key).is_some()).await,
        "Device did not connect"
    );
    assert!(agent.access_point.wait_for_upgrades(1, WAIT).await);

    events.send(DeviceEvent::offline("dev-1")).unwrap();
    assert!(
        wait_until(WAIT, || agent.manager.session(&key).is_none()).await,
        "Device did not disconnect"
    );
    assert!(
        wait_until(WAIT, || agent.access_point.live_sessions() == 0).await,
        "Access point still sees a live session"
    );
    assert!(agent.manager.registry().is_empty());
    assert!(
        wait_until(WAIT, || agent.manager.observed_devices() == 0).await,
        "Offline device is still tracked"
    );

    // Feed ends when the sender goes away
    drop(events);
    let result = tokio::time::timeout(WAIT, discovery)
        .await
        .expect("Discovery did not stop")
        .expect("Discovery task panicked");
    assert!(result.is_ok());
    assert_eq!(agent.access_point.upgrade_count(), 1);
}

#[tokio::test]
async fn test_offline_while_connecting_leaves_no_session() {
    init_test();

    let agent = TestAgent::start().await;
    agent.resolver.add_device("dev-1", "SERIAL1", Some("cloud-1"));

    let (events, mut feed) = channel_feed();
    let manager = agent.manager.clone();
    tokio::spawn(async move { manager.run_discovery(&mut feed).await });

    // Both events are queued before the first connect can finish
    events.send(DeviceEvent::online("dev-1")).unwrap();
    events.send(DeviceEvent::offline("dev-1")).unwrap();

    let key = DeviceKey::from("dev-1");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        wait_until(WAIT, || agent.manager.session(&key).is_none()).await,
        "A session survived the offline event"
    );
    assert!(
        wait_until(WAIT, || agent.access_point.live_sessions() == 0).await,
        "Access point still sees a live session"
    );
}

#[tokio::test]
async fn test_superseded_session_failure_keeps_replacement() {
    init_test();

    let agent = TestAgent::start().await;
    agent.resolver.add_device("dev-1", "SERIAL1", Some("cloud-1"));

    let key = DeviceKey::from("dev-1");
    let old = agent
        .manager
        .connect_by_key(&key)
        .await
        .expect("Failed to connect device");

    // Same key, new identity: the old session is replaced and closed
    let new = agent
        .manager
        .connect_by_key_and_id(&key, CloudDeviceId::from("cloud-2"))
        .await
        .expect("Failed to reconnect device");
    assert_ne!(old.token(), new.token());
    assert!(agent.access_point.wait_for_upgrades(2, WAIT).await);
    assert!(old.is_closed());

    // The old session's failure must not trigger a reconnect or a removal
    tokio::time::sleep(Duration::from_millis(200)).await;
    let current = agent.manager.session(&key).expect("Replacement was removed");
    assert_eq!(current.token(), new.token());
    assert!(!current.is_closed());
    assert_eq!(
        agent.manager.registry().cloud_id(&key),
        Some(CloudDeviceId::from("cloud-2"))
    );
    assert!(agent
        .manager
        .device_key_for(&CloudDeviceId::from("cloud-1"))
        .is_none());
    assert_eq!(agent.access_point.upgrade_count(), 2);
    assert_eq!(agent.directory.token_count(), 2);
}

#[tokio::test]
async fn test_cloud_id_moving_to_new_key_closes_old_session() {
    init_test();

    let agent = TestAgent::start().await;
    agent.resolver.add_device("usb-1", "SERIAL1", Some("cloud-1"));
    agent.resolver.add_device("wifi-1", "SERIAL1", Some("cloud-1"));

    let usb = agent
        .manager
        .connect_by_key(&DeviceKey::from("usb-1"))
        .await
        .expect("Failed to connect over USB");
    let wifi = agent
        .manager
        .connect_by_key(&DeviceKey::from("wifi-1"))
        .await
        .expect("Failed to connect over Wi-Fi");

    assert!(usb.is_closed());
    assert!(!wifi.is_closed());
    assert!(agent.manager.session(&DeviceKey::from("usb-1")).is_none());
    assert_eq!(
        agent.manager.device_key_for(&CloudDeviceId::from("cloud-1")),
        Some(DeviceKey::from("wifi-1"))
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.access_point.upgrade_count(), 2);
    assert_eq!(agent.manager.registry().len(), 1);
}
