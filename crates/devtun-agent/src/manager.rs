//! Device tunnel manager
//!
//! Owns the session registry and per-device locks, and runs the lifecycle of
//! every device tunnel: connect on discovery, accept and proxy streams,
//! reconnect once when a session fails, tear down on disconnect.
//!
//! All mutations for one device happen under that device's lock. The registry
//! token check keeps a late failure of a superseded session from touching its
//! replacement.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use thiserror::Error;

use crate::collaborators::{
    AccessPointDirectory, DirectoryError, DiscoveryError, DiscoveryFeed, IdentityError,
    IdentityResolver,
};
use crate::establish::{EstablishError, TunnelEstablisher};
use crate::locks::KeyedLocks;
use crate::mux::MuxStream;
use crate::proxy;
use crate::registry::SessionRegistry;
use crate::session::DeviceSession;
use crate::types::{CloudDeviceId, DeviceEvent, DeviceKey, DeviceState};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Device {0} is not registered with the control plane")]
    NotRegistered(DeviceKey),

    #[error("Identity lookup failed: {0}")]
    Identity(#[from] IdentityError),

    #[error("Access point directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("No access points available")]
    NoAccessPoints,

    #[error("Tunnel handshake failed: {0}")]
    Establish(#[from] EstablishError),
}

pub struct DeviceTunnelManager {
    registry: SessionRegistry,
    locks: KeyedLocks,
    resolver: Arc<dyn IdentityResolver>,
    directory: Arc<dyn AccessPointDirectory>,
    establisher: TunnelEstablisher,
    /// Latest state seen on the discovery feed, in feed order
    observed: DashMap<DeviceKey, Observation>,
}

/// Feed state of one device while its events are being handled
#[derive(Debug, Clone, Copy)]
struct Observation {
    state: DeviceState,
    /// Dispatched handlers that have not finished yet
    in_flight: usize,
}

impl DeviceTunnelManager {
    pub fn new(
        resolver: Arc<dyn IdentityResolver>,
        directory: Arc<dyn AccessPointDirectory>,
        establisher: TunnelEstablisher,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: SessionRegistry::new(),
            locks: KeyedLocks::new(),
            resolver,
            directory,
            establisher,
            observed: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn session(&self, key: &DeviceKey) -> Option<Arc<DeviceSession>> {
        self.registry.get(key)
    }

    /// Local device currently registered under `cloud_id`
    pub fn device_key_for(&self, cloud_id: &CloudDeviceId) -> Option<DeviceKey> {
        self.registry.device_key(cloud_id)
    }

    /// Resolve the device's cloud identity, then connect it.
    ///
    /// A device whose identifiers cannot be read (a desktop key, or ADB being
    /// unavailable) uses its key as the cloud id.
    pub async fn connect_by_key(
        self: &Arc<Self>,
        key: &DeviceKey,
    ) -> Result<Arc<DeviceSession>, ConnectError> {
        let cloud_id = self.resolve_cloud_id(key).await?;
        self.connect_by_key_and_id(key, cloud_id).await
    }

    async fn resolve_cloud_id(&self, key: &DeviceKey) -> Result<CloudDeviceId, ConnectError> {
        let identifiers = match self.resolver.resolve_identifiers(key).await {
            Ok(identifiers) => identifiers,
            Err(e) => {
                tracing::warn!(
                    "Could not read identifiers of {} ({}), using the key as its cloud id",
                    key,
                    e
                );
                return Ok(CloudDeviceId::new(key.as_str()));
            }
        };

        if let Some(cached) = identifiers.cached_cloud_id {
            tracing::debug!("Using cached cloud id {} for {}", cached, key);
            return Ok(cached);
        }

        let registered = self
            .resolver
            .lookup_registered_device(&identifiers.serial, identifiers.hardware_id.as_deref())
            .await?;
        registered
            .into_iter()
            .next()
            .ok_or_else(|| ConnectError::NotRegistered(key.clone()))
    }

    /// Connect `key` as `cloud_id`. A live session already registered for the
    /// same identity is returned unchanged.
    pub async fn connect_by_key_and_id(
        self: &Arc<Self>,
        key: &DeviceKey,
        cloud_id: CloudDeviceId,
    ) -> Result<Arc<DeviceSession>, ConnectError> {
        let _guard = self.locks.lock(key).await;

        if let Some(existing) = self.registry.get(key) {
            let same_identity = self.registry.cloud_id(key).as_ref() == Some(&cloud_id);
            if same_identity && !existing.is_closed() {
                tracing::debug!(
                    "Device {} already connected via {}",
                    key,
                    existing.endpoint()
                );
                return Ok(existing);
            }
        }

        self.connect_locked(key, cloud_id).await
    }

    /// Establish and register a new session. Caller holds the key's lock.
    async fn connect_locked(
        self: &Arc<Self>,
        key: &DeviceKey,
        cloud_id: CloudDeviceId,
    ) -> Result<Arc<DeviceSession>, ConnectError> {
        let access_point = self
            .directory
            .list_access_points()
            .await?
            .into_iter()
            .next()
            .ok_or(ConnectError::NoAccessPoints)?;

        let token = self
            .directory
            .issue_token(&cloud_id, &access_point.endpoint)
            .await?;

        let session = self.establisher.establish(key, &access_point, &token).await?;
        let (session, superseded) = self.registry.insert(session, cloud_id.clone());
        for stale in superseded {
            tracing::debug!(
                "Closing superseded session {} for {}",
                stale.token(),
                stale.key()
            );
            stale.close();
        }

        tracing::info!(
            "Device {} connected as {} via {}",
            key,
            cloud_id,
            access_point.endpoint
        );
        self.spawn_accept_loop(session.clone());
        Ok(session)
    }

    /// Tear down `session` if it is still the registered one for its key
    pub async fn disconnect(&self, session: &DeviceSession) -> bool {
        let removed = {
            let _guard = self.locks.lock(session.key()).await;
            self.disconnect_locked(session)
        };
        self.locks.prune();
        removed
    }

    /// Tear down whatever session is registered for `key`
    pub async fn force_disconnect(&self, key: &DeviceKey) -> bool {
        let removed = {
            let _guard = self.locks.lock(key).await;
            match self.registry.get(key) {
                Some(session) => self.disconnect_locked(&session),
                None => {
                    tracing::debug!("No session to disconnect for {}", key);
                    false
                }
            }
        };
        self.locks.prune();
        removed
    }

    fn disconnect_locked(&self, session: &DeviceSession) -> bool {
        let removed = self.registry.remove(session);
        session.close();
        if removed {
            tracing::info!("Device {} disconnected", session.key());
        } else {
            tracing::debug!(
                "Session {} for {} was already replaced or removed",
                session.token(),
                session.key()
            );
        }
        removed
    }

    fn spawn_accept_loop(self: &Arc<Self>, session: Arc<DeviceSession>) {
        let manager = Arc::clone(self);
        tokio::spawn(manager.accept_loop(session));
    }

    async fn accept_loop(self: Arc<Self>, session: Arc<DeviceSession>) {
        let key = session.key().clone();
        tracing::debug!("Accepting streams for {} ({})", key, session.token());

        let error = loop {
            match session.accept().await {
                Ok(stream) => spawn_proxy(&key, stream),
                Err(e) => break e,
            }
        };

        if self.registry.has(&key) {
            tracing::warn!("Tunnel for {} failed: {}, reconnecting", key, error);
            self.spawn_reconnect(session);
        } else {
            tracing::info!("Tunnel for {} closed: {}", key, error);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, failed: Arc<DeviceSession>) {
        let manager = Arc::clone(self);
        tokio::spawn(manager.reconnect(failed));
    }

    /// One reconnection attempt for a failed session.
    ///
    /// Skipped when the failed session is no longer the registered one. A
    /// failed attempt tears the failed session down.
    async fn reconnect(self: Arc<Self>, failed: Arc<DeviceSession>) {
        let key = failed.key().clone();
        {
            let _guard = self.locks.lock(&key).await;

            if !self.registry.is_current(&failed) {
                tracing::debug!("Session for {} already replaced, not reconnecting", key);
                return;
            }

            let Some(cloud_id) = self.registry.cloud_id(&key) else {
                tracing::warn!("No cloud id recorded for {}, dropping its session", key);
                self.disconnect_locked(&failed);
                return;
            };

            match self.connect_locked(&key, cloud_id).await {
                Ok(session) => {
                    tracing::info!("Device {} reconnected via {}", key, session.endpoint())
                }
                Err(e) => {
                    tracing::error!("Reconnecting {} failed: {}", key, e);
                    self.disconnect_locked(&failed);
                }
            }
        }
        self.locks.prune();
    }

    /// React to one discovery event
    pub async fn handle_event(self: &Arc<Self>, event: DeviceEvent) {
        if event.previous == event.current {
            tracing::debug!(
                "Ignoring {:?} -> {:?} for {}",
                event.previous,
                event.current,
                event.key
            );
            return;
        }

        match event.current {
            DeviceState::Online => {
                if let Err(e) = self.connect_by_key(&event.key).await {
                    tracing::warn!("Failed to connect {}: {}", event.key, e);
                    return;
                }
                // The device may have gone away again while we were connecting
                if self.observed_state(&event.key) == Some(DeviceState::Offline) {
                    self.disconnect_unless_online(&event.key).await;
                }
            }
            DeviceState::Offline => {
                self.disconnect_unless_online(&event.key).await;
            }
        }
    }

    /// Offline handling under the key's lock. Handlers for one key can reach
    /// the lock out of feed order, so the latest observed state decides: a key
    /// the feed has since reported online keeps its session.
    async fn disconnect_unless_online(&self, key: &DeviceKey) -> bool {
        let removed = {
            let _guard = self.locks.lock(key).await;
            if self.observed_state(key) == Some(DeviceState::Online) {
                tracing::debug!("Device {} is back online, keeping its session", key);
                false
            } else {
                match self.registry.get(key) {
                    Some(session) => self.disconnect_locked(&session),
                    None => false,
                }
            }
        };
        self.locks.prune();
        removed
    }

    fn observed_state(&self, key: &DeviceKey) -> Option<DeviceState> {
        self.observed.get(key).map(|observation| observation.state)
    }

    fn observe(&self, event: &DeviceEvent) {
        self.observed
            .entry(event.key.clone())
            .and_modify(|observation| {
                observation.state = event.current;
                observation.in_flight += 1;
            })
            .or_insert(Observation {
                state: event.current,
                in_flight: 1,
            });
    }

    /// Forget an offline key once none of its handlers is still running
    fn finish_event(&self, key: &DeviceKey) {
        if let Some(mut observation) = self.observed.get_mut(key) {
            observation.in_flight = observation.in_flight.saturating_sub(1);
        }
        self.observed.remove_if(key, |_, observation| {
            observation.in_flight == 0 && observation.state == DeviceState::Offline
        });
    }

    /// Number of devices whose feed state is still tracked
    pub fn observed_devices(&self) -> usize {
        self.observed.len()
    }

    /// Consume `feed` until it ends, handling each event on its own task
    pub async fn run_discovery<F>(self: &Arc<Self>, feed: &mut F) -> Result<(), DiscoveryError>
    where
        F: DiscoveryFeed + ?Sized,
    {
        while let Some(event) = feed.next_event().await? {
            tracing::debug!(
                "Device {}: {:?} -> {:?}",
                event.key,
                event.previous,
                event.current
            );
            self.observe(&event);
            self.spawn_event_handler(event);
        }
        tracing::info!("Discovery feed ended");
        Ok(())
    }

    fn spawn_event_handler(self: &Arc<Self>, event: DeviceEvent) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let key = event.key.clone();
            if let Err(panic) = AssertUnwindSafe(manager.handle_event(event))
                .catch_unwind()
                .await
            {
                tracing::error!(
                    "Event handler for {} panicked: {}",
                    key,
                    panic_message(panic.as_ref())
                );
            }
            manager.finish_event(&key);
        });
    }

    /// Close every session
    pub async fn shutdown(&self) {
        let sessions = self.registry.sessions();
        tracing::info!("Closing {} device tunnel(s)", sessions.len());
        for session in sessions {
            self.disconnect(&session).await;
        }
    }
}

/// Proxy one accepted stream on its own task, containing panics
fn spawn_proxy(key: &DeviceKey, stream: MuxStream) {
    let key = key.clone();
    let stream_id = stream.get_ref().id().val();
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(proxy::proxy_stream(&key, stream_id, stream))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => tracing::debug!("Stream {} on {} finished", stream_id, key),
            Ok(Err(e)) => tracing::warn!("Stream {} on {} failed: {}", stream_id, key, e),
            Err(panic) => tracing::error!(
                "Stream {} on {} panicked: {}",
                stream_id,
                key,
                panic_message(panic.as_ref())
            ),
        }
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessPoint, DeviceIdentifiers};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct StaticResolver {
        identifiers: Option<DeviceIdentifiers>,
        registered: Vec<CloudDeviceId>,
    }

    #[async_trait]
    impl IdentityResolver for StaticResolver {
        async fn resolve_identifiers(
            &self,
            key: &DeviceKey,
        ) -> Result<DeviceIdentifiers, IdentityError> {
            self.identifiers
                .clone()
                .ok_or_else(|| IdentityError::Unresolvable(key.clone()))
        }

        async fn lookup_registered_device(
            &self,
            _serial: &str,
            _hardware_id: Option<&str>,
        ) -> Result<Vec<CloudDeviceId>, IdentityError> {
            Ok(self.registered.clone())
        }
    }

    /// Directory with no access points that remembers token requests
    #[derive(Default)]
    struct EmptyDirectory {
        token_requests: Mutex<Vec<CloudDeviceId>>,
    }

    #[async_trait]
    impl AccessPointDirectory for EmptyDirectory {
        async fn list_access_points(&self) -> Result<Vec<AccessPoint>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn issue_token(
            &self,
            device: &CloudDeviceId,
            _endpoint: &str,
        ) -> Result<String, DirectoryError> {
            self.token_requests.lock().push(device.clone());
            Ok("token".to_string())
        }
    }

    fn manager(resolver: StaticResolver) -> Arc<DeviceTunnelManager> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let establisher = TunnelEstablisher::new(
            Arc::new(devtun_common::load_webpki_client_config()),
            "devtun-test",
            Duration::from_secs(1),
        );
        DeviceTunnelManager::new(
            Arc::new(resolver),
            Arc::new(EmptyDirectory::default()),
            establisher,
        )
    }

    fn identifiers(cached: Option<&str>) -> DeviceIdentifiers {
        DeviceIdentifiers {
            serial: "R58M123".to_string(),
            hardware_id: Some("a1b2c3".to_string()),
            cached_cloud_id: cached.map(CloudDeviceId::from),
        }
    }

    #[tokio::test]
    async fn test_unregistered_device_is_rejected() {
        let manager = manager(StaticResolver {
            identifiers: Some(identifiers(None)),
            registered: Vec::new(),
        });
        let result = manager.resolve_cloud_id(&"R58M123".into()).await;
        assert!(matches!(result, Err(ConnectError::NotRegistered(_))));
    }

    #[tokio::test]
    async fn test_cached_cloud_id_skips_lookup() {
        let manager = manager(StaticResolver {
            identifiers: Some(identifiers(Some("dev-cached"))),
            registered: vec!["dev-lookup".into()],
        });
        let cloud_id = manager.resolve_cloud_id(&"R58M123".into()).await.unwrap();
        assert_eq!(cloud_id, CloudDeviceId::from("dev-cached"));
    }

    #[tokio::test]
    async fn test_first_registered_device_wins() {
        let manager = manager(StaticResolver {
            identifiers: Some(identifiers(None)),
            registered: vec!["dev-1".into(), "dev-2".into()],
        });
        let cloud_id = manager.resolve_cloud_id(&"R58M123".into()).await.unwrap();
        assert_eq!(cloud_id, CloudDeviceId::from("dev-1"));
    }

    #[tokio::test]
    async fn test_unreadable_identifiers_fall_back_to_key() {
        let manager = manager(StaticResolver::default());
        let cloud_id = manager.resolve_cloud_id(&"desktop-7".into()).await.unwrap();
        assert_eq!(cloud_id, CloudDeviceId::from("desktop-7"));
    }

    #[tokio::test]
    async fn test_connect_without_access_points() {
        let manager = manager(StaticResolver::default());
        let result = manager.connect_by_key(&"desktop-7".into()).await;
        assert!(matches!(result, Err(ConnectError::NoAccessPoints)));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_offline_event_for_unknown_device_is_harmless() {
        let manager = manager(StaticResolver::default());
        manager.handle_event(DeviceEvent::offline("serialZ")).await;
        assert!(!manager.force_disconnect(&"serialZ".into()).await);
        assert!(manager.registry().is_empty());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
