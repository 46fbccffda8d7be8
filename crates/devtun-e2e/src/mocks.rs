//! In-memory collaborators for the tunnel manager
//!
//! These stand in for ADB, the control API and the discovery feed, and
//! count calls so tests can assert what the manager asked for.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use devtun_agent::{
    AccessPoint, AccessPointDirectory, CloudDeviceId, DeviceEvent, DeviceIdentifiers, DeviceKey,
    DirectoryError, DiscoveryError, DiscoveryFeed, IdentityError, IdentityResolver,
};

/// Identity resolver backed by maps filled in by the test
pub struct MockIdentityResolver {
    /// Identifiers each device reports
    devices: DashMap<DeviceKey, DeviceIdentifiers>,
    /// serial -> registered cloud id
    registrations: DashMap<String, CloudDeviceId>,
    /// Keys whose identity read panics
    panicking: RwLock<Vec<DeviceKey>>,
    resolve_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
}

impl MockIdentityResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a device. With `cloud_id` set, its serial is registered too.
    pub fn add_device(&self, key: &str, serial: &str, cloud_id: Option<&str>) {
        self.devices.insert(
            DeviceKey::from(key),
            DeviceIdentifiers {
                serial: serial.to_string(),
                hardware_id: Some(format!("hw-{}", serial.to_lowercase())),
                cached_cloud_id: None,
            },
        );
        if let Some(cloud_id) = cloud_id {
            self.registrations
                .insert(serial.to_string(), CloudDeviceId::from(cloud_id));
        }
    }

    /// Make identity reads for `key` panic
    pub fn panic_on(&self, key: &str) {
        self.panicking.write().push(DeviceKey::from(key));
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockIdentityResolver {
    fn default() -> Self {
        Self {
            devices: DashMap::new(),
            registrations: DashMap::new(),
            panicking: RwLock::new(Vec::new()),
            resolve_calls: AtomicUsize::new(0),
            lookup_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl IdentityResolver for MockIdentityResolver {
    async fn resolve_identifiers(
        &self,
        key: &DeviceKey,
    ) -> Result<DeviceIdentifiers, IdentityError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.panicking.read().contains(key) {
            panic!("identity backend crashed reading {}", key);
        }
        self.devices
            .get(key)
            .map(|d| d.value().clone())
            .ok_or_else(|| IdentityError::Unresolvable(key.clone()))
    }

    async fn lookup_registered_device(
        &self,
        serial: &str,
        _hardware_id: Option<&str>,
    ) -> Result<Vec<CloudDeviceId>, IdentityError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .registrations
            .get(serial)
            .map(|id| vec![id.value().clone()])
            .unwrap_or_default())
    }
}

/// A token the directory handed out
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedToken {
    pub device: CloudDeviceId,
    pub endpoint: String,
    pub token: String,
}

/// Access point directory with a fixed list and a token counter
pub struct MockDirectory {
    access_points: RwLock<Vec<AccessPoint>>,
    issued: RwLock<Vec<IssuedToken>>,
    token_counter: AtomicU64,
    fail_tokens: AtomicBool,
}

impl MockDirectory {
    pub fn new(access_points: Vec<AccessPoint>) -> Arc<Self> {
        Arc::new(Self {
            access_points: RwLock::new(access_points),
            issued: RwLock::new(Vec::new()),
            token_counter: AtomicU64::new(1),
            fail_tokens: AtomicBool::new(false),
        })
    }

    pub fn set_access_points(&self, access_points: Vec<AccessPoint>) {
        *self.access_points.write() = access_points;
    }

    /// Make token issuance fail until reset
    pub fn set_fail_tokens(&self, fail: bool) {
        self.fail_tokens.store(fail, Ordering::SeqCst);
    }

    pub fn issued_tokens(&self) -> Vec<IssuedToken> {
        self.issued.read().clone()
    }

    pub fn token_count(&self) -> usize {
        self.issued.read().len()
    }
}

#[async_trait]
impl AccessPointDirectory for MockDirectory {
    async fn list_access_points(&self) -> Result<Vec<AccessPoint>, DirectoryError> {
        Ok(self.access_points.read().clone())
    }

    async fn issue_token(
        &self,
        device: &CloudDeviceId,
        endpoint: &str,
    ) -> Result<String, DirectoryError> {
        if self.fail_tokens.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable(
                "token service is down".to_string(),
            ));
        }
        let n = self.token_counter.fetch_add(1, Ordering::SeqCst);
        let token = format!("tok-{}-{}", device, n);
        self.issued.write().push(IssuedToken {
            device: device.clone(),
            endpoint: endpoint.to_string(),
            token: token.clone(),
        });
        Ok(token)
    }
}

/// Discovery feed the test pushes events into
pub struct ChannelFeed {
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

/// Create a feed and the sender that drives it. Dropping the sender ends the feed.
pub fn channel_feed() -> (mpsc::UnboundedSender<DeviceEvent>, ChannelFeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelFeed { rx })
}

#[async_trait]
impl DiscoveryFeed for ChannelFeed {
    async fn next_event(&mut self) -> Result<Option<DeviceEvent>, DiscoveryError> {
        Ok(self.rx.recv().await)
    }
}
