//! ADB server client: device tracking and identity reads

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use devtun_protocol::{
    encode_request, parse_device_list, parse_length_prefix, AdbCodec, AdbError, ADB_FAIL, ADB_OKAY,
};

use crate::collaborators::{DiscoveryError, DiscoveryFeed, IdentityError, IdentityResolver};
use crate::control_api::ControlApiClient;
use crate::manager::DeviceTunnelManager;
use crate::types::{CloudDeviceId, DeviceEvent, DeviceIdentifiers, DeviceKey, DeviceState};

/// Talks to the local ADB server over its host protocol
#[derive(Debug, Clone)]
pub struct AdbClient {
    addr: String,
}

impl AdbClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn request(&self, payload: &str) -> Result<TcpStream, AdbError> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        send_request(&mut stream, payload).await?;
        Ok(stream)
    }

    /// Subscribe to device list changes
    pub async fn track_devices(&self) -> Result<AdbTracker<TcpStream>, AdbError> {
        let stream = self.request("host:track-devices").await?;
        tracing::info!("Tracking devices via ADB server at {}", self.addr);
        Ok(AdbTracker::new(stream))
    }

    /// Run a shell command on `serial` and return its trimmed output
    pub async fn shell(&self, serial: &str, command: &str) -> Result<String, AdbError> {
        let mut stream = self.request(&format!("host:transport:{}", serial)).await?;
        send_request(&mut stream, &format!("shell:{}", command)).await?;

        let mut output = Vec::new();
        stream.read_to_end(&mut output).await?;
        Ok(String::from_utf8_lossy(&output).trim().to_string())
    }
}

async fn send_request<S>(stream: &mut S, payload: &str) -> Result<(), AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_request(payload)?).await?;
    read_status(stream).await
}

async fn read_status<S>(stream: &mut S) -> Result<(), AdbError>
where
    S: AsyncRead + Unpin,
{
    let mut status = [0u8; 4];
    stream.read_exact(&mut status).await?;
    if &status == ADB_OKAY {
        return Ok(());
    }
    if &status != ADB_FAIL {
        return Err(AdbError::UnexpectedStatus(
            String::from_utf8_lossy(&status).into_owned(),
        ));
    }

    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await?;
    let length = parse_length_prefix(&prefix)?;
    let mut message = vec![0u8; length];
    stream.read_exact(&mut message).await?;
    Err(AdbError::Refused(
        String::from_utf8_lossy(&message).into_owned(),
    ))
}

/// Turns `host:track-devices` snapshots into online/offline events
pub struct AdbTracker<S> {
    frames: FramedRead<S, AdbCodec>,
    online: BTreeMap<String, bool>,
    pending: VecDeque<DeviceEvent>,
}

impl<S> AdbTracker<S>
where
    S: AsyncRead + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            frames: FramedRead::new(stream, AdbCodec::new()),
            online: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Start from devices already known to be online, so the first snapshot
    /// reports the ones that disappeared in the meantime as offline
    pub fn with_known_online<I>(mut self, serials: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.online = serials.into_iter().map(|serial| (serial, true)).collect();
        self
    }

    /// Serials online in the latest snapshot
    pub fn online_serials(&self) -> BTreeSet<String> {
        self.online
            .iter()
            .filter(|(_, online)| **online)
            .map(|(serial, _)| serial.clone())
            .collect()
    }

    fn apply_snapshot(&mut self, payload: &str) {
        let current: BTreeMap<String, bool> = parse_device_list(payload)
            .into_iter()
            .map(|(serial, state)| (serial, state.is_online()))
            .collect();

        for (serial, was_online) in &self.online {
            let now_online = current.get(serial).copied().unwrap_or(false);
            if *was_online != now_online {
                self.pending.push_back(transition(serial, *was_online, now_online));
            }
        }
        for (serial, now_online) in &current {
            if *now_online && !self.online.contains_key(serial) {
                self.pending.push_back(transition(serial, false, true));
            }
        }

        self.online = current;
    }
}

fn transition(serial: &str, was_online: bool, now_online: bool) -> DeviceEvent {
    let state = |online| {
        if online {
            DeviceState::Online
        } else {
            DeviceState::Offline
        }
    };
    DeviceEvent {
        key: DeviceKey::from(serial),
        previous: state(was_online),
        current: state(now_online),
    }
}

#[async_trait]
impl<S> DiscoveryFeed for AdbTracker<S>
where
    S: AsyncRead + Unpin + Send,
{
    async fn next_event(&mut self) -> Result<Option<DeviceEvent>, DiscoveryError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            match self.frames.next().await {
                Some(snapshot) => self.apply_snapshot(&snapshot?),
                None => return Ok(None),
            }
        }
    }
}

/// Follows the ADB device feed across reconnections to the ADB server
pub struct AdbDiscovery {
    adb: AdbClient,
    online: BTreeSet<String>,
}

impl AdbDiscovery {
    pub fn new(adb: AdbClient) -> Self {
        Self {
            adb,
            online: BTreeSet::new(),
        }
    }

    /// Subscribe once and feed events to `manager` until the feed ends.
    ///
    /// Devices that were online with a registered tunnel when the previous
    /// feed ended seed the new tracker, so any of them missing from the first
    /// snapshot is reported offline. Online devices without a tunnel are
    /// reported online again.
    pub async fn run_once(
        &mut self,
        manager: &Arc<DeviceTunnelManager>,
    ) -> Result<(), DiscoveryError> {
        let known: Vec<String> = self
            .online
            .iter()
            .filter(|serial| manager.registry().has(&DeviceKey::from(serial.as_str())))
            .cloned()
            .collect();
        let mut tracker = self.adb.track_devices().await?.with_known_online(known);
        let result = manager.run_discovery(&mut tracker).await;
        self.online = tracker.online_serials();
        result
    }

    /// Keep following the ADB server, waiting `retry` between attempts
    pub async fn run(mut self, manager: Arc<DeviceTunnelManager>, retry: Duration) {
        loop {
            match self.run_once(&manager).await {
                Ok(()) => tracing::warn!("ADB server closed the device feed"),
                Err(DiscoveryError::Adb(AdbError::Io(e))) => {
                    tracing::warn!("Cannot reach ADB server at {}: {}", self.adb.addr(), e)
                }
                Err(e) => tracing::warn!("ADB device feed failed: {}", e),
            }
            tokio::time::sleep(retry).await;
        }
    }
}

/// Reads identifiers over ADB and looks registrations up in the control API
pub struct AdbIdentityResolver {
    adb: AdbClient,
    api: Arc<ControlApiClient>,
}

impl AdbIdentityResolver {
    pub fn new(adb: AdbClient, api: Arc<ControlApiClient>) -> Self {
        Self { adb, api }
    }
}

#[async_trait]
impl IdentityResolver for AdbIdentityResolver {
    async fn resolve_identifiers(
        &self,
        key: &DeviceKey,
    ) -> Result<DeviceIdentifiers, IdentityError> {
        let serial = self.adb.shell(key.as_str(), "getprop ro.serialno").await?;
        if serial.is_empty() {
            return Err(IdentityError::Unresolvable(key.clone()));
        }

        let hardware_id = match self
            .adb
            .shell(key.as_str(), "settings get secure android_id")
            .await
        {
            Ok(id) if !id.is_empty() && id != "null" => Some(id),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("No android_id for {}: {}", key, e);
                None
            }
        };

        Ok(DeviceIdentifiers {
            serial,
            hardware_id,
            cached_cloud_id: None,
        })
    }

    async fn lookup_registered_device(
        &self,
        serial: &str,
        hardware_id: Option<&str>,
    ) -> Result<Vec<CloudDeviceId>, IdentityError> {
        Ok(self.api.find_devices(serial, hardware_id).await?)
    }
}
