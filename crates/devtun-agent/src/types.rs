//! Identifiers and records shared across the agent

use std::fmt;

use serde::{Deserialize, Serialize};

/// Local name of a device: an ADB serial or a configured desktop key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey(String);

impl DeviceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for DeviceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Identifier the control plane assigned to a registered device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloudDeviceId(String);

impl CloudDeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CloudDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CloudDeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Online,
    Offline,
}

/// A device changed state on the discovery feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub key: DeviceKey,
    pub previous: DeviceState,
    pub current: DeviceState,
}

impl DeviceEvent {
    pub fn online(key: impl Into<DeviceKey>) -> Self {
        Self {
            key: key.into(),
            previous: DeviceState::Offline,
            current: DeviceState::Online,
        }
    }

    pub fn offline(key: impl Into<DeviceKey>) -> Self {
        Self {
            key: key.into(),
            previous: DeviceState::Online,
            current: DeviceState::Offline,
        }
    }
}

/// What a device reports about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentifiers {
    /// Hardware serial number
    pub serial: String,
    /// Platform hardware id (Android ID), when readable
    pub hardware_id: Option<String>,
    /// Cloud id remembered from an earlier registration
    pub cached_cloud_id: Option<CloudDeviceId>,
}

/// A cloud endpoint that terminates device tunnels
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessPoint {
    /// Upgrade URL (`http`, `https`, `ws` or `wss`)
    pub endpoint: String,
    /// Value sent in the `Upgrade` header
    pub protocol: String,
    #[serde(default)]
    pub metadata: AccessPointMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccessPointMetadata {
    pub region: Option<String>,
    pub name: Option<String>,
}
