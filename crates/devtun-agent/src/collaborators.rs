//! Seams to the outside world the tunnel manager depends on
//!
//! Device discovery, identity lookup and the access point directory each sit
//! behind a trait so the manager can run against ADB and the control API in
//! production, or against in-memory mocks in tests.

use async_trait::async_trait;
use devtun_protocol::AdbError;
use thiserror::Error;

use crate::control_api::ApiError;
use crate::types::{AccessPoint, CloudDeviceId, DeviceEvent, DeviceIdentifiers, DeviceKey};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("ADB error: {0}")]
    Adb(#[from] AdbError),

    #[error("Discovery feed failed: {0}")]
    Feed(String),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Device {0} reported no usable identifiers")]
    Unresolvable(DeviceKey),

    #[error("ADB error: {0}")]
    Adb(#[from] AdbError),

    #[error("Control API error: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Control API error: {0}")]
    Api(#[from] ApiError),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Ordered stream of device state changes
#[async_trait]
pub trait DiscoveryFeed: Send {
    /// Next event, or `None` once the feed has ended
    async fn next_event(&mut self) -> Result<Option<DeviceEvent>, DiscoveryError>;
}

/// Maps a local device to its cloud registration
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Read identifiers from the device itself
    async fn resolve_identifiers(&self, key: &DeviceKey)
        -> Result<DeviceIdentifiers, IdentityError>;

    /// Registered cloud devices matching these identifiers, best match first.
    ///
    /// An empty list means the device is not registered.
    async fn lookup_registered_device(
        &self,
        serial: &str,
        hardware_id: Option<&str>,
    ) -> Result<Vec<CloudDeviceId>, IdentityError>;
}

/// Lists access points and issues per-device tunnel tokens
#[async_trait]
pub trait AccessPointDirectory: Send + Sync {
    /// Available access points, preferred first
    async fn list_access_points(&self) -> Result<Vec<AccessPoint>, DirectoryError>;

    /// Short-lived bearer token authorizing `device` at `endpoint`
    async fn issue_token(
        &self,
        device: &CloudDeviceId,
        endpoint: &str,
    ) -> Result<String, DirectoryError>;
}
