//! devtun agent library
//!
//! Keeps a reverse tunnel open from every attached device to a cloud access
//! point and relays the streams the access point opens to services on the
//! device side. It can be embedded in other applications or driven directly
//! from tests.

mod adb;
mod collaborators;
mod config;
mod control_api;
mod establish;
mod locks;
mod manager;
mod mux;
mod proxy;
mod registry;
mod session;
mod types;

// Re-export public types
pub use adb::{AdbClient, AdbDiscovery, AdbIdentityResolver, AdbTracker};
pub use collaborators::{
    AccessPointDirectory, DirectoryError, DiscoveryError, DiscoveryFeed, IdentityError,
    IdentityResolver,
};
pub use config::{AgentConfig, ResolvedAgentConfig};
pub use control_api::{ApiError, ControlApiClient};
pub use establish::{EstablishError, TunnelEstablisher};
pub use locks::{KeyGuard, KeyedLocks};
pub use manager::{ConnectError, DeviceTunnelManager};
pub use mux::{Mode, MuxError, MuxSession, MuxStream, StreamId};
pub use proxy::{proxy_stream, resolve_destination, ProxyError};
pub use registry::{IdentityMap, SessionRegistry};
pub use session::{DeviceSession, SessionToken};
pub use types::{
    AccessPoint, AccessPointMetadata, CloudDeviceId, DeviceEvent, DeviceIdentifiers, DeviceKey,
    DeviceState,
};
