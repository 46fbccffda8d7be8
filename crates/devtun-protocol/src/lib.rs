//! Wire formats used by the devtun agent
//!
//! - [`proxy_header`]: the per-stream routing header (PROXY protocol v1/v2)
//!   that the access point writes at the start of every tunneled stream.
//! - [`adb`]: the Android Debug Bridge host protocol used to discover devices
//!   and read their hardware identifiers.

pub mod adb;
pub mod proxy_header;

pub use adb::{
    encode_request, parse_device_list, parse_length_prefix, AdbCodec, AdbDeviceState, AdbError,
    ADB_FAIL, ADB_OKAY,
};
pub use proxy_header::{
    ProxyCommand, ProxyHeader, ProxyHeaderCodec, ProxyHeaderError, ProxyTransport, ProxyVersion,
    Tlv, PP2_TYPE_AUTHORITY,
};
