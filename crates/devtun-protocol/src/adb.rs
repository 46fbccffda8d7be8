//! ADB host protocol framing
//!
//! Requests to the ADB server are a 4 hex digit length followed by the
//! payload. The server answers `OKAY` or `FAIL`, and a `FAIL` is followed by a
//! length-prefixed message. Long-lived services such as `host:track-devices`
//! keep sending length-prefixed payloads after the initial `OKAY`.
//!
//! ```text
//! +------------------+--------------------+
//! | Length (4 ASCII  | Payload            |
//! | hex digits)      | (variable)         |
//! +------------------+--------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

pub const ADB_OKAY: &[u8; 4] = b"OKAY";
pub const ADB_FAIL: &[u8; 4] = b"FAIL";

/// Largest payload a 4 hex digit prefix can describe
const MAX_PAYLOAD: usize = 0xffff;

#[derive(Debug, Error)]
pub enum AdbError {
    #[error("ADB request too long: {0} bytes")]
    RequestTooLong(usize),

    #[error("Invalid ADB length prefix: {0:?}")]
    InvalidLength(String),

    #[error("ADB server refused request: {0}")]
    Refused(String),

    #[error("Unexpected ADB status: {0:?}")]
    UnexpectedStatus(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame a host request (`host:version`, `host:transport:<serial>`, `shell:<cmd>`, ...)
pub fn encode_request(payload: &str) -> Result<BytesMut, AdbError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(AdbError::RequestTooLong(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_slice(format!("{:04x}", payload.len()).as_bytes());
    buf.put_slice(payload.as_bytes());
    Ok(buf)
}

/// Parse a 4 byte length prefix. Only ASCII hex digits are accepted.
pub fn parse_length_prefix(prefix: &[u8]) -> Result<usize, AdbError> {
    let invalid = || AdbError::InvalidLength(String::from_utf8_lossy(prefix).into_owned());
    if prefix.len() != 4 || !prefix.iter().all(u8::is_ascii_hexdigit) {
        return Err(invalid());
    }
    let digits = std::str::from_utf8(prefix).map_err(|_| invalid())?;
    usize::from_str_radix(digits, 16).map_err(|_| invalid())
}

/// Decoder for length-prefixed ADB payloads
#[derive(Debug, Default)]
pub struct AdbCodec {
    _private: (),
}

impl AdbCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for AdbCodec {
    type Item = String;
    type Error = AdbError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = parse_length_prefix(&src[..4])?;

        let total_len = 4 + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(length);
        Ok(Some(String::from_utf8_lossy(&payload).into_owned()))
    }
}

/// Connection state of a device as reported by `host:track-devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdbDeviceState {
    Device,
    Offline,
    Unauthorized,
    Authorizing,
    Connecting,
    Recovery,
    Sideload,
    Bootloader,
    NoPermissions,
    Other(String),
}

impl AdbDeviceState {
    pub fn parse(state: &str) -> Self {
        match state {
            "device" => Self::Device,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            "authorizing" => Self::Authorizing,
            "connecting" => Self::Connecting,
            "recovery" => Self::Recovery,
            "sideload" => Self::Sideload,
            "bootloader" => Self::Bootloader,
            s if s.starts_with("no permissions") => Self::NoPermissions,
            other => Self::Other(other.to_string()),
        }
    }

    /// Only fully booted, authorized devices can carry a tunnel
    pub fn is_online(&self) -> bool {
        matches!(self, Self::Device)
    }
}

/// Parse one device list (`<serial>\t<state>\n` per device)
pub fn parse_device_list(payload: &str) -> Vec<(String, AdbDeviceState)> {
    payload
        .lines()
        .filter_map(|line| {
            let (serial, state) = line.split_once('\t')?;
            let serial = serial.trim();
            if serial.is_empty() {
                return None;
            }
            Some((serial.to_string(), AdbDeviceState::parse(state.trim())))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request() {
        let buf = encode_request("host:track-devices").unwrap();
        assert_eq!(&buf[..], b"0012host:track-devices");
    }

    #[test]
    fn test_encode_request_too_long() {
        let payload = "x".repeat(MAX_PAYLOAD + 1);
        assert!(matches!(
            encode_request(&payload),
            Err(AdbError::RequestTooLong(_))
        ));
    }

    #[test]
    fn test_decode_track_devices_updates() {
        let first = "emulator-5554\tdevice\nR58M123\tunauthorized\n";
        let second = "";

        let mut buf = BytesMut::new();
        buf.put_slice(format!("{:04x}{}", first.len(), first).as_bytes());
        buf.put_slice(b"0000");

        let mut codec = AdbCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(second));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_partial_payload() {
        let mut codec = AdbCodec::new();
        let mut buf = BytesMut::from(&b"000aabc"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(b"defghij");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("abcdefghij"));
    }

    #[test]
    fn test_decode_invalid_prefix() {
        let mut codec = AdbCodec::new();
        let mut buf = BytesMut::from(&b"zzzzpayload"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(AdbError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_length_prefix_rejects_sign() {
        assert!(matches!(
            parse_length_prefix(b"+00a"),
            Err(AdbError::InvalidLength(p)) if p == "+00a"
        ));
        assert!(parse_length_prefix(b" 00a").is_err());
        assert!(parse_length_prefix(b"00a").is_err());
        assert_eq!(parse_length_prefix(b"00aF").unwrap(), 0xaf);

        let mut codec = AdbCodec::new();
        let mut buf = BytesMut::from(&b"+005hello"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(AdbError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_parse_device_list() {
        let devices = parse_device_list(
            "emulator-5554\tdevice\nR58M123\toffline\n0123\tno permissions (user not in plugdev)\n\n",
        );
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].0, "emulator-5554");
        assert!(devices[0].1.is_online());
        assert_eq!(devices[1].1, AdbDeviceState::Offline);
        assert_eq!(devices[2].1, AdbDeviceState::NoPermissions);
        assert!(!devices[2].1.is_online());
    }
}
