use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Binary signature that opens every PROXY v2 header
const V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";

/// Fixed part of a v2 header: signature, version/command, family, length
const V2_HEADER_LEN: usize = 16;

const V1_PREFIX: &[u8] = b"PROXY ";

/// Longest legal v1 line, CRLF included
const V1_MAX_LEN: usize = 107;

/// TLV type carrying the host name the client asked for
pub const PP2_TYPE_AUTHORITY: u8 = 0x02;

/// Errors that can occur while reading or writing a routing header
#[derive(Debug, Error)]
pub enum ProxyHeaderError {
    #[error("Stream does not start with a PROXY protocol header")]
    InvalidSignature,

    #[error("PROXY v1 header exceeds 107 bytes")]
    TooLong,

    #[error("Unsupported PROXY protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed PROXY header: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn malformed(reason: impl Into<String>) -> ProxyHeaderError {
    ProxyHeaderError::Malformed(reason.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    /// Connection made by the proxy itself (health checks); addresses are meaningless
    Local,
    /// Connection relayed on behalf of a client
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyTransport {
    Unspecified,
    Stream,
    Datagram,
}

/// A v2 type-length-value extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub kind: u8,
    pub value: Bytes,
}

/// Routing header found at the start of every tunneled stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: ProxyVersion,
    pub command: ProxyCommand,
    pub transport: ProxyTransport,
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
    pub tlvs: Vec<Tlv>,
}

impl ProxyHeader {
    /// A binary (v2) header for a relayed TCP connection
    pub fn v2(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            version: ProxyVersion::V2,
            command: ProxyCommand::Proxy,
            transport: ProxyTransport::Stream,
            source: Some(source),
            destination: Some(destination),
            tlvs: Vec::new(),
        }
    }

    /// A text (v1) header for a relayed TCP connection
    pub fn v1(source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            version: ProxyVersion::V1,
            ..Self::v2(source, destination)
        }
    }

    /// Attach an authority TLV (only serialized by v2 headers)
    pub fn with_authority(mut self, authority: &str) -> Self {
        self.tlvs.push(Tlv {
            kind: PP2_TYPE_AUTHORITY,
            value: Bytes::copy_from_slice(authority.as_bytes()),
        });
        self
    }

    pub fn tlv(&self, kind: u8) -> Option<&Tlv> {
        self.tlvs.iter().find(|tlv| tlv.kind == kind)
    }

    /// The authority extension, if present and valid UTF-8
    pub fn authority(&self) -> Option<&str> {
        self.tlv(PP2_TYPE_AUTHORITY)
            .and_then(|tlv| std::str::from_utf8(&tlv.value).ok())
            .filter(|authority| !authority.is_empty())
    }
}

/// Decodes (and, for the access point side, encodes) PROXY protocol headers.
///
/// The decoder yields exactly one header and leaves any bytes that follow it
/// in the buffer, so callers can use `FramedRead::into_parts` to recover the
/// start of the payload.
#[derive(Debug, Default)]
pub struct ProxyHeaderCodec {
    _private: (),
}

impl ProxyHeaderCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

/// True when `src` and `expected` agree over their common length
fn agrees_with(src: &[u8], expected: &[u8]) -> bool {
    let n = src.len().min(expected.len());
    src[..n] == expected[..n]
}

impl Decoder for ProxyHeaderCodec {
    type Item = ProxyHeader;
    type Error = ProxyHeaderError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if agrees_with(src, &V2_SIGNATURE) {
            decode_v2(src)
        } else if agrees_with(src, V1_PREFIX) {
            decode_v1(src)
        } else {
            Err(ProxyHeaderError::InvalidSignature)
        }
    }
}

fn decode_v1(src: &mut BytesMut) -> Result<Option<ProxyHeader>, ProxyHeaderError> {
    let window = &src[..src.len().min(V1_MAX_LEN)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        if src.len() >= V1_MAX_LEN {
            return Err(ProxyHeaderError::TooLong);
        }
        return Ok(None);
    };

    let line = src.split_to(end + 2);
    let text = std::str::from_utf8(&line[..end]).map_err(|_| malformed("v1 header is not ASCII"))?;
    parse_v1_line(text).map(Some)
}

fn parse_v1_line(line: &str) -> Result<ProxyHeader, ProxyHeaderError> {
    let mut parts = line.split(' ').skip(1);

    let protocol = parts.next().ok_or_else(|| malformed("missing protocol"))?;
    match protocol {
        "UNKNOWN" => {
            return Ok(ProxyHeader {
                version: ProxyVersion::V1,
                command: ProxyCommand::Proxy,
                transport: ProxyTransport::Unspecified,
                source: None,
                destination: None,
                tlvs: Vec::new(),
            })
        }
        "TCP4" | "TCP6" => {}
        other => return Err(malformed(format!("unknown v1 protocol {:?}", other))),
    }

    let fields: Vec<&str> = parts.collect();
    let [src_ip, dst_ip, src_port, dst_port] = fields.as_slice() else {
        return Err(malformed(format!(
            "expected 4 address fields, found {}",
            fields.len()
        )));
    };

    let src_ip: IpAddr = src_ip
        .parse()
        .map_err(|_| malformed(format!("bad source address {:?}", src_ip)))?;
    let dst_ip: IpAddr = dst_ip
        .parse()
        .map_err(|_| malformed(format!("bad destination address {:?}", dst_ip)))?;
    let src_port: u16 = src_port
        .parse()
        .map_err(|_| malformed(format!("bad source port {:?}", src_port)))?;
    let dst_port: u16 = dst_port
        .parse()
        .map_err(|_| malformed(format!("bad destination port {:?}", dst_port)))?;

    let family_matches = match protocol {
        "TCP4" => src_ip.is_ipv4() && dst_ip.is_ipv4(),
        _ => src_ip.is_ipv6() && dst_ip.is_ipv6(),
    };
    if !family_matches {
        return Err(malformed(format!(
            "addresses do not match protocol {}",
            protocol
        )));
    }

    Ok(ProxyHeader {
        version: ProxyVersion::V1,
        command: ProxyCommand::Proxy,
        transport: ProxyTransport::Stream,
        source: Some(SocketAddr::new(src_ip, src_port)),
        destination: Some(SocketAddr::new(dst_ip, dst_port)),
        tlvs: Vec::new(),
    })
}

fn decode_v2(src: &mut BytesMut) -> Result<Option<ProxyHeader>, ProxyHeaderError> {
    if src.len() < V2_HEADER_LEN {
        return Ok(None);
    }

    let version = src[12] >> 4;
    if version != 2 {
        return Err(ProxyHeaderError::UnsupportedVersion(version));
    }

    let command = match src[12] & 0x0f {
        0x0 => ProxyCommand::Local,
        0x1 => ProxyCommand::Proxy,
        other => return Err(malformed(format!("unknown command {:#x}", other))),
    };

    let family = src[13] >> 4;
    let transport = match src[13] & 0x0f {
        0x0 => ProxyTransport::Unspecified,
        0x1 => ProxyTransport::Stream,
        0x2 => ProxyTransport::Datagram,
        other => return Err(malformed(format!("unknown transport {:#x}", other))),
    };

    let length = u16::from_be_bytes([src[14], src[15]]) as usize;
    let total_len = V2_HEADER_LEN + length;
    if src.len() < total_len {
        src.reserve(total_len - src.len());
        return Ok(None);
    }

    src.advance(V2_HEADER_LEN);
    let mut body = src.split_to(length).freeze();

    let address_len = match family {
        0x0 => 0,
        0x1 => 12,
        0x2 => 36,
        0x3 => 216,
        other => return Err(malformed(format!("unknown address family {:#x}", other))),
    };
    if body.len() < address_len {
        return Err(malformed("address block truncated"));
    }

    let (source, destination) = match family {
        0x1 => {
            let src_ip = Ipv4Addr::from(body.get_u32());
            let dst_ip = Ipv4Addr::from(body.get_u32());
            let src_port = body.get_u16();
            let dst_port = body.get_u16();
            (
                Some(SocketAddr::new(src_ip.into(), src_port)),
                Some(SocketAddr::new(dst_ip.into(), dst_port)),
            )
        }
        0x2 => {
            let src_ip = Ipv6Addr::from(body.get_u128());
            let dst_ip = Ipv6Addr::from(body.get_u128());
            let src_port = body.get_u16();
            let dst_port = body.get_u16();
            (
                Some(SocketAddr::new(src_ip.into(), src_port)),
                Some(SocketAddr::new(dst_ip.into(), dst_port)),
            )
        }
        // Unix sockets and unspecified families carry nothing we can dial
        _ => {
            body.advance(address_len);
            (None, None)
        }
    };

    let tlvs = parse_tlvs(body)?;

    // LOCAL connections keep their TLVs but their addresses must be ignored
    let (source, destination) = match command {
        ProxyCommand::Local => (None, None),
        ProxyCommand::Proxy => (source, destination),
    };

    Ok(Some(ProxyHeader {
        version: ProxyVersion::V2,
        command,
        transport,
        source,
        destination,
        tlvs,
    }))
}

fn parse_tlvs(mut body: Bytes) -> Result<Vec<Tlv>, ProxyHeaderError> {
    let mut tlvs = Vec::new();
    while body.has_remaining() {
        if body.len() < 3 {
            return Err(malformed("truncated TLV header"));
        }
        let kind = body.get_u8();
        let len = body.get_u16() as usize;
        if body.len() < len {
            return Err(malformed(format!("TLV {:#04x} truncated", kind)));
        }
        tlvs.push(Tlv {
            kind,
            value: body.split_to(len),
        });
    }
    Ok(tlvs)
}

impl Encoder<ProxyHeader> for ProxyHeaderCodec {
    type Error = ProxyHeaderError;

    fn encode(&mut self, header: ProxyHeader, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match header.version {
            ProxyVersion::V1 => encode_v1(&header, dst),
            ProxyVersion::V2 => encode_v2(&header, dst),
        }
    }
}

fn encode_v1(header: &ProxyHeader, dst: &mut BytesMut) -> Result<(), ProxyHeaderError> {
    let line = match (header.source, header.destination) {
        (Some(src), Some(dst)) if src.is_ipv4() && dst.is_ipv4() => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            src.ip(),
            dst.ip(),
            src.port(),
            dst.port()
        ),
        (Some(src), Some(dst)) if src.is_ipv6() && dst.is_ipv6() => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            src.ip(),
            dst.ip(),
            src.port(),
            dst.port()
        ),
        (None, None) => "PROXY UNKNOWN\r\n".to_string(),
        _ => return Err(malformed("source and destination families differ")),
    };
    dst.extend_from_slice(line.as_bytes());
    Ok(())
}

fn encode_v2(header: &ProxyHeader, dst: &mut BytesMut) -> Result<(), ProxyHeaderError> {
    let mut body = BytesMut::new();

    let family = match (header.source, header.destination) {
        (Some(SocketAddr::V4(src)), Some(SocketAddr::V4(dst))) => {
            body.put_slice(&src.ip().octets());
            body.put_slice(&dst.ip().octets());
            body.put_u16(src.port());
            body.put_u16(dst.port());
            0x10
        }
        (Some(SocketAddr::V6(src)), Some(SocketAddr::V6(dst))) => {
            body.put_slice(&src.ip().octets());
            body.put_slice(&dst.ip().octets());
            body.put_u16(src.port());
            body.put_u16(dst.port());
            0x20
        }
        (None, None) => 0x00,
        _ => return Err(malformed("source and destination families differ")),
    };

    for tlv in &header.tlvs {
        let len = u16::try_from(tlv.value.len())
            .map_err(|_| malformed(format!("TLV {:#04x} too large", tlv.kind)))?;
        body.put_u8(tlv.kind);
        body.put_u16(len);
        body.put_slice(&tlv.value);
    }

    let length = u16::try_from(body.len()).map_err(|_| malformed("v2 header too large"))?;

    let command = match header.command {
        ProxyCommand::Local => 0x20,
        ProxyCommand::Proxy => 0x21,
    };
    let transport = match (family, header.transport) {
        (0x00, _) | (_, ProxyTransport::Unspecified) => 0x0,
        (_, ProxyTransport::Stream) => 0x1,
        (_, ProxyTransport::Datagram) => 0x2,
    };

    dst.reserve(V2_HEADER_LEN + body.len());
    dst.put_slice(&V2_SIGNATURE);
    dst.put_u8(command);
    dst.put_u8(family | transport);
    dst.put_u16(length);
    dst.put_slice(&body);
    Ok(())
}
