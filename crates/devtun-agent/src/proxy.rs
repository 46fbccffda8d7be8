//! Relay of tunneled streams to local services
//!
//! Every stream the access point opens starts with a PROXY protocol header
//! naming the original client and the destination. The agent reads that
//! header, dials the destination on the device side and copies bytes both
//! ways until either side finishes.

use std::net::SocketAddr;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use devtun_protocol::{ProxyHeader, ProxyHeaderCodec, ProxyHeaderError};

use crate::types::DeviceKey;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Stream ended before a PROXY header arrived")]
    MissingHeader,

    #[error("Invalid PROXY header: {0}")]
    Header(#[from] ProxyHeaderError),

    #[error("PROXY header carries no destination address")]
    NoDestination,

    #[error("Wildcard destination without an authority TLV")]
    MissingAuthority,

    #[error("Failed to resolve {authority}: {source}")]
    Resolve {
        authority: String,
        source: std::io::Error,
    },

    #[error("No addresses found for {0}")]
    NoAddress(String),

    #[error("Failed to connect to {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Host part of an authority value, without any `:port` suffix
fn authority_host(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => authority,
    }
}

/// Address to dial for a decoded header.
///
/// A wildcard destination (`0.0.0.0` or `::`) means the access point could
/// not name a concrete address; the authority TLV then carries the host name,
/// which is resolved here and combined with the header's port.
pub async fn resolve_destination(header: &ProxyHeader) -> Result<SocketAddr, ProxyError> {
    let destination = header.destination.ok_or(ProxyError::NoDestination)?;
    if !destination.ip().is_unspecified() {
        return Ok(destination);
    }

    let authority = header.authority().ok_or(ProxyError::MissingAuthority)?;
    let host = authority_host(authority);
    let mut addrs = tokio::net::lookup_host((host, destination.port()))
        .await
        .map_err(|source| ProxyError::Resolve {
            authority: authority.to_string(),
            source,
        })?;
    addrs
        .next()
        .ok_or_else(|| ProxyError::NoAddress(authority.to_string()))
}

/// Serve one tunneled stream: decode its header, dial, relay
pub async fn proxy_stream<S>(
    key: &DeviceKey,
    stream_id: u32,
    stream: S,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = FramedRead::new(stream, ProxyHeaderCodec::new());
    let header = framed.next().await.ok_or(ProxyError::MissingHeader)??;
    // Bytes read past the header belong to the payload
    let parts = framed.into_parts();
    let (stream, early_data) = (parts.io, parts.read_buf);

    let addr = resolve_destination(&header).await?;
    tracing::debug!(
        "Stream {} on {}: {:?} -> {}",
        stream_id,
        key,
        header.source,
        addr
    );

    let mut upstream = TcpStream::connect(addr)
        .await
        .map_err(|source| ProxyError::Dial { addr, source })?;
    if !early_data.is_empty() {
        upstream.write_all(&early_data).await?;
    }

    relay(stream_id, stream, upstream).await;
    Ok(())
}

/// Copy both directions until one of them reaches EOF or fails, then close
/// both write sides so the other copy unblocks
async fn relay<S>(stream_id: u32, stream: S, upstream: TcpStream)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(stream);
    let (mut local_read, mut local_write) = upstream.into_split();

    tokio::select! {
        result = tokio::io::copy(&mut tunnel_read, &mut local_write) => match result {
            Ok(n) => tracing::debug!("Stream {}: tunnel side finished after {} bytes", stream_id, n),
            Err(e) => tracing::debug!("Stream {}: tunnel -> local copy ended: {}", stream_id, e),
        },
        result = tokio::io::copy(&mut local_read, &mut tunnel_write) => match result {
            Ok(n) => tracing::debug!("Stream {}: local side finished after {} bytes", stream_id, n),
            Err(e) => tracing::debug!("Stream {}: local -> tunnel copy ended: {}", stream_id, e),
        },
    }

    if let Err(e) = local_write.shutdown().await {
        tracing::debug!("Stream {}: local shutdown failed: {}", stream_id, e);
    }
    if let Err(e) = tunnel_write.shutdown().await {
        tracing::debug!("Stream {}: tunnel shutdown failed: {}", stream_id, e);
    }
}
