//! Tunnel handshake: HTTP/1.1 upgrade to an access point
//!
//! The agent dials the access point, sends `GET <path>` with
//! `Connection: upgrade`, the access point's protocol name in `Upgrade` and
//! the tunnel token as a bearer credential. A `101 Switching Protocols`
//! answer turns the connection into the device's multiplexed session; any
//! other status fails the attempt.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{AUTHORIZATION, CONNECTION, HOST, UPGRADE, USER_AGENT};
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::mux::MuxSession;
use crate::session::DeviceSession;
use crate::types::{AccessPoint, DeviceKey};

#[derive(Debug, Error)]
pub enum EstablishError {
    #[error("Invalid access point endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Failed to build handshake request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        source: std::io::Error,
    },

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Access point refused the upgrade with {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),
}

fn invalid(endpoint: &str, reason: impl Into<String>) -> EstablishError {
    EstablishError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.into(),
    }
}

/// Where and how to dial an access point
#[derive(Debug, PartialEq, Eq)]
struct Target {
    tls: bool,
    host: String,
    port: u16,
    authority: String,
    path: String,
}

fn parse_endpoint(endpoint: &str) -> Result<Target, EstablishError> {
    let uri: Uri = endpoint
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| invalid(endpoint, e.to_string()))?;

    let tls = match uri.scheme_str() {
        Some("https") | Some("wss") => true,
        Some("http") | Some("ws") => false,
        Some(other) => return Err(invalid(endpoint, format!("unsupported scheme {}", other))),
        None => return Err(invalid(endpoint, "missing scheme")),
    };

    let authority = uri
        .authority()
        .ok_or_else(|| invalid(endpoint, "missing host"))?;
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = authority.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());

    Ok(Target {
        tls,
        host,
        port,
        authority: authority.as_str().to_string(),
        path,
    })
}

/// Dials access points and upgrades the connection into a device session
pub struct TunnelEstablisher {
    tls: TlsConnector,
    client_id: String,
    timeout: Duration,
}

impl TunnelEstablisher {
    pub fn new(
        tls_config: Arc<rustls::ClientConfig>,
        client_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            tls: TlsConnector::from(tls_config),
            client_id: client_id.into(),
            timeout,
        }
    }

    /// Open a tunnel for `key` at `access_point`, authorized by `token`.
    ///
    /// The returned session carries no registry token yet.
    pub async fn establish(
        &self,
        key: &DeviceKey,
        access_point: &AccessPoint,
        token: &str,
    ) -> Result<DeviceSession, EstablishError> {
        let upgraded = tokio::time::timeout(self.timeout, self.handshake(access_point, token))
            .await
            .map_err(|_| EstablishError::Timeout(self.timeout))??;

        tracing::info!(
            "Tunnel for {} upgraded at {} ({})",
            key,
            access_point.endpoint,
            access_point.protocol
        );

        let mux = MuxSession::server(TokioIo::new(upgraded));
        Ok(DeviceSession::new(key.clone(), access_point.endpoint.clone(), mux))
    }

    async fn handshake(
        &self,
        access_point: &AccessPoint,
        token: &str,
    ) -> Result<Upgraded, EstablishError> {
        let target = parse_endpoint(&access_point.endpoint)?;

        let request = Request::builder()
            .method(Method::GET)
            .uri(target.path.as_str())
            .header(HOST, target.authority.as_str())
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, access_point.protocol.as_str())
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(USER_AGENT, self.client_id.as_str())
            .body(Empty::<Bytes>::new())?;

        tracing::debug!("Dialing access point {}:{}", target.host, target.port);
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|source| EstablishError::Dial {
                addr: target.authority.clone(),
                source,
            })?;

        if target.tls {
            let server_name = ServerName::try_from(target.host.clone())
                .map_err(|_| invalid(&access_point.endpoint, "host is not a valid TLS name"))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|source| EstablishError::Tls {
                    host: target.host.clone(),
                    source,
                })?;
            send_upgrade(tls_stream, request).await
        } else {
            send_upgrade(stream, request).await
        }
    }
}

async fn send_upgrade<S>(
    io: S,
    request: Request<Empty<Bytes>>,
) -> Result<Upgraded, EstablishError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            tracing::debug!("Handshake connection ended: {}", e);
        }
    });

    let response = sender.send_request(request).await?;
    let status = response.status();
    if status != StatusCode::SWITCHING_PROTOCOLS {
        let body = match response.into_body().collect().await {
            Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
            Err(e) => format!("<unreadable body: {}>", e),
        };
        return Err(EstablishError::Rejected { status, body });
    }

    Ok(hyper::upgrade::on(response).await?)
}
