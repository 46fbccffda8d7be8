//! In-process access point for E2E tests
//!
//! Accepts the agent's HTTP/1.1 upgrade, records what the agent sent, and
//! takes the opening side of the multiplexed session so tests can push
//! streams with PROXY headers towards the device.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderName, AUTHORIZATION, CONNECTION, UPGRADE, USER_AGENT};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;

use devtun_agent::{AccessPoint, AccessPointMetadata, MuxSession, MuxStream};
use devtun_protocol::{ProxyHeader, ProxyHeaderCodec};

use crate::harness::wait_until;

/// Protocol name the mock access point advertises
pub const TUNNEL_PROTOCOL: &str = "devtun-mux";

/// Headers of one upgrade request as the access point saw them
#[derive(Clone, Debug)]
pub struct RecordedHandshake {
    pub path: String,
    pub authorization: Option<String>,
    pub upgrade: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Default)]
struct AccessPointState {
    handshakes: RwLock<Vec<RecordedHandshake>>,
    sessions: RwLock<Vec<Arc<MuxSession>>>,
    upgrades: AtomicUsize,
    reject_with: RwLock<Option<StatusCode>>,
}

pub struct MockAccessPoint {
    addr: SocketAddr,
    state: Arc<AccessPointState>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl MockAccessPoint {
    /// Start an access point on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock access point");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AccessPointState::default());
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let server_state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Mock access point shutting down");
                        break;
                    }
                    result = listener.accept() => match result {
                        Ok((stream, _)) => {
                            tokio::spawn(serve_connection(stream, server_state.clone()));
                        }
                        Err(e) => {
                            tracing::error!("Access point accept error: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        tracing::info!("Mock access point listening on {}", addr);
        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/v1/tunnel", self.addr)
    }

    /// Directory entry pointing at this access point
    pub fn access_point(&self) -> AccessPoint {
        AccessPoint {
            endpoint: self.endpoint(),
            protocol: TUNNEL_PROTOCOL.to_string(),
            metadata: AccessPointMetadata {
                region: Some("local".to_string()),
                name: Some("mock".to_string()),
            },
        }
    }

    pub fn handshakes(&self) -> Vec<RecordedHandshake> {
        self.state.handshakes.read().clone()
    }

    /// Number of upgrades that completed
    pub fn upgrade_count(&self) -> usize {
        self.state.upgrades.load(Ordering::SeqCst)
    }

    /// Sessions whose connection is still up
    pub fn live_sessions(&self) -> usize {
        self.state
            .sessions
            .read()
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Answer further handshakes with `status` instead of upgrading
    pub fn reject_with(&self, status: Option<StatusCode>) {
        *self.state.reject_with.write() = status;
    }

    pub async fn wait_for_upgrades(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.upgrade_count() >= count).await
    }

    /// Open a stream on the newest live session without writing anything
    pub async fn open_raw(&self) -> anyhow::Result<MuxStream> {
        let session = self
            .state
            .sessions
            .read()
            .iter()
            .rev()
            .find(|s| !s.is_closed())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No live tunnel session"))?;
        Ok(session.open().await?)
    }

    /// Open a stream towards the device and send `header` on it
    pub async fn open_stream(&self, header: ProxyHeader) -> anyhow::Result<MuxStream> {
        let mut stream = self.open_raw().await?;
        let mut buf = BytesMut::new();
        ProxyHeaderCodec::new().encode(header, &mut buf)?;
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(stream)
    }

    /// Kill every session, as if the access point restarted
    pub fn drop_sessions(&self) {
        for session in self.state.sessions.write().drain(..) {
            session.close();
        }
    }
}

impl Drop for MockAccessPoint {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
        self.drop_sessions();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<AccessPointState>) {
    let service = service_fn(move |req| handle_upgrade(req, state.clone()));
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        tracing::debug!("Access point connection ended: {}", e);
    }
}

async fn handle_upgrade(
    req: Request<Incoming>,
    state: Arc<AccessPointState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let header = |name: HeaderName| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    let handshake = RecordedHandshake {
        path: req.uri().path().to_string(),
        authorization: header(AUTHORIZATION),
        upgrade: header(UPGRADE),
        user_agent: header(USER_AGENT),
    };
    tracing::debug!("Handshake: {:?}", handshake);
    state.handshakes.write().push(handshake.clone());

    let rejection = *state.reject_with.read();
    if let Some(status) = rejection {
        return Ok(Response::builder()
            .status(status)
            .body(Full::from("access denied"))
            .unwrap());
    }

    let protocol = handshake.upgrade.unwrap_or_default();
    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let session = MuxSession::client(TokioIo::new(upgraded));
                state.sessions.write().push(Arc::new(session));
                state.upgrades.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => tracing::warn!("Upgrade failed: {}", e),
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, protocol)
        .body(Full::new(Bytes::new()))
        .unwrap())
}
