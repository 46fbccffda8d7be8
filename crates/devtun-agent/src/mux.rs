//! Multiplexed session over one upgraded tunnel connection
//!
//! A yamux connection must be polled continuously to make progress, so each
//! session owns a driver task. The handle talks to the driver over channels:
//! inbound streams arrive on a queue, outbound opens are requests answered
//! through a oneshot.

use std::future::{poll_fn, Future};
use std::sync::Arc;
use std::task::Poll;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;

pub use yamux::{Mode, StreamId};

/// A logical stream inside a session, readable and writable with tokio IO
pub type MuxStream = Compat<yamux::Stream>;

/// Inbound streams the driver may queue before the accept loop picks them up
const INBOUND_BACKLOG: usize = 32;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Multiplexing error: {0}")]
    Connection(#[from] yamux::ConnectionError),

    #[error("Session closed: {0}")]
    Closed(String),
}

type OpenReply = oneshot::Sender<Result<yamux::Stream, MuxError>>;

enum DriverEvent {
    Inbound(Option<Result<yamux::Stream, yamux::ConnectionError>>),
    Shutdown(&'static str),
}

pub struct MuxSession {
    inbound: tokio::sync::Mutex<mpsc::Receiver<yamux::Stream>>,
    open_tx: mpsc::Sender<OpenReply>,
    shutdown: CancellationToken,
    close_reason: Arc<Mutex<Option<String>>>,
}

impl MuxSession {
    /// Run a session over `io` and start its driver task
    pub fn new<T>(io: T, mode: Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = yamux::Connection::new(io.compat(), yamux::Config::default(), mode);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BACKLOG);
        let (open_tx, open_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let close_reason = Arc::new(Mutex::new(None));

        tokio::spawn(drive(
            connection,
            inbound_tx,
            open_rx,
            shutdown.clone(),
            close_reason.clone(),
        ));

        Self {
            inbound: tokio::sync::Mutex::new(inbound_rx),
            open_tx,
            shutdown,
            close_reason,
        }
    }

    /// Session for the side that accepts streams (the device)
    pub fn server<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(io, Mode::Server)
    }

    /// Session for the side that opens streams (the access point)
    pub fn client<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(io, Mode::Client)
    }

    /// Wait for the peer to open a stream.
    ///
    /// Fails once the session is closed locally or the connection ends.
    pub async fn accept(&self) -> Result<MuxStream, MuxError> {
        if self.shutdown.is_cancelled() {
            return Err(MuxError::Closed(self.close_reason()));
        }
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(stream) => Ok(stream.compat()),
            None => Err(MuxError::Closed(self.close_reason())),
        }
    }

    /// Open a stream towards the peer
    pub async fn open(&self) -> Result<MuxStream, MuxError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx
            .send(reply_tx)
            .await
            .map_err(|_| MuxError::Closed(self.close_reason()))?;
        let stream = reply_rx
            .await
            .map_err(|_| MuxError::Closed(self.close_reason()))??;
        Ok(stream.compat())
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.open_tx.is_closed()
    }

    fn close_reason(&self) -> String {
        self.close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "closed locally".to_string())
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn drive<T>(
    mut connection: yamux::Connection<Compat<T>>,
    inbound_tx: mpsc::Sender<yamux::Stream>,
    mut open_rx: mpsc::Receiver<OpenReply>,
    shutdown: CancellationToken,
    close_reason: Arc<Mutex<Option<String>>>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let cancelled = shutdown.cancelled();
    tokio::pin!(cancelled);
    let mut pending_open: Option<OpenReply> = None;

    let reason = loop {
        let event = poll_fn(|cx| {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(DriverEvent::Shutdown("closed locally"));
            }

            if pending_open.is_none() {
                match open_rx.poll_recv(cx) {
                    Poll::Ready(Some(reply)) => pending_open = Some(reply),
                    Poll::Ready(None) => {
                        return Poll::Ready(DriverEvent::Shutdown("session handle dropped"))
                    }
                    Poll::Pending => {}
                }
            }

            if pending_open.is_some() {
                if let Poll::Ready(result) = connection.poll_new_outbound(cx) {
                    if let Some(reply) = pending_open.take() {
                        let _ = reply.send(result.map_err(MuxError::from));
                    }
                    // Pick up the next open request
                    cx.waker().wake_by_ref();
                }
            }

            connection.poll_next_inbound(cx).map(DriverEvent::Inbound)
        })
        .await;

        match event {
            DriverEvent::Inbound(Some(Ok(stream))) => {
                tracing::trace!("Inbound stream {}", stream.id());
                if inbound_tx.send(stream).await.is_err() {
                    break "session handle dropped".to_string();
                }
            }
            DriverEvent::Inbound(Some(Err(e))) => break format!("connection error: {}", e),
            DriverEvent::Inbound(None) => break "connection closed by peer".to_string(),
            DriverEvent::Shutdown(why) => {
                if let Err(e) = poll_fn(|cx| connection.poll_close(cx)).await {
                    tracing::debug!("Error while closing multiplexed connection: {}", e);
                }
                break why.to_string();
            }
        }
    };

    tracing::debug!("Multiplexed session ended: {}", reason);
    *close_reason.lock() = Some(reason);
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (MuxSession, MuxSession) {
        let (device_io, ap_io) = tokio::io::duplex(64 * 1024);
        (MuxSession::server(device_io), MuxSession::client(ap_io))
    }

    #[tokio::test]
    async fn test_peer_opened_stream_is_accepted() {
        let (device, access_point) = pair();

        let mut outbound = access_point.open().await.unwrap();
        outbound.write_all(b"ping").await.unwrap();
        outbound.flush().await.unwrap();

        let mut inbound = device.accept().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        inbound.flush().await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (device, access_point) = pair();

        let mut first = access_point.open().await.unwrap();
        let mut second = access_point.open().await.unwrap();
        first.write_all(b"one").await.unwrap();
        second.write_all(b"two").await.unwrap();

        let mut a = device.accept().await.unwrap();
        let mut b = device.accept().await.unwrap();
        assert_ne!(a.get_ref().id(), b.get_ref().id());

        let mut buf = [0u8; 3];
        a.read_exact(&mut buf).await.unwrap();
        let first_seen = buf;
        b.read_exact(&mut buf).await.unwrap();
        let mut seen = [first_seen, buf];
        seen.sort();
        assert_eq!(seen, [*b"one", *b"two"]);
    }

    #[tokio::test]
    async fn test_accept_fails_when_peer_goes_away() {
        let (device, access_point) = pair();
        drop(access_point);

        let result = tokio::time::timeout(Duration::from_secs(5), device.accept())
            .await
            .expect("accept should not hang");
        assert!(matches!(result, Err(MuxError::Closed(_))));
    }

    #[tokio::test]
    async fn test_local_close_ends_session() {
        let (device, access_point) = pair();
        device.close();
        assert!(device.is_closed());
        assert!(device.accept().await.is_err());

        let result = tokio::time::timeout(Duration::from_secs(5), access_point.accept())
            .await
            .expect("peer should observe the close");
        assert!(result.is_err());
    }
}
