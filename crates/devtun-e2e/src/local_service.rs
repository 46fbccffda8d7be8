//! Local TCP service the agent relays tunneled streams to

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// How the service answers each connection
#[derive(Clone, Debug)]
pub enum ServiceMode {
    /// Write back everything it reads
    Echo,
    /// Write these bytes once, then close
    FixedResponse(Vec<u8>),
}

pub struct LocalService {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl LocalService {
    pub async fn start(mode: ServiceMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind local service");
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let counter = connections.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = listener.accept() => match result {
                        Ok((stream, peer)) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tracing::debug!("Local service: connection from {}", peer);
                            tokio::spawn(serve(stream, mode.clone()));
                        }
                        Err(e) => {
                            tracing::error!("Local service accept error: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for LocalService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

async fn serve(mut stream: TcpStream, mode: ServiceMode) {
    match mode {
        ServiceMode::Echo => {
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        ServiceMode::FixedResponse(body) => {
            let _ = stream.write_all(&body).await;
            let _ = stream.shutdown().await;
        }
    }
}
