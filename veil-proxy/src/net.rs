//! Minimal network layer: newline-delimited JSON requests over TCP in,
//! responses delivered to each client's registered listening address.
//!
//! The [`ResponseSink`] trait is the only piece the session layer sees, so
//! tests (and alternative transports) can substitute their own delivery.

use crate::proxy::Proxy;
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use veil_shared::{ClientRequest, ClientResponse, VeilError, VeilResult};

/// Delivers responses to a client address.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn send(&self, addr: SocketAddr, response: ClientResponse) -> VeilResult<()>;
}

/// TCP sink that connects to each client's registered address and writes one
/// JSON line per response. Connections are cached per address and dropped on
/// the first write failure.
#[derive(Default)]
pub struct TcpResponseSink {
    connections: DashMap<SocketAddr, Arc<Mutex<TcpStream>>>,
}

impl TcpResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connection(&self, addr: SocketAddr) -> VeilResult<Arc<Mutex<TcpStream>>> {
        if let Some(existing) = self.connections.get(&addr) {
            return Ok(existing.clone());
        }
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| VeilError::network(format!("connect to {addr}: {e}")))?;
        let stream = Arc::new(Mutex::new(stream));
        self.connections.insert(addr, stream.clone());
        Ok(stream)
    }
}

#[async_trait]
impl ResponseSink for TcpResponseSink {
    async fn send(&self, addr: SocketAddr, response: ClientResponse) -> VeilResult<()> {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');

        let stream = self.connection(addr).await?;
        let mut guard = stream.lock().await;
        if let Err(e) = guard.write_all(&line).await {
            drop(guard);
            self.connections.remove(&addr);
            return Err(VeilError::network(format!("write to {addr}: {e}")));
        }
        Ok(())
    }
}

/// Accept loop: one task per inbound connection, each reading
/// newline-delimited JSON [`ClientRequest`]s.
pub async fn serve(proxy: Arc<Proxy>, listener: TcpListener) -> VeilResult<()> {
    let local = listener
        .local_addr()
        .map_err(|e| VeilError::network(e.to_string()))?;
    info!("proxy listening on {}", local);

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| VeilError::network(format!("accept: {e}")))?;
        let proxy = proxy.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(proxy, stream).await {
                warn!("connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(proxy: Arc<Proxy>, stream: TcpStream) -> VeilResult<()> {
    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| VeilError::network(e.to_string()))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let request: ClientRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("dropping malformed request: {}", e);
                continue;
            }
        };
        match proxy.handle_request(request).await {
            Ok(()) => {}
            Err(e @ VeilError::DuplicateClient { .. }) => {
                // A duplicate registration means two clients share an
                // identity; nothing the proxy does from here on can be
                // trusted.
                error!("fatal: {}", e);
                std::process::exit(1);
            }
            Err(e) => warn!("request failed: {}", e),
        }
    }
    Ok(())
}
