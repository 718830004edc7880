//! Exposes a [`VirtualSocket`] as a conventional local TCP socket.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::TetherResult;
use crate::socket::VirtualSocket;

#[async_trait]
pub trait SocketBridge: Send + Sync {
    /// Takes ownership of the socket and returns the local port it is bound to.
    async fn bridge(&self, socket: VirtualSocket) -> TetherResult<u16>;
}

/// Browser side: listens on an ephemeral port and relays the first client.
#[derive(Debug, Clone)]
pub struct TcpListenerBridge {
    host: IpAddr,
    accept_timeout: Duration,
}

impl TcpListenerBridge {
    pub fn new(host: IpAddr, accept_timeout: Duration) -> Self {
        Self {
            host,
            accept_timeout,
        }
    }
}

#[async_trait]
impl SocketBridge for TcpListenerBridge {
    async fn bridge(&self, socket: VirtualSocket) -> TetherResult<u16> {
        let listener = TcpListener::bind(SocketAddr::new(self.host, 0)).await?;
        let port = listener.local_addr()?.port();
        let accept_timeout = self.accept_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(accept_timeout, listener.accept()).await {
                Ok(Ok((tcp, remote))) => {
                    debug!(target = "tether::bridge", port, remote = %remote, stream = %socket.name(), "local client attached");
                    pump(tcp, socket).await;
                }
                Ok(Err(err)) => {
                    warn!(target = "tether::bridge", port, error = %err, "accept failed");
                }
                Err(_) => {
                    warn!(target = "tether::bridge", port, stream = %socket.name(), "no local client attached in time");
                }
            }
        });
        Ok(port)
    }
}

/// Advertiser side: relays the socket into the application's local server.
#[derive(Debug, Clone)]
pub struct TcpRelayBridge {
    host: IpAddr,
    port: u16,
}

impl TcpRelayBridge {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }
}

#[async_trait]
impl SocketBridge for TcpRelayBridge {
    async fn bridge(&self, socket: VirtualSocket) -> TetherResult<u16> {
        let tcp = TcpStream::connect(SocketAddr::new(self.host, self.port)).await?;
        let local_port = tcp.local_addr()?.port();
        debug!(target = "tether::bridge", server_port = self.port, local_port, stream = %socket.name(), "relaying to local server");
        tokio::spawn(pump(tcp, socket));
        Ok(local_port)
    }
}

async fn pump(mut tcp: TcpStream, mut socket: VirtualSocket) {
    match tokio::io::copy_bidirectional(&mut tcp, &mut socket).await {
        Ok((to_peer, from_peer)) => {
            debug!(target = "tether::bridge", stream = %socket.name(), to_peer, from_peer, "relay finished");
        }
        Err(err) => {
            debug!(target = "tether::bridge", stream = %socket.name(), error = %err, "relay ended with error");
        }
    }
    if let Err(err) = socket.close().await {
        debug!(target = "tether::bridge", error = %err, "closing virtual socket failed");
    }
}
