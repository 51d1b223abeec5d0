//! Seams between the supervisor and the two collaborators it drives:
//! the tunnel transport (SSH) and the local forward listener (SOCKS).

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::signal::CloseReason;
use crate::error::Result;
use crate::models::{ConnectionConfig, SocksAuth};
use crate::util::format_tcp_addr;

/// Byte stream that can be spliced to a client
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Host and port a SOCKS client asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_tcp_addr(&self.host, self.port))
    }
}

#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Open an authenticated tunnel, bounded by the config's timeout.
    async fn open(&self, config: &ConnectionConfig) -> Result<Arc<dyn Tunnel>>;
}

#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Open a port-forward from `source` to `destination` over the tunnel.
    async fn forward(
        &self,
        source: SocketAddr,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyConnection>>;

    /// Resolves once the tunnel has errored or closed.
    async fn closed(&self) -> CloseReason;

    /// Ask the tunnel to shut down. Safe to call more than once.
    fn end(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub host: String,
    /// `None` binds an ephemeral port
    pub port: Option<u16>,
    pub auth: Option<SocksAuth>,
}

#[async_trait]
pub trait ListenerFactory: Send + Sync {
    async fn listen(&self, config: &ListenerConfig) -> Result<Arc<dyn ForwardListener>>;
}

#[async_trait]
pub trait ForwardListener: Send + Sync {
    fn local_addr(&self) -> SocketAddr;

    /// Next client whose handshake completed. `None` once closed.
    ///
    /// Cancel-safe.
    async fn accept(&self) -> Option<Box<dyn PendingConnection>>;

    /// Stop accepting. Safe to call more than once.
    fn close(&self);

    async fn closed(&self) -> CloseReason;
}

/// A client waiting for the outcome of its connect request.
#[async_trait]
pub trait PendingConnection: Send {
    fn source(&self) -> SocketAddr;

    fn destination(&self) -> &Destination;

    /// Tell the client the connect succeeded and hand back its stream.
    async fn accept(self: Box<Self>) -> Result<Box<dyn ProxyConnection>>;

    async fn deny(self: Box<Self>);
}
