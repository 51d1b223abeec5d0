//! Local SOCKS5 listener.
//!
//! Accepts clients, runs the handshake (optionally with username/password
//! auth) and queues each connect request until the supervisor either
//! accepts it with a forwarded stream or denies it.

use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::signal::{CloseReason, CloseSignal};
use super::transport::{
    Destination, ForwardListener, ListenerConfig, ListenerFactory, PendingConnection,
    ProxyConnection,
};
use crate::error::{Result, SpmError};
use crate::models::SocksAuth;
use crate::util::format_tcp_addr;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PENDING_QUEUE: usize = 64;

#[allow(dead_code)]
mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_USER_PASS: u8 = 0x02;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const USER_PASS_VERSION: u8 = 0x01;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_GENERAL_FAILURE: u8 = 0x01;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// Binds [`SocksListener`]s on demand.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocksListenerFactory;

#[async_trait]
impl ListenerFactory for SocksListenerFactory {
    async fn listen(&self, config: &ListenerConfig) -> Result<Arc<dyn ForwardListener>> {
        let listener = SocksListener::bind(config).await?;
        Ok(Arc::new(listener))
    }
}

pub struct SocksListener {
    local_addr: SocketAddr,
    pending: Mutex<mpsc::Receiver<SocksPending>>,
    closed: CloseSignal,
}

impl SocksListener {
    pub async fn bind(config: &ListenerConfig) -> Result<Self> {
        let addr = format_tcp_addr(&config.host, config.port.unwrap_or(0));
        let listener =
            TcpListener::bind(&addr)
                .await
                .map_err(|e| SpmError::ListenerBindFailed {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel(PENDING_QUEUE);
        let closed = CloseSignal::new();
        tokio::spawn(accept_loop(
            listener,
            tx,
            closed.clone(),
            config.auth.clone().map(Arc::new),
        ));

        info!(
            "SOCKS listener bound on {} (auth: {})",
            local_addr,
            config.auth.is_some()
        );

        Ok(Self {
            local_addr,
            pending: Mutex::new(rx),
            closed,
        })
    }
}

impl Drop for SocksListener {
    fn drop(&mut self) {
        self.closed.fire(CloseReason::ListenerClosed);
    }
}

#[async_trait]
impl ForwardListener for SocksListener {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept(&self) -> Option<Box<dyn PendingConnection>> {
        let mut pending = self.pending.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.wait() => None,
            next = pending.recv() => next.map(|p| Box::new(p) as Box<dyn PendingConnection>),
        }
    }

    fn close(&self) {
        if self.closed.fire(CloseReason::ListenerClosed) {
            debug!("SOCKS listener on {} closing", self.local_addr);
        }
    }

    async fn closed(&self) -> CloseReason {
        self.closed.wait().await
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<SocksPending>,
    closed: CloseSignal,
    auth: Option<Arc<SocksAuth>>,
) {
    let local_addr = listener.local_addr().ok();

    loop {
        tokio::select! {
            _ = closed.wait() => break,
            accepted = listener.accept() => {
                let (stream, source) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("SOCKS accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }

                let tx = tx.clone();
                let closed = closed.clone();
                let auth = auth.clone();
                tokio::spawn(async move {
                    let mut stream = stream;
                    let destination = tokio::select! {
                        _ = closed.wait() => return,
                        result = tokio::time::timeout(
                            HANDSHAKE_TIMEOUT,
                            handshake(&mut stream, auth.as_deref()),
                        ) => match result {
                            Ok(Ok(destination)) => destination,
                            Ok(Err(e)) => {
                                debug!("SOCKS handshake from {} failed: {}", source, e);
                                return;
                            }
                            Err(_) => {
                                debug!("SOCKS handshake from {} timed out", source);
                                return;
                            }
                        },
                    };

                    debug!("SOCKS connect request {} -> {}", source, destination);
                    let pending = SocksPending {
                        stream,
                        source,
                        destination,
                    };
                    if tx.send(pending).await.is_err() {
                        debug!("SOCKS listener gone, dropping request from {}", source);
                    }
                });
            }
        }
    }

    if let Some(addr) = local_addr {
        info!("SOCKS listener on {} stopped", addr);
    }
}

/// Run the server side of the SOCKS5 handshake up to the connect request.
async fn handshake<S>(stream: &mut S, auth: Option<&SocksAuth>) -> Result<Destination>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 258];

    stream
        .read_exact(&mut buf[..2])
        .await
        .map_err(|e| SpmError::SocksHandshake(format!("failed to read greeting: {}", e)))?;
    if buf[0] != socks5::VERSION {
        return Err(SpmError::SocksHandshake(format!(
            "unsupported SOCKS version: {}",
            buf[0]
        )));
    }

    let nmethods = buf[1] as usize;
    stream
        .read_exact(&mut buf[..nmethods])
        .await
        .map_err(|e| SpmError::SocksHandshake(format!("failed to read auth methods: {}", e)))?;

    let method = if auth.is_some() {
        socks5::AUTH_USER_PASS
    } else {
        socks5::AUTH_NONE
    };
    if !buf[..nmethods].contains(&method) {
        stream
            .write_all(&[socks5::VERSION, socks5::AUTH_NO_ACCEPTABLE])
            .await
            .ok();
        return Err(SpmError::SocksHandshake(format!(
            "client does not offer auth method {:#04x}",
            method
        )));
    }
    stream.write_all(&[socks5::VERSION, method]).await?;

    if let Some(expected) = auth {
        let (username, password) = read_credentials(stream).await?;
        if username != expected.username || password != expected.password {
            stream
                .write_all(&[socks5::USER_PASS_VERSION, 0x01])
                .await
                .ok();
            return Err(SpmError::SocksHandshake(format!(
                "invalid credentials for user '{}'",
                username
            )));
        }
        stream
            .write_all(&[socks5::USER_PASS_VERSION, 0x00])
            .await?;
    }

    stream
        .read_exact(&mut buf[..4])
        .await
        .map_err(|e| SpmError::SocksHandshake(format!("failed to read request: {}", e)))?;
    if buf[0] != socks5::VERSION {
        return Err(SpmError::SocksHandshake(
            "invalid SOCKS version in request".into(),
        ));
    }

    let cmd = buf[1];
    let atyp = buf[3];
    if cmd != socks5::CMD_CONNECT {
        send_reply(stream, socks5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(SpmError::SocksHandshake(format!(
            "unsupported command: {}",
            cmd
        )));
    }

    let destination = match atyp {
        socks5::ATYP_IPV4 => {
            stream.read_exact(&mut buf[..6]).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            Destination::new(ip.to_string(), u16::from_be_bytes([buf[4], buf[5]]))
        }
        socks5::ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len + 2]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            Destination::new(domain, u16::from_be_bytes([buf[len], buf[len + 1]]))
        }
        socks5::ATYP_IPV6 => {
            stream.read_exact(&mut buf[..18]).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            Destination::new(ip.to_string(), u16::from_be_bytes([buf[16], buf[17]]))
        }
        _ => {
            send_reply(stream, socks5::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(SpmError::SocksHandshake(format!(
                "unsupported address type: {}",
                atyp
            )));
        }
    };

    Ok(destination)
}

/// RFC 1929 username/password subnegotiation
async fn read_credentials<S>(stream: &mut S) -> Result<(String, String)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 255];

    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != socks5::USER_PASS_VERSION {
        return Err(SpmError::SocksHandshake(format!(
            "unsupported auth version: {}",
            buf[0]
        )));
    }
    let ulen = buf[1] as usize;
    stream.read_exact(&mut buf[..ulen]).await?;
    let username = String::from_utf8_lossy(&buf[..ulen]).to_string();

    stream.read_exact(&mut buf[..1]).await?;
    let plen = buf[0] as usize;
    stream.read_exact(&mut buf[..plen]).await?;
    let password = String::from_utf8_lossy(&buf[..plen]).to_string();

    Ok((username, password))
}

async fn send_reply<S>(stream: &mut S, status: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT, bound address is always 0.0.0.0:0
    let reply = [
        socks5::VERSION,
        status,
        0x00,
        socks5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    Ok(())
}

/// Client whose handshake finished, waiting for accept/deny.
pub struct SocksPending {
    stream: TcpStream,
    source: SocketAddr,
    destination: Destination,
}

#[async_trait]
impl PendingConnection for SocksPending {
    fn source(&self) -> SocketAddr {
        self.source
    }

    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn accept(self: Box<Self>) -> Result<Box<dyn ProxyConnection>> {
        let SocksPending { mut stream, .. } = *self;
        send_reply(&mut stream, socks5::REP_SUCCESS).await?;
        Ok(Box::new(stream))
    }

    async fn deny(self: Box<Self>) {
        let SocksPending {
            mut stream, source, ..
        } = *self;
        if let Err(e) = send_reply(&mut stream, socks5::REP_HOST_UNREACHABLE).await {
            debug!("Failed to deny {}: {}", source, e);
        }
    }
}
