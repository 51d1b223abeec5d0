//! SSH tunnel transport built on russh.
//!
//! Each tunnel's `Handle` is owned by a single task. Callers talk to it
//! through a command channel; the task also watches the session and fires
//! the tunnel's close signal once the connection is gone.

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{ssh_key, PublicKey};
use russh::Channel;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::signal::{CloseReason, CloseSignal};
use super::transport::{Destination, ProxyConnection, Tunnel, TunnelTransport};
use crate::error::{Result, SpmError};
use crate::models::{ConnectionConfig, SshAuth};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_MAX: usize = 3;
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens [`SshTunnel`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshTransport;

#[async_trait]
impl TunnelTransport for SshTransport {
    async fn open(&self, config: &ConnectionConfig) -> Result<Arc<dyn Tunnel>> {
        let addr = config.addr();
        let timeout = Duration::from_secs(config.timeout_secs);

        // Dropping the half-open handle on timeout tears the session down.
        let handle = tokio::time::timeout(timeout, connect_and_authenticate(config))
            .await
            .map_err(|_| SpmError::TunnelTimeout(addr.clone()))??;

        info!("Established SSH tunnel to {}@{}", config.username, addr);
        Ok(Arc::new(SshTunnel::spawn(handle, addr)))
    }
}

async fn connect_and_authenticate(config: &ConnectionConfig) -> Result<Handle<SshHandler>> {
    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    };
    let handler = SshHandler {
        host: config.host.clone(),
        port: config.port,
    };

    let mut handle = client::connect(
        Arc::new(ssh_config),
        (config.host.as_str(), config.port),
        handler,
    )
    .await
    .map_err(|e| SpmError::TunnelConnectFailed(format!("{}: {}", config.addr(), e)))?;

    debug!("SSH handshake with {} completed", config.addr());

    let authenticated = match &config.auth {
        SshAuth::Password { password } => {
            handle
                .authenticate_password(&config.username, password)
                .await?
        }
        SshAuth::KeyFile { path, passphrase } => {
            let key = russh::keys::load_secret_key(path, passphrase.as_deref())?;
            handle
                .authenticate_publickey(
                    &config.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), None),
                )
                .await?
        }
        SshAuth::InlineKey { key, passphrase } => {
            let key = russh::keys::decode_secret_key(key, passphrase.as_deref())?;
            handle
                .authenticate_publickey(
                    &config.username,
                    PrivateKeyWithHashAlg::new(Arc::new(key), None),
                )
                .await?
        }
    };

    if !authenticated.success() {
        return Err(SpmError::TunnelAuthFailed {
            host: config.addr(),
            username: config.username.clone(),
        });
    }

    Ok(handle)
}

/// russh callbacks. Hosts come from trusted configuration, so every host
/// key is accepted and its fingerprint logged.
struct SshHandler {
    host: String,
    port: u16,
}

impl client::Handler for SshHandler {
    type Error = SpmError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        info!(
            "Host key for {}:{} accepted (fingerprint: {})",
            self.host,
            self.port,
            server_public_key.fingerprint(ssh_key::HashAlg::Sha256)
        );
        Ok(true)
    }
}

enum TunnelCommand {
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<std::result::Result<Channel<Msg>, russh::Error>>,
    },
}

/// Live SSH session usable for direct-tcpip forwards.
pub struct SshTunnel {
    addr: String,
    cmd_tx: mpsc::Sender<TunnelCommand>,
    closed: CloseSignal,
}

impl SshTunnel {
    fn spawn(handle: Handle<SshHandler>, addr: String) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let closed = CloseSignal::new();

        tokio::spawn(run_handle_owner(handle, cmd_rx, closed.clone(), addr.clone()));

        Self {
            addr,
            cmd_tx,
            closed,
        }
    }
}

async fn run_handle_owner(
    handle: Handle<SshHandler>,
    mut cmd_rx: mpsc::Receiver<TunnelCommand>,
    closed: CloseSignal,
    addr: String,
) {
    let handle = Arc::new(handle);
    let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
    // Channel opens run concurrently so one slow destination does not hold
    // up the others.
    let mut opening = JoinSet::new();

    loop {
        tokio::select! {
            _ = closed.wait() => break,
            _ = liveness.tick() => {
                if handle.is_closed() {
                    info!("SSH session to {} dropped", addr);
                    closed.fire(CloseReason::TunnelClosed);
                    break;
                }
            }
            Some(_) = opening.join_next(), if !opening.is_empty() => {}
            cmd = cmd_rx.recv() => match cmd {
                Some(TunnelCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let handle = handle.clone();
                    let closed = closed.clone();
                    let addr = addr.clone();
                    opening.spawn(async move {
                        let result = handle
                            .channel_open_direct_tcpip(host, port, originator_host, originator_port)
                            .await;
                        if let Err(e) = &result {
                            if is_session_error(e) {
                                warn!("SSH session to {} failed: {}", addr, e);
                                closed.fire(CloseReason::TunnelError(e.to_string()));
                            }
                        }
                        if reply_tx.send(result).is_err() {
                            debug!("Forward requester went away before the channel opened");
                        }
                    });
                }
                None => {
                    closed.fire(CloseReason::TunnelClosed);
                    break;
                }
            },
        }
    }

    // Requests still queued or opening see their reply sender dropped.
    opening.abort_all();
    cmd_rx.close();
    while cmd_rx.try_recv().is_ok() {}

    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "tunnel closed", "en")
        .await
    {
        debug!("SSH disconnect from {} failed: {}", addr, e);
    }
    info!("SSH tunnel to {} closed", addr);
}

/// A refused channel only fails that forward; anything else means the
/// session itself is broken.
fn is_session_error(err: &russh::Error) -> bool {
    !matches!(err, russh::Error::ChannelOpenFailure(_))
}

#[async_trait]
impl Tunnel for SshTunnel {
    async fn forward(
        &self,
        source: SocketAddr,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyConnection>> {
        if self.closed.is_fired() {
            return Err(SpmError::TunnelClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(TunnelCommand::OpenDirectTcpip {
                host: destination.host.clone(),
                port: destination.port as u32,
                originator_host: source.ip().to_string(),
                originator_port: source.port() as u32,
                reply_tx,
            })
            .await
            .map_err(|_| SpmError::TunnelClosed)?;

        let channel = match tokio::time::timeout(FORWARD_TIMEOUT, reply_rx).await {
            Err(_) => {
                return Err(SpmError::ForwardFailed(format!(
                    "{} (timed out via {})",
                    destination, self.addr
                )))
            }
            Ok(Err(_)) => return Err(SpmError::TunnelClosed),
            Ok(Ok(Err(e))) => {
                if self.closed.is_fired() {
                    return Err(SpmError::TunnelClosed);
                }
                warn!("Forward to {} via {} rejected: {}", destination, self.addr, e);
                return Err(SpmError::ForwardFailed(format!("{}: {}", destination, e)));
            }
            Ok(Ok(Ok(channel))) => channel,
        };

        Ok(Box::new(Box::pin(channel.into_stream())))
    }

    async fn closed(&self) -> CloseReason {
        self.closed.wait().await
    }

    fn end(&self) {
        if self.closed.fire(CloseReason::TunnelClosed) {
            debug!("Ending SSH tunnel to {}", self.addr);
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.closed.fire(CloseReason::TunnelClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn config(port: u16, timeout_secs: u64) -> ConnectionConfig {
        ConnectionConfig {
            host: "127.0.0.1".into(),
            port,
            username: "tunnel".into(),
            auth: SshAuth::Password {
                password: "pw".into(),
            },
            timeout_secs,
        }
    }

    #[tokio::test]
    async fn test_open_times_out_on_silent_server() {
        // Accepts TCP but never sends an SSH banner
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let result = SshTransport.open(&config(port, 1)).await;
        assert!(matches!(result, Err(SpmError::TunnelTimeout(_))));
        server.abort();
    }

    #[tokio::test]
    async fn test_open_fails_on_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = SshTransport.open(&config(port, 5)).await;
        let err = result.err().expect("connect to a closed port must fail");
        assert!(err.is_transport_error());
    }

    #[test]
    fn test_refused_channel_is_not_a_session_error() {
        let refused = russh::Error::ChannelOpenFailure(russh::ChannelOpenFailure::ConnectFailed);
        assert!(!is_session_error(&refused));
        assert!(is_session_error(&russh::Error::Disconnect));
    }
}
