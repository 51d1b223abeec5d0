//! Tunnel and listener plumbing
//!
//! This module provides:
//! - SSH tunnels opening direct-tcpip forwards
//! - SOCKS5 listeners handing connect requests to the supervisor
//! - Byte splicing between a client and its forward

pub mod bridge;
pub mod signal;
pub mod socks;
pub mod ssh;
pub mod transport;

pub use signal::{CloseReason, CloseSignal};
pub use socks::{SocksListener, SocksListenerFactory};
pub use ssh::{SshTransport, SshTunnel};
pub use transport::{
    Destination, ForwardListener, ListenerConfig, ListenerFactory, PendingConnection,
    ProxyConnection, Tunnel, TunnelTransport,
};
