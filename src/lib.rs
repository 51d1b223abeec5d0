//! SPM - SOCKS Proxy Manager
//!
//! Keeps a pool of SSH tunnels, each exposed through a local SOCKS5
//! listener, and publishes the listeners into a shared registry so scraping
//! workers can rotate through them.
//!
//! ## Components
//!
//! - [`services::Supervisor`] opens and watches tunnel/listener pairs
//! - [`registry::Registry`] tracks live listeners and least recently used
//!   connections in Redis
//! - [`client::SelectionClient`] hands out endpoints and penalizes blocked ones

pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod services;
pub mod store;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use client::SelectionClient;
pub use config::Config;
pub use error::{Result, SpmError};
pub use models::{ListenOptions, ProxyEndpoint, SocksAuth};
pub use registry::Registry;
