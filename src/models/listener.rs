use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use url::Url;

use crate::error::{Result, SpmError};
use crate::util::format_tcp_addr;

/// Address a SOCKS listener is reachable at. Persisted as the registry's
/// listener record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListenOptions {
    pub host: String,
    pub port: u16,
}

impl ListenOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format_tcp_addr(&self.host, self.port)
    }
}

impl fmt::Display for ListenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr())
    }
}

/// Username/password accepted by every listener in the pool.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocksAuth {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SocksAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Result of an LRU selection in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LruConnection {
    pub listen: ListenOptions,
    pub connection_hash: String,
}

/// Identifies the connection an endpoint was selected from.
///
/// Only the registry hands these out; callers can't build one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionToken(String);

impl ConnectionToken {
    pub(crate) fn new(connection_hash: String) -> Self {
        Self(connection_hash)
    }

    pub(crate) fn connection_hash(&self) -> &str {
        &self.0
    }
}

/// A proxy endpoint handed to a scraping worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub listen: ListenOptions,
    pub auth: Option<SocksAuth>,
    token: Option<ConnectionToken>,
}

impl ProxyEndpoint {
    /// Endpoint not obtained from the registry. Reporting it is a no-op.
    pub fn new(listen: ListenOptions, auth: Option<SocksAuth>) -> Self {
        Self {
            listen,
            auth,
            token: None,
        }
    }

    pub(crate) fn selected(
        listen: ListenOptions,
        auth: Option<SocksAuth>,
        token: ConnectionToken,
    ) -> Self {
        Self {
            listen,
            auth,
            token: Some(token),
        }
    }

    pub fn token(&self) -> Option<&ConnectionToken> {
        self.token.as_ref()
    }

    /// `socks5://[user:pass@]host:port`, for HTTP clients that take a proxy URL
    pub fn socks5_url(&self) -> Result<Url> {
        let mut url = Url::parse(&format!("socks5://{}", self.listen.addr()))?;

        if let Some(auth) = &self.auth {
            url.set_username(&auth.username).map_err(|_| {
                SpmError::InvalidConfig(format!("cannot set username on {}", self.listen))
            })?;
            url.set_password(Some(&auth.password)).map_err(|_| {
                SpmError::InvalidConfig(format!("cannot set password on {}", self.listen))
            })?;
        }

        Ok(url)
    }

    /// Open a TCP stream to `host:port` through this endpoint.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let socket = TcpStream::connect(self.listen.addr()).await?;

        let stream = match &self.auth {
            Some(auth) => {
                Socks5Stream::connect_with_password_and_socket(
                    socket,
                    (host, port),
                    &auth.username,
                    &auth.password,
                )
                .await?
            }
            None => Socks5Stream::connect_with_socket(socket, (host, port)).await?,
        };

        Ok(stream.into_inner())
    }
}
