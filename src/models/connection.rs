use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SpmError};
use crate::util::content_hash;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// One layer of tunnel configuration, as written in the environment.
///
/// Every field is optional so that a defaults layer and a per-connection
/// layer can be merged before resolving.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionOverride {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub private_key_path: Option<String>,
    pub passphrase: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl ConnectionOverride {
    fn has_credentials(&self) -> bool {
        self.password.is_some()
            || self.private_key.is_some()
            || self.private_key_path.is_some()
            || self.passphrase.is_some()
    }

    /// Merge `entry` on top of `self`.
    ///
    /// Plain fields from `entry` win one by one. Credentials are taken as a
    /// group: if `entry` names any credential, none of ours are kept.
    pub fn layer(&self, entry: &ConnectionOverride) -> ConnectionOverride {
        let credentials = if entry.has_credentials() { entry } else { self };

        ConnectionOverride {
            host: entry.host.clone().or_else(|| self.host.clone()),
            port: entry.port.or(self.port),
            username: entry.username.clone().or_else(|| self.username.clone()),
            password: credentials.password.clone(),
            private_key: credentials.private_key.clone(),
            private_key_path: credentials.private_key_path.clone(),
            passphrase: credentials.passphrase.clone(),
            timeout_secs: entry.timeout_secs.or(self.timeout_secs),
        }
    }

    /// Turn a fully merged layer into an immutable config.
    pub fn resolve(self) -> Result<ConnectionConfig> {
        let host = self
            .host
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| SpmError::InvalidConfig("connection is missing a host".into()))?;
        let username = self.username.filter(|u| !u.is_empty()).ok_or_else(|| {
            SpmError::InvalidConfig(format!("connection to {} is missing a username", host))
        })?;

        let port = self.port.unwrap_or(DEFAULT_SSH_PORT);
        if port == 0 {
            return Err(SpmError::InvalidConfig(format!(
                "connection to {} has port 0",
                host
            )));
        }

        let timeout_secs = self.timeout_secs.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(SpmError::InvalidConfig(format!(
                "connection to {} has a zero timeout",
                host
            )));
        }

        let auth = match (self.password, self.private_key, self.private_key_path) {
            (Some(password), None, None) => SshAuth::Password { password },
            (None, Some(key), None) => SshAuth::InlineKey {
                key,
                passphrase: self.passphrase,
            },
            (None, None, Some(path)) => SshAuth::KeyFile {
                path,
                passphrase: self.passphrase,
            },
            (None, None, None) => {
                return Err(SpmError::InvalidConfig(format!(
                    "connection to {} has no credentials",
                    host
                )))
            }
            _ => {
                return Err(SpmError::InvalidConfig(format!(
                    "connection to {} must use exactly one of password, private_key, private_key_path",
                    host
                )))
            }
        };

        Ok(ConnectionConfig {
            host,
            port,
            username,
            auth,
            timeout_secs,
        })
    }
}

/// How a tunnel authenticates against its remote host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuth {
    Password {
        password: String,
    },
    KeyFile {
        path: String,
        passphrase: Option<String>,
    },
    InlineKey {
        key: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password { .. } => f.write_str("Password(***)"),
            SshAuth::KeyFile { path, .. } => write!(f, "KeyFile({})", path),
            SshAuth::InlineKey { .. } => f.write_str("InlineKey(***)"),
        }
    }
}

/// Resolved, immutable description of one tunnel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    pub timeout_secs: u64,
}

impl ConnectionConfig {
    /// Content hash over the serialized config
    pub fn hash(&self) -> Result<String> {
        let serialized = serde_json::to_vec(self)?;
        Ok(content_hash(&serialized))
    }

    pub fn addr(&self) -> String {
        crate::util::format_tcp_addr(&self.host, self.port)
    }
}

/// A config paired with its identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub hash: String,
    pub config: ConnectionConfig,
}

impl ConnectionInfo {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        Ok(Self {
            hash: config.hash()?,
            config,
        })
    }
}
