use thiserror::Error;

/// Unified error type for the proxy manager
#[derive(Error, Debug)]
pub enum SpmError {
    // Registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] redis::RedisError),

    #[error("Registry call timed out after {0:?}")]
    RegistryTimeout(std::time::Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Selection errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    // Tunnel errors
    #[error("Tunnel connection failed: {0}")]
    TunnelConnectFailed(String),

    #[error("Tunnel authentication rejected for {username}@{host}")]
    TunnelAuthFailed { host: String, username: String },

    #[error("Tunnel connection to {0} timed out")]
    TunnelTimeout(String),

    #[error("Tunnel closed")]
    TunnelClosed,

    #[error("Forward to {0} failed")]
    ForwardFailed(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    // Listener errors
    #[error("Failed to bind listener on {addr}: {reason}")]
    ListenerBindFailed { addr: String, reason: String },

    #[error("SOCKS handshake failed: {0}")]
    SocksHandshake(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for proxy manager operations
pub type Result<T> = std::result::Result<T, SpmError>;

impl SpmError {
    /// Errors caused by the tunnel or its remote end
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            SpmError::TunnelConnectFailed(_)
                | SpmError::TunnelAuthFailed { .. }
                | SpmError::TunnelTimeout(_)
                | SpmError::TunnelClosed
                | SpmError::ForwardFailed(_)
                | SpmError::Ssh(_)
        )
    }

    /// Whether the caller may simply try again later
    pub fn is_retryable(&self) -> bool {
        self.is_transport_error()
            || matches!(
                self,
                SpmError::NoProxiesAvailable
                    | SpmError::Registry(_)
                    | SpmError::RegistryTimeout(_)
                    | SpmError::Io(_)
            )
    }
}

impl From<russh::Error> for SpmError {
    fn from(err: russh::Error) -> Self {
        SpmError::Ssh(err.to_string())
    }
}

impl From<russh::keys::Error> for SpmError {
    fn from(err: russh::keys::Error) -> Self {
        SpmError::InvalidConfig(format!("invalid private key: {}", err))
    }
}

impl From<tokio_socks::Error> for SpmError {
    fn from(err: tokio_socks::Error) -> Self {
        SpmError::SocksHandshake(err.to_string())
    }
}

impl From<url::ParseError> for SpmError {
    fn from(err: url::ParseError) -> Self {
        SpmError::InvalidConfig(err.to_string())
    }
}
