//! Selection client
//!
//! Read side of the registry used by scraping workers: hands out the least
//! recently used proxy endpoint and penalizes endpoints that got blocked.

use tracing::{debug, info, warn};

use crate::error::{Result, SpmError};
use crate::models::{ConnectionToken, ProxyEndpoint, SocksAuth};
use crate::registry::Registry;

#[derive(Clone)]
pub struct SelectionClient {
    registry: Registry,
    auth: Option<SocksAuth>,
}

impl SelectionClient {
    /// `auth` is the static SOCKS credential pair every listener in the
    /// pool accepts, passed through to each endpoint handed out.
    pub fn new(registry: Registry, auth: Option<SocksAuth>) -> Self {
        Self { registry, auth }
    }

    /// Select the least recently used endpoint.
    ///
    /// Returns [`SpmError::NoProxiesAvailable`] when the registry is empty
    /// or unreachable. Callers should treat that as retryable.
    pub async fn get_next_connection_info(&self) -> Result<ProxyEndpoint> {
        let Some(lru) = self.registry.get_lru_connection().await else {
            warn!("No proxy endpoints available");
            return Err(SpmError::NoProxiesAvailable);
        };

        debug!(hash = %lru.connection_hash, "Selected endpoint {}", lru.listen);
        Ok(ProxyEndpoint::selected(
            lru.listen,
            self.auth.clone(),
            ConnectionToken::new(lru.connection_hash),
        ))
    }

    /// Push the endpoint's connection to the back of the rotation.
    pub async fn report_blocked_request(&self, endpoint: &ProxyEndpoint) -> Result<()> {
        let Some(token) = endpoint.token() else {
            debug!("Blocked request reported for {} without a token", endpoint.listen);
            return Ok(());
        };

        let hash = token.connection_hash();
        if self.registry.penalize_connection(hash).await? {
            info!(hash = %hash, "Penalized connection after blocked request");
        } else {
            debug!(hash = %hash, "Blocked request reported for an unknown connection");
        }
        Ok(())
    }
}
