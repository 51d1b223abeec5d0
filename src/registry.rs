//! Shared registry of live SOCKS listeners.
//!
//! Layout under the configured prefix:
//! - `<prefix>:listeners:<listener_id>`: JSON `{host, port}` with a TTL
//! - `<prefix>:connections`: sorted set of connection hashes, scored by last use
//! - `<prefix>:connections:<hash>`: sorted set of listener ids, scored by last use
//!
//! Scores are epoch milliseconds. Ordinary use only ever raises a score;
//! penalization adds a large increment. Stale index entries are pruned by
//! selectors as they are found.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{ListenOptions, LruConnection};
use crate::store::RegistryStore;
use crate::util::{Clock, SystemClock};

pub const DEFAULT_KEY_PREFIX: &str = "spm";
pub const DEFAULT_LISTENER_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_PENALTY_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub prefix: String,
    pub listener_ttl: Duration,
    /// Score increment applied to a penalized connection
    pub penalty_ms: u64,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_KEY_PREFIX.to_string(),
            listener_ttl: DEFAULT_LISTENER_TTL,
            penalty_ms: DEFAULT_PENALTY_MS,
        }
    }
}

#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn RegistryStore>,
    options: RegistryOptions,
    clock: Arc<dyn Clock>,
}

impl Registry {
    pub fn new(store: Arc<dyn RegistryStore>, options: RegistryOptions) -> Self {
        Self::with_clock(store, options, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn RegistryStore>,
        options: RegistryOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            options,
            clock,
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    fn now(&self) -> f64 {
        self.clock.now_millis() as f64
    }

    pub fn key(&self, key: &str) -> String {
        format!("{}:{}", self.options.prefix, key)
    }

    fn listener_key(&self, listener_id: &str) -> String {
        self.key(&format!("listeners:{}", listener_id))
    }

    fn connections_key(&self) -> String {
        self.key("connections")
    }

    fn connection_listeners_key(&self, connection_hash: &str) -> String {
        self.key(&format!("connections:{}", connection_hash))
    }

    /// Publish a listener and mark it and its connection as used now.
    pub async fn store_connection(
        &self,
        connection_hash: &str,
        listener_id: &str,
        listen: &ListenOptions,
    ) -> Result<()> {
        let record = serde_json::to_string(listen)?;
        self.store
            .set_ex(
                &self.listener_key(listener_id),
                &record,
                self.options.listener_ttl,
            )
            .await?;

        let now = self.now();
        self.store
            .zadd_gt(
                &self.connection_listeners_key(connection_hash),
                listener_id,
                now,
            )
            .await?;
        self.store
            .zadd_gt(&self.connections_key(), connection_hash, now)
            .await?;

        debug!(
            hash = %connection_hash,
            listener_id = %listener_id,
            listen = %listen,
            "Stored listener"
        );
        Ok(())
    }

    /// Renew a listener record's TTL. Returns false if the record is gone.
    pub async fn refresh_listener(&self, listener_id: &str) -> Result<bool> {
        self.store
            .expire(&self.listener_key(listener_id), self.options.listener_ttl)
            .await
    }

    pub async fn remove_listener(&self, listener_id: &str) -> Result<()> {
        self.store.del(&self.listener_key(listener_id)).await
    }

    /// Pick the least recently used connection and one of its listeners.
    ///
    /// Store failures are logged and reported as "nothing available".
    pub async fn get_lru_connection(&self) -> Option<LruConnection> {
        match self.select_lru().await {
            Ok(selected) => selected,
            Err(e) => {
                warn!(error = %e, "Failed to select a connection from the registry");
                None
            }
        }
    }

    async fn select_lru(&self) -> Result<Option<LruConnection>> {
        let connections_key = self.connections_key();

        loop {
            let Some(connection_hash) = self.store.zfirst(&connections_key).await? else {
                return Ok(None);
            };
            self.store
                .zadd_gt(&connections_key, &connection_hash, self.now())
                .await?;

            let listeners_key = self.connection_listeners_key(&connection_hash);
            let Some(listener_id) = self.store.zfirst(&listeners_key).await? else {
                debug!(hash = %connection_hash, "Removing connection without listeners");
                self.store.zrem(&connections_key, &connection_hash).await?;
                continue;
            };
            self.store
                .zadd_gt(&listeners_key, &listener_id, self.now())
                .await?;

            let Some(record) = self.store.get(&self.listener_key(&listener_id)).await? else {
                debug!(
                    hash = %connection_hash,
                    listener_id = %listener_id,
                    "Removing expired listener"
                );
                self.store.zrem(&listeners_key, &listener_id).await?;
                continue;
            };

            match serde_json::from_str::<ListenOptions>(&record) {
                Ok(listen) => {
                    return Ok(Some(LruConnection {
                        listen,
                        connection_hash,
                    }))
                }
                Err(e) => {
                    warn!(
                        listener_id = %listener_id,
                        error = %e,
                        "Removing unreadable listener record"
                    );
                    self.store.zrem(&listeners_key, &listener_id).await?;
                    self.store.del(&self.listener_key(&listener_id)).await?;
                }
            }
        }
    }

    /// Defer reselection of a connection. Unknown hashes are left alone.
    ///
    /// Returns whether the connection was known.
    pub async fn penalize_connection(&self, connection_hash: &str) -> Result<bool> {
        let score = self
            .store
            .zincr_existing(
                &self.connections_key(),
                connection_hash,
                self.options.penalty_ms as f64,
            )
            .await?;
        Ok(score.is_some())
    }
}
