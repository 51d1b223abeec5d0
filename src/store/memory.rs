use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{ttl_secs, RegistryStore};
use crate::error::Result;

/// In-process store with the same semantics as the Redis commands the
/// registry issues. Expiry follows tokio's clock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, Entry>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Inner {
    fn live_entry(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .strings
            .get(key)
            .is_some_and(|e| e.expires_at <= Instant::now());
        if expired {
            self.strings.remove(key);
        }
        self.strings.get_mut(key)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Members of a sorted set, lowest score first
    pub fn zmembers(&self, key: &str) -> Vec<(String, f64)> {
        let inner = self.inner.lock();
        let mut members: Vec<(String, f64)> = inner
            .zsets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    /// Unexpired string keys starting with `prefix`
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = Instant::now();
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .strings
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

fn deadline(ttl: Duration) -> Instant {
    Instant::now() + Duration::from_secs(ttl_secs(ttl))
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        // Expired records nobody reads again are dropped here
        let now = Instant::now();
        inner.strings.retain(|_, entry| entry.expires_at > now);
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.live_entry(key) {
            Some(entry) => {
                entry.expires_at = deadline(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        Ok(inner.live_entry(key).map(|e| e.value.clone()))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.lock().strings.remove(key);
        Ok(())
    }

    async fn zadd_gt(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        let set = inner.zsets.entry(key.to_string()).or_default();
        let current = set.entry(member.to_string()).or_insert(score);
        if score > *current {
            *current = score;
        }
        Ok(())
    }

    async fn zincr_existing(&self, key: &str, member: &str, delta: f64) -> Result<Option<f64>> {
        let mut inner = self.inner.lock();
        let score = inner
            .zsets
            .get_mut(key)
            .and_then(|set| set.get_mut(member))
            .map(|score| {
                *score += delta;
                *score
            });
        Ok(score)
    }

    async fn zfirst(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        let first = inner.zsets.get(key).and_then(|set| {
            set.iter()
                .min_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)))
                .map(|(member, _)| member.clone())
        });
        Ok(first)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let emptied = match inner.zsets.get_mut(key) {
            Some(set) => {
                set.remove(member);
                set.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.zsets.remove(key);
        }
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let inner = self.inner.lock();
        Ok(inner.zsets.get(key).and_then(|set| set.get(member).copied()))
    }
}
