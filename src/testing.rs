//! Test doubles for the tunnel transport, the forward listener, the
//! registry store and the clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::error::{Result, SpmError};
use crate::models::ConnectionConfig;
use crate::proxy::signal::{CloseReason, CloseSignal};
use crate::proxy::transport::{
    Destination, ForwardListener, ListenerConfig, ListenerFactory, PendingConnection,
    ProxyConnection, Tunnel, TunnelTransport,
};
use crate::store::{MemoryStore, RegistryStore};
use crate::util::Clock;

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Store whose every call fails like an unreachable Redis
pub struct FailingStore;

fn unreachable() -> SpmError {
    SpmError::Registry(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

#[async_trait]
impl RegistryStore for FailingStore {
    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        Err(unreachable())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        Err(unreachable())
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(unreachable())
    }

    async fn del(&self, _key: &str) -> Result<()> {
        Err(unreachable())
    }

    async fn zadd_gt(&self, _key: &str, _member: &str, _score: f64) -> Result<()> {
        Err(unreachable())
    }

    async fn zincr_existing(&self, _key: &str, _member: &str, _delta: f64) -> Result<Option<f64>> {
        Err(unreachable())
    }

    async fn zfirst(&self, _key: &str) -> Result<Option<String>> {
        Err(unreachable())
    }

    async fn zrem(&self, _key: &str, _member: &str) -> Result<()> {
        Err(unreachable())
    }

    async fn zscore(&self, _key: &str, _member: &str) -> Result<Option<f64>> {
        Err(unreachable())
    }
}

/// Memory-backed store whose `expire` never returns, like a Redis
/// connection that stopped answering mid-session
#[derive(Default)]
pub struct StalledExpireStore {
    inner: MemoryStore,
}

impl StalledExpireStore {
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner.keys_with_prefix(prefix)
    }
}

#[async_trait]
impl RegistryStore for StalledExpireStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        std::future::pending().await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.del(key).await
    }

    async fn zadd_gt(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.inner.zadd_gt(key, member, score).await
    }

    async fn zincr_existing(&self, key: &str, member: &str, delta: f64) -> Result<Option<f64>> {
        self.inner.zincr_existing(key, member, delta).await
    }

    async fn zfirst(&self, key: &str) -> Result<Option<String>> {
        self.inner.zfirst(key).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        self.inner.zrem(key, member).await
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.inner.zscore(key, member).await
    }
}

/// Transport that opens in-memory tunnels, failing for selected hosts.
#[derive(Default)]
pub struct MockTransport {
    failing_hosts: Mutex<HashSet<String>>,
    rejected_destinations: Mutex<HashSet<String>>,
    opens: Mutex<Vec<(String, Instant)>>,
    tunnels: Mutex<Vec<Arc<MockTunnel>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_host(&self, host: &str) {
        self.failing_hosts.lock().insert(host.to_string());
    }

    pub fn recover_host(&self, host: &str) {
        self.failing_hosts.lock().remove(host);
    }

    /// Forwards to this host fail on every tunnel opened afterwards
    pub fn reject_destination(&self, host: &str) {
        self.rejected_destinations.lock().insert(host.to_string());
    }

    pub fn open_attempts(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn open_attempts_for(&self, host: &str) -> Vec<Instant> {
        self.opens
            .lock()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn tunnels(&self) -> Vec<Arc<MockTunnel>> {
        self.tunnels.lock().clone()
    }
}

#[async_trait]
impl TunnelTransport for MockTransport {
    async fn open(&self, config: &ConnectionConfig) -> Result<Arc<dyn Tunnel>> {
        self.opens
            .lock()
            .push((config.host.clone(), Instant::now()));

        if self.failing_hosts.lock().contains(&config.host) {
            return Err(SpmError::TunnelConnectFailed(format!(
                "{}: connection refused",
                config.addr()
            )));
        }

        let tunnel = Arc::new(MockTunnel {
            closed: CloseSignal::new(),
            end_calls: AtomicUsize::new(0),
            forwards: AtomicUsize::new(0),
            rejected: self.rejected_destinations.lock().clone(),
        });
        self.tunnels.lock().push(tunnel.clone());
        Ok(tunnel)
    }
}

/// Tunnel whose forwards echo back whatever they receive
pub struct MockTunnel {
    closed: CloseSignal,
    end_calls: AtomicUsize,
    forwards: AtomicUsize,
    rejected: HashSet<String>,
}

impl MockTunnel {
    pub fn end_calls(&self) -> usize {
        self.end_calls.load(Ordering::SeqCst)
    }

    pub fn forwards(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    /// Remote side dropped the session
    pub fn simulate_close(&self) {
        self.closed.fire(CloseReason::TunnelClosed);
    }

    pub fn simulate_error(&self, message: &str) {
        self.closed
            .fire(CloseReason::TunnelError(message.to_string()));
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    async fn forward(
        &self,
        _source: SocketAddr,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyConnection>> {
        if self.closed.is_fired() {
            return Err(SpmError::TunnelClosed);
        }
        if self.rejected.contains(&destination.host) {
            return Err(SpmError::ForwardFailed(destination.to_string()));
        }
        self.forwards.fetch_add(1, Ordering::SeqCst);

        let (near, mut far) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match far.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if far.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(near))
    }

    async fn closed(&self) -> CloseReason {
        self.closed.wait().await
    }

    fn end(&self) {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.fire(CloseReason::TunnelClosed);
    }
}

/// Listener factory handing out listeners on made-up ports that never
/// receive clients
pub struct MockListenerFactory {
    next_port: AtomicU16,
    fail: Mutex<bool>,
    listeners: Mutex<Vec<Arc<MockListener>>>,
}

impl Default for MockListenerFactory {
    fn default() -> Self {
        Self {
            next_port: AtomicU16::new(41000),
            fail: Mutex::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl MockListenerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_binds(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn listeners(&self) -> Vec<Arc<MockListener>> {
        self.listeners.lock().clone()
    }
}

#[async_trait]
impl ListenerFactory for MockListenerFactory {
    async fn listen(&self, config: &ListenerConfig) -> Result<Arc<dyn ForwardListener>> {
        let port = config
            .port
            .unwrap_or_else(|| self.next_port.fetch_add(1, Ordering::SeqCst));
        if *self.fail.lock() {
            return Err(SpmError::ListenerBindFailed {
                addr: format!("{}:{}", config.host, port),
                reason: "address in use".into(),
            });
        }

        let listener = Arc::new(MockListener {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            closed: CloseSignal::new(),
            close_calls: AtomicUsize::new(0),
        });
        self.listeners.lock().push(listener.clone());
        Ok(listener)
    }
}

pub struct MockListener {
    addr: SocketAddr,
    closed: CloseSignal,
    close_calls: AtomicUsize,
}

impl MockListener {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    pub fn simulate_close(&self) {
        self.closed.fire(CloseReason::ListenerClosed);
    }
}

#[async_trait]
impl ForwardListener for MockListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Never yields clients; returns once closed
    async fn accept(&self) -> Option<Box<dyn PendingConnection>> {
        self.closed.wait().await;
        None
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.fire(CloseReason::ListenerClosed);
    }

    async fn closed(&self) -> CloseReason {
        self.closed.wait().await
    }
}

/// Wait (yielding) until `condition` holds, failing the test otherwise.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
