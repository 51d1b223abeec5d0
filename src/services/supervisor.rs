//! Connection supervisor
//!
//! Keeps one SSH tunnel and one SOCKS listener alive per configured
//! connection, publishes each listener into the registry and reopens pairs
//! that go away.
//!
//! Per connection the supervisor tracks an explicit state:
//! `Idle -> Establishing -> Live -> Closing -> Closed`, with `Closed` going
//! back to `Establishing` when the pair is reopened. All transitions happen
//! on the supervisor's own task, driven by [`ConnectionEvent`]s that the
//! establishment attempts and the per-pair supervision tasks resolve to.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SpmError};
use crate::models::{ConnectionConfig, ConnectionInfo, ListenOptions};
use crate::proxy::bridge::splice;
use crate::proxy::signal::CloseReason;
use crate::proxy::transport::{
    ForwardListener, ListenerConfig, ListenerFactory, PendingConnection, Tunnel, TunnelTransport,
};
use crate::registry::Registry;
use crate::util::{random_id, LISTENER_ID_LEN};

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Where and how every SOCKS listener binds
    pub listener: ListenerConfig,
    /// Delay before the first reopen of a failed or closed pair
    pub reconnect_delay: Duration,
    /// Upper bound for the doubling reopen delay
    pub max_reconnect_delay: Duration,
    /// How often a live listener's registry record is renewed
    pub refresh_interval: Duration,
}

impl SupervisorConfig {
    /// Delay before reopen attempt number `failures + 1`
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(16));
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Keep supervising (and reopening) after the initial establishment
    pub watch: bool,
}

/// Externally visible phase of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Establishing,
    Live,
    Closing,
    Closed,
}

enum ConnectionState {
    Idle,
    Establishing,
    Live(LiveConnection),
    Closing(LiveConnection),
    Closed,
}

impl ConnectionState {
    fn phase(&self) -> ConnectionPhase {
        match self {
            ConnectionState::Idle => ConnectionPhase::Idle,
            ConnectionState::Establishing => ConnectionPhase::Establishing,
            ConnectionState::Live(_) => ConnectionPhase::Live,
            ConnectionState::Closing(_) => ConnectionPhase::Closing,
            ConnectionState::Closed => ConnectionPhase::Closed,
        }
    }
}

struct ConnectionRuntime {
    info: ConnectionInfo,
    state: ConnectionState,
    /// Consecutive reopen attempts since the pair was last live
    failures: u32,
}

struct LiveConnection {
    listener_id: String,
    listen: ListenOptions,
    tunnel: Arc<dyn Tunnel>,
    listener: Arc<dyn ForwardListener>,
    clients: ClientSet,
    teardown: Option<oneshot::Sender<()>>,
}

enum ConnectionEvent {
    Established {
        hash: String,
        tunnel: Arc<dyn Tunnel>,
        listener: Arc<dyn ForwardListener>,
        listener_id: String,
        listen: ListenOptions,
    },
    EstablishFailed {
        hash: String,
        error: SpmError,
    },
    Closed {
        hash: String,
        reason: CloseReason,
        /// False if the supervision task died before tearing the pair down
        clean: bool,
    },
}

/// Client connections spliced over one pair. Aborting a task drops both
/// the client socket and its forwarded channel.
#[derive(Clone, Default)]
pub struct ClientSet {
    inner: Arc<Mutex<ClientSetInner>>,
}

#[derive(Default)]
struct ClientSetInner {
    next_id: u64,
    tasks: HashMap<u64, AbortHandle>,
}

impl ClientSet {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let set = self.clone();
        let handle = tokio::spawn(async move {
            task.await;
            set.inner.lock().tasks.remove(&id);
        });
        inner.tasks.insert(id, handle.abort_handle());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every tracked client. Safe to call repeatedly.
    pub fn abort_all(&self) {
        let tasks: Vec<AbortHandle> = self
            .inner
            .lock()
            .tasks
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for task in tasks {
            task.abort();
        }
    }
}

/// Everything an establishment attempt needs, detached from the supervisor
struct EstablishAttempt {
    hash: String,
    config: ConnectionConfig,
    listener_config: ListenerConfig,
    transport: Arc<dyn TunnelTransport>,
    listeners: Arc<dyn ListenerFactory>,
    registry: Registry,
    registry_timeout: Duration,
    stopping: watch::Receiver<bool>,
}

impl EstablishAttempt {
    async fn run(mut self, delay: Duration) -> ConnectionEvent {
        if !delay.is_zero() {
            debug!(hash = %self.hash, "Reopening in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut self.stopping) => {
                    return ConnectionEvent::EstablishFailed {
                        hash: self.hash,
                        error: SpmError::Cancelled,
                    };
                }
            }
        }

        let mut stopping = self.stopping.clone();
        let result = tokio::select! {
            result = self.open_pair() => result,
            _ = stopped(&mut stopping) => Err(SpmError::Cancelled),
        };

        match result {
            Ok((tunnel, listener, listener_id, listen)) => ConnectionEvent::Established {
                hash: self.hash,
                tunnel,
                listener,
                listener_id,
                listen,
            },
            Err(error) => ConnectionEvent::EstablishFailed {
                hash: self.hash,
                error,
            },
        }
    }

    async fn open_pair(
        &self,
    ) -> Result<(Arc<dyn Tunnel>, Arc<dyn ForwardListener>, String, ListenOptions)> {
        let tunnel = self.transport.open(&self.config).await?;

        let listener = match self.listeners.listen(&self.listener_config).await {
            Ok(listener) => listener,
            Err(e) => {
                tunnel.end();
                return Err(e);
            }
        };

        let listen = ListenOptions::new(
            self.listener_config.host.clone(),
            listener.local_addr().port(),
        );
        let listener_id = random_id(LISTENER_ID_LEN);

        // The pair stays usable; the next refresh re-registers it.
        let stored = bounded(
            self.registry_timeout,
            self.registry
                .store_connection(&self.hash, &listener_id, &listen),
        )
        .await;
        if let Err(e) = stored {
            warn!(
                hash = %self.hash,
                listener_id = %listener_id,
                error = %e,
                "Failed to register listener"
            );
        }

        Ok((tunnel, listener, listener_id, listen))
    }
}

/// Run a registry call, giving up after `limit`.
async fn bounded<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| SpmError::RegistryTimeout(limit))?
}

async fn stopped(stopping: &mut watch::Receiver<bool>) {
    // A dropped sender means the supervisor is gone, which counts as stopping.
    let _ = stopping.wait_for(|stopping| *stopping).await;
}

/// A live listener's registry record
#[derive(Clone)]
struct Registration {
    registry: Registry,
    hash: String,
    listener_id: String,
    listen: ListenOptions,
    timeout: Duration,
}

impl Registration {
    /// Renew the record, storing it again if it expired.
    async fn refresh(self) {
        let renewed = bounded(
            self.timeout,
            self.registry.refresh_listener(&self.listener_id),
        )
        .await;

        match renewed {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    hash = %self.hash,
                    listener_id = %self.listener_id,
                    "Listener record expired, registering it again"
                );
                let stored = bounded(
                    self.timeout,
                    self.registry
                        .store_connection(&self.hash, &self.listener_id, &self.listen),
                )
                .await;
                if let Err(e) = stored {
                    warn!(listener_id = %self.listener_id, error = %e, "Failed to register listener");
                }
            }
            Err(e) => {
                warn!(listener_id = %self.listener_id, error = %e, "Failed to refresh listener");
            }
        }
    }
}

/// Supervision of one live pair, running on its own task
struct PairTask {
    registration: Registration,
    tunnel: Arc<dyn Tunnel>,
    listener: Arc<dyn ForwardListener>,
    refresh_interval: Duration,
    clients: ClientSet,
    teardown: oneshot::Receiver<()>,
}

impl PairTask {
    async fn run(mut self) -> CloseReason {
        let mut refresh = interval_at(
            Instant::now() + self.refresh_interval,
            self.refresh_interval,
        );
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Registry calls run off this loop so a slow registry never holds up
        // clients or teardown.
        let mut refreshing: Option<JoinHandle<()>> = None;

        let reason = loop {
            tokio::select! {
                reason = self.tunnel.closed() => {
                    self.listener.close();
                    break reason;
                }
                reason = self.listener.closed() => {
                    self.tunnel.end();
                    break reason;
                }
                _ = &mut self.teardown => {
                    self.tunnel.end();
                    self.listener.close();
                    break CloseReason::Stopped;
                }
                _ = refresh.tick() => {
                    if refreshing.as_ref().is_some_and(|task| !task.is_finished()) {
                        debug!(
                            listener_id = %self.registration.listener_id,
                            "Previous refresh still running"
                        );
                    } else {
                        refreshing = Some(tokio::spawn(self.registration.clone().refresh()));
                    }
                }
                pending = self.listener.accept() => match pending {
                    Some(pending) => {
                        self.clients.spawn(forward_connection(self.tunnel.clone(), pending));
                    }
                    None => {
                        self.tunnel.end();
                        break CloseReason::ListenerClosed;
                    }
                },
            }
        };

        if let Some(task) = refreshing {
            task.abort();
        }
        self.clients.abort_all();
        reason
    }
}

/// Forward one accepted client over the tunnel and splice the streams.
async fn forward_connection(tunnel: Arc<dyn Tunnel>, pending: Box<dyn PendingConnection>) {
    let source = pending.source();
    let destination = pending.destination().clone();

    let remote = match tunnel.forward(source, &destination).await {
        Ok(remote) => remote,
        Err(e) => {
            debug!("Forward {} -> {} failed: {}", source, destination, e);
            pending.deny().await;
            if matches!(e, SpmError::TunnelClosed) {
                tunnel.end();
            }
            return;
        }
    };

    let client = match pending.accept().await {
        Ok(client) => client,
        Err(e) => {
            debug!("Client {} went away before the forward was ready: {}", source, e);
            return;
        }
    };

    let (sent, received) = splice(client, remote).await;
    debug!(
        bytes_sent = sent,
        bytes_received = received,
        "Connection {} -> {} finished",
        source,
        destination
    );
}

/// Owns every configured connection and its runtime state.
pub struct Supervisor {
    config: SupervisorConfig,
    transport: Arc<dyn TunnelTransport>,
    listeners: Arc<dyn ListenerFactory>,
    registry: Registry,
    order: Vec<String>,
    connections: HashMap<String, ConnectionRuntime>,
    pending: FuturesUnordered<BoxFuture<'static, ConnectionEvent>>,
    stopping: watch::Sender<bool>,
    watching: bool,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        connections: Vec<ConnectionInfo>,
        transport: Arc<dyn TunnelTransport>,
        listeners: Arc<dyn ListenerFactory>,
        registry: Registry,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut order = Vec::with_capacity(connections.len());
        let mut runtimes = HashMap::with_capacity(connections.len());
        for info in connections {
            if runtimes.contains_key(&info.hash) {
                warn!(
                    hash = %info.hash,
                    "Ignoring duplicate connection to {}",
                    info.config.addr()
                );
                continue;
            }
            order.push(info.hash.clone());
            runtimes.insert(
                info.hash.clone(),
                ConnectionRuntime {
                    info,
                    state: ConnectionState::Idle,
                    failures: 0,
                },
            );
        }

        let (stopping, _) = watch::channel(false);

        Self {
            config,
            transport,
            listeners,
            registry,
            order,
            connections: runtimes,
            pending: FuturesUnordered::new(),
            stopping,
            watching: false,
            shutdown,
        }
    }

    /// Connection hashes in configuration order
    pub fn connection_hashes(&self) -> &[String] {
        &self.order
    }

    pub fn phase(&self, hash: &str) -> Option<ConnectionPhase> {
        self.connections.get(hash).map(|r| r.state.phase())
    }

    /// `(hash, listener_id, listen)` of every live pair
    pub fn live_listeners(&self) -> Vec<(String, String, ListenOptions)> {
        self.order
            .iter()
            .filter_map(|hash| match &self.connections.get(hash)?.state {
                ConnectionState::Live(live) => {
                    Some((hash.clone(), live.listener_id.clone(), live.listen.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Client connections currently spliced over a pair
    pub fn client_count(&self, hash: &str) -> usize {
        match self.connections.get(hash).map(|r| &r.state) {
            Some(ConnectionState::Live(live)) | Some(ConnectionState::Closing(live)) => {
                live.clients.len()
            }
            _ => 0,
        }
    }

    fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Establish every connection concurrently and wait until each attempt
    /// has either come up or failed. With `watch`, keep supervising until
    /// shutdown is signalled.
    #[instrument(skip(self))]
    pub async fn start(&mut self, options: StartOptions) {
        self.watching = options.watch;
        info!(
            "Starting supervisor with {} connection(s) (watch: {})",
            self.order.len(),
            options.watch
        );

        let mut unsettled: HashSet<String> = self.order.iter().cloned().collect();
        for hash in self.order.clone() {
            self.establish(&hash, Duration::ZERO);
        }

        while !unsettled.is_empty() {
            let Some(event) = self.pending.next().await else {
                break;
            };
            if let Some(settled) = self.handle_event(event).await {
                unsettled.remove(&settled);
            }
        }

        let live = self.live_listeners().len();
        info!("{} of {} connection(s) live", live, self.order.len());

        if options.watch {
            self.watch_connections().await;
        }
    }

    /// React to pairs closing, one at a time in completion order, until
    /// shutdown is signalled.
    pub async fn watch_connections(&mut self) {
        self.watching = true;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            tokio::select! {
                event = self.pending.next(), if !self.pending.is_empty() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Supervision loop exited");
    }

    /// Tear every pair down, remove their registry records and wait until
    /// each has fully closed. No pair is reopened afterwards.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) {
        self.stopping.send_replace(true);
        info!("Stopping supervisor");

        for runtime in self.connections.values_mut() {
            let state = std::mem::replace(&mut runtime.state, ConnectionState::Idle);
            runtime.state = match state {
                ConnectionState::Live(mut live) => {
                    if let Some(teardown) = live.teardown.take() {
                        let _ = teardown.send(());
                    }
                    ConnectionState::Closing(live)
                }
                other => other,
            };
        }

        while let Some(event) = self.pending.next().await {
            self.handle_event(event).await;
        }

        info!("Supervisor stopped");
    }

    /// `start` with supervision, then `stop` once shutdown is signalled.
    pub async fn run(mut self) {
        self.start(StartOptions { watch: true }).await;
        self.stop().await;
    }

    fn establish(&mut self, hash: &str, delay: Duration) {
        let Some(runtime) = self.connections.get_mut(hash) else {
            return;
        };
        runtime.state = ConnectionState::Establishing;

        let attempt = EstablishAttempt {
            hash: hash.to_string(),
            config: runtime.info.config.clone(),
            listener_config: self.config.listener.clone(),
            transport: self.transport.clone(),
            listeners: self.listeners.clone(),
            registry: self.registry.clone(),
            registry_timeout: self.config.refresh_interval,
            stopping: self.stopping.subscribe(),
        };
        self.pending.push(Box::pin(attempt.run(delay)));
    }

    /// Returns the hash of a connection whose establishment just settled.
    async fn handle_event(&mut self, event: ConnectionEvent) -> Option<String> {
        match event {
            ConnectionEvent::Established {
                hash,
                tunnel,
                listener,
                listener_id,
                listen,
            } => {
                self.on_established(&hash, tunnel, listener, listener_id, listen)
                    .await;
                Some(hash)
            }
            ConnectionEvent::EstablishFailed { hash, error } => {
                self.on_establish_failed(&hash, error);
                Some(hash)
            }
            ConnectionEvent::Closed {
                hash,
                reason,
                clean,
            } => {
                self.on_closed(&hash, reason, clean).await;
                None
            }
        }
    }

    async fn on_established(
        &mut self,
        hash: &str,
        tunnel: Arc<dyn Tunnel>,
        listener: Arc<dyn ForwardListener>,
        listener_id: String,
        listen: ListenOptions,
    ) {
        if self.is_stopping() || !self.connections.contains_key(hash) {
            tunnel.end();
            listener.close();
            if let Err(e) = self.remove_record(&listener_id).await {
                warn!(listener_id = %listener_id, error = %e, "Failed to remove listener record");
            }
            if let Some(runtime) = self.connections.get_mut(hash) {
                runtime.state = ConnectionState::Closed;
            }
            return;
        }

        info!(
            hash = %hash,
            listener_id = %listener_id,
            "Connection live, SOCKS listener on {}",
            listen
        );

        let (teardown_tx, teardown_rx) = oneshot::channel();
        let clients = ClientSet::default();
        let task = PairTask {
            registration: Registration {
                registry: self.registry.clone(),
                hash: hash.to_string(),
                listener_id: listener_id.clone(),
                listen: listen.clone(),
                timeout: self.config.refresh_interval,
            },
            tunnel: tunnel.clone(),
            listener: listener.clone(),
            refresh_interval: self.config.refresh_interval,
            clients: clients.clone(),
            teardown: teardown_rx,
        };
        let handle = tokio::spawn(task.run());

        let closed_hash = hash.to_string();
        self.pending.push(Box::pin(async move {
            match handle.await {
                Ok(reason) => ConnectionEvent::Closed {
                    hash: closed_hash,
                    reason,
                    clean: true,
                },
                Err(e) => ConnectionEvent::Closed {
                    hash: closed_hash,
                    reason: CloseReason::TunnelError(format!("supervision task failed: {}", e)),
                    clean: false,
                },
            }
        }));

        if let Some(runtime) = self.connections.get_mut(hash) {
            runtime.failures = 0;
            runtime.state = ConnectionState::Live(LiveConnection {
                listener_id,
                listen,
                tunnel,
                listener,
                clients,
                teardown: Some(teardown_tx),
            });
        }
    }

    fn on_establish_failed(&mut self, hash: &str, error: SpmError) {
        let Some(runtime) = self.connections.get_mut(hash) else {
            return;
        };
        runtime.state = ConnectionState::Closed;

        if matches!(error, SpmError::Cancelled) {
            debug!(hash = %hash, "Establishment cancelled");
            return;
        }
        warn!(
            hash = %hash,
            error = %error,
            "Failed to establish connection to {}",
            runtime.info.config.addr()
        );

        self.schedule_reopen(hash);
    }

    async fn on_closed(&mut self, hash: &str, reason: CloseReason, clean: bool) {
        let Some(runtime) = self.connections.get_mut(hash) else {
            return;
        };
        let state = std::mem::replace(&mut runtime.state, ConnectionState::Closed);
        let live = match state {
            ConnectionState::Live(live) | ConnectionState::Closing(live) => live,
            other => {
                runtime.state = other;
                return;
            }
        };

        if clean {
            info!(hash = %hash, listener_id = %live.listener_id, "Connection closed: {}", reason);
        } else {
            error!(hash = %hash, listener_id = %live.listener_id, "Connection closed: {}", reason);
            live.tunnel.end();
            live.listener.close();
        }
        live.clients.abort_all();

        if let Err(e) = self.remove_record(&live.listener_id).await {
            warn!(listener_id = %live.listener_id, error = %e, "Failed to remove listener record");
        }

        self.schedule_reopen(hash);
    }

    fn remove_record(&self, listener_id: &str) -> impl Future<Output = Result<()>> + Send + 'static {
        let limit = self.config.refresh_interval;
        let registry = self.registry.clone();
        let listener_id = listener_id.to_string();
        async move { bounded(limit, registry.remove_listener(&listener_id)).await }
    }

    fn schedule_reopen(&mut self, hash: &str) {
        if !self.watching || self.is_stopping() {
            return;
        }
        let Some(runtime) = self.connections.get_mut(hash) else {
            return;
        };

        let delay = self.config.backoff(runtime.failures);
        runtime.failures = runtime.failures.saturating_add(1);
        self.establish(hash, delay);
    }
}

/// Handle for signalling the supervisor to shut down
pub struct SupervisorHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl SupervisorHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for SupervisorHandle {
    fn default() -> Self {
        Self::new().0
    }
}
