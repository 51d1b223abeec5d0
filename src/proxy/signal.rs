use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Why a tunnel, listener or connection pair went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    TunnelError(String),
    TunnelClosed,
    ListenerClosed,
    Stopped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TunnelError(e) => write!(f, "tunnel error: {}", e),
            CloseReason::TunnelClosed => f.write_str("tunnel closed"),
            CloseReason::ListenerClosed => f.write_str("listener closed"),
            CloseReason::Stopped => f.write_str("stopped"),
        }
    }
}

/// One-shot, cloneable close notification.
///
/// The first `fire` wins; later calls are ignored. Any number of tasks can
/// `wait`, before or after it fired.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true if this call fired the signal.
    pub fn fire(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CloseReason> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> CloseReason {
        let mut rx = self.tx.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            // The sender lives in `self`, so this only fails if it was dropped mid-wait
            if rx.changed().await.is_err() {
                return self.reason().unwrap_or(CloseReason::Stopped);
            }
        }
    }
}
