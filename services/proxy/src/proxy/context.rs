//! Per-connection context.
//!
//! # Responsibilities
//! - Give each accepted socket a unique ID for tracing
//! - Track the frontend state machine
//! - Carry the routing decision from the trust check to the frontend handler
//!
//! ```text
//! AwaitingHandshake → ConnectingBackend → Relaying → Closed
//!         └──────────────────┴───────────────┴──→ Failed
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::provider::ProxyConnectionSettings;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frontend connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TLS handshake in progress.
    AwaitingHandshake,
    /// Authorized; connecting to the destination.
    ConnectingBackend,
    /// Bytes flowing in both directions.
    Relaying,
    /// Both sides closed normally.
    Closed,
    /// Terminated by an error.
    Failed,
}

impl ConnectionState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    settings: Option<Arc<dyn ProxyConnectionSettings>>,
    settings_bound: bool,
    principal: Option<String>,
}

/// State shared by the handshake verifier and the frontend handler of one
/// connection.
#[derive(Debug)]
pub struct ConnectionContext {
    id: ConnectionId,
    peer_addr: SocketAddr,
    inner: Mutex<Inner>,
}

impl ConnectionContext {
    /// Create the context for a freshly accepted socket.
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            peer_addr,
            inner: Mutex::new(Inner {
                state: ConnectionState::AwaitingHandshake,
                settings: None,
                settings_bound: false,
                principal: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address of the client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Move to a new state. Terminal states are never left.
    pub fn transition(&self, next: ConnectionState) -> ConnectionState {
        let mut inner = self.lock();
        let previous = inner.state;
        if !previous.is_terminal() {
            inner.state = next;
            trace!(connection_id = %self.id, from = ?previous, to = ?next, "State transition");
        }
        previous
    }

    /// Attach the routing decision for this connection.
    ///
    /// Succeeds only once per connection; a second call returns false and
    /// leaves the first binding in place.
    pub fn bind_settings(
        &self,
        principal: &str,
        settings: Arc<dyn ProxyConnectionSettings>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.settings_bound {
            return false;
        }
        inner.settings_bound = true;
        inner.settings = Some(settings);
        inner.principal = Some(principal.to_string());
        true
    }

    /// Take the routing decision. Yields it at most once.
    pub fn take_settings(&self) -> Option<Arc<dyn ProxyConnectionSettings>> {
        self.lock().settings.take()
    }

    /// Whether settings were ever bound.
    pub fn is_authorized(&self) -> bool {
        self.lock().settings_bound
    }

    /// The authorized client identity, once known.
    pub fn principal(&self) -> Option<String> {
        self.lock().principal.clone()
    }
}
