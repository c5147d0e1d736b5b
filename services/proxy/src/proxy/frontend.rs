//! Per-connection frontend handling.
//!
//! Drives one accepted socket through the handshake, the backend connect
//! and the relay:
//!
//! ```text
//! accept ─→ TLS handshake ─→ take settings ─→ start hook ─→ connect ─→ relay
//!            (trust check)                                              │
//!                                              stop hook (exactly once) ←┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::backend::{relay, BackendConnection, BackendConnector, RelayOptions, RelayStats};
use super::context::{ConnectionContext, ConnectionState};
use super::listener::ListenerStats;
use super::provider::ProxyConnectionSettings;
use super::tls::TlsAuthority;
use crate::error::ConnectionError;

/// Timeouts and relay options applied to every connection.
#[derive(Debug, Clone, Default)]
pub struct FrontendOptions {
    /// Limit on the TLS handshake, including the trust decision.
    pub handshake_timeout: Option<Duration>,
    /// Limit on the backend connect.
    pub connect_timeout: Option<Duration>,
    /// Relay tuning.
    pub relay: RelayOptions,
}

/// Handles accepted sockets.
pub struct FrontendHandler {
    tls: Arc<TlsAuthority>,
    connector: BackendConnector,
    handshake_timeout: Option<Duration>,
    relay: RelayOptions,
    stats: Arc<ListenerStats>,
}

impl FrontendHandler {
    /// Create a handler.
    pub fn new(tls: Arc<TlsAuthority>, options: FrontendOptions, stats: Arc<ListenerStats>) -> Self {
        Self {
            tls,
            connector: BackendConnector::new(options.connect_timeout),
            handshake_timeout: options.handshake_timeout,
            relay: options.relay,
            stats,
        }
    }

    /// Serve one connection to completion and log how it ended.
    pub async fn handle(&self, stream: TcpStream, context: Arc<ConnectionContext>) {
        match self.serve(stream, &context).await {
            Ok(Some(relayed)) => {
                context.transition(ConnectionState::Closed);
                self.stats.record_relay(&relayed);
                info!(
                    bytes_to_backend = relayed.bytes_to_backend,
                    bytes_from_backend = relayed.bytes_from_backend,
                    "Connection closed"
                );
            }
            Ok(None) => {
                context.transition(ConnectionState::Closed);
                debug!("Client closed before the backend connection was established");
            }
            Err(e) => {
                context.transition(ConnectionState::Failed);
                self.stats.record_failure(&e);
                if e.is_transport_noise() {
                    debug!(reason = e.reason_code(), error = %e, "Connection dropped");
                } else if e.is_operational() {
                    warn!(reason = e.reason_code(), error = %e, "Connection failed");
                } else {
                    error!(reason = e.reason_code(), error = %e, "Unexpected connection error");
                }
            }
        }
    }

    async fn serve(
        &self,
        stream: TcpStream,
        context: &Arc<ConnectionContext>,
    ) -> Result<Option<RelayStats>, ConnectionError> {
        let config = self.tls.server_config(Arc::clone(context))?;
        let tls = self.handshake(TlsAcceptor::from(config), stream).await?;

        let settings = context
            .take_settings()
            .ok_or(ConnectionError::MissingSettings)?;
        context.transition(ConnectionState::ConnectingBackend);
        self.stats.record_authorized();
        info!(
            principal = context.principal().as_deref().unwrap_or(""),
            "Client authorized"
        );

        let hooks = LifecycleGuard::start(Arc::clone(&settings)).await?;
        let outcome = self.connect_and_relay(tls, settings.as_ref(), context).await;
        hooks.finish().await;
        outcome
    }

    async fn handshake(
        &self,
        acceptor: TlsAcceptor,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, ConnectionError> {
        let accept = acceptor.accept(stream);
        let result = match self.handshake_timeout {
            Some(limit) => timeout(limit, accept)
                .await
                .map_err(|_| ConnectionError::HandshakeTimeout)?,
            None => accept.await,
        };
        result.map_err(ConnectionError::Handshake)
    }

    async fn connect_and_relay(
        &self,
        mut tls: TlsStream<TcpStream>,
        settings: &dyn ProxyConnectionSettings,
        context: &ConnectionContext,
    ) -> Result<Option<RelayStats>, ConnectionError> {
        let destination = settings.destination();

        let connected = self.connector.connect(&destination, &mut tls).await;
        let (mut backend, pending) = match connected {
            Ok(BackendConnection::Connected { stream, pending }) => (stream, pending),
            Ok(BackendConnection::InboundClosed) => return Ok(None),
            Err(source) => {
                return Err(ConnectionError::BackendConnect {
                    destination,
                    source,
                });
            }
        };
        self.stats.record_backend_connected();
        debug!(destination = %destination, "Backend connected");

        let mut early_bytes = 0u64;
        if let Some(early) = pending {
            backend.write_all(&early).await?;
            backend.flush().await?;
            early_bytes = early.len() as u64;
        }

        context.transition(ConnectionState::Relaying);
        let mut relayed = relay(tls, backend, &self.relay).await?;
        relayed.bytes_to_backend += early_bytes;
        Ok(Some(relayed))
    }
}

/// Runs the settings' stop hook once the connection is done with them.
///
/// `finish` runs it inline; if the connection task is aborted first, the
/// hook is spawned from `Drop` instead.
#[derive(Debug)]
struct LifecycleGuard {
    settings: Option<Arc<dyn ProxyConnectionSettings>>,
}

impl LifecycleGuard {
    async fn start(settings: Arc<dyn ProxyConnectionSettings>) -> Result<Self, ConnectionError> {
        let armed = match settings.lifecycle() {
            Some(hooks) => {
                hooks.start().await.map_err(ConnectionError::Provisioning)?;
                true
            }
            None => false,
        };
        Ok(Self {
            settings: armed.then_some(settings),
        })
    }

    async fn finish(mut self) {
        if let Some(settings) = self.settings.take() {
            if let Some(hooks) = settings.lifecycle() {
                hooks.stop().await;
            }
        }
    }
}

impl Drop for LifecycleGuard {
    fn drop(&mut self) {
        let Some(settings) = self.settings.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(hooks) = settings.lifecycle() {
                        hooks.stop().await;
                    }
                });
            }
            Err(_) => warn!("No runtime available to run the connection stop hook"),
        }
    }
}
