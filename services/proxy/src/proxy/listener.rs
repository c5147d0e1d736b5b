//! The proxy server: TCP listener, accept loop and provider registration.
//!
//! - One accept loop per running server
//! - Each accepted socket runs on its own task with its own context
//! - Concurrent connections are capped by a semaphore
//! - `stop` closes the listening socket and aborts in-flight connections

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::SupportedProtocolVersion;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::backend::{RelayOptions, RelayStats, RELAY_BUFFER_SIZE};
use super::context::ConnectionContext;
use super::frontend::{FrontendHandler, FrontendOptions};
use super::keys::ServerKeyManager;
use super::provider::{ProviderRegistry, SharedProvider};
use super::tls::{default_crypto_provider, TlsAuthority};
use super::trust::ClientTrustAuthority;
use crate::error::{ConnectionError, ProxyError};

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for the proxy listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Allowed TLS protocol versions.
    pub protocols: Vec<&'static SupportedProtocolVersion>,
    /// Limit on the TLS handshake.
    pub handshake_timeout: Option<Duration>,
    /// Limit on the backend connect.
    pub connect_timeout: Option<Duration>,
    /// Idle timeout for relayed connections.
    pub idle_timeout: Option<Duration>,
    /// Trace relayed bytes.
    pub wire_logging: bool,
}

impl ListenerConfig {
    /// Create a configuration with TLS 1.3 only and no timeouts.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            protocols: vec![&rustls::version::TLS13],
            handshake_timeout: None,
            connect_timeout: None,
            idle_timeout: None,
            wire_logging: false,
        }
    }

    fn frontend_options(&self) -> FrontendOptions {
        FrontendOptions {
            handshake_timeout: self.handshake_timeout,
            connect_timeout: self.connect_timeout,
            relay: RelayOptions {
                idle_timeout: self.idle_timeout,
                wire_logging: self.wire_logging,
                buffer_size: RELAY_BUFFER_SIZE,
            },
        }
    }
}

/// Statistics for the listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Handshakes that failed or were refused.
    pub handshakes_failed: AtomicU64,
    /// Connections with an authorized client identity.
    pub connections_authorized: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    pub(crate) fn record_authorized(&self) {
        self.connections_authorized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backend_connected(&self) {
        self.backend_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relay(&self, relayed: &RelayStats) {
        self.bytes_to_backend
            .fetch_add(relayed.bytes_to_backend, Ordering::Relaxed);
        self.bytes_from_backend
            .fetch_add(relayed.bytes_from_backend, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, err: &ConnectionError) {
        match err {
            ConnectionError::Handshake(_) | ConnectionError::HandshakeTimeout => {
                self.handshakes_failed.fetch_add(1, Ordering::Relaxed);
            }
            ConnectionError::BackendConnect { .. } => {
                self.backend_failed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// Decrements the active count when a connection task ends, aborted or not.
struct ActiveConnection {
    stats: Arc<ListenerStats>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Mutual-TLS proxy server.
///
/// Providers may be registered and unregistered at any time, including
/// while the server is running.
pub struct ProxyServer {
    config: ListenerConfig,
    registry: Arc<ProviderRegistry>,
    handler: Arc<FrontendHandler>,
    stats: Arc<ListenerStats>,
    running: Mutex<Option<Running>>,
}

impl ProxyServer {
    /// Create a server around an existing provider registry.
    pub fn new(
        config: ListenerConfig,
        registry: Arc<ProviderRegistry>,
        keys: Arc<ServerKeyManager>,
    ) -> Self {
        let trust = Arc::new(ClientTrustAuthority::new(Arc::clone(&registry)));
        let tls = Arc::new(TlsAuthority::new(
            keys,
            trust,
            default_crypto_provider(),
            config.protocols.clone(),
        ));
        let stats = Arc::new(ListenerStats::default());
        let handler = Arc::new(FrontendHandler::new(
            tls,
            config.frontend_options(),
            Arc::clone(&stats),
        ));

        Self {
            config,
            registry,
            handler,
            stats,
            running: Mutex::new(None),
        }
    }

    /// Add a provider after all previously registered ones.
    pub fn register_configuration_provider(&self, provider: SharedProvider) -> bool {
        self.registry.register(provider)
    }

    /// Remove a provider. Handshakes already in progress may still consult it.
    pub fn unregister_configuration_provider(&self, provider: &SharedProvider) -> bool {
        self.registry.unregister(provider)
    }

    /// The provider registry.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// The bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind the listening socket and start accepting connections.
    ///
    /// Returns the bound address (useful when binding port 0).
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_loop = AcceptLoop {
            listener,
            handler: Arc::clone(&self.handler),
            semaphore: Arc::new(Semaphore::new(self.config.max_connections)),
            stats: Arc::clone(&self.stats),
        };
        let task = tokio::spawn(
            accept_loop
                .run(shutdown_rx)
                .instrument(info_span!("listener", bind_addr = %local_addr)),
        );

        info!(
            bind_addr = %local_addr,
            max_connections = self.config.max_connections,
            providers = self.registry.len(),
            "Proxy started"
        );

        *running = Some(Running {
            local_addr,
            shutdown: shutdown_tx,
            task,
        });
        Ok(local_addr)
    }

    /// Stop accepting, close the listening socket and abort live connections.
    ///
    /// A stopped server may be started again.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.shutdown.send(true);
        if let Err(e) = running.task.await {
            error!(error = %e, "Accept loop ended abnormally");
        }
        info!(bind_addr = %running.local_addr, "Proxy stopped");
    }
}

struct AcceptLoop {
    listener: TcpListener,
    handler: Arc<FrontendHandler>,
    semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl AcceptLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.spawn_connection(&mut connections, stream, peer_addr),
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        drop(self.listener);
        debug!(in_flight = connections.len(), "Aborting in-flight connections");
        connections.shutdown().await;
    }

    fn spawn_connection(
        &self,
        connections: &mut JoinSet<()>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.stats
                    .connections_rejected
                    .fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.stats
            .connections_active
            .fetch_add(1, Ordering::Relaxed);

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let active = ActiveConnection {
            stats: Arc::clone(&self.stats),
            _permit: permit,
        };
        let handler = Arc::clone(&self.handler);
        let context = Arc::new(ConnectionContext::new(peer_addr));
        let span = info_span!("connection", id = %context.id(), peer = %peer_addr);

        connections.spawn(
            async move {
                let _active = active;
                handler.handle(stream, context).await;
            }
            .instrument(span),
        );
    }
}
