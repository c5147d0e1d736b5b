//! Error types for the proxy service.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ConfigError;
use crate::proxy::{KeyStoreError, ProviderError, TlsSetupError};

/// Errors that stop the proxy from starting.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `start` was called on a running server.
    #[error("proxy is already running")]
    AlreadyRunning,

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Server key material could not be loaded.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// TLS parameters are invalid.
    #[error(transparent)]
    Tls(#[from] TlsSetupError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors that end a single proxied connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The per-connection TLS configuration could not be built.
    #[error("tls config failed: {0}")]
    TlsConfig(#[from] rustls::Error),

    /// The TLS handshake failed (bad client, rejected identity, non-TLS bytes).
    #[error("handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// The TLS handshake did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The handshake succeeded but no settings were bound to the connection.
    #[error("handshake completed without connection settings")]
    MissingSettings,

    /// The settings' start hook failed.
    #[error("backend provisioning failed: {0}")]
    Provisioning(#[source] ProviderError),

    /// The destination could not be reached.
    #[error("backend connect to {destination} failed: {source}")]
    BackendConnect {
        destination: String,
        #[source]
        source: io::Error,
    },

    /// IO error while relaying.
    #[error("relay io error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectionError {
    /// Get a stable reason code for logging.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConnectionError::TlsConfig(_) => "tls_config_failed",
            ConnectionError::Handshake(_) => "handshake_failed",
            ConnectionError::HandshakeTimeout => "handshake_timeout",
            ConnectionError::MissingSettings => "missing_settings",
            ConnectionError::Provisioning(_) => "provisioning_failed",
            ConnectionError::BackendConnect { .. } => "backend_connect_failed",
            ConnectionError::Io(_) => "io_error",
        }
    }

    /// Whether this is background noise of a public TLS port: scanners
    /// sending plaintext, broken handshakes, peers resetting the socket.
    pub fn is_transport_noise(&self) -> bool {
        match self {
            ConnectionError::Handshake(e) | ConnectionError::Io(e) => is_io_noise(e),
            ConnectionError::HandshakeTimeout => true,
            _ => false,
        }
    }

    /// Whether this is an expected operational failure outside the proxy's
    /// control (unreachable backend, provider refusing to provision).
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            ConnectionError::BackendConnect { .. } | ConnectionError::Provisioning(_)
        )
    }
}

fn is_io_noise(err: &io::Error) -> bool {
    if let Some(tls) = err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
        return !matches!(tls, rustls::Error::General(_) | rustls::Error::Other(_));
    }

    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::InvalidData
            | io::ErrorKind::NotConnected
            | io::ErrorKind::TimedOut
    )
}
