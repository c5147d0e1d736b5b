//! TLS context for the mutual-TLS listener.
//!
//! Composes the two TLS strategies explicitly: the key manager supplies the
//! server certificate and the trust authority decides client trust. Each
//! accepted connection gets its own `ServerConfig` whose verifier carries
//! that connection's context.

use std::fmt;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::server::NoServerSessionStorage;
use rustls::{ServerConfig, SupportedProtocolVersion};
use thiserror::Error;

use super::context::ConnectionContext;
use super::keys::ServerKeyManager;
use super::trust::{ClientTrustAuthority, ConnectionVerifier};

/// Protocol used when none is configured.
pub const DEFAULT_PROTOCOL: &str = "TLSv1.3";

/// TLS setup errors.
#[derive(Debug, Error)]
pub enum TlsSetupError {
    /// A protocol name is not recognized.
    #[error("unsupported TLS protocol '{0}' (expected TLSv1.2 or TLSv1.3)")]
    UnsupportedProtocol(String),

    /// The protocol allowlist is empty.
    #[error("no TLS protocols configured")]
    NoProtocols,
}

/// The crypto provider used for both key loading and handshakes.
pub fn default_crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Map protocol names (`TLSv1.3`, `TLSv1.2`) to rustls versions.
pub fn parse_protocols(
    names: &[String],
) -> Result<Vec<&'static SupportedProtocolVersion>, TlsSetupError> {
    let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::new();
    for name in names {
        let version = match name.trim() {
            "TLSv1.3" | "TLSv1_3" | "TLS1.3" => &rustls::version::TLS13,
            "TLSv1.2" | "TLSv1_2" | "TLS1.2" => &rustls::version::TLS12,
            other => return Err(TlsSetupError::UnsupportedProtocol(other.to_string())),
        };
        if !versions.iter().any(|v| v.version == version.version) {
            versions.push(version);
        }
    }
    if versions.is_empty() {
        return Err(TlsSetupError::NoProtocols);
    }
    Ok(versions)
}

/// Server certificate selection plus client trust, shared by all connections.
pub struct TlsAuthority {
    keys: Arc<ServerKeyManager>,
    trust: Arc<ClientTrustAuthority>,
    crypto: Arc<CryptoProvider>,
    protocols: Vec<&'static SupportedProtocolVersion>,
}

impl TlsAuthority {
    /// Create the authority.
    pub fn new(
        keys: Arc<ServerKeyManager>,
        trust: Arc<ClientTrustAuthority>,
        crypto: Arc<CryptoProvider>,
        protocols: Vec<&'static SupportedProtocolVersion>,
    ) -> Self {
        Self {
            keys,
            trust,
            crypto,
            protocols,
        }
    }

    /// The key manager serving the proxy's certificate.
    pub fn keys(&self) -> &Arc<ServerKeyManager> {
        &self.keys
    }

    /// The client trust authority.
    pub fn trust(&self) -> &Arc<ClientTrustAuthority> {
        &self.trust
    }

    /// Build the TLS configuration for one accepted connection.
    ///
    /// Session resumption is disabled so every connection passes through
    /// the trust check and gets its own settings.
    pub fn server_config(
        &self,
        context: Arc<ConnectionContext>,
    ) -> Result<Arc<ServerConfig>, rustls::Error> {
        let verifier = Arc::new(ConnectionVerifier::new(
            Arc::clone(&self.trust),
            context,
            Arc::clone(&self.crypto),
        ));

        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.crypto))
            .with_protocol_versions(&self.protocols)?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(self.keys.clone());
        config.session_storage = Arc::new(NoServerSessionStorage {});
        config.send_tls13_tickets = 0;

        Ok(Arc::new(config))
    }
}

impl fmt::Debug for TlsAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsAuthority")
            .field("alias", &self.keys.choose_server_alias())
            .field(
                "protocols",
                &self.protocols.iter().map(|v| v.version).collect::<Vec<_>>(),
            )
            .finish()
    }
}
