//! Mutual-TLS dynamic proxy.
//!
//! This module provides:
//! - The configuration provider contract and ordered registry
//! - Server key selection and client trust evaluation
//! - Per-connection context carrying the routing decision
//! - Backend connect and pull-based relay
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> TLS handshake -> Trust authority -> Providers
//!                            |                                 |
//!                            |               settings bound to context
//!                            v                                 |
//!                        Frontend <----------------------------+
//!                            |
//!                 start hook, connect, relay -> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let registry = Arc::new(ProviderRegistry::new());
//! let keys = Arc::new(ServerKeyManager::new(store, aliases, &default_crypto_provider())?);
//!
//! let server = ProxyServer::new(ListenerConfig::new("0.0.0.0:8802".parse()?), registry, keys);
//! server.register_configuration_provider(provider);
//! let addr = server.start().await?;
//! ```

mod backend;
mod certs;
mod context;
mod frontend;
mod keys;
mod listener;
mod provider;
mod provisioned;
mod tls;
mod trust;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    relay, BackendConnection, BackendConnector, RelayOptions, RelayStats, RELAY_BUFFER_SIZE,
};
pub use certs::{check_validity, is_self_issued, subject_name};
pub use context::{ConnectionContext, ConnectionId, ConnectionState};
pub use frontend::{FrontendHandler, FrontendOptions};
pub use keys::{
    read_certificates, read_private_key, KeyStore, KeyStoreError, ServerKeyManager,
    DEFAULT_SERVER_ALIAS,
};
pub use listener::{ListenerConfig, ListenerStats, ProxyServer, DEFAULT_MAX_CONNECTIONS};
pub use provider::{
    ConnectionLifecycle, ProviderError, ProviderRegistry, ProxyConfigurationProvider,
    ProxyConnectionRequest, ProxyConnectionSettings, SharedProvider, StaticConnectionSettings,
};
pub use provisioned::{BackendLauncher, ProvisionedSettings};
pub use tls::{
    default_crypto_provider, parse_protocols, TlsAuthority, TlsSetupError, DEFAULT_PROTOCOL,
};
pub use trust::{ClientTrustAuthority, ConnectionVerifier, TrustError};
