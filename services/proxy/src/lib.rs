pub mod config;
pub mod error;
pub mod proxy;
pub mod routes;

pub use config::{Config, ConfigError};
pub use error::{ConnectionError, ProxyError};
pub use proxy::{
    BackendLauncher, ConnectionLifecycle, KeyStore, ListenerConfig, ListenerStats, ProviderError,
    ProviderRegistry, ProxyConfigurationProvider, ProxyConnectionRequest,
    ProxyConnectionSettings, ProxyServer, ProvisionedSettings, ServerKeyManager, SharedProvider,
    StaticConnectionSettings,
};
pub use routes::{MappingProvider, RoutesError};
