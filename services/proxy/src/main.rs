//! dynproxy
//!
//! Mutual-TLS reverse proxy with per-connection dynamic backends.
//!
//! This service:
//! - Terminates TLS and requires a client certificate
//! - Authorizes each client identity against the configured providers
//! - Connects to the destination chosen for that identity
//! - Relays bytes until either side closes

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dynproxy_proxy::proxy::default_crypto_provider;
use dynproxy_proxy::{
    Config, KeyStore, MappingProvider, ProviderRegistry, ProxyServer, ServerKeyManager,
};

fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to DYNPROXY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all().thread_name("dynproxy-worker");
    if let Some(workers) = config.worker_threads {
        runtime.worker_threads(workers);
    }
    let runtime = runtime.build().context("Failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    info!("Starting dynproxy");
    info!(
        bind_addr = %config.bind_addr,
        protocols = ?config.tls_protocols,
        keystore_dir = %config.keystore_dir.display(),
        key_aliases = ?config.key_aliases,
        max_connections = config.max_connections,
        wire_logging = config.wire_logging,
        "Configuration loaded"
    );

    let store = KeyStore::load_dir(&config.keystore_dir, &config.key_aliases)
        .with_context(|| format!("Failed to load key store {}", config.keystore_dir.display()))?;
    let keys = Arc::new(ServerKeyManager::new(
        store,
        config.key_aliases.clone(),
        &default_crypto_provider(),
    )?);

    let registry = Arc::new(ProviderRegistry::new());
    let server = ProxyServer::new(config.listener_config()?, Arc::clone(&registry), keys);

    match &config.routes_file {
        Some(path) => {
            let routes = MappingProvider::from_file(path)?;
            server.register_configuration_provider(Arc::new(routes));
        }
        None => warn!("No routes file configured; all clients will be rejected"),
    }

    let addr = server.start().await?;
    info!(bind_addr = %addr, providers = registry.len(), "Listening");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    server.stop().await;
    info!("dynproxy stopped");
    Ok(())
}
