//! Proxy configuration.
//!
//! Everything is read from `DYNPROXY_*` environment variables; unset
//! timeouts mean "never time out".

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::proxy::{
    parse_protocols, ListenerConfig, TlsSetupError, DEFAULT_MAX_CONNECTIONS, DEFAULT_PROTOCOL,
    DEFAULT_SERVER_ALIAS,
};

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8802";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable could not be parsed.
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    /// A required variable is missing.
    #[error("{0} must be set")]
    Missing(&'static str),

    /// The protocol allowlist is invalid.
    #[error("DYNPROXY_TLS_PROTOCOLS: {0}")]
    Protocols(#[from] TlsSetupError),
}

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TLS listener binds to.
    pub bind_addr: SocketAddr,

    /// Allowed TLS protocol names (`TLSv1.3`, `TLSv1.2`).
    pub tls_protocols: Vec<String>,

    /// Directory holding `<alias>.crt` / `<alias>.key` pairs.
    pub keystore_dir: PathBuf,

    /// Server key aliases, in preference order.
    pub key_aliases: Vec<String>,

    /// Trace every relayed chunk.
    pub wire_logging: bool,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Runtime worker threads (None = one per core).
    pub worker_threads: Option<usize>,

    /// Limit on the TLS handshake.
    pub handshake_timeout: Option<Duration>,

    /// Limit on the backend connect.
    pub connect_timeout: Option<Duration>,

    /// Relay idle timeout.
    pub idle_timeout: Option<Duration>,

    /// Optional static routes file.
    pub routes_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bind_addr = parse_var(
            "DYNPROXY_BIND_ADDR",
            &var("DYNPROXY_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        )?;

        let tls_protocols = split_list(
            &var("DYNPROXY_TLS_PROTOCOLS").unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
        );
        parse_protocols(&tls_protocols)?;

        let keystore_dir = var("DYNPROXY_KEYSTORE_DIR")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("DYNPROXY_KEYSTORE_DIR"))?;

        let key_aliases = split_list(
            &var("DYNPROXY_KEY_ALIASES").unwrap_or_else(|| DEFAULT_SERVER_ALIAS.to_string()),
        );

        let wire_logging = var("DYNPROXY_WIRE_LOGGING")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let max_connections = var("DYNPROXY_MAX_CONNECTIONS")
            .map(|v| parse_var::<usize>("DYNPROXY_MAX_CONNECTIONS", &v))
            .transpose()?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let worker_threads = var("DYNPROXY_WORKER_THREADS")
            .map(|v| parse_var::<usize>("DYNPROXY_WORKER_THREADS", &v))
            .transpose()?
            .filter(|n| *n > 0);

        let handshake_timeout = millis(&var, "DYNPROXY_HANDSHAKE_TIMEOUT_MS")?;
        let connect_timeout = millis(&var, "DYNPROXY_CONNECT_TIMEOUT_MS")?;
        let idle_timeout = millis(&var, "DYNPROXY_IDLE_TIMEOUT_MS")?;

        let routes_file = var("DYNPROXY_ROUTES_FILE").map(PathBuf::from);

        let log_level = var("DYNPROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bind_addr,
            tls_protocols,
            keystore_dir,
            key_aliases,
            wire_logging,
            max_connections,
            worker_threads,
            handshake_timeout,
            connect_timeout,
            idle_timeout,
            routes_file,
            log_level,
        })
    }

    /// Listener settings derived from this configuration.
    pub fn listener_config(&self) -> Result<ListenerConfig, ConfigError> {
        let mut listener = ListenerConfig::new(self.bind_addr);
        listener.max_connections = self.max_connections;
        listener.protocols = parse_protocols(&self.tls_protocols)?;
        listener.handshake_timeout = self.handshake_timeout;
        listener.connect_timeout = self.connect_timeout;
        listener.idle_timeout = self.idle_timeout;
        listener.wire_logging = self.wire_logging;
        Ok(listener)
    }
}

fn parse_var<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: format!("'{}': {}", value, e),
    })
}

fn millis<F>(var: &F, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(var(name)
        .map(|v| parse_var::<u64>(name, &v))
        .transpose()?
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
