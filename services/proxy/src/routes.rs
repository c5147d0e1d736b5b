//! Static principal-to-destination mapping loaded from a TOML file.
//!
//! ```toml
//! # Optional: client chains must validate against these anchors.
//! trust_anchors = "clients-ca.pem"
//!
//! [[routes]]
//! principal = "CN=billing-agent"
//! destination = "10.0.4.17:5432"
//!
//! [[routes]]
//! principal = "CN=metrics"
//! destination = "[fd00::12]:9100"
//! ```
//!
//! Relative `trust_anchors` paths are resolved against the routes file's
//! directory. Principals are matched exactly against the leaf subject.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::RootCertStore;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::proxy::{
    default_crypto_provider, KeyStoreError, ProviderError, ProxyConfigurationProvider,
    ProxyConnectionRequest, ProxyConnectionSettings, StaticConnectionSettings,
};

/// Errors loading a routes file.
#[derive(Debug, Error)]
pub enum RoutesError {
    #[error("failed to read routes file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid routes file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("route for {principal}: invalid destination '{destination}' (expected host:port)")]
    InvalidDestination {
        principal: String,
        destination: String,
    },

    #[error("duplicate route for {0}")]
    DuplicatePrincipal(String),

    #[error("failed to load trust anchors: {0}")]
    TrustAnchors(#[from] KeyStoreError),

    #[error("invalid trust anchors: {0}")]
    Verifier(#[from] VerifierBuilderError),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoutesFile {
    trust_anchors: Option<PathBuf>,
    #[serde(default)]
    routes: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteEntry {
    principal: String,
    destination: String,
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn parse_destination(destination: &str) -> Option<(String, u16)> {
    let (host, port) = destination.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']')?,
        None if host.contains(':') => return None,
        None => host,
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Provider answering from a fixed table of principals.
pub struct MappingProvider {
    routes: HashMap<String, Arc<StaticConnectionSettings>>,
    anchors: Vec<CertificateDer<'static>>,
    verifier: Option<Arc<dyn ClientCertVerifier>>,
}

impl MappingProvider {
    /// Load a routes file.
    pub fn from_file(path: &Path) -> Result<Self, RoutesError> {
        let text = std::fs::read_to_string(path).map_err(|source| RoutesError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let provider = Self::from_toml(&text, path.parent())?;
        info!(
            path = %path.display(),
            routes = provider.len(),
            trust_anchors = provider.anchors.len(),
            "Loaded routes file"
        );
        Ok(provider)
    }

    /// Parse routes from TOML. `base_dir` resolves a relative anchors path.
    pub fn from_toml(text: &str, base_dir: Option<&Path>) -> Result<Self, RoutesError> {
        let file: RoutesFile = toml::from_str(text)?;

        let mut routes = HashMap::with_capacity(file.routes.len());
        for entry in file.routes {
            let (host, port) = parse_destination(&entry.destination).ok_or_else(|| {
                RoutesError::InvalidDestination {
                    principal: entry.principal.clone(),
                    destination: entry.destination.clone(),
                }
            })?;
            if routes.contains_key(&entry.principal) {
                return Err(RoutesError::DuplicatePrincipal(entry.principal));
            }
            routes.insert(
                entry.principal,
                Arc::new(StaticConnectionSettings::new(host, port)),
            );
        }

        let provider = Self {
            routes,
            anchors: Vec::new(),
            verifier: None,
        };
        match file.trust_anchors {
            Some(path) => {
                let path = match base_dir {
                    Some(dir) if path.is_relative() => dir.join(path),
                    _ => path,
                };
                let anchors = crate::proxy::read_certificates(&path)?;
                provider.with_trust_anchors(anchors)
            }
            None => Ok(provider),
        }
    }

    /// Require client chains to validate against `anchors`.
    pub fn with_trust_anchors(
        mut self,
        anchors: Vec<CertificateDer<'static>>,
    ) -> Result<Self, RoutesError> {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(anchors.iter().cloned());
        debug!(added, ignored, "Loaded client trust anchors");

        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), default_crypto_provider())
                .build()?;
        self.anchors = anchors;
        self.verifier = Some(verifier);
        Ok(self)
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if there are no routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// The configured destination for a principal.
    pub fn destination_for(&self, principal: &str) -> Option<String> {
        self.routes.get(principal).map(|s| s.destination())
    }

    fn validate_chain(&self, request: &ProxyConnectionRequest) -> Result<(), ProviderError> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };
        let leaf = request
            .leaf()
            .ok_or(rustls::CertificateError::BadEncoding)?;

        match verifier.verify_client_cert(leaf, request.intermediates(), UnixTime::now()) {
            Ok(_) => Ok(()),
            Err(rustls::Error::InvalidCertificate(e)) => Err(ProviderError::Certificate(e)),
            Err(e) => Err(ProviderError::Other(e.into())),
        }
    }
}

impl ProxyConfigurationProvider for MappingProvider {
    fn authorize(&self, request: &ProxyConnectionRequest) -> Result<bool, ProviderError> {
        if !self.routes.contains_key(request.principal()) {
            return Ok(false);
        }
        self.validate_chain(request)?;
        Ok(true)
    }

    fn settings_for_request(
        &self,
        request: &ProxyConnectionRequest,
    ) -> Result<Arc<dyn ProxyConnectionSettings>, ProviderError> {
        let settings = self.routes.get(request.principal()).ok_or_else(|| {
            anyhow::anyhow!("no route for principal {}", request.principal())
        })?;
        Ok(Arc::clone(settings) as Arc<dyn ProxyConnectionSettings>)
    }

    fn accepted_identity_issuers(&self) -> Vec<CertificateDer<'static>> {
        self.anchors.clone()
    }
}

impl fmt::Debug for MappingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingProvider")
            .field("routes", &self.routes.len())
            .field("trust_anchors", &self.anchors.len())
            .finish()
    }
}
