//! Configuration provider contract and the ordered provider registry.
//!
//! Providers decide, during the TLS handshake, whether they recognize a
//! client identity and where its connection should be forwarded.
//!
//! - Registration order is authorization priority
//! - The first provider that authorizes an identity wins
//! - Registry updates swap in a new snapshot; live handshakes keep
//!   iterating the snapshot they loaded

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use rustls::CertificateError;
use thiserror::Error;
use tracing::info;

use super::certs;

/// A client's claimed identity and the certificate chain it presented.
#[derive(Debug, Clone)]
pub struct ProxyConnectionRequest {
    principal: String,
    chain: Vec<CertificateDer<'static>>,
}

impl ProxyConnectionRequest {
    /// Create a request from an already known principal.
    pub fn new(principal: impl Into<String>, chain: Vec<CertificateDer<'static>>) -> Self {
        Self {
            principal: principal.into(),
            chain,
        }
    }

    /// Build a request from a presented chain, leaf first.
    ///
    /// The principal is the leaf certificate's subject name.
    pub fn from_chain(chain: Vec<CertificateDer<'static>>) -> Result<Self, CertificateError> {
        let leaf = chain.first().ok_or(CertificateError::BadEncoding)?;
        let principal = certs::subject_name(leaf)?;
        Ok(Self { principal, chain })
    }

    /// The client identity (leaf subject name).
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// The full chain as presented during the handshake.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The client's own certificate.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }

    /// Certificates presented after the leaf.
    pub fn intermediates(&self) -> &[CertificateDer<'static>] {
        self.chain.get(1..).unwrap_or(&[])
    }
}

/// Errors a provider raises to hard-reject a connection.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The client certificate itself is unacceptable.
    #[error("certificate rejected: {0:?}")]
    Certificate(CertificateError),

    /// Any other failure while making the decision.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProviderError {
    /// The certificate error at the root of this failure, if any.
    pub fn certificate_cause(&self) -> Option<CertificateError> {
        match self {
            ProviderError::Certificate(e) => Some(e.clone()),
            ProviderError::Other(e) => e.chain().find_map(|cause| {
                match cause.downcast_ref::<rustls::Error>() {
                    Some(rustls::Error::InvalidCertificate(ce)) => Some(ce.clone()),
                    _ => None,
                }
            }),
        }
    }
}

impl From<CertificateError> for ProviderError {
    fn from(e: CertificateError) -> Self {
        ProviderError::Certificate(e)
    }
}

/// Lifecycle hooks for settings whose backend is provisioned on demand.
#[async_trait]
pub trait ConnectionLifecycle: Send + Sync {
    /// Called once the connection is authorized, before the backend connect.
    ///
    /// The future may be dropped before it completes when the server stops;
    /// `stop` is not called in that case.
    async fn start(&self) -> Result<(), ProviderError>;

    /// Called exactly once after the backend connection has closed.
    async fn stop(&self);
}

/// The routing decision for one authorized connection.
pub trait ProxyConnectionSettings: Send + Sync + fmt::Debug {
    /// Host to forward the connection to.
    fn destination_host(&self) -> &str;

    /// Port to forward the connection to.
    fn destination_port(&self) -> u16;

    /// Trust anchors associated with the destination, if any.
    fn destination_trust_anchors(&self) -> &[CertificateDer<'static>] {
        &[]
    }

    /// Start/stop hooks, for settings that provision their backend lazily.
    fn lifecycle(&self) -> Option<&dyn ConnectionLifecycle> {
        None
    }

    /// `host:port` form of the destination.
    fn destination(&self) -> String {
        let host = self.destination_host();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.destination_port())
        } else {
            format!("{}:{}", host, self.destination_port())
        }
    }
}

/// Fixed destination settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticConnectionSettings {
    host: String,
    port: u16,
    trust_anchors: Vec<CertificateDer<'static>>,
}

impl StaticConnectionSettings {
    /// Create settings for a fixed destination.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            trust_anchors: Vec::new(),
        }
    }

    /// Attach destination trust anchors.
    pub fn with_trust_anchors(mut self, trust_anchors: Vec<CertificateDer<'static>>) -> Self {
        self.trust_anchors = trust_anchors;
        self
    }
}

impl ProxyConnectionSettings for StaticConnectionSettings {
    fn destination_host(&self) -> &str {
        &self.host
    }

    fn destination_port(&self) -> u16 {
        self.port
    }

    fn destination_trust_anchors(&self) -> &[CertificateDer<'static>] {
        &self.trust_anchors
    }
}

/// An authorization and routing decision-maker consulted during the handshake.
pub trait ProxyConfigurationProvider: Send + Sync {
    /// Whether this provider accepts the identity in `request`.
    ///
    /// `Ok(false)` passes the request to the next provider. An error
    /// rejects the connection outright.
    fn authorize(&self, request: &ProxyConnectionRequest) -> Result<bool, ProviderError>;

    /// Routing settings for a request this provider just authorized.
    fn settings_for_request(
        &self,
        request: &ProxyConnectionRequest,
    ) -> Result<Arc<dyn ProxyConnectionSettings>, ProviderError>;

    /// Issuers this provider trusts. Diagnostic only.
    fn accepted_identity_issuers(&self) -> Vec<CertificateDer<'static>> {
        Vec::new()
    }
}

/// Shared handle to a provider.
pub type SharedProvider = Arc<dyn ProxyConfigurationProvider>;

fn same_provider(a: &SharedProvider, b: &SharedProvider) -> bool {
    // Compare data pointers only; vtable pointers are not unique.
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Ordered, duplicate-free set of providers.
///
/// Uses ArcSwap so handshakes iterate a stable snapshot without locking
/// while registrations swap in a new list.
pub struct ProviderRegistry {
    providers: ArcSwap<Vec<SharedProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            providers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Append a provider. Returns false if it was already registered.
    pub fn register(&self, provider: SharedProvider) -> bool {
        let previous = self.providers.rcu(|current| {
            if current.iter().any(|p| same_provider(p, &provider)) {
                Arc::clone(current)
            } else {
                let mut next = Vec::with_capacity(current.len() + 1);
                next.extend(current.iter().cloned());
                next.push(Arc::clone(&provider));
                Arc::new(next)
            }
        });

        let added = !previous.iter().any(|p| same_provider(p, &provider));
        if added {
            info!(provider_count = previous.len() + 1, "Configuration provider registered");
        }
        added
    }

    /// Remove a provider. Returns whether it was registered.
    pub fn unregister(&self, provider: &SharedProvider) -> bool {
        let previous = self.providers.rcu(|current| {
            Arc::new(
                current
                    .iter()
                    .filter(|p| !same_provider(p, provider))
                    .cloned()
                    .collect::<Vec<_>>(),
            )
        });

        let removed = previous.iter().any(|p| same_provider(p, provider));
        if removed {
            info!(provider_count = previous.len() - 1, "Configuration provider unregistered");
        }
        removed
    }

    /// Current providers in priority order.
    pub fn snapshot(&self) -> Arc<Vec<SharedProvider>> {
        self.providers.load_full()
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.load().len()
    }

    /// Check if no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.load().is_empty()
    }

    /// Union of every provider's trusted issuers. Diagnostic only; never
    /// advertised to TLS peers.
    pub fn accepted_identity_issuers(&self) -> Vec<CertificateDer<'static>> {
        let mut issuers: Vec<CertificateDer<'static>> = Vec::new();
        for provider in self.providers.load().iter() {
            for issuer in provider.accepted_identity_issuers() {
                if !issuers.contains(&issuer) {
                    issuers.push(issuer);
                }
            }
        }
        issuers
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.len())
            .finish()
    }
}
