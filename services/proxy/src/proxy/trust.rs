//! Client trust authority.
//!
//! Authorization happens inside the TLS handshake: the client chain is
//! checked for temporal validity, then offered to each registered provider
//! in order. The first provider to accept it supplies the routing settings,
//! which are bound to the connection's context for the frontend handler.
//!
//! Every failing or ambiguous outcome rejects the handshake.

use std::iter;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, SignatureScheme,
};
use thiserror::Error;
use tracing::{debug, warn};

use super::certs;
use super::context::ConnectionContext;
use super::provider::{ProviderError, ProviderRegistry, ProxyConnectionRequest};

/// Reasons a client is refused during the handshake.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The certificate itself is invalid (expired, malformed, rejected).
    #[error("client certificate rejected: {0:?}")]
    Certificate(CertificateError),

    /// No provider recognized the identity.
    #[error("identity '{principal}' not authorized by any provider")]
    NotAuthorized { principal: String },

    /// A provider failed while deciding.
    #[error("authorization failed for '{principal}': {source}")]
    Provider {
        principal: String,
        #[source]
        source: ProviderError,
    },

    /// Settings were already attached to this connection.
    #[error("connection settings already bound")]
    SettingsAlreadyBound,
}

impl From<TrustError> for rustls::Error {
    fn from(err: TrustError) -> Self {
        match err {
            TrustError::Certificate(e) => rustls::Error::InvalidCertificate(e),
            TrustError::NotAuthorized { .. } => {
                rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
            }
            other => rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(
                Arc::new(other),
            ))),
        }
    }
}

/// Decides whether a client chain may connect, consulting the providers.
#[derive(Debug)]
pub struct ClientTrustAuthority {
    registry: Arc<ProviderRegistry>,
}

impl ClientTrustAuthority {
    /// Create an authority over a provider registry.
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// The providers consulted by this authority.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Validate a client chain (leaf first) and bind the winning provider's
    /// settings to `context`.
    pub fn check_client_trusted(
        &self,
        chain: Vec<CertificateDer<'static>>,
        now: UnixTime,
        context: &ConnectionContext,
    ) -> Result<(), TrustError> {
        let leaf = chain
            .first()
            .ok_or(TrustError::Certificate(CertificateError::BadEncoding))?;

        if let Err(e) = certs::check_validity(leaf, now) {
            warn!(
                connection_id = %context.id(),
                peer_addr = %context.peer_addr(),
                subject = %certs::subject_name(leaf).unwrap_or_default(),
                reason = ?e,
                "Client certificate outside validity period"
            );
            return Err(TrustError::Certificate(e));
        }

        let request = ProxyConnectionRequest::from_chain(chain).map_err(TrustError::Certificate)?;

        for provider in self.registry.snapshot().iter() {
            let authorized = provider
                .authorize(&request)
                .map_err(|e| self.provider_failure(&request, context, e))?;
            if !authorized {
                continue;
            }

            let settings = provider
                .settings_for_request(&request)
                .map_err(|e| self.provider_failure(&request, context, e))?;

            debug!(
                connection_id = %context.id(),
                principal = %request.principal(),
                destination = %settings.destination(),
                "Client identity authorized"
            );

            if !context.bind_settings(request.principal(), settings) {
                return Err(TrustError::SettingsAlreadyBound);
            }
            return Ok(());
        }

        warn!(
            connection_id = %context.id(),
            peer_addr = %context.peer_addr(),
            principal = %request.principal(),
            "Client identity not authorized"
        );
        Err(TrustError::NotAuthorized {
            principal: request.principal().to_string(),
        })
    }

    fn provider_failure(
        &self,
        request: &ProxyConnectionRequest,
        context: &ConnectionContext,
        err: ProviderError,
    ) -> TrustError {
        warn!(
            connection_id = %context.id(),
            peer_addr = %context.peer_addr(),
            principal = %request.principal(),
            error = %err,
            "Configuration provider rejected client"
        );
        match err.certificate_cause() {
            Some(cause) => TrustError::Certificate(cause),
            None => TrustError::Provider {
                principal: request.principal().to_string(),
                source: err,
            },
        }
    }
}

/// rustls client verifier for one connection.
///
/// Client authentication is mandatory. No issuer hints are sent, so the
/// trusted identities are not disclosed to peers.
#[derive(Debug)]
pub struct ConnectionVerifier {
    authority: Arc<ClientTrustAuthority>,
    context: Arc<ConnectionContext>,
    crypto: Arc<CryptoProvider>,
}

impl ConnectionVerifier {
    /// Create the verifier for a connection.
    pub fn new(
        authority: Arc<ClientTrustAuthority>,
        context: Arc<ConnectionContext>,
        crypto: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            authority,
            context,
            crypto,
        }
    }
}

impl ClientCertVerifier for ConnectionVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let chain = iter::once(end_entity)
            .chain(intermediates)
            .map(|cert| cert.clone().into_owned())
            .collect();

        self.authority
            .check_client_trusted(chain, now, &self.context)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.crypto.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::provider::SharedProvider;
    use crate::proxy::testing::{FixedProvider, TestCa};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn now() -> UnixTime {
        UnixTime::since_unix_epoch(SystemTime::now().duration_since(UNIX_EPOCH).unwrap())
    }

    fn context() -> ConnectionContext {
        ConnectionContext::new("127.0.0.1:40000".parse().unwrap())
    }

    fn authority(providers: Vec<SharedProvider>) -> ClientTrustAuthority {
        let registry = Arc::new(ProviderRegistry::new());
        for p in providers {
            registry.register(p);
        }
        ClientTrustAuthority::new(registry)
    }

    #[test]
    fn test_second_provider_used_when_first_declines() {
        let ca = TestCa::new("Test CA");
        let (chain, _) = ca.client("node-1");
        let authority = authority(vec![
            FixedProvider::declining(),
            FixedProvider::accepting("backend.local", 4000),
        ]);

        let ctx = context();
        authority.check_client_trusted(chain, now(), &ctx).unwrap();

        let settings = ctx.take_settings().unwrap();
        assert_eq!(settings.destination_host(), "backend.local");
        assert_eq!(settings.destination_port(), 4000);
        assert!(ctx.principal().unwrap().contains("CN=node-1"));
    }

    #[test]
    fn test_first_registered_provider_wins() {
        let ca = TestCa::new("Test CA");
        let (chain, _) = ca.client("node-1");
        let authority = authority(vec![
            FixedProvider::accepting("first.local", 1),
            FixedProvider::accepting("second.local", 2),
        ]);

        let ctx = context();
        authority.check_client_trusted(chain, now(), &ctx).unwrap();
        assert_eq!(ctx.take_settings().unwrap().destination_host(), "first.local");
    }

    #[test]
    fn test_unrecognized_identity_rejected() {
        let ca = TestCa::new("Test CA");
        let (chain, _) = ca.client("stranger");
        let authority = authority(vec![FixedProvider::declining()]);

        let ctx = context();
        let err = authority.check_client_trusted(chain, now(), &ctx).unwrap_err();
        assert!(matches!(err, TrustError::NotAuthorized { .. }));
        assert!(!ctx.is_authorized());
        assert!(matches!(
            rustls::Error::from(err),
            rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
        ));
    }

    #[test]
    fn test_empty_registry_rejects() {
        let ca = TestCa::new("Test CA");
        let (chain, _) = ca.client("node-1");
        let ctx = context();
        assert!(authority(Vec::new())
            .check_client_trusted(chain, now(), &ctx)
            .is_err());
    }

    #[test]
    fn test_provider_certificate_error_propagated() {
        let ca = TestCa::new("Test CA");
        let (chain, _) = ca.client("revoked");
        let authority = authority(vec![
            FixedProvider::failing(|| ProviderError::Certificate(CertificateError::Revoked)),
            FixedProvider::accepting("never.local", 1),
        ]);

        let ctx = context();
        let err = authority.check_client_trusted(chain, now(), &ctx).unwrap_err();
        assert!(matches!(err, TrustError::Certificate(CertificateError::Revoked)));
        assert!(!ctx.is_authorized());
    }

    #[test]
    fn test_provider_failure_fails_closed() {
        let ca = TestCa::new("Test CA");
        let (chain, _) = ca.client("node-1");
        let authority = authority(vec![
            FixedProvider::failing(|| ProviderError::Other(anyhow::anyhow!("lookup failed"))),
            FixedProvider::accepting("never.local", 1),
        ]);

        let ctx = context();
        let err = authority.check_client_trusted(chain, now(), &ctx).unwrap_err();
        assert!(matches!(err, TrustError::Provider { .. }));
        assert!(!ctx.is_authorized());
        assert!(matches!(
            rustls::Error::from(err),
            rustls::Error::InvalidCertificate(CertificateError::Other(_))
        ));
    }

    #[test]
    fn test_expired_certificate_rejected_before_providers() {
        let ca = TestCa::new("Test CA");
        let (chain, _) = ca.client_with_validity("old", (2000, 1, 1), (2001, 1, 1));
        let authority = authority(vec![FixedProvider::accepting("never.local", 1)]);

        let ctx = context();
        let err = authority.check_client_trusted(chain, now(), &ctx).unwrap_err();
        assert!(matches!(err, TrustError::Certificate(CertificateError::Expired)));
        assert!(!ctx.is_authorized());
    }

    #[test]
    fn test_not_yet_valid_certificate_rejected() {
        let ca = TestCa::new("Test CA");
        let (chain, _) = ca.client_with_validity("future", (2020, 1, 1), (2099, 1, 1));
        let authority = authority(vec![FixedProvider::accepting("never.local", 1)]);

        let ctx = context();
        let early = UnixTime::since_unix_epoch(Duration::from_secs(1_262_304_000)); // 2010-01-01
        let err = authority.check_client_trusted(chain, early, &ctx).unwrap_err();
        assert!(matches!(err, TrustError::Certificate(CertificateError::NotValidYet)));
    }

    #[test]
    fn test_unregistered_provider_not_consulted() {
        let ca = TestCa::new("Test CA");
        let registry = Arc::new(ProviderRegistry::new());
        let first: SharedProvider = FixedProvider::accepting("first.local", 1);
        registry.register(Arc::clone(&first));
        registry.register(FixedProvider::accepting("second.local", 2));
        assert!(registry.unregister(&first));

        let authority = ClientTrustAuthority::new(registry);
        let ctx = context();
        let (chain, _) = ca.client("node-1");
        authority.check_client_trusted(chain, now(), &ctx).unwrap();
        assert_eq!(ctx.take_settings().unwrap().destination_host(), "second.local");
    }

    #[test]
    fn test_verifier_advertises_no_issuers() {
        let verifier = ConnectionVerifier::new(
            Arc::new(authority(Vec::new())),
            Arc::new(context()),
            Arc::new(rustls::crypto::ring::default_provider()),
        );
        assert!(verifier.root_hint_subjects().is_empty());
        assert!(verifier.client_auth_mandatory());
        assert!(verifier.offer_client_auth());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }
}
