//! Certificate fixtures for unit tests.

use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use super::provider::{
    ProviderError, ProxyConfigurationProvider, ProxyConnectionRequest, ProxyConnectionSettings,
    SharedProvider, StaticConnectionSettings,
};

pub struct TestCa {
    pub cert: Certificate,
    pub key: KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Issue a client certificate; returns (chain, key).
    pub fn client(&self, common_name: &str) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        self.client_with_validity(common_name, (2020, 1, 1), (2099, 1, 1))
    }

    pub fn client_with_validity(
        &self,
        common_name: &str,
        not_before: (i32, u8, u8),
        not_after: (i32, u8, u8),
    ) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = rcgen::date_time_ymd(not_before.0, not_before.1, not_before.2);
        params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (
            vec![cert.der().clone(), self.der()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }
}

/// Provider with a fixed answer, for ordering tests.
pub struct FixedProvider {
    pub answer: Result<bool, fn() -> ProviderError>,
    pub host: &'static str,
    pub port: u16,
}

impl FixedProvider {
    pub fn accepting(host: &'static str, port: u16) -> SharedProvider {
        Arc::new(Self {
            answer: Ok(true),
            host,
            port,
        })
    }

    pub fn declining() -> SharedProvider {
        Arc::new(Self {
            answer: Ok(false),
            host: "unused",
            port: 0,
        })
    }

    pub fn failing(err: fn() -> ProviderError) -> SharedProvider {
        Arc::new(Self {
            answer: Err(err),
            host: "unused",
            port: 0,
        })
    }
}

impl ProxyConfigurationProvider for FixedProvider {
    fn authorize(&self, _request: &ProxyConnectionRequest) -> Result<bool, ProviderError> {
        match &self.answer {
            Ok(answer) => Ok(*answer),
            Err(make) => Err(make()),
        }
    }

    fn settings_for_request(
        &self,
        _request: &ProxyConnectionRequest,
    ) -> Result<Arc<dyn ProxyConnectionSettings>, ProviderError> {
        Ok(Arc::new(StaticConnectionSettings::new(self.host, self.port)))
    }
}
