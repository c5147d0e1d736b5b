//! Test harness for proxy integration tests.
//!
//! Provides a throwaway PKI, echo backends, a running proxy and a
//! mutual-TLS client.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use dynproxy_proxy::proxy::default_crypto_provider;
use dynproxy_proxy::{
    KeyStore, ListenerConfig, ProviderError, ProviderRegistry, ProxyConfigurationProvider,
    ProxyConnectionRequest, ProxyConnectionSettings, ProxyServer, ServerKeyManager,
    StaticConnectionSettings,
};

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

pub const SERVER_NAME: &str = "localhost";

/// Client certificate chain and key.
pub struct ClientIdentity {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// A CA that issues the proxy's server certificate and client certificates.
pub struct TestPki {
    ca_cert: Certificate,
    ca_key: KeyPair,
}

#[allow(dead_code)]
impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "dynproxy test CA");
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self { ca_cert, ca_key }
    }

    pub fn ca_der(&self) -> CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// Server key store with the "server" alias (chain includes the CA).
    pub fn server_key_store(&self) -> KeyStore {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![SERVER_NAME.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "dynproxy");
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        let mut store = KeyStore::new();
        store.insert(
            "server",
            vec![cert.der().clone(), self.ca_der()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        );
        store
    }

    pub fn client(&self, common_name: &str) -> ClientIdentity {
        self.client_with_validity(common_name, (2020, 1, 1), (2099, 1, 1))
    }

    pub fn expired_client(&self, common_name: &str) -> ClientIdentity {
        self.client_with_validity(common_name, (2000, 1, 1), (2001, 1, 1))
    }

    fn client_with_validity(
        &self,
        common_name: &str,
        not_before: (i32, u8, u8),
        not_after: (i32, u8, u8),
    ) -> ClientIdentity {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = rcgen::date_time_ymd(not_before.0, not_before.1, not_before.2);
        params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        ClientIdentity {
            chain: vec![cert.der().clone(), self.ca_der()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        }
    }
}

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self::serve(listener))
    }

    /// Echo on an already bound listener.
    pub fn serve(listener: TcpListener) -> Self {
        let addr = listener
            .local_addr()
            .unwrap_or_else(|_| "127.0.0.1:0".parse().unwrap());
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Provider that routes one principal (or every principal) to a fixed address.
#[allow(dead_code)]
pub struct RouteProvider {
    principal: Option<String>,
    destination: Option<SocketAddr>,
    pub authorize_calls: AtomicUsize,
}

#[allow(dead_code)]
impl RouteProvider {
    /// Route `principal` (e.g. "CN=alice") to `destination`.
    pub fn to(principal: &str, destination: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            principal: Some(principal.to_string()),
            destination: Some(destination),
            authorize_calls: AtomicUsize::new(0),
        })
    }

    /// Route every principal to `destination`.
    pub fn everyone_to(destination: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            principal: None,
            destination: Some(destination),
            authorize_calls: AtomicUsize::new(0),
        })
    }

    /// Decline every principal.
    pub fn declining() -> Arc<Self> {
        Arc::new(Self {
            principal: None,
            destination: None,
            authorize_calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.authorize_calls.load(Ordering::SeqCst)
    }
}

impl ProxyConfigurationProvider for RouteProvider {
    fn authorize(&self, request: &ProxyConnectionRequest) -> Result<bool, ProviderError> {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        if self.destination.is_none() {
            return Ok(false);
        }
        Ok(match &self.principal {
            Some(principal) => principal == request.principal(),
            None => true,
        })
    }

    fn settings_for_request(
        &self,
        _request: &ProxyConnectionRequest,
    ) -> Result<Arc<dyn ProxyConnectionSettings>, ProviderError> {
        let destination = self
            .destination
            .ok_or_else(|| anyhow::anyhow!("provider has no destination"))?;
        Ok(Arc::new(StaticConnectionSettings::new(
            destination.ip().to_string(),
            destination.port(),
        )))
    }
}

pub struct ProxyHandle {
    pub addr: SocketAddr,
    pub server: ProxyServer,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub async fn spawn(pki: &TestPki) -> io::Result<Self> {
        Self::spawn_with(pki, ListenerConfig::new("127.0.0.1:0".parse().unwrap())).await
    }

    pub async fn spawn_with(pki: &TestPki, config: ListenerConfig) -> io::Result<Self> {
        init_crypto_provider();

        let keys = ServerKeyManager::new(
            pki.server_key_store(),
            vec!["server".to_string()],
            &default_crypto_provider(),
        )
        .map_err(io::Error::other)?;

        let server = ProxyServer::new(config, Arc::new(ProviderRegistry::new()), Arc::new(keys));
        let addr = server.start().await.map_err(io::Error::other)?;

        Ok(Self { addr, server })
    }

    pub fn stats(&self) -> &dynproxy_proxy::ListenerStats {
        self.server.stats()
    }
}

pub async fn tls_client_connect(
    addr: SocketAddr,
    pki: &TestPki,
    identity: &ClientIdentity,
) -> io::Result<TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store.add(pki.ca_der()).map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(identity.chain.clone(), identity.key.clone_key())
        .map_err(io::Error::other)?;

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(SERVER_NAME.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}

/// Send `payload` and read the same number of bytes back.
#[allow(dead_code)]
pub async fn echo_round_trip(
    stream: &mut TlsStream<TcpStream>,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    stream.write_all(payload).await?;
    stream.flush().await?;
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "echo timed out"))??;
    Ok(buf)
}

/// Whether the proxy refused this client: either the handshake failed, or
/// (TLS 1.3 reports client-certificate rejection after the client finishes)
/// the first read fails or hits end-of-stream.
#[allow(dead_code)]
pub async fn is_rejected(
    addr: SocketAddr,
    pki: &TestPki,
    identity: &ClientIdentity,
) -> bool {
    let mut stream = match tls_client_connect(addr, pki, identity).await {
        Ok(stream) => stream,
        Err(_) => return true,
    };
    let _ = stream.write_all(b"hello?").await;
    let _ = stream.flush().await;

    let mut buf = [0u8; 16];
    match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) => false,
        Err(_) => false,
    }
}

/// Poll `check` until it holds or the deadline passes.
#[allow(dead_code)]
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
