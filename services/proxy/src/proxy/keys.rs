//! Server key material and certificate selection.
//!
//! The key store maps aliases to a certificate chain and private key. The
//! key manager picks the first configured alias present in the store and
//! serves its chain with root entries removed, so the CA certificate is
//! never sent to clients.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tracing::{debug, info};

use super::certs;

/// Alias used when none is configured.
pub const DEFAULT_SERVER_ALIAS: &str = "server";

/// Key store errors.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Could not read a key store file.
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// A certificate file held no certificates.
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// A key file held no private key.
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// None of the configured aliases is present.
    #[error("none of the configured aliases {aliases:?} exist in the key store")]
    NoAlias { aliases: Vec<String> },

    /// The private key cannot be used for signing.
    #[error("unusable private key for alias '{alias}': {source}")]
    InvalidKey { alias: String, source: rustls::Error },
}

struct KeyEntry {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

/// Alias-indexed certificate chains and private keys.
#[derive(Default)]
pub struct KeyStore {
    entries: HashMap<String, KeyEntry>,
}

impl KeyStore {
    /// Create an empty key store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the given aliases from a directory.
    ///
    /// Each alias is read from `<alias>.crt` (PEM chain, leaf first) and
    /// `<alias>.key` (PEM private key). Aliases without a certificate file
    /// are skipped.
    pub fn load_dir(dir: &Path, aliases: &[String]) -> Result<Self, KeyStoreError> {
        let mut store = Self::new();
        for alias in aliases {
            let cert_path = dir.join(format!("{}.crt", alias));
            if !cert_path.exists() {
                debug!(alias = %alias, path = %cert_path.display(), "Alias not present in key store");
                continue;
            }
            let key_path = dir.join(format!("{}.key", alias));

            let chain = read_certificates(&cert_path)?;
            let key = read_private_key(&key_path)?;
            debug!(alias = %alias, chain_len = chain.len(), "Loaded key store entry");
            store.insert(alias.clone(), chain, key);
        }
        Ok(store)
    }

    /// Add or replace an entry.
    pub fn insert(
        &mut self,
        alias: impl Into<String>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) {
        self.entries.insert(alias.into(), KeyEntry { chain, key });
    }

    /// Whether the alias exists.
    pub fn contains(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("aliases", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn open(path: &Path) -> Result<BufReader<File>, KeyStoreError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Read every certificate in a PEM file.
pub fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, KeyStoreError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(KeyStoreError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file.
pub fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, KeyStoreError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| KeyStoreError::NoPrivateKey(path.to_path_buf()))
}

/// Remove self-issued entries from a chain.
///
/// The leaf is kept if it is the only certificate, so a self-signed server
/// certificate is still served.
pub fn strip_self_issued(chain: &[CertificateDer<'static>]) -> Vec<CertificateDer<'static>> {
    let stripped: Vec<_> = chain
        .iter()
        .filter(|cert| !certs::is_self_issued(cert))
        .cloned()
        .collect();
    if stripped.is_empty() {
        chain.iter().take(1).cloned().collect()
    } else {
        stripped
    }
}

/// Selects and serves the proxy's own certificate.
pub struct ServerKeyManager {
    store: KeyStore,
    aliases: Vec<String>,
    alias: String,
    certified: Arc<CertifiedKey>,
}

impl ServerKeyManager {
    /// Resolve the server identity from the store.
    ///
    /// `aliases` is tried in order; the first alias present is used for
    /// every connection.
    pub fn new(
        store: KeyStore,
        aliases: Vec<String>,
        provider: &CryptoProvider,
    ) -> Result<Self, KeyStoreError> {
        let aliases = if aliases.is_empty() {
            vec![DEFAULT_SERVER_ALIAS.to_string()]
        } else {
            aliases
        };

        let alias = aliases
            .iter()
            .find(|a| store.contains(a))
            .cloned()
            .ok_or_else(|| KeyStoreError::NoAlias {
                aliases: aliases.clone(),
            })?;

        let entry = store
            .entries
            .get(&alias)
            .ok_or_else(|| KeyStoreError::NoAlias {
                aliases: aliases.clone(),
            })?;

        let signing_key = provider
            .key_provider
            .load_private_key(entry.key.clone_key())
            .map_err(|source| KeyStoreError::InvalidKey {
                alias: alias.clone(),
                source,
            })?;

        let chain = strip_self_issued(&entry.chain);
        info!(
            alias = %alias,
            chain_len = chain.len(),
            stripped = entry.chain.len() - chain.len(),
            "Server certificate selected"
        );

        let certified = Arc::new(CertifiedKey::new(chain, signing_key));
        Ok(Self {
            store,
            aliases,
            alias,
            certified,
        })
    }

    /// The alias served to every client.
    pub fn choose_server_alias(&self) -> &str {
        &self.alias
    }

    /// Configured aliases, in preference order.
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Chain for an alias with self-issued entries removed.
    pub fn certificate_chain(&self, alias: &str) -> Option<Vec<CertificateDer<'static>>> {
        self.store
            .entries
            .get(alias)
            .map(|entry| strip_self_issued(&entry.chain))
    }

    /// Private key for an alias.
    pub fn private_key(&self, alias: &str) -> Option<PrivateKeyDer<'static>> {
        self.store.entries.get(alias).map(|entry| entry.key.clone_key())
    }

    /// The resolved server identity.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }
}

impl fmt::Debug for ServerKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerKeyManager")
            .field("alias", &self.alias)
            .field("aliases", &self.aliases)
            .finish()
    }
}

impl ResolvesServerCert for ServerKeyManager {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.certified))
    }
}
