//! Settings for backends provisioned on demand.
//!
//! The destination port is reserved from a [`DynamicPortRegistrar`] in the
//! start hook, a backend is launched on it, and both are torn down in the
//! stop hook once the connection has closed.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dynproxy_networking::DynamicPortRegistrar;
use tracing::{debug, info, warn};

use super::provider::{ConnectionLifecycle, ProviderError, ProxyConnectionSettings};

/// Starts and stops a backend listening on a reserved port.
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    /// Bring up a backend on `host:port`. Must be accepting when this returns.
    async fn launch(&self, host: &str, port: u16) -> Result<(), ProviderError>;

    /// Tear down the backend on `port`.
    async fn terminate(&self, port: u16);
}

/// Connection settings whose backend exists only while the connection does.
///
/// The destination port reads as 0 until the start hook has run.
pub struct ProvisionedSettings {
    host: String,
    port: AtomicU16,
    registrar: Arc<dyn DynamicPortRegistrar>,
    launcher: Arc<dyn BackendLauncher>,
}

impl ProvisionedSettings {
    /// Create settings that provision a backend on `host`.
    pub fn new(
        host: impl Into<String>,
        registrar: Arc<dyn DynamicPortRegistrar>,
        launcher: Arc<dyn BackendLauncher>,
    ) -> Self {
        Self {
            host: host.into(),
            port: AtomicU16::new(0),
            registrar,
            launcher,
        }
    }

    /// Whether a backend is currently provisioned.
    pub fn is_provisioned(&self) -> bool {
        self.port.load(Ordering::Acquire) != 0
    }
}

impl ProxyConnectionSettings for ProvisionedSettings {
    fn destination_host(&self) -> &str {
        &self.host
    }

    fn destination_port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    fn lifecycle(&self) -> Option<&dyn ConnectionLifecycle> {
        Some(self)
    }
}

#[async_trait]
impl ConnectionLifecycle for ProvisionedSettings {
    async fn start(&self) -> Result<(), ProviderError> {
        let port = self
            .registrar
            .reserve_new_port()
            .await
            .map_err(|e| ProviderError::Other(e.into()))?;
        let reservation = Reservation {
            registrar: &*self.registrar,
            port: Some(port),
        };

        if let Err(e) = self.launcher.launch(&self.host, port).await {
            warn!(port, error = %e, "Backend launch failed; releasing port");
            return Err(e);
        }

        reservation.keep();
        self.port.store(port, Ordering::Release);
        info!(host = %self.host, port, "Backend provisioned");
        Ok(())
    }

    async fn stop(&self) {
        let port = self.port.swap(0, Ordering::AcqRel);
        if port == 0 {
            return;
        }
        self.launcher.terminate(port).await;
        let released = self.registrar.release_port(port);
        debug!(port, released, "Backend deprovisioned");
    }
}

/// A reserved port, released on drop unless `keep` is called.
struct Reservation<'a> {
    registrar: &'a dyn DynamicPortRegistrar,
    port: Option<u16>,
}

impl Reservation<'_> {
    fn keep(mut self) {
        self.port = None;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(port) = self.port.take() {
            self.registrar.release_port(port);
        }
    }
}

impl fmt::Debug for ProvisionedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionedSettings")
            .field("host", &self.host)
            .field("port", &self.destination_port())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynproxy_networking::{PortError, SimpleDynamicPortRegistrar};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLauncher {
        fail: bool,
        hang: bool,
        launched: Mutex<Vec<u16>>,
        terminated: AtomicUsize,
    }

    #[async_trait]
    impl BackendLauncher for RecordingLauncher {
        async fn launch(&self, _host: &str, port: u16) -> Result<(), ProviderError> {
            if self.fail {
                return Err(anyhow::anyhow!("launch failed").into());
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.launched.lock().unwrap().push(port);
            Ok(())
        }

        async fn terminate(&self, _port: u16) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registrar(port: u16) -> Arc<SimpleDynamicPortRegistrar> {
        Arc::new(SimpleDynamicPortRegistrar::with_supplier(Arc::new(move || {
            Ok::<u16, PortError>(port)
        })))
    }

    #[tokio::test]
    async fn test_start_reserves_and_stop_releases() {
        let registrar = registrar(41000);
        let launcher = Arc::new(RecordingLauncher::default());
        let settings = ProvisionedSettings::new("127.0.0.1", registrar.clone(), launcher.clone());
        assert_eq!(settings.destination_port(), 0);

        settings.start().await.unwrap();
        assert_eq!(settings.destination(), "127.0.0.1:41000");
        assert!(registrar.is_reserved(41000));
        assert_eq!(*launcher.launched.lock().unwrap(), vec![41000]);

        settings.stop().await;
        assert!(!registrar.is_reserved(41000));
        assert!(!settings.is_provisioned());
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);

        // A second stop is a no-op.
        settings.stop().await;
        assert_eq!(launcher.terminated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_launch_releases_port() {
        let registrar = registrar(41001);
        let launcher = Arc::new(RecordingLauncher {
            fail: true,
            ..RecordingLauncher::default()
        });
        let settings = ProvisionedSettings::new("127.0.0.1", registrar.clone(), launcher);

        assert!(settings.start().await.is_err());
        assert!(!registrar.is_reserved(41001));
        assert!(!settings.is_provisioned());
    }

    #[tokio::test]
    async fn test_cancelled_start_releases_port() {
        let registrar = registrar(41002);
        let launcher = Arc::new(RecordingLauncher {
            hang: true,
            ..RecordingLauncher::default()
        });
        let settings = Arc::new(ProvisionedSettings::new(
            "127.0.0.1",
            registrar.clone(),
            launcher,
        ));

        let task = tokio::spawn({
            let settings = Arc::clone(&settings);
            async move { settings.start().await }
        });
        for _ in 0..100 {
            if registrar.is_reserved(41002) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(registrar.is_reserved(41002));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!registrar.is_reserved(41002));
        assert!(!settings.is_provisioned());
    }

    #[tokio::test]
    async fn test_exhausted_registrar_fails_start() {
        let registrar = Arc::new(
            SimpleDynamicPortRegistrar::with_supplier(Arc::new(|| {
                Err::<u16, PortError>(PortError::Supplier("no ports".to_string()))
            }))
            .with_max_attempts(2)
            .with_retry_delay(std::time::Duration::from_millis(1)),
        );
        let settings = ProvisionedSettings::new(
            "127.0.0.1",
            registrar,
            Arc::new(RecordingLauncher::default()),
        );

        let err = settings.start().await.unwrap_err();
        assert!(err.to_string().contains("2 attempts"));
    }
}
