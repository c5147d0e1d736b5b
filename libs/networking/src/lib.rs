//! Networking utilities for the dynamic proxy.
//!
//! This library provides the dynamic port registrar used by configuration
//! providers that provision a backend listener per authorized connection:
//! - Reserve an ephemeral port for exclusive use by one caller
//! - Release a reservation so the port can be reused immediately
//! - Clear every reservation in bulk when the owning process stops

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of attempts `reserve_new_port` makes before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default pause between reservation attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Port registrar errors.
#[derive(Debug, Error)]
pub enum PortError {
    /// The port supplier could not produce a candidate.
    #[error("port supplier failed: {0}")]
    Supplier(String),

    /// Every attempt collided with an existing reservation or failed.
    #[error("unable to reserve a port after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// Source of candidate port numbers.
pub type PortSupplier = Arc<dyn Fn() -> Result<u16, PortError> + Send + Sync>;

/// Registrar for dynamically provisioned backend ports.
///
/// A reserved port is owned by exactly one caller until it is released.
#[async_trait]
pub trait DynamicPortRegistrar: Send + Sync {
    /// Reserve a port no other caller currently holds.
    async fn reserve_new_port(&self) -> Result<u16, PortError>;

    /// Release a reservation. Returns whether the port had been reserved.
    fn release_port(&self, port: u16) -> bool;

    /// Check whether a port is currently reserved.
    fn is_reserved(&self, port: u16) -> bool;

    /// Drop every reservation.
    ///
    /// Only meant for process shutdown, when all ports are free to be
    /// reused elsewhere.
    fn shutdown(&self);
}

/// Ask the OS for a currently unused TCP port on the loopback interface.
pub fn ephemeral_port() -> Result<u16, PortError> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| PortError::Supplier(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| PortError::Supplier(e.to_string()))?
        .port();
    Ok(port)
}

/// In-memory registrar backed by a concurrent reservation table.
pub struct SimpleDynamicPortRegistrar {
    reserved: DashMap<u16, ()>,
    supplier: PortSupplier,
    max_attempts: u32,
    retry_delay: Duration,
}

impl SimpleDynamicPortRegistrar {
    /// Create a registrar that draws ports from the OS ephemeral range.
    pub fn new() -> Self {
        Self::with_supplier(Arc::new(ephemeral_port))
    }

    /// Create a registrar with a custom port supplier.
    pub fn with_supplier(supplier: PortSupplier) -> Self {
        Self {
            reserved: DashMap::new(),
            supplier,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set the number of attempts made per reservation (at least one).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the pause between reservation attempts.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Number of ports currently reserved.
    pub fn reserved_count(&self) -> usize {
        self.reserved.len()
    }

    /// Insert the port only if no one holds it yet.
    fn try_reserve(&self, port: u16) -> bool {
        match self.reserved.entry(port) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        }
    }
}

impl Default for SimpleDynamicPortRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimpleDynamicPortRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleDynamicPortRegistrar")
            .field("reserved", &self.reserved.len())
            .field("max_attempts", &self.max_attempts)
            .field("retry_delay", &self.retry_delay)
            .finish()
    }
}

#[async_trait]
impl DynamicPortRegistrar for SimpleDynamicPortRegistrar {
    async fn reserve_new_port(&self) -> Result<u16, PortError> {
        for attempt in 1..=self.max_attempts {
            match (self.supplier)() {
                Ok(port) if self.try_reserve(port) => {
                    debug!(port = port, attempt = attempt, "Port reserved");
                    return Ok(port);
                }
                Ok(port) => {
                    debug!(port = port, attempt = attempt, "Port already reserved");
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Port supplier failed");
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(PortError::Exhausted {
            attempts: self.max_attempts,
        })
    }

    fn release_port(&self, port: u16) -> bool {
        let released = self.reserved.remove(&port).is_some();
        if released {
            debug!(port = port, "Port released");
        }
        released
    }

    fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains_key(&port)
    }

    fn shutdown(&self) {
        let count = self.reserved.len();
        self.reserved.clear();
        debug!(released = count, "All port reservations cleared");
    }
}
