//! Host port allocation for communicator forwarding rules.

use std::path::PathBuf;

use rand::seq::SliceRandom;
use vboxbuild_shared::errors::{BuildError, BuildResult};

use super::lock::PortLock;

/// Finds a free TCP port in `[min, max]` on `address`.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    address: String,
    min: u16,
    max: u16,
    lock_dir: PathBuf,
}

/// A booked host port.
///
/// The probe socket is already closed; the booking lives as long as the
/// advisory lock, until [`PortReservation::release`] or drop.
#[derive(Debug)]
pub struct PortReservation {
    pub address: String,
    pub port: u16,
    pub range_min: u16,
    pub range_max: u16,
    lock: Option<PortLock>,
}

impl PortReservation {
    pub fn is_held(&self) -> bool {
        self.lock.is_some()
    }

    pub fn release(&mut self) {
        if self.lock.take().is_some() {
            tracing::debug!(port = self.port, "Released port booking");
        }
    }
}

impl PortAllocator {
    pub fn new(address: impl Into<String>, min: u16, max: u16, lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            min,
            max,
            lock_dir: lock_dir.into(),
        }
    }

    /// Book a free port.
    ///
    /// Candidates are tried in random order so concurrent builds rarely
    /// race for the same port. A candidate counts as free when its lock can
    /// be taken and a listener can bind it.
    pub async fn reserve(&self) -> BuildResult<PortReservation> {
        if self.min > self.max {
            return Err(BuildError::Config(format!(
                "empty port range {}-{}",
                self.min, self.max
            )));
        }

        let mut candidates: Vec<u16> = (self.min..=self.max).collect();
        candidates.shuffle(&mut rand::rng());

        for port in candidates {
            let lock = match PortLock::acquire(&self.lock_dir, port) {
                Ok(lock) => lock,
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            };

            match tokio::net::TcpListener::bind((self.address.as_str(), port)).await {
                Ok(listener) => {
                    // Free the port but keep the booking.
                    drop(listener);
                    tracing::debug!(address = %self.address, port, "Reserved host port");
                    return Ok(PortReservation {
                        address: self.address.clone(),
                        port,
                        range_min: self.min,
                        range_max: self.max,
                        lock: Some(lock),
                    });
                }
                Err(e) => {
                    tracing::trace!(port, error = %e, "Port not bindable");
                }
            }
        }

        Err(BuildError::ResourceExhausted(format!(
            "no free port between {} and {} on {}",
            self.min, self.max, self.address
        )))
    }
}
