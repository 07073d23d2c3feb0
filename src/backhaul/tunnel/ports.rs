use std::{
    collections::HashSet,
    ops::RangeInclusive,
    sync::{Mutex, MutexGuard, PoisonError},
};

use rand::{RngExt, rng};

/// Ports a client may request (or be assigned) for a tunnel.
pub const PORT_RANGE: RangeInclusive<u16> = 1024..=65535;

/// Random draws attempted for `remote = 0` before giving up.
pub const AUTO_ASSIGN_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("port {0} outside allowed range 1024-65535")]
    InvalidPort(u16),
    #[error("port {0} already in use")]
    PortConflict(u16),
    #[error("no free port found after {AUTO_ASSIGN_ATTEMPTS} attempts")]
    PortExhaustion,
}

/// Process-wide registry of remote ports held by live tunnel listeners.
///
/// Shared by every control connection on the server; `allocate` and
/// `release` are serialized so two clients can never reserve the same port.
#[derive(Debug, Default)]
pub struct PortAllocator {
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `requested`, or a random free port when `requested == 0`.
    pub fn allocate(&self, requested: u16) -> Result<u16, PortError> {
        let mut used = self.lock();

        if requested != 0 {
            if !PORT_RANGE.contains(&requested) {
                return Err(PortError::InvalidPort(requested));
            }
            if !used.insert(requested) {
                return Err(PortError::PortConflict(requested));
            }
            return Ok(requested);
        }

        let mut r = rng();
        for _ in 0..AUTO_ASSIGN_ATTEMPTS {
            let port = r.random_range(PORT_RANGE);
            if used.insert(port) {
                return Ok(port);
            }
        }
        Err(PortError::PortExhaustion)
    }

    /// Return `port` to the pool. Releasing a port that is not held is a no-op.
    pub fn release(&self, port: u16) {
        self.lock().remove(&port);
    }

    #[cfg(test)]
    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
