use std::{net::SocketAddr, sync::Arc};

use super::{types::short_id, Pool};
use crate::runtime::ContainerHandle;

/// Exclusive use of one container of a pool.
///
/// The container goes back to the pool exactly once: through
/// [`ContainerLease::release`] or, on any other exit path including panics
/// and cancelled futures, when the lease is dropped.
pub struct ContainerLease {
    pool: Arc<Pool>,
    handle: ContainerHandle,
    host_port: u16,
    released: bool,
}

impl ContainerLease {
    pub(super) fn new(pool: Arc<Pool>, handle: ContainerHandle, host_port: u16) -> Self {
        Self {
            pool,
            handle,
            host_port,
            released: false,
        }
    }

    #[cfg(test)]
    pub fn container_id(&self) -> &str {
        &self.handle.id
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.handle.id)
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.handle.endpoint
    }

    pub(super) fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    pub fn release(mut self) {
        self.release_once();
    }

    /// Give up the lease without returning the container to the idle set.
    /// The caller takes over its removal.
    pub(super) fn forfeit(mut self) -> ContainerHandle {
        self.released = true;
        self.handle.clone()
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(&self.handle.id);
        }
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for ContainerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLease")
            .field("function", &self.pool.name())
            .field("container_id", &self.handle.id)
            .field("host_port", &self.host_port)
            .field("released", &self.released)
            .finish()
    }
}
