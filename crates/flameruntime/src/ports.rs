//! Port reservation through the directory plus a local bind probe.
//!
//! The set-if-absent lock under `system/port<p>` keeps two concurrent
//! reservations from picking the same port; the connect probe skips ports
//! already owned by unrelated processes that never registered.

use crate::directory::DirectoryStore;
use flamecore::FlameError;
use std::time::Duration;
use tokio::net::TcpStream;

pub const DEFAULT_PORT_START: u16 = 9000;
pub const DEFAULT_PORT_CEILING: u16 = 64000;

const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Reserves free TCP ports for endpoints via directory locks.
pub struct PortAllocator {
    store: DirectoryStore,
    ceiling: u16,
    next_hint: u16,
}

impl PortAllocator {
    pub fn new(store: DirectoryStore, start: u16, ceiling: u16) -> Self {
        Self {
            store,
            ceiling,
            next_hint: start,
        }
    }

    /// Reserve the next free port, locking it in the directory under the
    /// given key (usually the EUI that will own the endpoint).
    pub async fn reserve(&mut self, key: &str) -> Result<u16, FlameError> {
        let mut port = self.next_hint;
        loop {
            if port >= self.ceiling {
                return Err(FlameError::NoFreePort {
                    ceiling: self.ceiling,
                });
            }
            port += 1;
            if !self.store.set_if_absent(&format!("system/port{port}"), key) {
                continue;
            }
            if is_port_in_use(port).await {
                // owned by some unrelated process, release and move on
                self.store.delete(&format!("system/port{port}"));
                continue;
            }
            tracing::debug!("Reserved port {port} for {key}");
            self.next_hint = port;
            return Ok(port);
        }
    }

    /// Release the directory lock for a port.
    pub fn release(&self, port: u16) {
        self.store.delete(&format!("system/port{port}"));
    }
}

async fn is_port_in_use(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}
