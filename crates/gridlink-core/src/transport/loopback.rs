//! Loopback transport for in-process communication.
//!
//! Keeps the session manager and simulated devices in the same process
//! without touching the network stack.  Endpoints are keyed by port only:
//! the hub models a single LAN host, so transmitter destination hosts are
//! recorded for logging but do not take part in routing.
//!
//! Delivery is synchronous and in call order, which gives tests the
//! arrival-order guarantee a single UDP socket provides.  Messages sent to a
//! port nobody is bound on are dropped, matching UDP semantics.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::{Dispatch, Receiver, Transmitter, Transport, TransportError};
use crate::protocol::messages::OscMessage;

/// Callback bound on a hub port.
pub type Endpoint = Arc<dyn Fn(SocketAddr, OscMessage) + Send + Sync>;

/// First port handed out to receivers and transmitters (IANA ephemeral base).
const EPHEMERAL_BASE: u16 = 49152;

struct HubInner {
    endpoints: Mutex<HashMap<u16, Endpoint>>,
    next_port: AtomicU16,
}

impl HubInner {
    fn endpoints(&self) -> MutexGuard<'_, HashMap<u16, Endpoint>> {
        // A panicked endpoint callback leaves the map itself intact.
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn alloc_port(&self) -> u16 {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            if port >= EPHEMERAL_BASE && !self.endpoints().contains_key(&port) {
                return port;
            }
        }
    }

    fn deliver(&self, port: u16, from: SocketAddr, msg: OscMessage) -> bool {
        // Clone the endpoint out before invoking it so an endpoint that
        // transmits in turn can re-enter the hub.
        let endpoint = self.endpoints().get(&port).cloned();
        match endpoint {
            Some(endpoint) => {
                endpoint(from, msg);
                true
            }
            None => {
                debug!("dropping message to unbound loopback port {port}: {}", msg.address);
                false
            }
        }
    }

    fn unbind(&self, port: u16) {
        // Bind the removed endpoint so it drops after the guard temporary:
        // an endpoint's drop may re-enter the hub (e.g. closing a receiver it
        // owns), which must not happen while the endpoints lock is held.
        let removed = self.endpoints().remove(&port);
        drop(removed);
    }
}

/// In-process message hub implementing [`Transport`].
///
/// Cheap to clone; clones share the same port table.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                endpoints: Mutex::new(HashMap::new()),
                next_port: AtomicU16::new(EPHEMERAL_BASE),
            }),
        }
    }

    /// Binds `endpoint` on an explicit port, standing in for a device (or the
    /// serialosc daemon itself).  Replaces any previous binding on the port.
    pub fn bind(&self, port: u16, endpoint: Endpoint) {
        // As in `unbind`, drop any replaced endpoint outside the lock.
        let replaced = self.inner.endpoints().insert(port, endpoint);
        drop(replaced);
    }

    /// Removes the binding on `port`, if any.
    pub fn unbind(&self, port: u16) {
        self.inner.unbind(port);
    }

    /// Delivers one message to the endpoint bound on `port`.
    ///
    /// Returns `false` when nothing is bound there (the message is dropped).
    /// Tests use this to inject inbound traffic directly.
    pub fn deliver(&self, port: u16, from: SocketAddr, msg: OscMessage) -> bool {
        self.inner.deliver(port, from, msg)
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackHub {
    fn start_transmitter(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn Transmitter>, TransportError> {
        let source_port = self.inner.alloc_port();
        Ok(Box::new(LoopbackTransmitter {
            inner: Arc::clone(&self.inner),
            dest_host: host.to_string(),
            dest_port: port,
            source: SocketAddr::from(([127, 0, 0, 1], source_port)),
            open: AtomicBool::new(true),
        }))
    }

    fn start_receiver(&self, dispatch: Dispatch) -> Result<Box<dyn Receiver>, TransportError> {
        let port = self.inner.alloc_port();
        let endpoint: Endpoint = Arc::from(dispatch);
        // As in `unbind`, drop any replaced endpoint outside the lock.
        let replaced = self.inner.endpoints().insert(port, endpoint);
        drop(replaced);
        Ok(Box::new(LoopbackReceiver {
            inner: Arc::clone(&self.inner),
            port,
            open: AtomicBool::new(true),
        }))
    }
}

/// Outbound half handed out by [`LoopbackHub`].
struct LoopbackTransmitter {
    inner: Arc<HubInner>,
    dest_host: String,
    dest_port: u16,
    source: SocketAddr,
    open: AtomicBool,
}

impl Transmitter for LoopbackTransmitter {
    fn transmit(&self, msg: &OscMessage) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.inner.deliver(self.dest_port, self.source, msg.clone()) {
            debug!(
                "no endpoint at {}:{} for {}",
                self.dest_host, self.dest_port, msg.address
            );
        }
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Inbound half handed out by [`LoopbackHub`].
struct LoopbackReceiver {
    inner: Arc<HubInner>,
    port: u16,
    open: AtomicBool,
}

impl Receiver for LoopbackReceiver {
    fn port(&self) -> u16 {
        self.port
    }

    fn close(&self) {
        if self
            .open
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.unbind(self.port);
        }
    }
}

impl Drop for LoopbackReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
