//! Transport seam between the session core and the network.
//!
//! The session manager never opens sockets or encodes OSC byte frames; it
//! consumes a [`Transport`] that hands out closable [`Transmitter`] and
//! [`Receiver`] halves.  A transmitter is bound to one destination
//! host/port; a receiver is bound to an ephemeral local port and invokes its
//! dispatch callback for every inbound message until closed.
//!
//! Implementations are swappable: a UDP/OSC transport for real hardware, the
//! in-process [`loopback`] hub for tests and local runs.

use std::net::SocketAddr;

use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::protocol::messages::OscMessage;

pub mod loopback;

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint was already closed when the operation ran.
    #[error("transport endpoint already closed")]
    Closed,
    /// A transmitter to the given destination could not be opened.
    #[error("failed to open transmitter to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    /// A receiver could not be bound to a local port.
    #[error("failed to bind receiver: {0}")]
    Bind(String),
}

/// Callback invoked by a [`Receiver`] for every inbound message.
///
/// Receives the sender's address and the decoded message.  Called from the
/// transport's delivery context; implementations should stay cheap and hand
/// real work off to the session layer.
pub type Dispatch = Box<dyn Fn(SocketAddr, OscMessage) + Send + Sync>;

/// Outbound half: sends messages to the destination it was opened for.
#[cfg_attr(test, automock)]
pub trait Transmitter: Send + Sync {
    /// Sends one message.  Delivery is best-effort (UDP semantics); only a
    /// closed transmitter is an error.
    fn transmit(&self, msg: &OscMessage) -> Result<(), TransportError>;

    /// Releases the underlying resource.  Idempotent.
    fn close(&self);
}

/// Inbound half: owns an ephemeral local port and a dispatch callback.
pub trait Receiver: Send + Sync {
    /// The local port replies should be directed to.
    fn port(&self) -> u16;

    /// Stops dispatching and releases the underlying resource.  Idempotent.
    fn close(&self);
}

/// Factory for transport halves.
pub trait Transport: Send + Sync {
    /// Opens an outbound sender bound to `host:port`.
    fn start_transmitter(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn Transmitter>, TransportError>;

    /// Opens an inbound listener on an ephemeral port; `dispatch` fires for
    /// every message that arrives until the receiver is closed.
    fn start_receiver(&self, dispatch: Dispatch) -> Result<Box<dyn Receiver>, TransportError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
