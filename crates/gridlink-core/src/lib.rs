//! # gridlink-core
//!
//! Shared library for gridlink containing the serialosc message model and the
//! transport seam consumed by the session manager.
//!
//! This crate has no opinion about how datagrams reach the wire.  Messages
//! are structured `(address, arguments)` values; opening sockets and encoding
//! OSC byte frames is the job of a [`transport::Transport`] implementation.
//! The crate ships one such implementation, [`transport::loopback`], an
//! in-process hub used by tests and local runs.
//!
//! # Protocol overview
//!
//! Grid controllers (monome-style grids and arcs) are not addressed directly.
//! A daemon — serialosc — owns the serial connection and exposes each device
//! behind a per-device UDP port.  Everything speaks OSC addresses:
//!
//! - `/serialosc/list` on port 12002 asks the daemon to announce every
//!   connected device via `/serialosc/device (id, name, port)` replies.
//! - `/sys/info`, `/sys/host`, `/sys/port`, `/sys/prefix` configure where and
//!   under which address namespace a device reports its events.
//! - `<prefix>/grid/key`, `<prefix>/enc/key`, `<prefix>/enc/delta` are the
//!   event messages a configured device emits.

pub mod protocol;
pub mod transport;

// Re-export the most-used types at the crate root so callers can write
// `gridlink_core::OscMessage` instead of the full module path.
pub use protocol::messages::{DeviceAnnouncement, OscArg, OscMessage};
pub use transport::{Dispatch, Receiver, Transmitter, Transport, TransportError};
