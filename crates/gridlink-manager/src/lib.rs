//! # gridlink-manager
//!
//! Device discovery, session establishment, and event dispatch for
//! serialosc-connected grid controllers.
//!
//! The flow:
//!
//! ```text
//! ConnectionSet::discover()
//!   └─ list_devices (/serialosc/list, 1000 ms window)
//!        └─ per announcement: ConnectionSet::connect()
//!             ├─ list_properties (/sys/info → registry, always)
//!             └─ binding match → session::establish()
//!                  ├─ transmitter + ephemeral receiver
//!                  ├─ handler factory + initial state
//!                  ├─ /sys/host, /sys/port, /sys/prefix
//!                  └─ inbound dispatch → handler callbacks → state cell
//! ConnectionSet::shutdown_all()
//!   └─ per session, in order: handler shutdown, close both halves
//! ```
//!
//! Callers supply a [`handler::GridHandler`] factory per device id or name;
//! the transport comes from `gridlink-core` and is swappable (loopback for
//! tests and local runs, UDP/OSC against real hardware).

pub mod config;
pub mod connection_set;
pub mod discovery;
pub mod handler;
pub mod session;

// Re-export the surface most callers touch.
pub use config::{load_config, save_config, ConfigError, ManagerConfig};
pub use connection_set::{ConnectionSet, DeviceView, StateSnapshotFn};
pub use discovery::{
    list_devices, list_properties, DeviceIdentity, DeviceProperty, DiscoveryError,
    DISCOVERY_WINDOW,
};
pub use handler::{binding, GridHandler, HandlerBinding, HandlerBindings};
pub use session::{SessionError, SessionInfo};
