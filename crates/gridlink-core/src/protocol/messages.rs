//! Message types and address constants for the serialosc protocol.
//!
//! Every exchange with the daemon or a device is an [`OscMessage`]: an
//! address string plus an ordered list of typed arguments.  The addresses
//! used by gridlink:
//!
//! | Address              | Direction | Arguments                      |
//! |----------------------|-----------|--------------------------------|
//! | `/serialosc/list`    | outbound  | `(self_address, reply_port)`   |
//! | `/serialosc/device`  | inbound   | `(id, name, port)`             |
//! | `/sys/info`          | outbound  | `(self_address, reply_port)`   |
//! | `/sys/host`          | outbound  | `(self_address)`               |
//! | `/sys/port`          | outbound  | `(reply_port)`                 |
//! | `/sys/prefix`        | outbound  | `(prefix)`                     |
//! | `<prefix>/grid/key`  | inbound   | `(x, y, how)`                  |
//! | `<prefix>/enc/key`   | inbound   | `(enc, how)`                   |
//! | `<prefix>/enc/delta` | inbound   | `(enc, delta)`                 |

use serde::{Deserialize, Serialize};

/// Well-known UDP port the serialosc daemon listens on for device listing.
pub const SERIALOSC_PORT: u16 = 12002;

/// Default per-session address prefix negotiated via [`SYS_PREFIX`].
pub const DEFAULT_PREFIX: &str = "/-";

/// Outbound: ask the daemon to announce every connected device.
pub const SERIALOSC_LIST: &str = "/serialosc/list";
/// Inbound: one announcement per connected device, `(id, name, port)`.
pub const SERIALOSC_DEVICE: &str = "/serialosc/device";
/// Outbound: ask a device to report its system properties.
pub const SYS_INFO: &str = "/sys/info";
/// Outbound: declare the host a device should send events to.
pub const SYS_HOST: &str = "/sys/host";
/// Outbound: declare the port a device should send events to.
pub const SYS_PORT: &str = "/sys/port";
/// Outbound: declare the address prefix a device should emit events under.
pub const SYS_PREFIX: &str = "/sys/prefix";

/// Event address suffix for grid key presses, matched after the negotiated
/// prefix has been stripped.
pub const GRID_KEY: &str = "/grid/key";
/// Event address suffix for encoder key presses.
pub const ENC_KEY: &str = "/enc/key";
/// Event address suffix for encoder rotation.
pub const ENC_DELTA: &str = "/enc/delta";

/// A single typed OSC argument.
///
/// The serialosc surface gridlink touches only ever carries 32-bit integers
/// and strings, so the model stops there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OscArg {
    Int(i32),
    Str(String),
}

impl OscArg {
    /// Returns the integer value, or `None` for a string argument.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            OscArg::Int(v) => Some(*v),
            OscArg::Str(_) => None,
        }
    }

    /// Returns the string value, or `None` for an integer argument.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            OscArg::Int(_) => None,
            OscArg::Str(s) => Some(s.as_str()),
        }
    }
}

impl From<i32> for OscArg {
    fn from(v: i32) -> Self {
        OscArg::Int(v)
    }
}

impl From<&str> for OscArg {
    fn from(v: &str) -> Self {
        OscArg::Str(v.to_string())
    }
}

impl From<String> for OscArg {
    fn from(v: String) -> Self {
        OscArg::Str(v)
    }
}

/// An OSC message: address plus ordered typed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscArg>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>, args: Vec<OscArg>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// Returns the argument at `index` as an integer, if present and typed so.
    pub fn int_arg(&self, index: usize) -> Option<i32> {
        self.args.get(index).and_then(OscArg::as_int)
    }

    /// Returns the argument at `index` as a string, if present and typed so.
    pub fn str_arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(OscArg::as_str)
    }
}

/// A parsed `/serialosc/device` reply.
///
/// The announcement carries no host: the device is reachable on the host the
/// listing request was sent to, on the announced port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAnnouncement {
    /// Serial-number identifier, e.g. `"m0000123"`.
    pub id: String,
    /// Human-readable model name, e.g. `"monome 128"`.
    pub name: String,
    /// UDP port the device listens on.
    pub port: u16,
}

/// Parses a `/serialosc/device` announcement.
///
/// Returns `None` for any other address and for malformed argument lists; the
/// discovery window receives arbitrary traffic and malformed replies are not
/// errors, they are simply not announcements.
pub fn parse_device_announcement(msg: &OscMessage) -> Option<DeviceAnnouncement> {
    if msg.address != SERIALOSC_DEVICE {
        return None;
    }
    let id = msg.str_arg(0)?.to_string();
    let name = msg.str_arg(1)?.to_string();
    let port = u16::try_from(msg.int_arg(2)?).ok()?;
    Some(DeviceAnnouncement { id, name, port })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
