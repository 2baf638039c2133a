//! Time-boxed serialosc discovery.
//!
//! Two structurally identical operations: [`list_devices`] broadcasts a
//! `/serialosc/list` request and reports every `/serialosc/device` reply;
//! [`list_properties`] sends `/sys/info` to one device and reports every
//! reply as a keyed property.
//!
//! Both are fire-and-forget.  They open a transmitter and an ephemeral
//! receiver, send a single request, and return immediately; the transport
//! halves are released after a fixed 1000 ms window regardless of how many
//! replies arrived.  Callbacks may fire zero or more times inside that
//! window — this is a best-effort broadcast/collect pattern, not a blocking
//! RPC, and nothing is retried.

use std::sync::Arc;
use std::time::Duration;

use gridlink_core::protocol::messages::{self, OscArg, OscMessage};
use gridlink_core::{Receiver, Transmitter, Transport, TransportError};
use thiserror::Error;
use tracing::debug;

/// How long discovery receivers stay open collecting replies.
pub const DISCOVERY_WINDOW: Duration = Duration::from_millis(1000);

/// Error type for discovery operations.
///
/// Only the initial open/send can fail; replies arriving malformed or not at
/// all are normal operation.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Identity of a discovered device; immutable once reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Serial-number identifier from the announcement.
    pub id: String,
    /// Human-readable model name from the announcement.
    pub name: String,
    /// Host the listing request was sent to; the device lives there too.
    pub host: String,
    /// UDP port the device listens on.
    pub port: u16,
}

/// One reported system property, keyed by its reply address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperty {
    pub key: String,
    pub value: Vec<OscArg>,
}

/// Broadcasts a device-listing request to the serialosc daemon at
/// `host:port` and invokes `on_device` for every announcement that arrives
/// within the discovery window.
///
/// Returns as soon as the request is sent; resource release is scheduled on
/// the tokio timer, so a running runtime is required.
///
/// # Errors
///
/// Returns [`DiscoveryError::Transport`] if the transport halves cannot be
/// opened or the request cannot be sent.
pub fn list_devices(
    transport: &Arc<dyn Transport>,
    host: &str,
    self_address: &str,
    port: u16,
    on_device: impl Fn(DeviceIdentity) + Send + Sync + 'static,
) -> Result<(), DiscoveryError> {
    let tx = transport.start_transmitter(host, port)?;
    let reply_host = host.to_string();
    let rx = transport.start_receiver(Box::new(move |_from, msg| {
        match messages::parse_device_announcement(&msg) {
            Some(announcement) => on_device(DeviceIdentity {
                id: announcement.id,
                name: announcement.name,
                host: reply_host.clone(),
                port: announcement.port,
            }),
            None => debug!("ignoring non-announcement reply {}", msg.address),
        }
    }))?;
    tx.transmit(&OscMessage::new(
        messages::SERIALOSC_LIST,
        vec![self_address.into(), OscArg::Int(i32::from(rx.port()))],
    ))?;
    schedule_close(tx, rx);
    Ok(())
}

/// Requests system info from the device at `host:port` and invokes
/// `on_property` for every reply that arrives within the discovery window.
///
/// Each reply is reported verbatim: the reply address is the property key,
/// the reply arguments are the value (e.g. `/sys/size (16, 8)`).
///
/// # Errors
///
/// Returns [`DiscoveryError::Transport`] if the transport halves cannot be
/// opened or the request cannot be sent.
pub fn list_properties(
    transport: &Arc<dyn Transport>,
    host: &str,
    self_address: &str,
    port: u16,
    on_property: impl Fn(DeviceProperty) + Send + Sync + 'static,
) -> Result<(), DiscoveryError> {
    let tx = transport.start_transmitter(host, port)?;
    let rx = transport.start_receiver(Box::new(move |_from, msg| {
        on_property(DeviceProperty {
            key: msg.address,
            value: msg.args,
        });
    }))?;
    tx.transmit(&OscMessage::new(
        messages::SYS_INFO,
        vec![self_address.into(), OscArg::Int(i32::from(rx.port()))],
    ))?;
    schedule_close(tx, rx);
    Ok(())
}

/// Releases both discovery halves once the reply window closes.
fn schedule_close(tx: Box<dyn Transmitter>, rx: Box<dyn Receiver>) {
    tokio::spawn(async move {
        tokio::time::sleep(DISCOVERY_WINDOW).await;
        tx.close();
        rx.close();
    });
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use gridlink_core::protocol::messages::{SERIALOSC_DEVICE, SERIALOSC_LIST, SYS_INFO};
    use gridlink_core::transport::loopback::LoopbackHub;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    fn daemon_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 12002))
    }

    #[tokio::test]
    async fn test_list_devices_reports_announcements_with_listing_host() {
        // Arrange: a simulated daemon that announces one device per listing.
        let hub = LoopbackHub::new();
        let transport: Arc<dyn Transport> = Arc::new(hub.clone());
        let hub_reply = hub.clone();
        hub.bind(
            12002,
            Arc::new(move |_from, msg: OscMessage| {
                assert_eq!(msg.address, SERIALOSC_LIST);
                let reply_port = msg.int_arg(1).expect("listing carries reply port") as u16;
                hub_reply.deliver(
                    reply_port,
                    daemon_addr(),
                    OscMessage::new(
                        SERIALOSC_DEVICE,
                        vec!["m0".into(), "monome128".into(), 13000.into()],
                    ),
                );
            }),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        // Act
        list_devices(&transport, "127.0.0.1", "127.0.0.1", 12002, move |device| {
            seen_clone.lock().unwrap().push(device);
        })
        .expect("list_devices");

        // Assert: loopback delivery is synchronous, so the reply already ran.
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[DeviceIdentity {
                id: "m0".to_string(),
                name: "monome128".to_string(),
                host: "127.0.0.1".to_string(),
                port: 13000,
            }]
        );
    }

    #[tokio::test]
    async fn test_list_devices_ignores_non_announcement_replies() {
        let hub = LoopbackHub::new();
        let transport: Arc<dyn Transport> = Arc::new(hub.clone());
        let hub_reply = hub.clone();
        hub.bind(
            12002,
            Arc::new(move |_from, msg: OscMessage| {
                let reply_port = msg.int_arg(1).unwrap() as u16;
                // Not a /serialosc/device reply; must not reach the callback.
                hub_reply.deliver(
                    reply_port,
                    daemon_addr(),
                    OscMessage::new("/sys/size", vec![16.into(), 8.into()]),
                );
            }),
        );

        let count = Arc::new(Mutex::new(0usize));
        let count_clone = Arc::clone(&count);
        list_devices(&transport, "127.0.0.1", "127.0.0.1", 12002, move |_| {
            *count_clone.lock().unwrap() += 1;
        })
        .unwrap();

        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_properties_reports_every_reply_keyed_by_address() {
        // Arrange: a simulated device that reports two properties.
        let hub = LoopbackHub::new();
        let transport: Arc<dyn Transport> = Arc::new(hub.clone());
        let hub_reply = hub.clone();
        hub.bind(
            13000,
            Arc::new(move |_from, msg: OscMessage| {
                assert_eq!(msg.address, SYS_INFO);
                let reply_port = msg.int_arg(1).unwrap() as u16;
                let device = SocketAddr::from(([127, 0, 0, 1], 13000));
                hub_reply.deliver(
                    reply_port,
                    device,
                    OscMessage::new("/sys/size", vec![16.into(), 8.into()]),
                );
                hub_reply.deliver(
                    reply_port,
                    device,
                    OscMessage::new("/sys/rotation", vec![0.into()]),
                );
            }),
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        // Act
        list_properties(&transport, "127.0.0.1", "127.0.0.1", 13000, move |prop| {
            seen_clone.lock().unwrap().push(prop);
        })
        .unwrap();

        // Assert
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].key, "/sys/size");
        assert_eq!(seen[0].value, vec![OscArg::Int(16), OscArg::Int(8)]);
        assert_eq!(seen[1].key, "/sys/rotation");
    }

    #[test]
    fn test_list_devices_returns_immediately_without_replies() {
        // A daemon that never answers: the call must still return Ok right
        // away, with cleanup deferred to the timer.
        tokio_test::block_on(async {
            let hub = LoopbackHub::new();
            let transport: Arc<dyn Transport> = Arc::new(hub.clone());
            let result = list_devices(&transport, "127.0.0.1", "127.0.0.1", 12002, |_| {});
            assert!(result.is_ok());
        });
    }
}
