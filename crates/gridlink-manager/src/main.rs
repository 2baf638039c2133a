//! gridlink manager entry point.
//!
//! Wires together logging, configuration, and the connection set, runs one
//! discovery pass, and waits for Ctrl-C before tearing every session down.
//!
//! Until a UDP/OSC transport is wired in, the binary runs against the
//! in-process loopback transport with a simulated monome, which exercises
//! the full discovery → negotiation → dispatch → shutdown path end to end.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gridlink_core::protocol::messages::{self, OscMessage};
use gridlink_core::transport::loopback::LoopbackHub;
use gridlink_core::Transport;
use gridlink_manager::{
    ConnectionSet, GridHandler, HandlerBindings, ManagerConfig, DISCOVERY_WINDOW,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Port the simulated device listens on.
const SIM_DEVICE_PORT: u16 = 13000;

/// Demo handler: counts grid key-down events.
struct KeyCounter;

impl GridHandler for KeyCounter {
    type State = u32;

    fn initial_state(&self) -> u32 {
        0
    }

    fn on_grid_key(&self, state: u32, x: i32, y: i32, how: i32) -> u32 {
        if how == 1 {
            info!("grid key down at ({x}, {y}); {} press(es) this session", state + 1);
            state + 1
        } else {
            state
        }
    }

    fn on_shutdown(&self, state: u32) {
        info!("session closing after {state} key press(es)");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, config_err) = match gridlink_manager::load_config() {
        Ok(cfg) => (cfg, None),
        Err(e) => (ManagerConfig::default(), Some(e)),
    };

    // Initialise structured logging.  `RUST_LOG` overrides the config level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.manager.log_level.clone())),
        )
        .init();

    info!("gridlink manager starting");
    if let Some(e) = config_err {
        warn!("could not load config ({e}); using defaults");
    }

    // ── Transport ─────────────────────────────────────────────────────────────
    // A real deployment plugs a UDP/OSC `Transport` in here; the loopback hub
    // plus a simulated monome keeps the binary self-contained.
    let hub = LoopbackHub::new();
    install_simulated_monome(&hub, config.network.serialosc_port);
    let transport: Arc<dyn Transport> = Arc::new(hub.clone());

    let mut bindings = HandlerBindings::new();
    bindings.register("monome 128", |_info| KeyCounter);

    let set = Arc::new(ConnectionSet::new(transport, bindings, &config));
    Arc::clone(&set).discover()?;

    // Let the discovery window close before summarising what was found.
    tokio::time::sleep(DISCOVERY_WINDOW + Duration::from_millis(200)).await;
    for (id, view) in set.state() {
        info!(
            "device {id}: {} propert(ies) collected, active session: {}",
            view.properties.len(),
            view.state.is_some()
        );
    }

    info!("gridlink manager ready.  Press Ctrl-C to exit.");
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received");
    set.shutdown_all();
    info!("gridlink manager stopped");
    Ok(())
}

fn sim_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Binds a simulated serialosc daemon and one simulated monome on the hub.
///
/// The daemon announces the device on every listing.  The device reports a
/// 16×8 grid via `/sys/info`, learns its event destination from `/sys/port`,
/// and emits one key press/release pair once `/sys/prefix` completes the
/// negotiation.
fn install_simulated_monome(hub: &LoopbackHub, serialosc_port: u16) {
    let daemon_hub = hub.clone();
    hub.bind(
        serialosc_port,
        Arc::new(move |_from, msg: OscMessage| {
            if msg.address != messages::SERIALOSC_LIST {
                return;
            }
            if let Some(reply_port) = msg.int_arg(1) {
                daemon_hub.deliver(
                    reply_port as u16,
                    sim_addr(serialosc_port),
                    OscMessage::new(
                        messages::SERIALOSC_DEVICE,
                        vec![
                            "m0000226".into(),
                            "monome 128".into(),
                            i32::from(SIM_DEVICE_PORT).into(),
                        ],
                    ),
                );
            }
        }),
    );

    let device_hub = hub.clone();
    let event_port: Arc<Mutex<Option<u16>>> = Arc::new(Mutex::new(None));
    hub.bind(
        SIM_DEVICE_PORT,
        Arc::new(move |_from, msg: OscMessage| match msg.address.as_str() {
            messages::SYS_INFO => {
                if let Some(reply_port) = msg.int_arg(1) {
                    let from = sim_addr(SIM_DEVICE_PORT);
                    device_hub.deliver(
                        reply_port as u16,
                        from,
                        OscMessage::new("/sys/size", vec![16.into(), 8.into()]),
                    );
                    device_hub.deliver(
                        reply_port as u16,
                        from,
                        OscMessage::new("/sys/rotation", vec![0.into()]),
                    );
                }
            }
            messages::SYS_PORT => {
                if let Ok(mut slot) = event_port.lock() {
                    *slot = msg.int_arg(0).map(|p| p as u16);
                }
            }
            messages::SYS_PREFIX => {
                let Some(prefix) = msg.str_arg(0) else {
                    return;
                };
                let port = event_port.lock().ok().and_then(|slot| *slot);
                if let Some(port) = port {
                    let from = sim_addr(SIM_DEVICE_PORT);
                    device_hub.deliver(
                        port,
                        from,
                        OscMessage::new(
                            format!("{prefix}/grid/key"),
                            vec![3.into(), 5.into(), 1.into()],
                        ),
                    );
                    device_hub.deliver(
                        port,
                        from,
                        OscMessage::new(
                            format!("{prefix}/grid/key"),
                            vec![3.into(), 5.into(), 0.into()],
                        ),
                    );
                }
            }
            _ => {}
        }),
    );
}
