//! Aggregate session lifecycle: the shared connection registry and the
//! connection set that discovers devices, establishes sessions, and tears
//! everything down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use gridlink_core::protocol::messages::OscArg;
use gridlink_core::Transport;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::discovery::{self, DeviceIdentity, DiscoveryError};
use crate::handler::{BoxedState, HandlerBindings};
use crate::session::{self, SessionError};

/// Accessor that clones out a session's current handler state.
pub type StateSnapshotFn = Arc<dyn Fn() -> Option<BoxedState> + Send + Sync>;

/// One device's registry slot.  Fields carry their own locks so mutations on
/// the same device contend only with each other, never with the map or with
/// other devices.
#[derive(Default)]
struct DeviceEntry {
    properties: Mutex<HashMap<String, Vec<OscArg>>>,
    snapshot: Mutex<Option<StateSnapshotFn>>,
}

impl DeviceEntry {
    fn properties(&self) -> MutexGuard<'_, HashMap<String, Vec<OscArg>>> {
        self.properties
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> MutexGuard<'_, Option<StateSnapshotFn>> {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared registry mapping device id to driver properties and, for devices
/// with an active session, a state-snapshot accessor.
///
/// Mutated by concurrent session-establishment flows; every mutation is an
/// update of one device's entry, never a cross-device operation.  The map
/// lock covers only entry insertion and lookup — per-entry state sits behind
/// the entry's own locks, so unrelated devices never serialize against each
/// other.  Devices without a handler binding still get a properties entry —
/// the registry doubles as a property cache for everything discovery saw.
#[derive(Default)]
pub struct ConnectionRegistry {
    devices: Mutex<HashMap<String, Arc<DeviceEntry>>>,
}

impl ConnectionRegistry {
    fn devices(&self) -> MutexGuard<'_, HashMap<String, Arc<DeviceEntry>>> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clones out the entry for `device_id`, creating it on first contact.
    fn entry(&self, device_id: &str) -> Arc<DeviceEntry> {
        Arc::clone(self.devices().entry(device_id.to_string()).or_default())
    }

    fn lookup(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.devices().get(device_id).cloned()
    }

    /// Records one driver property for `device_id`, creating the entry on
    /// first contact.
    pub(crate) fn record_property(&self, device_id: &str, key: String, value: Vec<OscArg>) {
        self.entry(device_id).properties().insert(key, value);
    }

    /// Installs the state-snapshot accessor for `device_id`.
    pub(crate) fn set_snapshot(&self, device_id: &str, snapshot: StateSnapshotFn) {
        *self.entry(device_id).snapshot() = Some(snapshot);
    }

    pub(crate) fn property_keys(&self, device_id: &str) -> Vec<String> {
        self.lookup(device_id)
            .map(|entry| entry.properties().keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn property(&self, device_id: &str, key: &str) -> Option<Vec<OscArg>> {
        self.lookup(device_id)
            .and_then(|entry| entry.properties().get(key).cloned())
    }

    fn snapshot_view(&self) -> HashMap<String, DeviceView> {
        // Clone the entry handles out first; accessors run with no registry
        // lock held at all, since they take their session's state lock and
        // may call back into the registry.
        let entries: Vec<(String, Arc<DeviceEntry>)> = self
            .devices()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        entries
            .into_iter()
            .map(|(id, entry)| {
                let properties = entry.properties().clone();
                let snapshot = entry.snapshot().clone();
                let state = snapshot.and_then(|accessor| accessor());
                (id, DeviceView { properties, state })
            })
            .collect()
    }
}

/// Read-only view of one device in a [`ConnectionSet::state`] snapshot.
pub struct DeviceView {
    /// Driver properties collected by `/sys/info`, keyed by reply address.
    pub properties: HashMap<String, Vec<OscArg>>,
    /// Cloned handler state; `None` for devices without an active session.
    pub state: Option<BoxedState>,
}

type ShutdownAction = Box<dyn FnOnce() + Send>;

/// Ordered shutdown actions, one per established session, each invoked
/// exactly once.
#[derive(Default)]
struct ShutdownRegistry {
    actions: Mutex<Vec<ShutdownAction>>,
}

impl ShutdownRegistry {
    fn push(&self, action: ShutdownAction) {
        self.actions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(action);
    }

    fn drain(&self) -> Vec<ShutdownAction> {
        std::mem::take(
            &mut *self
                .actions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

/// Aggregates all active sessions behind one discovery entry point and one
/// shutdown switch.
pub struct ConnectionSet {
    transport: Arc<dyn Transport>,
    bindings: HandlerBindings,
    serialosc_host: String,
    serialosc_port: u16,
    self_address: String,
    prefix: String,
    registry: Arc<ConnectionRegistry>,
    shutdown: ShutdownRegistry,
}

impl ConnectionSet {
    pub fn new(transport: Arc<dyn Transport>, bindings: HandlerBindings, config: &ManagerConfig) -> Self {
        Self {
            transport,
            bindings,
            serialosc_host: config.network.serialosc_host.clone(),
            serialosc_port: config.network.serialosc_port,
            self_address: config.network.self_address.clone(),
            prefix: config.session.prefix.clone(),
            registry: Arc::new(ConnectionRegistry::default()),
            shutdown: ShutdownRegistry::default(),
        }
    }

    /// Broadcasts a device listing and connects every announced device.
    ///
    /// Returns once the listing request is sent; sessions are established
    /// from the discovery callback as announcements arrive.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] if the listing request cannot be sent.
    /// Per-device establishment failures are logged, not propagated — one
    /// broken device must not stop the rest of the fleet.
    pub fn discover(self: Arc<Self>) -> Result<(), DiscoveryError> {
        info!(
            "discovering devices via {}:{} ({} binding(s) registered)",
            self.serialosc_host,
            self.serialosc_port,
            self.bindings.len()
        );
        let this = Arc::clone(&self);
        discovery::list_devices(
            &self.transport,
            &self.serialosc_host,
            &self.self_address,
            self.serialosc_port,
            move |device| {
                let id = device.id.clone();
                if let Err(e) = this.connect(device) {
                    error!("failed to establish session with {id}: {e}");
                }
            },
        )
    }

    /// Connects one device: always starts property collection, and
    /// establishes a session when a handler binding matches the device id or
    /// name.
    ///
    /// Returns `Ok(true)` when a session was established, `Ok(false)` when
    /// no binding matched (the device is skipped for session purposes).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when a matching binding exists but the
    /// session's transport halves cannot be opened or negotiation fails.
    pub fn connect(&self, device: DeviceIdentity) -> Result<bool, SessionError> {
        // Driver properties are collected for every discovered device,
        // session or not; the registry serves as a property cache.
        let registry = Arc::clone(&self.registry);
        let device_id = device.id.clone();
        if let Err(e) = discovery::list_properties(
            &self.transport,
            &device.host,
            &self.self_address,
            device.port,
            move |prop| registry.record_property(&device_id, prop.key, prop.value),
        ) {
            warn!("property listing for {} failed: {e}", device.id);
        }

        let Some(binding) = self.bindings.lookup(&device.id, &device.name) else {
            debug!(
                "no handler binding for {} ({}); not creating a session",
                device.id, device.name
            );
            return Ok(false);
        };

        let session = session::establish(
            &self.transport,
            binding,
            &self.registry,
            device,
            &self.self_address,
            &self.prefix,
        )?;
        self.registry
            .set_snapshot(session.device_id(), session.snapshot_fn());
        self.shutdown.push(session.into_shutdown_action());
        Ok(true)
    }

    /// Instantaneous snapshot of every device's properties and handler
    /// state.  Does not block on in-flight sessions.
    pub fn state(&self) -> HashMap<String, DeviceView> {
        self.registry.snapshot_view()
    }

    /// Invokes every registered shutdown action exactly once, in
    /// registration order.  Safe to call with zero sessions; a second call
    /// finds nothing left to do.
    pub fn shutdown_all(&self) {
        let actions = self.shutdown.drain();
        info!("shutting down {} session(s)", actions.len());
        for action in actions {
            action();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
