//! Per-device sessions: channel negotiation, the state cell, and the inbound
//! dispatch state machine.
//!
//! A session owns one transmitter, one receiver, and a mutable state cell.
//! Establishment is synchronous up through sending the negotiation messages;
//! after that the receiver dispatches inbound events independently of the
//! caller, applying handler callbacks to the state cell one at a time in
//! arrival order.
//!
//! The receiver is live before the handler has produced its initial state, so
//! a first event can race initialization.  The cell resolves the race by
//! definition: applying an update to an uninitialized cell is a no-op, never
//! an error.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use gridlink_core::protocol::messages::{self, OscArg, OscMessage};
use gridlink_core::{Receiver, Transmitter, Transport, TransportError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection_set::{ConnectionRegistry, StateSnapshotFn};
use crate::discovery::DeviceIdentity;
use crate::handler::{BoxedState, ErasedGridHandler, HandlerBinding};

/// Error type for session establishment.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Opening the transport halves or sending negotiation failed.
    #[error("transport error establishing session with {device_id}: {source}")]
    Transport {
        device_id: String,
        #[source]
        source: TransportError,
    },
}

/// A queued state update awaiting its turn in the fold.
type StateUpdate = Box<dyn FnOnce(BoxedState) -> BoxedState + Send>;

struct CellInner {
    state: Option<BoxedState>,
    /// An update function is currently running with the state checked out.
    busy: bool,
    pending: VecDeque<StateUpdate>,
}

/// Mutable session state slot.
///
/// Starts empty; [`StateCell::apply`] folds an update into the state when
/// initialized and does nothing otherwise.  Updates run one at a time in
/// arrival order, but the lock is never held while an update function
/// executes: the state is checked out, folded, and checked back in.  An
/// update arriving while another is in flight — including one issued by a
/// handler calling [`SessionInfo::swap_state`] from inside its own
/// callback — is queued and folded in afterwards rather than contending.
pub(crate) struct StateCell {
    inner: Mutex<CellInner>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(CellInner {
                state: None,
                busy: false,
                pending: VecDeque::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, CellInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Installs the initial state.  Runs once, before dispatch can observe a
    /// populated cell.
    pub(crate) fn initialize(&self, state: BoxedState) {
        self.inner().state = Some(state);
    }

    /// Replaces the state with `f(state)` if initialized; no-op otherwise.
    ///
    /// Re-entrant: when called while another update holds the state, `f` is
    /// queued and applied by the in-flight fold, preserving arrival order.
    pub(crate) fn apply(&self, f: impl FnOnce(BoxedState) -> BoxedState + Send + 'static) {
        let mut update: StateUpdate = Box::new(f);
        let mut state = {
            let mut inner = self.inner();
            if inner.busy {
                inner.pending.push_back(update);
                return;
            }
            let Some(state) = inner.state.take() else {
                // Uninitialized cell: the update is dropped by definition.
                return;
            };
            inner.busy = true;
            state
        };
        loop {
            // No lock held here; `update` may call back into this cell.
            state = update(state);
            let mut inner = self.inner();
            match inner.pending.pop_front() {
                Some(next) => update = next,
                None => {
                    inner.state = Some(state);
                    inner.busy = false;
                    return;
                }
            }
        }
    }

    /// Removes and returns the state, leaving the cell empty.
    pub(crate) fn take(&self) -> Option<BoxedState> {
        self.inner().state.take()
    }

    /// Reads the state in place.
    pub(crate) fn peek<R>(&self, f: impl FnOnce(Option<&BoxedState>) -> R) -> R {
        f(self.inner().state.as_ref())
    }
}

/// Capability set handed to a handler-binding factory.
///
/// Bound to one device's registry entry and one private state cell; cloning
/// shares both, so a handler can keep a copy for use from its callbacks.
#[derive(Clone)]
pub struct SessionInfo {
    device_id: String,
    prefix: String,
    transmitter: Arc<dyn Transmitter>,
    registry: Arc<ConnectionRegistry>,
    state: Arc<StateCell>,
}

impl SessionInfo {
    /// The session's outbound half, for lighting LEDs and the like.
    pub fn transmitter(&self) -> Arc<dyn Transmitter> {
        Arc::clone(&self.transmitter)
    }

    /// The address prefix negotiated for this session.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Keys of the driver properties collected for this device so far.
    pub fn keys(&self) -> Vec<String> {
        self.registry.property_keys(&self.device_id)
    }

    /// One driver property value, if collected.
    pub fn key(&self, key: &str) -> Option<Vec<OscArg>> {
        self.registry.property(&self.device_id, key)
    }

    /// Replaces the session state with `f(state)`.
    ///
    /// A no-op while the cell is uninitialized (the factory runs before the
    /// initial state is installed) and when `S` is not the handler's state
    /// type.  Safe to call from inside a handler callback: the update is
    /// queued behind the event being dispatched and applied right after it.
    pub fn swap_state<S: Send + 'static>(&self, f: impl FnOnce(S) -> S + Send + 'static) {
        self.state.apply(|boxed| match boxed.downcast::<S>() {
            Ok(state) => Box::new(f(*state)),
            Err(other) => {
                warn!("swap_state type mismatch; session state left unchanged");
                other
            }
        });
    }
}

/// An established session: device identity, exclusive transport halves,
/// handler, state cell, and negotiated prefix.
pub(crate) struct Session {
    identity: DeviceIdentity,
    transmitter: Arc<dyn Transmitter>,
    receiver: Box<dyn Receiver>,
    handler: Arc<dyn ErasedGridHandler>,
    state: Arc<StateCell>,
    prefix: String,
}

impl Session {
    pub(crate) fn device_id(&self) -> &str {
        &self.identity.id
    }

    /// Accessor that clones out the current handler state, for the
    /// connection registry.  Returns `None` until initialization completes
    /// and after shutdown.
    pub(crate) fn snapshot_fn(&self) -> StateSnapshotFn {
        let state = Arc::clone(&self.state);
        let handler = Arc::clone(&self.handler);
        Arc::new(move || state.peek(|slot| slot.and_then(|boxed| handler.clone_state(boxed))))
    }

    /// Consumes the session into its shutdown action: notify the handler
    /// with the final state, then release both transport halves.
    pub(crate) fn into_shutdown_action(self) -> Box<dyn FnOnce() + Send> {
        Box::new(move || {
            if let Some(state) = self.state.take() {
                self.handler.shutdown(state);
            }
            self.transmitter.close();
            self.receiver.close();
            debug!(
                "closed session with {} (prefix {})",
                self.identity.id, self.prefix
            );
        })
    }
}

/// Establishes a session with `device` using `binding`.
///
/// Opens the transport halves, constructs the handler with its
/// [`SessionInfo`], installs the initial state, and sends the three
/// negotiation messages (self host, reply port, prefix).  Inbound dispatch is
/// live from the moment the receiver exists.
///
/// # Errors
///
/// Returns [`SessionError::Transport`] when a transport half cannot be
/// opened or a negotiation message cannot be sent.
pub(crate) fn establish(
    transport: &Arc<dyn Transport>,
    binding: &HandlerBinding,
    registry: &Arc<ConnectionRegistry>,
    device: DeviceIdentity,
    self_address: &str,
    prefix: &str,
) -> Result<Session, SessionError> {
    let transport_err = |device_id: &str| {
        let device_id = device_id.to_string();
        move |source| SessionError::Transport { device_id, source }
    };

    let transmitter: Arc<dyn Transmitter> = Arc::from(
        transport
            .start_transmitter(&device.host, device.port)
            .map_err(transport_err(&device.id))?,
    );

    let state = Arc::new(StateCell::new());
    // The receiver needs a handler before one can exist; it reads this slot
    // on every dispatch and drops messages that arrive first.  The state
    // cell is still empty at that point, so nothing is lost that could have
    // mattered.
    let handler_slot: Arc<OnceLock<Arc<dyn ErasedGridHandler>>> = Arc::new(OnceLock::new());

    let receiver = {
        let state = Arc::clone(&state);
        let handler_slot = Arc::clone(&handler_slot);
        let prefix = prefix.to_string();
        transport
            .start_receiver(Box::new(move |from, msg| match handler_slot.get() {
                Some(handler) => dispatch_message(handler, &state, &prefix, from, &msg),
                None => debug!("dropping pre-initialization message {}", msg.address),
            }))
            .map_err(transport_err(&device.id))?
    };

    let info = SessionInfo {
        device_id: device.id.clone(),
        prefix: prefix.to_string(),
        transmitter: Arc::clone(&transmitter),
        registry: Arc::clone(registry),
        state: Arc::clone(&state),
    };
    let handler: Arc<dyn ErasedGridHandler> = Arc::from(binding(info));
    let _ = handler_slot.set(Arc::clone(&handler));
    state.initialize(handler.initial_state());

    if let Err(source) = negotiate(transmitter.as_ref(), self_address, receiver.port(), prefix) {
        // A half-negotiated session never becomes live; release both halves
        // instead of leaving them to the drop path.
        transmitter.close();
        receiver.close();
        return Err(SessionError::Transport {
            device_id: device.id,
            source,
        });
    }

    info!(
        "session established with {} ({}) at {}:{}, events on port {}",
        device.id,
        device.name,
        device.host,
        device.port,
        receiver.port()
    );

    Ok(Session {
        identity: device,
        transmitter,
        receiver,
        handler,
        state,
        prefix: prefix.to_string(),
    })
}

/// Sends the three channel-negotiation messages: self host, reply port,
/// session prefix.
pub(crate) fn negotiate(
    transmitter: &dyn Transmitter,
    self_address: &str,
    reply_port: u16,
    prefix: &str,
) -> Result<(), TransportError> {
    transmitter.transmit(&OscMessage::new(
        messages::SYS_HOST,
        vec![self_address.into()],
    ))?;
    transmitter.transmit(&OscMessage::new(
        messages::SYS_PORT,
        vec![OscArg::Int(i32::from(reply_port))],
    ))?;
    transmitter.transmit(&OscMessage::new(messages::SYS_PREFIX, vec![prefix.into()]))?;
    Ok(())
}

/// Routes one inbound message to the handler callback its stripped address
/// selects, replacing the session state with the callback's return value.
///
/// Addresses outside the negotiated prefix, unknown event suffixes, and
/// malformed argument lists are logged and change nothing.
pub(crate) fn dispatch_message(
    handler: &Arc<dyn ErasedGridHandler>,
    state: &StateCell,
    prefix: &str,
    from: SocketAddr,
    msg: &OscMessage,
) {
    let Some(suffix) = msg.address.strip_prefix(prefix) else {
        warn!("unrecognized message from {from}: {}", msg.address);
        return;
    };
    match suffix {
        messages::GRID_KEY => match (msg.int_arg(0), msg.int_arg(1), msg.int_arg(2)) {
            (Some(x), Some(y), Some(how)) => {
                let handler = Arc::clone(handler);
                state.apply(move |s| handler.on_grid_key(s, x, y, how));
            }
            _ => warn!("malformed grid key event from {from}: {:?}", msg.args),
        },
        messages::ENC_KEY => match (msg.int_arg(0), msg.int_arg(1)) {
            (Some(enc), Some(how)) => {
                let handler = Arc::clone(handler);
                state.apply(move |s| handler.on_enc_key(s, enc, how));
            }
            _ => warn!("malformed enc key event from {from}: {:?}", msg.args),
        },
        messages::ENC_DELTA => match (msg.int_arg(0), msg.int_arg(1)) {
            (Some(enc), Some(delta)) => {
                let handler = Arc::clone(handler);
                state.apply(move |s| handler.on_enc_delta(s, enc, delta));
            }
            _ => warn!("malformed enc delta event from {from}: {:?}", msg.args),
        },
        _ => warn!("unrecognized message from {from}: {}", msg.address),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{binding, GridHandler};
    use std::sync::Mutex as StdMutex;

    /// Transmitter that records what it is asked to send.
    struct RecordingTransmitter {
        sent: StdMutex<Vec<OscMessage>>,
    }

    impl RecordingTransmitter {
        fn new() -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<OscMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transmitter for RecordingTransmitter {
        fn transmit(&self, msg: &OscMessage) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }

        fn close(&self) {}
    }

    struct Recorder;

    impl GridHandler for Recorder {
        type State = Vec<String>;

        fn initial_state(&self) -> Self::State {
            Vec::new()
        }

        fn on_grid_key(&self, mut state: Self::State, x: i32, y: i32, how: i32) -> Self::State {
            state.push(format!("grid:{x},{y},{how}"));
            state
        }
    }

    fn erased_recorder() -> Arc<dyn ErasedGridHandler> {
        let b = binding(|_info| Recorder);
        Arc::from(b(dummy_session_info()))
    }

    fn dummy_session_info() -> SessionInfo {
        SessionInfo {
            device_id: "m0".to_string(),
            prefix: "/-".to_string(),
            transmitter: Arc::new(RecordingTransmitter::new()),
            registry: Arc::new(ConnectionRegistry::default()),
            state: Arc::new(StateCell::new()),
        }
    }

    fn sender() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 13000))
    }

    fn cell_as_vec(cell: &StateCell) -> Option<Vec<String>> {
        cell.peek(|slot| {
            slot.and_then(|boxed| boxed.downcast_ref::<Vec<String>>().cloned())
        })
    }

    #[test]
    fn test_state_cell_apply_before_initialize_is_noop() {
        // Arrange
        let cell = StateCell::new();

        // Act: the race guard — applying to an empty cell must leave it empty.
        cell.apply(|_| Box::new(vec!["never".to_string()]));

        // Assert
        assert!(cell.peek(|slot| slot.is_none()));
    }

    #[test]
    fn test_state_cell_applies_cumulatively_after_initialize() {
        let cell = StateCell::new();
        cell.initialize(Box::new(0i32));
        cell.apply(|s| Box::new(*s.downcast::<i32>().unwrap() + 1));
        cell.apply(|s| Box::new(*s.downcast::<i32>().unwrap() + 1));
        let value = cell.peek(|slot| slot.and_then(|b| b.downcast_ref::<i32>().copied()));
        assert_eq!(value, Some(2));
    }

    #[test]
    fn test_state_cell_apply_from_inside_apply_is_queued() {
        // Arrange
        let cell = Arc::new(StateCell::new());
        cell.initialize(Box::new(Vec::<String>::new()));

        // Act: an update that issues another update while it runs.
        let reenter = Arc::clone(&cell);
        cell.apply(move |s| {
            reenter.apply(|inner| {
                let mut v = inner.downcast::<Vec<String>>().unwrap();
                v.push("queued".to_string());
                v
            });
            let mut v = s.downcast::<Vec<String>>().unwrap();
            v.push("in-flight".to_string());
            v
        });

        // Assert: the nested update ran after the one in flight, not never.
        let value = cell.peek(|slot| {
            slot.and_then(|b| b.downcast_ref::<Vec<String>>().cloned())
        });
        assert_eq!(
            value,
            Some(vec!["in-flight".to_string(), "queued".to_string()])
        );
    }

    #[test]
    fn test_state_cell_take_empties_the_cell() {
        let cell = StateCell::new();
        cell.initialize(Box::new(7i32));
        assert!(cell.take().is_some());
        assert!(cell.take().is_none(), "second take must observe empty");
    }

    #[test]
    fn test_establish_closes_both_halves_when_negotiation_fails() {
        use std::sync::atomic::{AtomicBool, Ordering};

        /// Transmitter that refuses every send and records `close()`.
        struct DeadTransmitter {
            closed: Arc<AtomicBool>,
        }

        impl Transmitter for DeadTransmitter {
            fn transmit(&self, _msg: &OscMessage) -> Result<(), TransportError> {
                Err(TransportError::Connect {
                    host: "127.0.0.1".to_string(),
                    port: 13000,
                    reason: "unreachable".to_string(),
                })
            }

            fn close(&self) {
                self.closed.store(true, Ordering::SeqCst);
            }
        }

        struct StubReceiver {
            closed: Arc<AtomicBool>,
        }

        impl Receiver for StubReceiver {
            fn port(&self) -> u16 {
                50000
            }

            fn close(&self) {
                self.closed.store(true, Ordering::SeqCst);
            }
        }

        struct DeadTransport {
            tx_closed: Arc<AtomicBool>,
            rx_closed: Arc<AtomicBool>,
        }

        impl Transport for DeadTransport {
            fn start_transmitter(
                &self,
                _host: &str,
                _port: u16,
            ) -> Result<Box<dyn Transmitter>, TransportError> {
                Ok(Box::new(DeadTransmitter {
                    closed: Arc::clone(&self.tx_closed),
                }))
            }

            fn start_receiver(
                &self,
                _dispatch: gridlink_core::Dispatch,
            ) -> Result<Box<dyn Receiver>, TransportError> {
                Ok(Box::new(StubReceiver {
                    closed: Arc::clone(&self.rx_closed),
                }))
            }
        }

        // Arrange
        let tx_closed = Arc::new(AtomicBool::new(false));
        let rx_closed = Arc::new(AtomicBool::new(false));
        let transport: Arc<dyn Transport> = Arc::new(DeadTransport {
            tx_closed: Arc::clone(&tx_closed),
            rx_closed: Arc::clone(&rx_closed),
        });
        let binding = binding(|_info| Recorder);
        let registry = Arc::new(ConnectionRegistry::default());
        let device = DeviceIdentity {
            id: "m0".to_string(),
            name: "monome128".to_string(),
            host: "127.0.0.1".to_string(),
            port: 13000,
        };

        // Act
        let result = establish(&transport, &binding, &registry, device, "127.0.0.1", "/-");

        // Assert
        assert!(matches!(result, Err(SessionError::Transport { .. })));
        assert!(tx_closed.load(Ordering::SeqCst), "transmitter must be closed");
        assert!(rx_closed.load(Ordering::SeqCst), "receiver must be closed");
    }

    #[test]
    fn test_negotiate_sends_host_port_prefix_in_order() {
        // Arrange
        let tx = RecordingTransmitter::new();

        // Act
        negotiate(&tx, "192.168.1.10", 13001, "/-").unwrap();

        // Assert
        let sent = tx.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].address, messages::SYS_HOST);
        assert_eq!(sent[0].str_arg(0), Some("192.168.1.10"));
        assert_eq!(sent[1].address, messages::SYS_PORT);
        assert_eq!(sent[1].int_arg(0), Some(13001));
        assert_eq!(sent[2].address, messages::SYS_PREFIX);
        assert_eq!(sent[2].str_arg(0), Some("/-"));
    }

    #[test]
    fn test_dispatch_grid_key_folds_into_state() {
        // Arrange
        let handler = erased_recorder();
        let cell = StateCell::new();
        cell.initialize(handler.initial_state());

        // Act
        let msg = OscMessage::new("/-/grid/key", vec![3.into(), 5.into(), 1.into()]);
        dispatch_message(&handler, &cell, "/-", sender(), &msg);

        // Assert
        assert_eq!(cell_as_vec(&cell), Some(vec!["grid:3,5,1".to_string()]));
    }

    #[test]
    fn test_dispatch_unrecognized_address_leaves_state_unchanged() {
        let handler = erased_recorder();
        let cell = StateCell::new();
        cell.initialize(handler.initial_state());

        dispatch_message(
            &handler,
            &cell,
            "/-",
            sender(),
            &OscMessage::new("/-/tilt", vec![0.into()]),
        );
        dispatch_message(
            &handler,
            &cell,
            "/-",
            sender(),
            &OscMessage::new("/other/grid/key", vec![1.into(), 1.into(), 1.into()]),
        );

        assert_eq!(cell_as_vec(&cell), Some(Vec::new()));
    }

    #[test]
    fn test_dispatch_malformed_args_leave_state_unchanged() {
        let handler = erased_recorder();
        let cell = StateCell::new();
        cell.initialize(handler.initial_state());

        // Wrong arity and wrong type both fall through without a state change.
        dispatch_message(
            &handler,
            &cell,
            "/-",
            sender(),
            &OscMessage::new("/-/grid/key", vec![3.into(), 5.into()]),
        );
        dispatch_message(
            &handler,
            &cell,
            "/-",
            sender(),
            &OscMessage::new("/-/grid/key", vec!["x".into(), 5.into(), 1.into()]),
        );

        assert_eq!(cell_as_vec(&cell), Some(Vec::new()));
    }

    #[test]
    fn test_swap_state_before_initialization_is_noop() {
        // Arrange: a SessionInfo over an uninitialized cell, as a binding
        // factory would observe it.
        let info = dummy_session_info();

        // Act
        info.swap_state::<Vec<String>>(|mut s| {
            s.push("too early".to_string());
            s
        });

        // Assert
        assert!(info.state.peek(|slot| slot.is_none()));
    }

    #[test]
    fn test_swap_state_after_initialization_applies() {
        let info = dummy_session_info();
        info.state.initialize(Box::new(Vec::<String>::new()));

        info.swap_state::<Vec<String>>(|mut s| {
            s.push("applied".to_string());
            s
        });

        assert_eq!(cell_as_vec(&info.state), Some(vec!["applied".to_string()]));
    }

    #[test]
    fn test_swap_state_with_wrong_type_keeps_state() {
        let info = dummy_session_info();
        info.state.initialize(Box::new(Vec::<String>::new()));

        info.swap_state::<i32>(|n| n + 1);

        assert_eq!(cell_as_vec(&info.state), Some(Vec::new()));
    }
}
