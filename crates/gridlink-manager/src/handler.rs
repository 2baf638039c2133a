//! Handler bindings: caller-supplied factories producing stateful event
//! handlers, one per device type.
//!
//! A [`GridHandler`] is a pure fold over device events: every callback takes
//! the current state by value and returns the next state.  The session layer
//! owns the state cell and threads it through; handlers never see concurrent
//! calls against the same state.
//!
//! Handler state types differ per device, so the session plumbing works with
//! a type-erased adapter ([`ErasedGridHandler`]) that moves states around as
//! `Box<dyn Any + Send>`.  [`binding`] wraps a typed factory into the erased
//! form; [`HandlerBindings`] is the registry sessions are matched against,
//! keyed by device id with a fallback to device name.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::session::SessionInfo;

/// A handler state in transit through the type-erased session plumbing.
pub type BoxedState = Box<dyn Any + Send>;

/// Stateful event handler for one connected device.
///
/// Only `initial_state` is required; event callbacks default to returning the
/// state unchanged, so a grid-only handler can skip the encoder callbacks and
/// vice versa.
pub trait GridHandler: Send + Sync + 'static {
    /// Session state threaded through every callback.  `Clone` lets the
    /// connection registry hand out snapshots without disturbing the cell.
    type State: Clone + Send + 'static;

    /// Produces the state a fresh session starts from.
    fn initial_state(&self) -> Self::State;

    /// A grid key went down (`how == 1`) or up (`how == 0`) at `(x, y)`.
    fn on_grid_key(&self, state: Self::State, x: i32, y: i32, how: i32) -> Self::State {
        let _ = (x, y, how);
        state
    }

    /// An encoder's push switch went down or up.
    fn on_enc_key(&self, state: Self::State, enc: i32, how: i32) -> Self::State {
        let _ = (enc, how);
        state
    }

    /// An encoder rotated by `delta` ticks.
    fn on_enc_delta(&self, state: Self::State, enc: i32, delta: i32) -> Self::State {
        let _ = (enc, delta);
        state
    }

    /// The session is being torn down; `state` is the final state.
    fn on_shutdown(&self, state: Self::State) {
        let _ = state;
    }
}

/// Object-safe adapter over [`GridHandler`].
///
/// States travel as [`BoxedState`]; a state of the wrong concrete type is
/// handed back untouched rather than panicking, which keeps a mis-typed
/// `swap_state` from corrupting a live session.
pub trait ErasedGridHandler: Send + Sync {
    fn initial_state(&self) -> BoxedState;
    fn on_grid_key(&self, state: BoxedState, x: i32, y: i32, how: i32) -> BoxedState;
    fn on_enc_key(&self, state: BoxedState, enc: i32, how: i32) -> BoxedState;
    fn on_enc_delta(&self, state: BoxedState, enc: i32, delta: i32) -> BoxedState;
    fn shutdown(&self, state: BoxedState);
    fn clone_state(&self, state: &BoxedState) -> Option<BoxedState>;
}

struct Erase<H>(H);

impl<H: GridHandler> ErasedGridHandler for Erase<H> {
    fn initial_state(&self) -> BoxedState {
        Box::new(self.0.initial_state())
    }

    fn on_grid_key(&self, state: BoxedState, x: i32, y: i32, how: i32) -> BoxedState {
        match state.downcast::<H::State>() {
            Ok(s) => Box::new(self.0.on_grid_key(*s, x, y, how)),
            Err(other) => {
                warn!("grid key event dropped: handler state has unexpected type");
                other
            }
        }
    }

    fn on_enc_key(&self, state: BoxedState, enc: i32, how: i32) -> BoxedState {
        match state.downcast::<H::State>() {
            Ok(s) => Box::new(self.0.on_enc_key(*s, enc, how)),
            Err(other) => {
                warn!("enc key event dropped: handler state has unexpected type");
                other
            }
        }
    }

    fn on_enc_delta(&self, state: BoxedState, enc: i32, delta: i32) -> BoxedState {
        match state.downcast::<H::State>() {
            Ok(s) => Box::new(self.0.on_enc_delta(*s, enc, delta)),
            Err(other) => {
                warn!("enc delta event dropped: handler state has unexpected type");
                other
            }
        }
    }

    fn shutdown(&self, state: BoxedState) {
        match state.downcast::<H::State>() {
            Ok(s) => self.0.on_shutdown(*s),
            Err(_) => warn!("shutdown skipped: handler state has unexpected type"),
        }
    }

    fn clone_state(&self, state: &BoxedState) -> Option<BoxedState> {
        state
            .downcast_ref::<H::State>()
            .map(|s| Box::new(s.clone()) as BoxedState)
    }
}

/// Factory producing a handler for one session, given its capabilities.
pub type HandlerBinding = Arc<dyn Fn(SessionInfo) -> Box<dyn ErasedGridHandler> + Send + Sync>;

/// Wraps a typed handler factory into a [`HandlerBinding`].
pub fn binding<H, F>(factory: F) -> HandlerBinding
where
    H: GridHandler,
    F: Fn(SessionInfo) -> H + Send + Sync + 'static,
{
    Arc::new(move |info| Box::new(Erase(factory(info))) as Box<dyn ErasedGridHandler>)
}

/// Registry of handler bindings keyed by device id or device name.
#[derive(Default)]
pub struct HandlerBindings {
    by_key: HashMap<String, HandlerBinding>,
}

impl HandlerBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a binding under `key` (a device id or a device name).
    pub fn insert(&mut self, key: impl Into<String>, binding: HandlerBinding) {
        self.by_key.insert(key.into(), binding);
    }

    /// Registers a typed factory under `key`.
    pub fn register<H, F>(&mut self, key: impl Into<String>, factory: F)
    where
        H: GridHandler,
        F: Fn(SessionInfo) -> H + Send + Sync + 'static,
    {
        self.insert(key, binding(factory));
    }

    /// Looks up a binding by device id, falling back to device name.
    pub fn lookup(&self, id: &str, name: &str) -> Option<&HandlerBinding> {
        self.by_key.get(id).or_else(|| self.by_key.get(name))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
