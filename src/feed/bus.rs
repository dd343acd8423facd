//! The two observable channels published by the feed.
//!
//! Every publication passes through a small gate holding the current epoch and
//! the id of the live session. `connect`/`disconnect` open a new epoch from
//! the caller's thread; anything the orchestrator publishes on behalf of an
//! older epoch, or a price from a session that is no longer live, is dropped.
//! Because the check and the send happen under the same lock, nothing from a
//! previous epoch can land after the new epoch's first state.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};

use crate::feed::state::ConnectionState;
use crate::models::PriceUpdate;
use crate::transport::SessionId;

const STATE_CAPACITY: usize = 256;
const PRICE_CAPACITY: usize = 1024;

/// Monotonic generation of `connect`/`disconnect` calls.
pub type Epoch = u64;

#[derive(Debug, Default)]
struct Gate {
    epoch: Epoch,
    live: Option<SessionId>,
}

pub struct EventBus {
    gate: Mutex<Gate>,
    state_watch: watch::Sender<ConnectionState>,
    state_events: broadcast::Sender<ConnectionState>,
    prices: broadcast::Sender<PriceUpdate>,
}

impl EventBus {
    pub fn new() -> Self {
        let (state_watch, _) = watch::channel(ConnectionState::Disconnected);
        let (state_events, _) = broadcast::channel(STATE_CAPACITY);
        let (prices, _) = broadcast::channel(PRICE_CAPACITY);
        Self {
            gate: Mutex::new(Gate::default()),
            state_watch,
            state_events,
            prices,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Gate> {
        // the gate holds plain integers; a panic elsewhere can't corrupt it
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, state: ConnectionState) {
        self.state_watch.send_replace(state);
        let _ = self.state_events.send(state);
    }

    /// Starts a new epoch and publishes `state` as its first value.
    pub fn begin(&self, state: ConnectionState) -> Epoch {
        let mut gate = self.lock();
        gate.epoch += 1;
        gate.live = None;
        self.emit(state);
        gate.epoch
    }

    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.lock().epoch == epoch
    }

    /// Publishes `state` if `epoch` is still current; ends any live session.
    pub fn publish_state(&self, epoch: Epoch, state: ConnectionState) -> bool {
        let mut gate = self.lock();
        if gate.epoch != epoch {
            return false;
        }
        gate.live = None;
        self.emit(state);
        true
    }

    /// Publishes `Connected` and marks `session` as the live price source.
    pub fn go_live(&self, epoch: Epoch, session: SessionId) -> bool {
        let mut gate = self.lock();
        if gate.epoch != epoch {
            return false;
        }
        gate.live = Some(session);
        self.emit(ConnectionState::Connected);
        true
    }

    /// Stops accepting prices from `session`.
    pub fn retire(&self, session: SessionId) {
        let mut gate = self.lock();
        if gate.live == Some(session) {
            gate.live = None;
        }
    }

    /// Broadcasts `update` if `session` is live. Returns whether it was accepted.
    pub fn publish_price(&self, session: SessionId, update: PriceUpdate) -> bool {
        let gate = self.lock();
        if gate.live != Some(session) {
            return false;
        }
        // no subscribers is fine
        let _ = self.prices.send(update);
        true
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_watch.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_watch.subscribe()
    }

    /// Current state followed by every later transition.
    pub fn subscribe_state(&self) -> StateSubscription {
        let _gate = self.lock();
        StateSubscription::new(self.current_state(), self.state_events.subscribe())
    }

    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceUpdate> {
        self.prices.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for connection states: yields the state current at subscription
/// time, then every transition in publication order.
#[derive(Debug)]
pub struct StateSubscription {
    initial: Option<ConnectionState>,
    rx: broadcast::Receiver<ConnectionState>,
}

impl StateSubscription {
    pub fn new(initial: ConnectionState, rx: broadcast::Receiver<ConnectionState>) -> Self {
        Self {
            initial: Some(initial),
            rx,
        }
    }

    pub async fn recv(&mut self) -> Result<ConnectionState, broadcast::error::RecvError> {
        if let Some(state) = self.initial.take() {
            return Ok(state);
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<ConnectionState, broadcast::error::TryRecvError> {
        if let Some(state) = self.initial.take() {
            return Ok(state);
        }
        self.rx.try_recv()
    }
}
