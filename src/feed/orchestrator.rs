use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::clock::sleep_or_cancel;
use crate::config::FeedConfig;
use crate::errors::FeedError;
use crate::feed::PriceFeed;
use crate::feed::bus::{Epoch, EventBus, StateSubscription};
use crate::feed::loops::{LoopSet, LoopTimings};
use crate::feed::reconnect::ReconnectDecision;
use crate::feed::state::ConnectionState;
use crate::models::{PriceUpdate, Watchlist};
use crate::simulator::PriceSimulator;
use crate::transport::{
    CloseCode, CloseDisposition, CloseInfo, Connector, Session, SessionEvents, SessionId,
    TransportEvent, classify,
};

/// Everything the orchestrator task reacts to, in arrival order.
#[derive(Debug)]
pub(crate) enum FeedEvent {
    Connect { epoch: Epoch, symbols: Watchlist },
    Disconnect { epoch: Epoch },
    Transport(TransportEvent),
    LoopFailed { session: SessionId, error: FeedError },
    RetryDue { ticket: u64 },
}

/// Handle to a resilient price feed connection.
///
/// `connect` and `disconnect` never fail and never block; outcomes are
/// observed on the state channel. Must be created inside a tokio runtime.
/// Dropping the handle closes the session and stops every task.
pub struct FeedClient {
    bus: Arc<EventBus>,
    events: mpsc::UnboundedSender<FeedEvent>,
    max_attempts: u32,
    _shutdown: DropGuard,
}

impl FeedClient {
    pub fn new(config: FeedConfig, connector: Arc<dyn Connector>) -> Self {
        let bus = Arc::new(EventBus::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let max_attempts = config.reconnect.max_attempts;

        let orchestrator = Orchestrator {
            config,
            connector,
            bus: Arc::clone(&bus),
            events_tx: events_tx.clone(),
            epoch: 0,
            state: ConnectionState::Disconnected,
            symbols: None,
            simulator: Arc::new(Mutex::new(PriceSimulator::new())),
            reconnect: ReconnectState::default(),
            session: None,
            next_session: 0,
            next_ticket: 0,
        };
        tokio::spawn(orchestrator.run(events_rx, shutdown.clone()));

        Self {
            bus,
            events: events_tx,
            max_attempts,
            _shutdown: shutdown.drop_guard(),
        }
    }

    /// Resets everything and starts a fresh connection for `symbols`.
    pub fn connect(&self, symbols: Watchlist) {
        let epoch = self.bus.begin(ConnectionState::Connecting);
        info!(symbols = symbols.len(), "[FEED] connect requested");
        let _ = self.events.send(FeedEvent::Connect { epoch, symbols });
    }

    /// Stops streaming. `Disconnected` is published before this returns and
    /// nothing from the previous session is published afterwards.
    pub fn disconnect(&self) {
        let epoch = self.bus.begin(ConnectionState::Disconnected);
        info!("[FEED] disconnect requested");
        let _ = self.events.send(FeedEvent::Disconnect { epoch });
    }

    pub fn current_state(&self) -> ConnectionState {
        self.bus.current_state()
    }

    /// Latest-value view of the connection state; intermediate states may be
    /// skipped by slow readers.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.bus.watch_state()
    }

    pub fn subscribe_state(&self) -> StateSubscription {
        self.bus.subscribe_state()
    }

    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceUpdate> {
        self.bus.subscribe_prices()
    }

    pub fn max_reconnect_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl PriceFeed for FeedClient {
    fn connect(&self, symbols: Watchlist) {
        FeedClient::connect(self, symbols)
    }

    fn disconnect(&self) {
        FeedClient::disconnect(self)
    }

    fn current_state(&self) -> ConnectionState {
        FeedClient::current_state(self)
    }

    fn subscribe_state(&self) -> StateSubscription {
        FeedClient::subscribe_state(self)
    }

    fn subscribe_prices(&self) -> broadcast::Receiver<PriceUpdate> {
        FeedClient::subscribe_prices(self)
    }
}

#[derive(Debug, Default)]
struct ReconnectState {
    attempt: u32,
    user_initiated_disconnect: bool,
    pending: Option<PendingRetry>,
}

#[derive(Debug)]
struct PendingRetry {
    ticket: u64,
    cancel: CancellationToken,
}

struct ActiveSession {
    id: SessionId,
    handle: Arc<dyn Session>,
    /// `None` until the handshake completes.
    loops: Option<LoopSet>,
}

/// Owns all mutable connection state; runs as a single task.
struct Orchestrator {
    config: FeedConfig,
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    events_tx: mpsc::UnboundedSender<FeedEvent>,
    epoch: Epoch,
    /// Last state this task published or adopted.
    state: ConnectionState,
    symbols: Option<Watchlist>,
    simulator: Arc<Mutex<PriceSimulator>>,
    reconnect: ReconnectState,
    session: Option<ActiveSession>,
    next_session: u64,
    next_ticket: u64,
}

impl Orchestrator {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<FeedEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = events.recv() => self.handle(event),
            }
        }
        self.cancel_retry();
        self.teardown(Some(CloseInfo::new(CloseCode::Away, None)));
        debug!("[FEED] orchestrator stopped");
    }

    fn handle(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Connect { epoch, symbols } => self.on_connect(epoch, symbols),
            FeedEvent::Disconnect { epoch } => self.on_disconnect(epoch),
            // a newer connect/disconnect is queued behind this event
            other if !self.bus.is_current(self.epoch) => {
                debug!(event = ?other, "[FEED] event for superseded epoch dropped");
            }
            FeedEvent::Transport(TransportEvent::Opened { session }) => self.on_open(session),
            FeedEvent::Transport(TransportEvent::Closed { session, close }) => {
                self.on_close(session, close)
            }
            FeedEvent::LoopFailed { session, error } => self.on_loop_failed(session, error),
            FeedEvent::RetryDue { ticket } => self.on_retry_due(ticket),
        }
    }

    fn on_connect(&mut self, epoch: Epoch, symbols: Watchlist) {
        self.epoch = epoch;
        self.state = ConnectionState::Connecting;
        self.cancel_retry();
        self.teardown(Some(CloseInfo::new(CloseCode::Away, None)));
        self.reconnect.attempt = 0;
        self.reconnect.user_initiated_disconnect = false;
        self.simulator = Arc::new(Mutex::new(PriceSimulator::new()));
        self.symbols = Some(symbols);
        self.open_session();
    }

    fn on_disconnect(&mut self, epoch: Epoch) {
        self.epoch = epoch;
        self.state = ConnectionState::Disconnected;
        self.reconnect.user_initiated_disconnect = true;
        self.reconnect.attempt = 0;
        self.cancel_retry();
        self.teardown(Some(CloseInfo::new(CloseCode::Away, None)));
    }

    fn open_session(&mut self) {
        if self.session.is_some() {
            self.teardown(Some(CloseInfo::new(CloseCode::Away, None)));
        }
        self.next_session += 1;
        let id = SessionId(self.next_session);
        let events = SessionEvents::new(id, self.events_tx.clone());
        let handle = self.connector.open(&self.config.ws_url, events);
        info!(session = %id, url = %self.config.ws_url, "[FEED] opening session");
        self.session = Some(ActiveSession {
            id,
            handle,
            loops: None,
        });
    }

    fn on_open(&mut self, id: SessionId) {
        let handle = match &self.session {
            Some(active) if active.id == id && active.loops.is_none() => Arc::clone(&active.handle),
            _ => {
                debug!(session = %id, "[FEED] stale handshake ignored");
                return;
            }
        };
        let Some(symbols) = self.symbols.clone() else {
            return;
        };

        self.reconnect.attempt = 0;
        if !self.state.can_transition_to(&ConnectionState::Connected)
            || !self.bus.go_live(self.epoch, id)
        {
            debug!(session = %id, state = %self.state, "[FEED] handshake completed out of order");
            return;
        }
        self.state = ConnectionState::Connected;
        info!(session = %id, "[FEED] connected");

        self.simulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seed(&symbols);
        let loops = LoopSet::spawn(
            id,
            handle,
            Arc::clone(&self.bus),
            self.events_tx.clone(),
            symbols,
            Arc::clone(&self.simulator),
            LoopTimings {
                price_interval: self.config.price_update_interval,
                heartbeat_interval: self.config.heartbeat_interval,
            },
        );
        if let Some(active) = self.session.as_mut() {
            active.loops = Some(loops);
        }
    }

    fn on_close(&mut self, id: SessionId, close: CloseInfo) {
        if self.session.as_ref().map(|a| a.id) != Some(id) {
            debug!(session = %id, "[FEED] stale close ignored");
            return;
        }
        // the socket is already gone, nothing to close
        self.teardown(None);

        match classify(&close) {
            CloseDisposition::Terminal => {
                let err = FeedError::NonRecoverableClose {
                    code: close.code.into(),
                    reason: close.reason,
                };
                warn!(session = %id, error = %err, "[FEED] socket closed; not reconnecting");
                self.publish(ConnectionState::Disconnected);
            }
            CloseDisposition::Recoverable => {
                warn!(session = %id, code = ?close.code, "[FEED] socket closed");
                self.schedule_reconnect();
            }
        }
    }

    fn on_loop_failed(&mut self, id: SessionId, error: FeedError) {
        match &self.session {
            Some(active) if active.id == id && active.loops.is_some() => {
                self.fail_and_recover(error)
            }
            _ => debug!(session = %id, error = %error, "[FEED] failure from stale session ignored"),
        }
    }

    /// Single recovery path for send, heartbeat and receive failures.
    fn fail_and_recover(&mut self, error: FeedError) {
        warn!(error = %error, "[FEED] connection failed; recovering");
        self.teardown(Some(CloseInfo::abnormal()));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect.user_initiated_disconnect {
            return;
        }
        match self.config.reconnect.next(self.reconnect.attempt) {
            ReconnectDecision::GiveUp => {
                let err = FeedError::MaxAttemptsExceeded(self.reconnect.attempt);
                error!(error = %err, "[FEED] giving up");
                self.publish(ConnectionState::Disconnected);
            }
            ReconnectDecision::Retry { attempt, delay } => {
                self.reconnect.attempt = attempt;
                self.publish(ConnectionState::Reconnecting { attempt });
                info!(attempt, delay_ms = delay.as_millis() as u64, "[FEED] reconnect scheduled");

                self.cancel_retry();
                self.next_ticket += 1;
                let ticket = self.next_ticket;
                let cancel = CancellationToken::new();
                let token = cancel.clone();
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    if sleep_or_cancel(delay, &token).await {
                        let _ = tx.send(FeedEvent::RetryDue { ticket });
                    }
                });
                self.reconnect.pending = Some(PendingRetry { ticket, cancel });
            }
        }
    }

    fn on_retry_due(&mut self, ticket: u64) {
        match &self.reconnect.pending {
            Some(pending) if pending.ticket == ticket => self.reconnect.pending = None,
            _ => {
                debug!(ticket, "[FEED] cancelled retry ignored");
                return;
            }
        }
        if self.reconnect.user_initiated_disconnect {
            return;
        }
        self.publish(ConnectionState::Connecting);
        self.open_session();
    }

    fn cancel_retry(&mut self) {
        if let Some(pending) = self.reconnect.pending.take() {
            pending.cancel.cancel();
        }
    }

    /// Stops the loops and drops the session; `close` is sent to the socket if given.
    fn teardown(&mut self, close: Option<CloseInfo>) {
        let Some(active) = self.session.take() else {
            return;
        };
        self.bus.retire(active.id);
        if let Some(loops) = active.loops {
            loops.cancel();
        }
        if let Some(close) = close {
            active.handle.close(close.code, close.reason);
        }
    }

    fn publish(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(&next) {
            debug!(from = %self.state, to = %next, "[FEED] illegal transition dropped");
            return;
        }
        if self.bus.publish_state(self.epoch, next) {
            info!(state = %next, "[FEED] state changed");
            self.state = next;
        }
    }
}
