//! Presentation-ready projection of the feed.
//!
//! [`AppState`] is an immutable snapshot; every operation returns a new value.
//! [`PriceStore`] folds the state and price channels of a [`PriceFeed`] into a
//! `watch` channel of snapshots and clears price flashes after
//! [`FLASH_DURATION`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::clock::sleep_or_cancel;
use crate::feed::{ConnectionState, PriceFeed, StateSubscription};
use crate::models::{PriceFlash, PriceUpdate, Symbol, Watchlist};

/// How long a flash marker stays after the last update of its symbol.
pub const FLASH_DURATION: Duration = Duration::from_secs(1);

/// Changes smaller than half a cent display as `+0.00` and do not flash.
const FLASH_THRESHOLD: f64 = 0.005;

#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub symbols: Watchlist,
    /// Latest update per ticker.
    pub prices: HashMap<String, PriceUpdate>,
    pub connection: ConnectionState,
    pub selected: Symbol,
    pub flashes: HashMap<String, PriceFlash>,
}

impl AppState {
    /// Empty snapshot with the first symbol selected.
    pub fn new(symbols: Watchlist) -> Self {
        let selected = symbols.first().clone();
        Self {
            symbols,
            prices: HashMap::new(),
            connection: ConnectionState::Disconnected,
            selected,
            flashes: HashMap::new(),
        }
    }

    pub fn updating_connection(&self, connection: ConnectionState) -> Self {
        Self {
            connection,
            ..self.clone()
        }
    }

    /// Records `update` as the latest price and flashes on a visible change.
    pub fn applying(&self, update: PriceUpdate) -> Self {
        let mut next = self.clone();
        if let Some(flash) = flash_for(update.change) {
            next.flashes.insert(update.symbol.clone(), flash);
        }
        next.prices.insert(update.symbol.clone(), update);
        next
    }

    /// Selects `symbol`; symbols outside the watchlist are ignored.
    pub fn selecting(&self, symbol: &Symbol) -> Self {
        if !self.symbols.iter().any(|s| s.ticker == symbol.ticker) {
            return self.clone();
        }
        Self {
            selected: symbol.clone(),
            ..self.clone()
        }
    }

    pub fn clearing_flash(&self, ticker: &str) -> Self {
        let mut next = self.clone();
        next.flashes.remove(ticker);
        next
    }

    pub fn price(&self, ticker: &str) -> Option<&PriceUpdate> {
        self.prices.get(ticker)
    }
}

fn flash_for(change: f64) -> Option<PriceFlash> {
    if change.abs() < FLASH_THRESHOLD {
        None
    } else if change > 0.0 {
        Some(PriceFlash::Up)
    } else {
        Some(PriceFlash::Down)
    }
}

/// Keeps an [`AppState`] in sync with a feed.
pub struct PriceStore {
    feed: Arc<dyn PriceFeed>,
    state: Arc<watch::Sender<AppState>>,
    _shutdown: DropGuard,
}

impl PriceStore {
    /// Binds to `feed`. Must be called inside a tokio runtime.
    pub fn new(feed: Arc<dyn PriceFeed>, symbols: Watchlist) -> Self {
        let initial = AppState::new(symbols).updating_connection(feed.current_state());
        let (tx, _) = watch::channel(initial);
        let state = Arc::new(tx);
        let shutdown = CancellationToken::new();

        tokio::spawn(fold(
            feed.subscribe_state(),
            feed.subscribe_prices(),
            Arc::clone(&state),
            shutdown.clone(),
        ));

        Self {
            feed,
            state,
            _shutdown: shutdown.drop_guard(),
        }
    }

    /// Current snapshot.
    pub fn state(&self) -> AppState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.state.subscribe()
    }

    pub fn start_streaming(&self) {
        let symbols = self.state.borrow().symbols.clone();
        self.feed.connect(symbols);
    }

    pub fn stop_streaming(&self) {
        self.feed.disconnect();
        self.state
            .send_modify(|s| *s = s.updating_connection(ConnectionState::Disconnected));
    }

    pub fn select(&self, symbol: &Symbol) {
        self.state.send_modify(|s| *s = s.selecting(symbol));
    }
}

async fn fold(
    mut states: StateSubscription,
    mut prices: broadcast::Receiver<PriceUpdate>,
    state: Arc<watch::Sender<AppState>>,
    shutdown: CancellationToken,
) {
    let (clear_tx, mut clear_rx) = mpsc::unbounded_channel::<(String, u64)>();
    // latest timer generation per ticker; older timers are ignored
    let mut flash_timers: HashMap<String, u64> = HashMap::new();
    let mut next_generation = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = states.recv() => match received {
                Ok(connection) => {
                    state.send_modify(|s| *s = s.updating_connection(connection));
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "[STORE] state subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
            received = prices.recv() => match received {
                Ok(update) => {
                    let ticker = update.symbol.clone();
                    state.send_modify(|s| *s = s.applying(update));

                    next_generation += 1;
                    let generation = next_generation;
                    flash_timers.insert(ticker.clone(), generation);
                    let token = shutdown.child_token();
                    let tx = clear_tx.clone();
                    tokio::spawn(async move {
                        if sleep_or_cancel(FLASH_DURATION, &token).await {
                            let _ = tx.send((ticker, generation));
                        }
                    });
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "[STORE] price subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
            Some((ticker, generation)) = clear_rx.recv() => {
                if flash_timers.get(&ticker) == Some(&generation) {
                    flash_timers.remove(&ticker);
                    state.send_modify(|s| *s = s.clearing_flash(&ticker));
                }
            }
        }
    }
    debug!("[STORE] projection stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::EventBus;
    use crate::transport::SessionId;
    use std::sync::Mutex;

    fn symbols() -> Watchlist {
        Watchlist::new(vec![
            Symbol::new("AAA", "Company A", "Test symbol A"),
            Symbol::new("BBB", "Company B", "Test symbol B"),
        ])
        .unwrap()
    }

    /// Feed whose channels are driven by the test.
    #[derive(Default)]
    struct FakeFeed {
        bus: EventBus,
        connects: Mutex<Vec<Watchlist>>,
        disconnects: Mutex<usize>,
    }

    impl FakeFeed {
        fn set_state(&self, state: ConnectionState) {
            self.bus.begin(state);
        }

        fn push_price(&self, symbol: &str, price: f64, change: f64) {
            let epoch = self.bus.begin(ConnectionState::Connecting);
            self.bus.go_live(epoch, SessionId(1));
            self.bus
                .publish_price(SessionId(1), PriceUpdate::new(symbol, price, change));
        }
    }

    impl PriceFeed for FakeFeed {
        fn connect(&self, symbols: Watchlist) {
            self.connects.lock().unwrap().push(symbols);
        }

        fn disconnect(&self) {
            *self.disconnects.lock().unwrap() += 1;
        }

        fn current_state(&self) -> ConnectionState {
            self.bus.current_state()
        }

        fn subscribe_state(&self) -> StateSubscription {
            self.bus.subscribe_state()
        }

        fn subscribe_prices(&self) -> broadcast::Receiver<PriceUpdate> {
            self.bus.subscribe_prices()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn initial_state_selects_first_symbol() {
        let state = AppState::new(symbols());
        assert_eq!(state.selected.ticker, "AAA");
        assert_eq!(state.connection, ConnectionState::Disconnected);
        assert!(state.prices.is_empty());
        assert!(state.flashes.is_empty());
    }

    #[test]
    fn applying_sets_price_and_flash() {
        let state = AppState::new(symbols());
        let up = state.applying(PriceUpdate::new("AAA", 120.0, 1.5));
        assert_eq!(up.price("AAA").map(|u| u.price), Some(120.0));
        assert_eq!(up.flashes.get("AAA"), Some(&PriceFlash::Up));

        let down = up.applying(PriceUpdate::new("AAA", 90.0, -3.0));
        assert_eq!(down.price("AAA").map(|u| u.price), Some(90.0));
        assert_eq!(down.flashes.get("AAA"), Some(&PriceFlash::Down));
        // the input snapshot is untouched
        assert_eq!(up.flashes.get("AAA"), Some(&PriceFlash::Up));
    }

    #[test]
    fn sub_cent_change_does_not_flash() {
        let state = AppState::new(symbols()).applying(PriceUpdate::new("AAA", 100.0, 0.002));
        assert_eq!(state.price("AAA").map(|u| u.price), Some(100.0));
        assert!(state.flashes.get("AAA").is_none());

        let flashed = state.applying(PriceUpdate::new("AAA", 99.0, -1.0));
        let after = flashed.applying(PriceUpdate::new("AAA", 99.0, 0.0));
        assert_eq!(after.flashes.get("AAA"), Some(&PriceFlash::Down));
    }

    #[test]
    fn selecting_and_clearing() {
        let list = symbols();
        let state = AppState::new(list.clone());
        let b = list.symbols()[1].clone();
        assert_eq!(state.selecting(&b).selected, b);
        let unknown = Symbol::from_ticker("ZZZ");
        assert_eq!(state.selecting(&unknown).selected.ticker, "AAA");

        let state = state
            .applying(PriceUpdate::new("AAA", 1.0, 1.0))
            .applying(PriceUpdate::new("BBB", 1.0, -1.0))
            .clearing_flash("AAA");
        assert!(state.flashes.get("AAA").is_none());
        assert_eq!(state.flashes.get("BBB"), Some(&PriceFlash::Down));
    }

    #[tokio::test(start_paused = true)]
    async fn store_follows_connection_state() {
        let feed = Arc::new(FakeFeed::default());
        let store = PriceStore::new(feed.clone(), symbols());
        assert_eq!(store.state().connection, ConnectionState::Disconnected);

        feed.set_state(ConnectionState::Connected);
        settle().await;
        assert_eq!(store.state().connection, ConnectionState::Connected);

        feed.set_state(ConnectionState::Reconnecting { attempt: 1 });
        settle().await;
        assert_eq!(
            store.state().connection,
            ConnectionState::Reconnecting { attempt: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flash_clears_after_delay() {
        let feed = Arc::new(FakeFeed::default());
        let store = PriceStore::new(feed.clone(), symbols());

        feed.push_price("AAA", 90.0, -2.0);
        settle().await;
        assert_eq!(store.state().flashes.get("AAA"), Some(&PriceFlash::Down));
        assert_eq!(store.state().price("AAA").map(|u| u.price), Some(90.0));

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(store.state().flashes.get("AAA").is_none());
        assert_eq!(store.state().price("AAA").map(|u| u.price), Some(90.0));
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_updates_keep_last_price_and_rearm_flash() {
        let feed = Arc::new(FakeFeed::default());
        let store = PriceStore::new(feed.clone(), symbols());

        feed.push_price("AAA", 100.0, 1.0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        feed.push_price("AAA", 99.0, -1.0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        feed.push_price("AAA", 101.0, 2.0);
        settle().await;

        let state = store.state();
        assert_eq!(state.price("AAA").map(|u| u.price), Some(101.0));
        assert_eq!(state.flashes.get("AAA"), Some(&PriceFlash::Up));

        // earlier timers have fired by now but were superseded
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.state().flashes.get("AAA"), Some(&PriceFlash::Up));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.state().flashes.get("AAA").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_commands_reach_the_feed() {
        let feed = Arc::new(FakeFeed::default());
        let store = PriceStore::new(feed.clone(), symbols());

        store.start_streaming();
        assert_eq!(feed.connects.lock().unwrap().len(), 1);
        assert_eq!(feed.connects.lock().unwrap()[0].len(), 2);

        feed.set_state(ConnectionState::Connected);
        settle().await;
        store.stop_streaming();
        assert_eq!(*feed.disconnects.lock().unwrap(), 1);
        assert_eq!(store.state().connection, ConnectionState::Disconnected);

        let b = symbols().symbols()[1].clone();
        store.select(&b);
        assert_eq!(store.state().selected, b);
    }
}
