//! Connection lifecycle: state machine, backoff, event bus, periodic loops and
//! the orchestrator that ties them together.

pub mod bus;
pub mod loops;
pub mod orchestrator;
pub mod reconnect;
pub mod state;

use tokio::sync::broadcast;

pub use bus::{EventBus, StateSubscription};
pub use loops::{DISCONNECT_DIRECTIVE, is_disconnect_directive};
pub use orchestrator::FeedClient;
pub(crate) use orchestrator::FeedEvent;
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use state::ConnectionState;

use crate::models::{PriceUpdate, Watchlist};

/// Consumer-facing surface of a price feed.
///
/// Implemented by [`FeedClient`]; state projections depend on this trait so
/// they can be driven by a fake in tests.
pub trait PriceFeed: Send + Sync {
    fn connect(&self, symbols: Watchlist);
    fn disconnect(&self);
    fn current_state(&self) -> ConnectionState;
    /// Current state, then every transition.
    fn subscribe_state(&self) -> StateSubscription;
    fn subscribe_prices(&self) -> broadcast::Receiver<PriceUpdate>;
}
