//! Resilient price-feed client.
//!
//! A [`FeedClient`] keeps one WebSocket session alive, streams simulated
//! prices over it, recovers from transient failures with exponential backoff,
//! and publishes connection state and price updates on two channels.
//! [`store::PriceStore`] projects both channels into a single snapshot.

pub mod clock;
pub mod config;
pub mod errors;
pub mod feed;
pub mod models;
pub mod simulator;
pub mod store;
pub mod transport;
pub mod utils;

pub use config::FeedConfig;
pub use errors::{FeedError, Result};
pub use feed::{ConnectionState, FeedClient, PriceFeed};
pub use models::{PriceUpdate, Symbol, Watchlist};
