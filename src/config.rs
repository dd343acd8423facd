//! Configuration loader and feed settings.

use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::errors::{FeedError, Result};
use crate::feed::reconnect::ReconnectPolicy;
use crate::models::Watchlist;

/// Echo endpoint the simulated prices are written to.
pub const DEFAULT_WS_URL: &str = "wss://ws.postman-echo.com/raw";
pub const DEFAULT_SYMBOLS: &str = "AAPL,MSFT,GOOG,AMZN,NVDA";

/// Consolidated feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// WebSocket endpoint of the remote peer.
    pub ws_url: Url,
    /// Time between two rounds of price updates.
    pub price_update_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How long the WebSocket upgrade may take before the attempt counts as failed.
    pub connect_timeout: Duration,
    /// How long a ping may wait for its pong.
    pub ping_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            // constant, always parses
            ws_url: Url::parse(DEFAULT_WS_URL).expect("default URL is valid"),
            price_update_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; malformed values are errors.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let ws_url = match lookup("FEED_WS_URL") {
            Some(raw) => parse_ws_url(&raw)?,
            None => defaults.ws_url,
        };
        let price_update_interval = duration_var(&lookup, "FEED_PRICE_INTERVAL_MS", Duration::from_millis)?
            .unwrap_or(defaults.price_update_interval);
        let heartbeat_interval = duration_var(&lookup, "FEED_HEARTBEAT_INTERVAL_SECS", Duration::from_secs)?
            .unwrap_or(defaults.heartbeat_interval);
        let connect_timeout = duration_var(&lookup, "FEED_CONNECT_TIMEOUT_SECS", Duration::from_secs)?
            .unwrap_or(defaults.connect_timeout);
        let ping_timeout = duration_var(&lookup, "FEED_PING_TIMEOUT_SECS", Duration::from_secs)?
            .unwrap_or(defaults.ping_timeout);

        let initial_delay = duration_var(&lookup, "FEED_RECONNECT_INITIAL_MS", Duration::from_millis)?
            .unwrap_or(defaults.reconnect.initial_delay);
        let max_delay = duration_var(&lookup, "FEED_RECONNECT_MAX_MS", Duration::from_millis)?
            .unwrap_or(defaults.reconnect.max_delay);
        let max_attempts = parse_var::<u32>(&lookup, "FEED_MAX_RECONNECT_ATTEMPTS")?
            .unwrap_or(defaults.reconnect.max_attempts);

        if max_delay < initial_delay {
            return Err(FeedError::Config(format!(
                "FEED_RECONNECT_MAX_MS ({max_delay:?}) is below FEED_RECONNECT_INITIAL_MS ({initial_delay:?})"
            )));
        }

        Ok(Self {
            ws_url,
            price_update_interval,
            heartbeat_interval,
            connect_timeout,
            ping_timeout,
            reconnect: ReconnectPolicy {
                initial_delay,
                max_delay,
                max_attempts,
            },
        })
    }
}

/// Symbols to stream, from `FEED_SYMBOLS` or the default list.
pub fn load_watchlist() -> Result<Watchlist> {
    load_watchlist_from(|key| std::env::var(key).ok())
}

/// Same as [`load_watchlist`] with a custom variable source.
pub fn load_watchlist_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Watchlist> {
    let raw = lookup("FEED_SYMBOLS").unwrap_or_else(|| DEFAULT_SYMBOLS.into());
    Watchlist::from_tickers(&raw)
}

fn parse_ws_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(FeedError::Config(format!(
            "FEED_WS_URL must use ws:// or wss://, got {other}://"
        ))),
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().map_err(FeedError::from))
        .transpose()
}

fn duration_var(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    unit: fn(u64) -> Duration,
) -> Result<Option<Duration>> {
    let value = parse_var::<u64>(lookup, key)?;
    match value {
        Some(0) => Err(FeedError::Config(format!("{key} must be greater than zero"))),
        other => Ok(other.map(unit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_feed_constants() {
        let config = FeedConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.ws_url.as_str(), DEFAULT_WS_URL);
        assert_eq!(config.price_update_interval, Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = FeedConfig::from_lookup(lookup(&[
            ("FEED_WS_URL", "ws://localhost:9001/feed"),
            ("FEED_PRICE_INTERVAL_MS", "500"),
            ("FEED_CONNECT_TIMEOUT_SECS", "3"),
            ("FEED_MAX_RECONNECT_ATTEMPTS", " 3 "),
            ("FEED_RECONNECT_INITIAL_MS", "200"),
            ("FEED_RECONNECT_MAX_MS", "1000"),
        ]))
        .unwrap();
        assert_eq!(config.ws_url.host_str(), Some("localhost"));
        assert_eq!(config.price_update_interval, Duration::from_millis(500));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(200));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(1));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            FeedConfig::from_lookup(lookup(&[("FEED_PRICE_INTERVAL_MS", "fast")])),
            Err(FeedError::ParseInt(_))
        ));
        assert!(matches!(
            FeedConfig::from_lookup(lookup(&[("FEED_HEARTBEAT_INTERVAL_SECS", "0")])),
            Err(FeedError::Config(_))
        ));
        assert!(matches!(
            FeedConfig::from_lookup(lookup(&[("FEED_WS_URL", "https://example.com")])),
            Err(FeedError::Config(_))
        ));
        assert!(matches!(
            FeedConfig::from_lookup(lookup(&[("FEED_WS_URL", "not a url")])),
            Err(FeedError::UrlParse(_))
        ));
        assert!(matches!(
            FeedConfig::from_lookup(lookup(&[
                ("FEED_RECONNECT_INITIAL_MS", "5000"),
                ("FEED_RECONNECT_MAX_MS", "1000"),
            ])),
            Err(FeedError::Config(_))
        ));
    }

    #[test]
    fn watchlist_from_symbols_variable() {
        let list = load_watchlist_from(lookup(&[("FEED_SYMBOLS", "btc, eth ,BTC")])).unwrap();
        let tickers: Vec<&str> = list.iter().map(|s| s.ticker.as_str()).collect();
        assert_eq!(tickers, vec!["BTC", "ETH"]);

        let defaults = load_watchlist_from(lookup(&[])).unwrap();
        assert_eq!(defaults.len(), 5);
        assert_eq!(defaults.first().ticker, "AAPL");

        assert!(matches!(
            load_watchlist_from(lookup(&[("FEED_SYMBOLS", " , ")])),
            Err(FeedError::EmptyWatchlist)
        ));
    }

    #[test]
    fn zero_connect_timeout_is_rejected() {
        assert!(matches!(
            FeedConfig::from_lookup(lookup(&[("FEED_CONNECT_TIMEOUT_SECS", "0")])),
            Err(FeedError::Config(_))
        ));
    }
}
