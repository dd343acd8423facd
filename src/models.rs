//! Shared data structures used throughout the feed.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{FeedError, Result};

/// A tradable instrument streamed by the feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    /// Unique key, e.g. "AAPL".
    pub ticker: String,
    pub name: String,
    pub description: String,
}

impl Symbol {
    /// Builds a symbol; an empty `description` falls back to a generic blurb.
    pub fn new(ticker: impl Into<String>, name: impl Into<String>, description: &str) -> Self {
        let name = name.into();
        let description = if description.is_empty() {
            format!("Real-time updates for {name}.")
        } else {
            description.to_string()
        };
        Self {
            ticker: ticker.into(),
            name,
            description,
        }
    }

    /// Symbol whose display name is the ticker itself.
    pub fn from_ticker(ticker: &str) -> Self {
        Self::new(ticker, ticker, "")
    }
}

/// Non-empty, ticker-unique list of symbols handed to `connect`.
///
/// Order is kept as given; a repeated ticker keeps its first occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watchlist(Vec<Symbol>);

impl Watchlist {
    pub fn new(symbols: Vec<Symbol>) -> Result<Self> {
        let mut seen = HashSet::new();
        let unique: Vec<Symbol> = symbols
            .into_iter()
            .filter(|s| seen.insert(s.ticker.clone()))
            .collect();
        if unique.is_empty() {
            return Err(FeedError::EmptyWatchlist);
        }
        Ok(Self(unique))
    }

    /// Parses a comma separated ticker list such as `"AAPL, MSFT,GOOG"`.
    pub fn from_tickers(raw: &str) -> Result<Self> {
        let symbols = raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Symbol::from_ticker(&t.to_uppercase()))
            .collect();
        Self::new(symbols)
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.0
    }

    pub fn first(&self) -> &Symbol {
        // non-empty by construction
        &self.0[0]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Symbol> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Watchlist {
    type Item = &'a Symbol;
    type IntoIter = std::slice::Iter<'a, Symbol>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// One generated price tick for a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub id: Uuid,
    pub symbol: String,
    pub price: f64,
    pub change: f64,
}

impl PriceUpdate {
    pub fn new(symbol: impl Into<String>, price: f64, change: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            price,
            change,
        }
    }

    pub fn formatted_price(&self) -> String {
        format!("${:.2}", self.price)
    }

    pub fn formatted_change(&self) -> String {
        let prefix = if self.change >= 0.0 { "+" } else { "" };
        format!("{prefix}{:.2}", self.change)
    }
}

/// Direction marker derived from a nonzero price change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceFlash {
    Up,
    Down,
}

/// JSON text frame sent to the remote endpoint for every update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceMessage {
    pub symbol: String,
    pub price: f64,
    pub change: f64,
    /// Unix seconds, fractional.
    pub timestamp: f64,
}

impl PriceMessage {
    pub fn from_update(update: &PriceUpdate) -> Self {
        let now = chrono::Utc::now();
        Self {
            symbol: update.symbol.clone(),
            price: update.price,
            change: update.change,
            timestamp: now.timestamp_micros() as f64 / 1_000_000.0,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
