//! Synthetic price generator.
//!
//! Each tick draws a uniform delta per symbol and applies it to the last known
//! price. Unseen tickers are seeded lazily, prices never drop below
//! [`PRICE_FLOOR`].

use std::collections::HashMap;
use std::ops::RangeInclusive;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::{PriceUpdate, Symbol};

/// Range a ticker's first price is drawn from.
pub const SEED_RANGE: RangeInclusive<f64> = 40.0..=250.0;
/// Largest absolute per-tick move.
pub const MAX_STEP: f64 = 2.5;
pub const PRICE_FLOOR: f64 = 0.5;

/// Applies `delta` to `last` and clamps the result to the floor.
pub fn apply_delta(last: f64, delta: f64) -> f64 {
    (last + delta).max(PRICE_FLOOR)
}

/// Random-walk generator holding the last price per ticker.
#[derive(Debug)]
pub struct PriceSimulator<R = StdRng> {
    book: HashMap<String, f64>,
    rng: R,
}

impl PriceSimulator<StdRng> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Deterministic generator, for tests and replays.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl Default for PriceSimulator<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> PriceSimulator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            book: HashMap::new(),
            rng,
        }
    }

    /// Seeds every ticker that has no price yet; known prices are kept.
    pub fn seed<'a>(&mut self, symbols: impl IntoIterator<Item = &'a Symbol>) {
        for symbol in symbols {
            if !self.book.contains_key(&symbol.ticker) {
                let initial = self.rng.random_range(SEED_RANGE);
                self.book.insert(symbol.ticker.clone(), initial);
            }
        }
    }

    pub fn last_price(&self, ticker: &str) -> Option<f64> {
        self.book.get(ticker).copied()
    }

    /// Advances one ticker by a random step.
    pub fn step(&mut self, ticker: &str) -> PriceUpdate {
        let existing = match self.book.get(ticker) {
            Some(price) => *price,
            None => self.rng.random_range(SEED_RANGE),
        };
        let delta = self.rng.random_range(-MAX_STEP..=MAX_STEP);
        let price = apply_delta(existing, delta);
        self.book.insert(ticker.to_string(), price);
        PriceUpdate::new(ticker, price, delta)
    }

    /// One round of updates, in symbol order.
    pub fn tick<'a>(&mut self, symbols: impl IntoIterator<Item = &'a Symbol>) -> Vec<PriceUpdate> {
        symbols
            .into_iter()
            .map(|symbol| self.step(&symbol.ticker))
            .collect()
    }
}
