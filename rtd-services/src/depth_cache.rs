//! Depth Cache
//!
//! Last known order book and instrument record per symbol. Snapshots are
//! stored and returned whole: a merge is built on a copy and swapped in with
//! a single insert, so readers never observe a half-applied update.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use rtd_core::{DataKey, DataPoint, Instrument, MarketDataSnapshot};

/// Thread-safe cache of books and instruments
#[derive(Debug, Default)]
pub struct DepthCache {
    snapshots: DashMap<String, MarketDataSnapshot>,
    instruments: DashMap<String, Instrument>,
}

impl DepthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the cached book for a symbol
    pub fn get_snapshot(&self, symbol: &str) -> Option<MarketDataSnapshot> {
        self.snapshots.get(symbol).map(|s| s.value().clone())
    }

    /// Overwrite the book for `snapshot.symbol` wholesale
    pub fn replace_snapshot(&self, snapshot: MarketDataSnapshot) {
        self.snapshots.insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn get_instrument(&self, symbol: &str) -> Option<Instrument> {
        self.instruments.get(symbol).map(|i| i.value().clone())
    }

    /// Insert or replace instrument records, returns how many were loaded
    pub fn load_instruments<I>(&self, instruments: I) -> usize
    where
        I: IntoIterator<Item = Instrument>,
    {
        let mut loaded = 0;
        for instrument in instruments {
            self.instruments.insert(instrument.symbol.clone(), instrument);
            loaded += 1;
        }
        debug!("[DepthCache] Loaded {} instruments", loaded);
        loaded
    }

    /// Record a trade price on a known instrument
    ///
    /// Returns `false` and leaves the cache untouched when no instrument
    /// record exists for `symbol`.
    pub fn update_last_price(&self, symbol: &str, price: Decimal) -> bool {
        match self.instruments.get_mut(symbol) {
            Some(mut instrument) => {
                instrument.last_price = Some(price);
                true
            }
            None => {
                warn!(
                    "[DepthCache] Trade for unknown instrument {} at {}, dropped",
                    symbol, price
                );
                false
            }
        }
    }

    /// Whether any book or instrument is cached for the symbol
    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.snapshots.contains_key(symbol) || self.instruments.contains_key(symbol)
    }

    /// Current value for a key, if the cache holds one
    ///
    /// Book data points come from the snapshot, `Last` from the instrument.
    pub fn value_of(&self, key: &DataKey) -> Option<Decimal> {
        match key.data_point() {
            DataPoint::Last => self
                .instruments
                .get(key.symbol())
                .and_then(|i| i.last_price),
            dp => self
                .snapshots
                .get(key.symbol())
                .and_then(|s| s.value().value(dp, key.level())),
        }
    }

    pub fn clear(&self) {
        self.snapshots.clear();
        self.instruments.clear();
    }

    pub fn stats(&self) -> DepthCacheStats {
        let last_update = self.snapshots.iter().map(|s| s.timestamp).max();
        DepthCacheStats {
            snapshots: self.snapshots.len(),
            instruments: self.instruments.len(),
            last_update,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct DepthCacheStats {
    pub snapshots: usize,
    pub instruments: usize,
    pub last_update: Option<DateTime<Utc>>,
}
