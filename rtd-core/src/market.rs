//! Market data structures for BitMEX instruments and order books

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{RtdError, RtdResult};
use crate::subscription::DataPoint;

/// Maximum number of price levels kept per side of a book
pub const MAX_DEPTH: usize = 10;

/// A single price level in an order book
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDepth {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl MarketDepth {
    /// Create a new price level
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// A level with zero price and quantity (padding for sparse updates)
    pub fn is_blank(&self) -> bool {
        self.price.is_zero() && self.quantity.is_zero()
    }
}

/// Top of book snapshot for one instrument
///
/// Level 0 is the best price on each side. Neither side is ever longer
/// than [`MAX_DEPTH`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    pub symbol: String,
    /// Bids, best (highest) price first
    pub bids: Vec<MarketDepth>,
    /// Asks, best (lowest) price first
    pub asks: Vec<MarketDepth>,
    pub timestamp: DateTime<Utc>,
}

impl MarketDataSnapshot {
    /// Create an empty snapshot
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: Vec::new(),
            asks: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Build a snapshot from full bid/ask arrays, dropping anything past [`MAX_DEPTH`]
    pub fn from_levels(
        symbol: impl Into<String>,
        mut bids: Vec<MarketDepth>,
        mut asks: Vec<MarketDepth>,
    ) -> Self {
        bids.truncate(MAX_DEPTH);
        asks.truncate(MAX_DEPTH);
        Self {
            symbol: symbol.into(),
            bids,
            asks,
            timestamp: Utc::now(),
        }
    }

    pub fn best_bid(&self) -> Decimal {
        self.bids.first().map(|l| l.price).unwrap_or(Decimal::ZERO)
    }

    pub fn best_bid_volume(&self) -> Decimal {
        self.bids.first().map(|l| l.quantity).unwrap_or(Decimal::ZERO)
    }

    pub fn best_ask(&self) -> Decimal {
        self.asks.first().map(|l| l.price).unwrap_or(Decimal::ZERO)
    }

    pub fn best_ask_volume(&self) -> Decimal {
        self.asks.first().map(|l| l.quantity).unwrap_or(Decimal::ZERO)
    }

    /// Resolve a book data point at a level
    ///
    /// Returns `None` for [`DataPoint::Last`] (held on the instrument, not the
    /// book) or when the level is not present yet.
    pub fn value(&self, data_point: DataPoint, level: usize) -> Option<Decimal> {
        match data_point {
            DataPoint::Bid => self.bids.get(level).map(|l| l.price),
            DataPoint::BidVolume => self.bids.get(level).map(|l| l.quantity),
            DataPoint::Ask => self.asks.get(level).map(|l| l.price),
            DataPoint::AskVolume => self.asks.get(level).map(|l| l.quantity),
            DataPoint::Last => None,
        }
    }

    /// Merge one sparse level update into this snapshot
    ///
    /// A side is touched only when the update carries its price or size. The
    /// side is padded with blank levels until `level` exists, then only the
    /// present fields are overwritten.
    pub fn apply_level_update(&mut self, update: &LevelUpdate) -> RtdResult<()> {
        if update.level >= MAX_DEPTH {
            return Err(RtdError::parse(format!(
                "level {} for {} exceeds max depth {}",
                update.level, update.symbol, MAX_DEPTH
            )));
        }

        if update.bid_price.is_some() || update.bid_size.is_some() {
            let slot = Self::level_mut(&mut self.bids, update.level);
            if let Some(price) = update.bid_price {
                slot.price = price;
            }
            if let Some(size) = update.bid_size {
                slot.quantity = size;
            }
        }

        if update.ask_price.is_some() || update.ask_size.is_some() {
            let slot = Self::level_mut(&mut self.asks, update.level);
            if let Some(price) = update.ask_price {
                slot.price = price;
            }
            if let Some(size) = update.ask_size {
                slot.quantity = size;
            }
        }

        self.timestamp = update.timestamp.unwrap_or_else(Utc::now);
        Ok(())
    }

    fn level_mut(side: &mut Vec<MarketDepth>, level: usize) -> &mut MarketDepth {
        if side.len() <= level {
            side.resize(level + 1, MarketDepth::default());
        }
        &mut side[level]
    }
}

impl std::fmt::Display for MarketDataSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {{ {}@{} / {}@{} }}",
            self.symbol,
            self.best_bid_volume(),
            self.best_bid(),
            self.best_ask(),
            self.best_ask_volume()
        )
    }
}

/// Sparse per-level update carried by a depth snapshot frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelUpdate {
    pub symbol: String,
    pub level: usize,
    pub bid_price: Option<Decimal>,
    pub bid_size: Option<Decimal>,
    pub ask_price: Option<Decimal>,
    pub ask_size: Option<Decimal>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Instrument reference data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    /// Unique symbol (e.g., "XBTUSD")
    pub symbol: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_symbol: Option<String>,

    /// Listing state (e.g., "Open", "Settled")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Instrument type code (e.g., "FFWCSX" for perpetual swaps)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_size: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_close_price: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_volume: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub vwap: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<Decimal>,

    /// Last traded price, refreshed by the trade feed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_price: Option<Decimal>,
}

impl Instrument {
    /// Create an instrument with only a symbol set
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            root_symbol: None,
            state: None,
            typ: None,
            expiry: None,
            tick_size: None,
            multiplier: None,
            prev_close_price: None,
            total_volume: None,
            volume: None,
            vwap: None,
            open_interest: None,
            last_price: None,
        }
    }
}

/// Side of a trade (taker side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// A single public trade print
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<TradeSide>,
    pub timestamp: DateTime<Utc>,
}
