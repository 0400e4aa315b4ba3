//! Subscription addressing and value delivery contracts
//!
//! A consumer asks for one scalar, addressed by a [`DataKey`], and receives
//! updates through a [`ValueSink`] keyed by the [`SubscriberHandle`] it got
//! back from `connect`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::{RtdError, RtdResult};
use crate::market::MAX_DEPTH;

/// The kind of value a subscriber wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataPoint {
    Bid,
    Ask,
    BidVolume,
    AskVolume,
    Last,
}

impl DataPoint {
    /// All book data points (everything except `Last`)
    pub const BOOK: [DataPoint; 4] = [
        DataPoint::Bid,
        DataPoint::BidVolume,
        DataPoint::Ask,
        DataPoint::AskVolume,
    ];

    pub fn is_book(&self) -> bool {
        !matches!(self, DataPoint::Last)
    }
}

impl std::str::FromStr for DataPoint {
    type Err = RtdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bid" => Ok(DataPoint::Bid),
            "ask" => Ok(DataPoint::Ask),
            "bidvol" | "bidvolume" => Ok(DataPoint::BidVolume),
            "askvol" | "askvolume" => Ok(DataPoint::AskVolume),
            "last" => Ok(DataPoint::Last),
            other => Err(RtdError::invalid_request(format!(
                "unknown data point '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for DataPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataPoint::Bid => "Bid",
            DataPoint::Ask => "Ask",
            DataPoint::BidVolume => "BidVolume",
            DataPoint::AskVolume => "AskVolume",
            DataPoint::Last => "Last",
        };
        f.write_str(name)
    }
}

/// Unique key for one subscribable value
///
/// Only constructible through [`DataKey::new`] / [`DataKey::parse`], so a
/// key in hand always has an in-range level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DataKey {
    symbol: String,
    data_point: DataPoint,
    level: usize,
}

impl DataKey {
    /// Validate and build a key. `Last` always lives at level 0.
    pub fn new(symbol: impl Into<String>, data_point: DataPoint, level: usize) -> RtdResult<Self> {
        let symbol = symbol.into();
        if symbol.trim().is_empty() {
            return Err(RtdError::invalid_request("symbol must not be empty"));
        }
        if level >= MAX_DEPTH {
            return Err(RtdError::invalid_request(format!(
                "level {} out of range [0, {})",
                level, MAX_DEPTH
            )));
        }

        let level = if data_point == DataPoint::Last { 0 } else { level };

        Ok(Self {
            symbol,
            data_point,
            level,
        })
    }

    /// Parse a key from its string parts; a missing level means top of book
    pub fn parse(symbol: &str, data_point: &str, level: Option<&str>) -> RtdResult<Self> {
        let data_point: DataPoint = data_point.parse()?;
        let level = match level.map(str::trim) {
            None | Some("") => 0,
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| RtdError::invalid_request(format!("invalid level '{}'", raw)))?,
        };
        Self::new(symbol.trim(), data_point, level)
    }

    /// Key for a bid/ask side value at a given level, used when fanning out
    /// book updates. The caller guarantees `level < MAX_DEPTH`.
    pub(crate) fn unchecked(symbol: &str, data_point: DataPoint, level: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            data_point,
            level,
        }
    }

    /// Key for a book value at `level`, `None` when the level is out of range
    pub fn book(symbol: &str, data_point: DataPoint, level: usize) -> Option<Self> {
        (data_point.is_book() && level < MAX_DEPTH)
            .then(|| Self::unchecked(symbol, data_point, level))
    }

    /// Key for the last traded price of a symbol
    pub fn last(symbol: &str) -> Self {
        Self::unchecked(symbol, DataPoint::Last, 0)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn data_point(&self) -> DataPoint {
        self.data_point
    }

    pub fn level(&self) -> usize {
        self.level
    }
}

impl std::fmt::Display for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.symbol, self.data_point, self.level)
    }
}

/// Opaque subscriber identifier minted by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberHandle(pub u64);

impl std::fmt::Display for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// Current value of a key as seen at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataValue {
    Value(Decimal),
    /// No data cached yet; a later push will deliver it
    Pending,
}

impl DataValue {
    pub fn is_pending(&self) -> bool {
        matches!(self, DataValue::Pending)
    }

    pub fn value(&self) -> Option<Decimal> {
        match self {
            DataValue::Value(v) => Some(*v),
            DataValue::Pending => None,
        }
    }
}

/// Result of a successful connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub handle: SubscriberHandle,
    pub key: DataKey,
    pub value: DataValue,
}

/// One pushed value change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueUpdate {
    pub handle: SubscriberHandle,
    pub value: Decimal,
}

/// Delivery contract invoked whenever a subscribed value changes
///
/// Called from the dispatcher task. Implementations must not block.
pub trait ValueSink: Send + Sync {
    fn on_value_changed(&self, handle: SubscriberHandle, value: Decimal);
}

/// [`ValueSink`] that keeps only the latest value per handle
///
/// A slow consumer never sees a backlog: repeated changes to one handle
/// between reads collapse into the most recent value.
#[derive(Debug, Default)]
pub struct ConflatingSink {
    latest: DashMap<SubscriberHandle, Decimal>,
    notify: Notify,
}

impl ConflatingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every pending change, ordered by handle
    pub fn take(&self) -> Vec<ValueUpdate> {
        let handles: Vec<SubscriberHandle> = self.latest.iter().map(|e| *e.key()).collect();
        let mut updates: Vec<ValueUpdate> = handles
            .into_iter()
            .filter_map(|handle| {
                self.latest
                    .remove(&handle)
                    .map(|(handle, value)| ValueUpdate { handle, value })
            })
            .collect();
        updates.sort_by_key(|u| u.handle);
        updates
    }

    /// Wait until at least one change is pending, then take them all
    pub async fn changed(&self) -> Vec<ValueUpdate> {
        loop {
            let updates = self.take();
            if !updates.is_empty() {
                return updates;
            }
            self.notify.notified().await;
        }
    }

    /// Pending value for `handle` without consuming it
    pub fn latest(&self, handle: SubscriberHandle) -> Option<Decimal> {
        self.latest.get(&handle).map(|v| *v)
    }

    pub fn pending(&self) -> usize {
        self.latest.len()
    }
}

impl ValueSink for ConflatingSink {
    fn on_value_changed(&self, handle: SubscriberHandle, value: Decimal) {
        self.latest.insert(handle, value);
        // Stores a permit when nobody is waiting
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_data_point_names() {
        assert_eq!("Bid".parse::<DataPoint>().unwrap(), DataPoint::Bid);
        assert_eq!("ask".parse::<DataPoint>().unwrap(), DataPoint::Ask);
        assert_eq!("BidVol".parse::<DataPoint>().unwrap(), DataPoint::BidVolume);
        assert_eq!("AskVolume".parse::<DataPoint>().unwrap(), DataPoint::AskVolume);
        assert_eq!(" LAST ".parse::<DataPoint>().unwrap(), DataPoint::Last);
        assert!("Mid".parse::<DataPoint>().unwrap_err().is_invalid_request());
    }

    #[test]
    fn test_key_level_range() {
        assert!(DataKey::new("XBTUSD", DataPoint::Bid, 0).is_ok());
        assert!(DataKey::new("XBTUSD", DataPoint::Bid, 9).is_ok());

        let err = DataKey::new("XBTUSD", DataPoint::Bid, 10).unwrap_err();
        assert!(matches!(err, RtdError::InvalidRequest(_)));
    }

    #[test]
    fn test_key_parse_defaults_level() {
        let key = DataKey::parse("XBTUSD", "Ask", None).unwrap();
        assert_eq!(key.level(), 0);

        let key = DataKey::parse("XBTUSD", "AskVol", Some("3")).unwrap();
        assert_eq!(key.data_point(), DataPoint::AskVolume);
        assert_eq!(key.level(), 3);
    }

    #[test]
    fn test_key_parse_rejects_garbage() {
        assert!(DataKey::parse("XBTUSD", "Bid", Some("-1")).is_err());
        assert!(DataKey::parse("XBTUSD", "Bid", Some("top")).is_err());
        assert!(DataKey::parse("", "Bid", None).is_err());
        assert!(DataKey::parse("XBTUSD", "Spread", None).is_err());
    }

    #[test]
    fn test_last_is_always_level_zero() {
        let key = DataKey::new("XBTUSD", DataPoint::Last, 4).unwrap();
        assert_eq!(key, DataKey::last("XBTUSD"));
    }

    #[test]
    fn test_book_key_helper() {
        assert!(DataKey::book("XBTUSD", DataPoint::Bid, 9).is_some());
        assert!(DataKey::book("XBTUSD", DataPoint::Bid, 10).is_none());
        assert!(DataKey::book("XBTUSD", DataPoint::Last, 0).is_none());
    }

    #[test]
    fn test_conflating_sink_keeps_latest_per_handle() {
        let sink = ConflatingSink::new();
        for i in 0..1000 {
            sink.on_value_changed(SubscriberHandle(7), Decimal::from(i));
        }
        sink.on_value_changed(SubscriberHandle(3), dec!(101.5));

        assert_eq!(sink.pending(), 2);
        assert_eq!(sink.latest(SubscriberHandle(7)), Some(dec!(999)));
        assert_eq!(
            sink.take(),
            vec![
                ValueUpdate {
                    handle: SubscriberHandle(3),
                    value: dec!(101.5)
                },
                ValueUpdate {
                    handle: SubscriberHandle(7),
                    value: dec!(999)
                },
            ]
        );
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_conflating_sink_wakes_waiter() {
        let sink = std::sync::Arc::new(ConflatingSink::new());
        let waiter = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.changed().await })
        };
        tokio::task::yield_now().await;

        sink.on_value_changed(SubscriberHandle(1), dec!(1));
        sink.on_value_changed(SubscriberHandle(1), dec!(2));

        let updates = waiter.await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].value, dec!(2));
    }
}
