//! BitMEX API wire types
//!
//! Numbers are read from their exact JSON text into `Decimal`; nothing
//! passes through `f64`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Number;

use rtd_core::{Instrument, LevelUpdate, MarketDataSnapshot, MarketDepth, Trade, TradeSide};

/// BitMEX realtime WebSocket URL
pub const BITMEX_WS_URL: &str = "wss://ws.bitmex.com/realtime";

/// BitMEX REST API base
pub const BITMEX_API_BASE: &str = "https://www.bitmex.com/api/v1";

/// Top 10 levels, full replace on every update
pub const DEPTH_DELTA_TABLE: &str = "orderBook10";

/// Per-level rows returned for a `getSymbol` request
pub const DEPTH_SNAPSHOT_TABLE: &str = "orderBook25";

pub const TRADE_TABLE: &str = "trade";

// ============================================================================
// Outbound
// ============================================================================

/// Operation request sent over the socket, e.g. `{"op":"subscribe","args":[...]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpRequest {
    pub op: String,
    pub args: Vec<String>,
}

impl OpRequest {
    pub fn subscribe<S: AsRef<str>>(channels: &[S]) -> Self {
        Self {
            op: "subscribe".to_string(),
            args: channels.iter().map(|c| c.as_ref().to_string()).collect(),
        }
    }

    pub fn get_symbol(symbol: &str) -> Self {
        Self {
            op: "getSymbol".to_string(),
            args: vec![symbol.to_string()],
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Envelope shared by every table message
#[derive(Debug, Clone, Deserialize)]
pub struct TableMessage<T> {
    pub table: String,
    #[serde(default)]
    pub action: Option<String>,
    pub data: Vec<T>,
}

/// Row of the `orderBook10` table
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBook10Row {
    pub symbol: String,
    #[serde(default)]
    pub bids: Vec<(Number, Number)>,
    #[serde(default)]
    pub asks: Vec<(Number, Number)>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl OrderBook10Row {
    /// Convert to a full replacement snapshot
    pub fn to_snapshot(&self) -> Result<MarketDataSnapshot, rust_decimal::Error> {
        let mut bids = Self::convert_side(&self.bids)?;
        let mut asks = Self::convert_side(&self.asks)?;

        // Bids by price descending, asks by price ascending
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        let mut snapshot = MarketDataSnapshot::from_levels(self.symbol.clone(), bids, asks);
        if let Some(ts) = self.timestamp {
            snapshot.timestamp = ts;
        }
        Ok(snapshot)
    }

    fn convert_side(levels: &[(Number, Number)]) -> Result<Vec<MarketDepth>, rust_decimal::Error> {
        levels
            .iter()
            .map(|(price, qty)| Ok(MarketDepth::new(parse_number(price)?, parse_number(qty)?)))
            .collect()
    }
}

/// Row of the `orderBook25` table (one per level)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthLevelRow {
    pub symbol: String,
    pub level: usize,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub bid_size: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub bid_price: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub ask_size: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub ask_price: Option<Decimal>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<DepthLevelRow> for LevelUpdate {
    fn from(row: DepthLevelRow) -> Self {
        LevelUpdate {
            symbol: row.symbol,
            level: row.level,
            bid_price: row.bid_price,
            bid_size: row.bid_size,
            ask_price: row.ask_price,
            ask_size: row.ask_size,
            timestamp: row.timestamp,
        }
    }
}

/// Row of the `trade` table
#[derive(Debug, Clone, Deserialize)]
pub struct TradeRow {
    pub symbol: String,
    #[serde(deserialize_with = "decimal")]
    pub price: Decimal,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub size: Option<Decimal>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<TradeRow> for Trade {
    fn from(row: TradeRow) -> Self {
        let side = row.side.as_deref().and_then(|s| match s {
            "Buy" => Some(TradeSide::Buy),
            "Sell" => Some(TradeSide::Sell),
            _ => None,
        });

        Trade {
            symbol: row.symbol,
            price: row.price,
            size: row.size,
            side,
            timestamp: row.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// Instrument as returned by `GET /instrument`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentResponse {
    pub symbol: String,
    #[serde(default)]
    pub root_symbol: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub typ: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub tick_size: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub multiplier: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub prev_close_price: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub total_volume: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub volume: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub vwap: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub open_interest: Option<Decimal>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub last_price: Option<Decimal>,
}

impl InstrumentResponse {
    pub fn to_instrument(self) -> Instrument {
        Instrument {
            symbol: self.symbol,
            root_symbol: self.root_symbol,
            state: self.state,
            typ: self.typ,
            expiry: self.expiry,
            tick_size: self.tick_size,
            multiplier: self.multiplier,
            prev_close_price: self.prev_close_price,
            total_volume: self.total_volume,
            volume: self.volume,
            vwap: self.vwap,
            open_interest: self.open_interest,
            last_price: self.last_price,
        }
    }
}

// ============================================================================
// Decimal helpers
// ============================================================================

/// Parse a JSON number from its literal text
pub fn parse_number(n: &Number) -> Result<Decimal, rust_decimal::Error> {
    let text = n.to_string();
    Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text))
}

fn decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let n = Number::deserialize(deserializer)?;
    parse_number(&n).map_err(serde::de::Error::custom)
}

fn optional_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Number>::deserialize(deserializer)? {
        Some(n) => parse_number(&n).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_op_request_json() {
        let json = serde_json::to_string(&OpRequest::subscribe(&["trade", "orderBook10"])).unwrap();
        assert_eq!(json, r#"{"op":"subscribe","args":["trade","orderBook10"]}"#);

        let json = serde_json::to_string(&OpRequest::get_symbol("XBTUSD")).unwrap();
        assert_eq!(json, r#"{"op":"getSymbol","args":["XBTUSD"]}"#);
    }

    #[test]
    fn test_parse_number_keeps_precision() {
        let n: Number = serde_json::from_str("12345678.123456789").unwrap();
        assert_eq!(parse_number(&n).unwrap().to_string(), "12345678.123456789");

        let n: Number = serde_json::from_str("7123.5").unwrap();
        assert_eq!(parse_number(&n).unwrap(), dec!(7123.5));

        let n: Number = serde_json::from_str("1e-5").unwrap();
        assert_eq!(parse_number(&n).unwrap(), dec!(0.00001));
    }

    #[test]
    fn test_instrument_response_mapping() {
        let json = r#"{
            "symbol": "XBTUSD",
            "rootSymbol": "XBT",
            "state": "Open",
            "typ": "FFWCSX",
            "expiry": null,
            "tickSize": 0.5,
            "multiplier": -100000000,
            "prevClosePrice": 64250.12,
            "totalVolume": 123456789,
            "volume": 1000,
            "vwap": 64100.3,
            "openInterest": 500000,
            "lastPrice": 64300.5,
            "fundingRate": 0.0001
        }"#;

        let resp: InstrumentResponse = serde_json::from_str(json).unwrap();
        let instrument = resp.to_instrument();

        assert_eq!(instrument.symbol, "XBTUSD");
        assert_eq!(instrument.root_symbol.as_deref(), Some("XBT"));
        assert_eq!(instrument.expiry, None);
        assert_eq!(instrument.tick_size, Some(dec!(0.5)));
        assert_eq!(instrument.multiplier, Some(dec!(-100000000)));
        assert_eq!(instrument.last_price, Some(dec!(64300.5)));
    }
}
