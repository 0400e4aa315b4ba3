//! Inbound frame classification and decoding
//!
//! Every text frame from the realtime socket goes through [`decode`]. It
//! never panics: anything it cannot make sense of comes back as
//! [`RtdError::Parse`] for the caller to log and drop.

use serde::de::DeserializeOwned;
use serde_json::Value;

use rtd_core::{LevelUpdate, MarketDataSnapshot, RtdError, RtdResult, Trade};

use crate::types::{
    DepthLevelRow, OrderBook10Row, TableMessage, TradeRow, DEPTH_DELTA_TABLE,
    DEPTH_SNAPSHOT_TABLE, TRADE_TABLE,
};

/// Action tag carried by table messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookAction {
    /// Replace the addressed levels wholesale
    Partial,
    Insert,
    Update,
    Delete,
    Other(String),
}

impl BookAction {
    pub fn parse(action: Option<&str>) -> Self {
        match action {
            Some("partial") => BookAction::Partial,
            Some("insert") => BookAction::Insert,
            Some("update") => BookAction::Update,
            Some("delete") => BookAction::Delete,
            Some(other) => BookAction::Other(other.to_string()),
            None => BookAction::Other(String::new()),
        }
    }
}

/// A classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Reply to our text heartbeat
    Pong,
    /// Server greeting; the connection is ready for requests
    Welcome,
    /// Server-side error; the connection must be recycled
    Error(String),
    /// `orderBook10` rows, each a full replacement book
    DepthDelta(Vec<MarketDataSnapshot>),
    /// `orderBook25` rows answering a `getSymbol` request
    DepthSnapshot {
        action: BookAction,
        levels: Vec<LevelUpdate>,
    },
    Trades(Vec<Trade>),
    /// Acks, unknown tables and anything else we don't act on
    Ignored,
}

/// Classify and decode one text frame
///
/// Order matters: welcome, then error, then data tables.
pub fn decode(text: &str) -> RtdResult<Frame> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("pong") {
        return Ok(Frame::Pong);
    }

    let json: Value = serde_json::from_str(trimmed)
        .map_err(|e| RtdError::parse(format!("invalid JSON: {}", e)))?;

    if !json.is_object() {
        return Err(RtdError::parse("frame is not a JSON object"));
    }

    if json
        .get("info")
        .and_then(Value::as_str)
        .is_some_and(|info| info.contains("Welcome"))
    {
        return Ok(Frame::Welcome);
    }

    if let Some(error) = json.get("error") {
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(Frame::Error(message));
    }

    let table = match (json.get("table").and_then(Value::as_str), json.get("data")) {
        (Some(table), Some(_)) => table.to_string(),
        _ => return Ok(Frame::Ignored),
    };

    match table.as_str() {
        DEPTH_DELTA_TABLE => decode_depth_delta(json),
        DEPTH_SNAPSHOT_TABLE => decode_depth_snapshot(json),
        TRADE_TABLE => decode_trades(json),
        _ => Ok(Frame::Ignored),
    }
}

fn table_message<T: DeserializeOwned>(json: Value) -> RtdResult<TableMessage<T>> {
    serde_json::from_value(json).map_err(|e| RtdError::parse(e.to_string()))
}

fn decode_depth_delta(json: Value) -> RtdResult<Frame> {
    let msg: TableMessage<OrderBook10Row> = table_message(json)?;
    if msg.data.is_empty() {
        return Err(RtdError::parse("orderBook10 frame without rows"));
    }

    let snapshots = msg
        .data
        .iter()
        .map(|row| {
            row.to_snapshot()
                .map_err(|e| RtdError::parse(format!("bad depth for {}: {}", row.symbol, e)))
        })
        .collect::<RtdResult<Vec<_>>>()?;

    Ok(Frame::DepthDelta(snapshots))
}

fn decode_depth_snapshot(json: Value) -> RtdResult<Frame> {
    let msg: TableMessage<DepthLevelRow> = table_message(json)?;
    Ok(Frame::DepthSnapshot {
        action: BookAction::parse(msg.action.as_deref()),
        levels: msg.data.into_iter().map(LevelUpdate::from).collect(),
    })
}

fn decode_trades(json: Value) -> RtdResult<Frame> {
    let msg: TableMessage<TradeRow> = table_message(json)?;
    Ok(Frame::Trades(msg.data.into_iter().map(Trade::from).collect()))
}
