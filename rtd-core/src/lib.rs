//! Core types for the BitMEX real-time depth server
//!
//! This crate defines the shared data structures used across the server:
//! instruments, depth snapshots, subscription keys and the delivery
//! contracts between the engine and its consumers.

pub mod connection;
pub mod error;
pub mod market;
pub mod subscription;

pub use connection::{ConnectionState, SnapshotRequester};
pub use error::{RtdError, RtdResult};
pub use market::{
    Instrument, LevelUpdate, MarketDataSnapshot, MarketDepth, Trade, TradeSide, MAX_DEPTH,
};
pub use subscription::{
    Connection, ConflatingSink, DataKey, DataPoint, DataValue, SubscriberHandle, ValueSink,
    ValueUpdate,
};
