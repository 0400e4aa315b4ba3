//! BitMEX integration for the real-time depth server
//!
//! This crate provides the streaming connection to BitMEX's realtime API
//! (connection lifecycle, frame decoding, snapshot requests) and a small
//! REST client for instrument reference data.

pub mod client;
pub mod decoder;
pub mod types;
pub mod websocket;

pub use client::BitmexClient;
pub use decoder::{decode, BookAction, Frame};
pub use websocket::{BitmexUpdate, BitmexWebSocket, BitmexWebSocketConfig};
