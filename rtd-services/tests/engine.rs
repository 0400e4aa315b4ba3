//! End-to-end behaviour of the depth engine without a live exchange
//!
//! Run with: cargo test -p rtd-services --test engine

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use rtd_bitmex::{decode, BitmexUpdate, BookAction, Frame};
use rtd_core::{
    ConflatingSink, DataKey, DataValue, Instrument, LevelUpdate, MarketDataSnapshot, MarketDepth,
    SnapshotRequester, Trade, ValueUpdate,
};
use rtd_services::{DepthCache, MarketDataServer, SubscriptionRegistry};

/// Records snapshot requests instead of sending them
#[derive(Default)]
struct RecordingRequester {
    requests: Mutex<Vec<String>>,
}

impl RecordingRequester {
    fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl SnapshotRequester for RecordingRequester {
    fn request_snapshot(&self, symbol: &str) {
        self.requests.lock().push(symbol.to_string());
    }
}

struct Engine {
    server: MarketDataServer,
    requester: Arc<RecordingRequester>,
    sink: Arc<ConflatingSink>,
}

fn engine() -> Engine {
    let requester = Arc::new(RecordingRequester::default());
    let sink = Arc::new(ConflatingSink::new());
    let server = MarketDataServer::new(
        Arc::new(DepthCache::new()),
        Arc::new(SubscriptionRegistry::new()),
        requester.clone(),
        sink.clone(),
    );
    Engine {
        server,
        requester,
        sink,
    }
}

fn partial(levels: Vec<LevelUpdate>) -> BitmexUpdate {
    BitmexUpdate::DepthSnapshot {
        action: BookAction::Partial,
        levels,
    }
}

fn book(symbol: &str, bid: rust_decimal::Decimal) -> MarketDataSnapshot {
    MarketDataSnapshot::from_levels(
        symbol,
        vec![MarketDepth::new(bid, dec!(100))],
        vec![MarketDepth::new(bid + dec!(0.5), dec!(200))],
    )
}

#[test]
fn test_connect_then_disconnect_leaves_no_entry() {
    let e = engine();
    let topics = [
        ("XBTUSD", "Bid", Some("0")),
        ("XBTUSD", "AskVol", Some("9")),
        ("ETHUSD", "BidVolume", None),
        ("ETHUSD", "Last", None),
    ];

    for (symbol, data_point, level) in topics {
        let conn = e.server.connect(symbol, data_point, level).unwrap();
        assert_eq!(e.server.registry().subscription_of(conn.handle), Some(conn.key.clone()));

        e.server.disconnect(conn.handle);
        assert_eq!(e.server.registry().subscription_of(conn.handle), None);
        assert!(e.server.registry().lookup(&conn.key).is_empty());
    }

    assert_eq!(e.server.registry().total_handles(), 0);
    assert_eq!(e.server.registry().total_keys(), 0);
}

#[test]
fn test_partial_at_level_two_pads_empty_book() {
    let e = engine();
    let row = LevelUpdate {
        symbol: "XBTUSD".to_string(),
        level: 2,
        bid_price: Some(dec!(63999)),
        bid_size: Some(dec!(40)),
        ask_price: Some(dec!(64002)),
        ask_size: Some(dec!(60)),
        timestamp: None,
    };

    e.server.dispatcher().handle_update(partial(vec![row]));

    let snapshot = e.server.cache().get_snapshot("XBTUSD").unwrap();
    assert_eq!(snapshot.bids.len(), 3);
    assert_eq!(snapshot.asks.len(), 3);
    for level in 0..2 {
        assert_eq!(snapshot.bids[level], MarketDepth::default());
        assert_eq!(snapshot.asks[level], MarketDepth::default());
    }
    assert_eq!(snapshot.bids[2], MarketDepth::new(dec!(63999), dec!(40)));
    assert_eq!(snapshot.asks[2], MarketDepth::new(dec!(64002), dec!(60)));
}

#[test]
fn test_depth_delta_without_subscribers_updates_cache_only() {
    let e = engine();

    e.server
        .dispatcher()
        .handle_update(BitmexUpdate::DepthDelta(book("XBTUSD", dec!(64000))));

    assert_eq!(
        e.server.cache().get_snapshot("XBTUSD").unwrap().best_bid(),
        dec!(64000)
    );
    assert!(e.sink.take().is_empty());
}

#[test]
fn test_pending_subscription_then_single_push() {
    let e = engine();

    let conn = e.server.connect("XBTUSD", "Bid", Some("0")).unwrap();
    assert_eq!(conn.value, DataValue::Pending);
    assert_eq!(e.requester.requests(), vec!["XBTUSD".to_string()]);

    e.server
        .dispatcher()
        .handle_update(BitmexUpdate::DepthDelta(book("XBTUSD", dec!(64000.5))));

    assert_eq!(
        e.sink.take(),
        vec![ValueUpdate {
            handle: conn.handle,
            value: dec!(64000.5)
        }]
    );
    assert_eq!(e.requester.requests().len(), 1);
}

#[test]
fn test_cached_value_returned_without_snapshot_request() {
    let e = engine();
    e.server
        .dispatcher()
        .handle_update(BitmexUpdate::DepthDelta(book("XBTUSD", dec!(64000))));

    let conn = e.server.connect("XBTUSD", "AskVol", None).unwrap();
    assert_eq!(conn.value, DataValue::Value(dec!(200)));
    assert!(e.requester.requests().is_empty());
}

#[test]
fn test_last_uses_instrument_and_never_requests_snapshot() {
    let e = engine();

    let pending = e.server.connect("XBTUSD", "Last", None).unwrap();
    assert!(pending.value.is_pending());

    let mut instrument = Instrument::new("XBTUSD");
    instrument.last_price = Some(dec!(63950));
    e.server.cache().load_instruments(vec![instrument]);

    let cached = e.server.connect("XBTUSD", "last", Some("3")).unwrap();
    assert_eq!(cached.value, DataValue::Value(dec!(63950)));
    assert_eq!(cached.key, DataKey::last("XBTUSD"));
    assert!(e.requester.requests().is_empty());

    e.server.dispatcher().handle_update(BitmexUpdate::Trade(Trade {
        symbol: "XBTUSD".to_string(),
        price: dec!(63960),
        size: None,
        side: None,
        timestamp: Utc::now(),
    }));

    let updates = e.sink.take();
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|u| u.value == dec!(63960)));
}

#[test]
fn test_out_of_range_level_has_no_side_effects() {
    let e = engine();

    for (data_point, level) in [("Bid", "10"), ("Ask", "-1"), ("BidVol", "two"), ("Mid", "0")] {
        let err = e.server.connect("XBTUSD", data_point, Some(level)).unwrap_err();
        assert!(err.is_invalid_request(), "{} {} -> {:?}", data_point, level, err);
    }
    assert!(e.server.connect("", "Bid", None).unwrap_err().is_invalid_request());

    assert_eq!(e.server.registry().total_handles(), 0);
    assert_eq!(e.server.registry().total_keys(), 0);
    assert!(e.requester.requests().is_empty());
}

#[test]
fn test_partial_fields_survive_later_partials() {
    let e = engine();
    let dispatcher = e.server.dispatcher();

    dispatcher.handle_update(partial(vec![LevelUpdate {
        symbol: "ETHUSD".to_string(),
        level: 0,
        bid_price: Some(dec!(3000.05)),
        bid_size: Some(dec!(12)),
        ..Default::default()
    }]));
    dispatcher.handle_update(partial(vec![LevelUpdate {
        symbol: "ETHUSD".to_string(),
        level: 0,
        ask_price: Some(dec!(3000.10)),
        ask_size: Some(dec!(8)),
        ..Default::default()
    }]));

    let snapshot = e.server.cache().get_snapshot("ETHUSD").unwrap();
    assert_eq!(snapshot.bids[0], MarketDepth::new(dec!(3000.05), dec!(12)));
    assert_eq!(snapshot.asks[0], MarketDepth::new(dec!(3000.10), dec!(8)));
}

#[test]
fn test_decoded_depth_frame_reaches_subscriber_exactly() {
    let e = engine();
    let conn = e.server.connect("XBTUSD", "BidVol", Some("1")).unwrap();

    let text = r#"{"table":"orderBook10","action":"update","data":[{"symbol":"XBTUSD","bids":[[64000.5,1200],[64000,0.00012345]],"asks":[[64001,500]],"timestamp":"2024-05-01T12:00:00.000Z"}]}"#;
    let Frame::DepthDelta(snapshots) = decode(text).unwrap() else {
        panic!("expected depth delta");
    };
    for snapshot in snapshots {
        e.server
            .dispatcher()
            .handle_update(BitmexUpdate::DepthDelta(snapshot));
    }

    let updates = e.sink.take();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].handle, conn.handle);
    assert_eq!(updates[0].value.to_string(), "0.00012345");
}

#[test]
fn test_trade_for_unknown_symbol_is_dropped() {
    let e = engine();
    let conn = e.server.connect("DOGEUSD", "Last", None).unwrap();

    e.server.dispatcher().handle_update(BitmexUpdate::Trade(Trade {
        symbol: "DOGEUSD".to_string(),
        price: dec!(0.1),
        size: Some(dec!(1000)),
        side: None,
        timestamp: Utc::now(),
    }));

    assert!(!e.server.cache().has_symbol("DOGEUSD"));
    assert_eq!(e.server.cache().stats().instruments, 0);
    assert!(e.sink.take().is_empty());
    assert_eq!(e.server.registry().subscription_of(conn.handle), Some(conn.key));
}

#[test]
fn test_slow_consumer_sees_only_latest_value() {
    let e = engine();
    let bid = e.server.connect("XBTUSD", "Bid", None).unwrap();
    let ask = e.server.connect("XBTUSD", "Ask", None).unwrap();

    for i in 1..=1000 {
        let price = rust_decimal::Decimal::from(64000 + i);
        e.server
            .dispatcher()
            .handle_update(BitmexUpdate::DepthDelta(book("XBTUSD", price)));
    }

    assert_eq!(
        e.sink.take(),
        vec![
            ValueUpdate {
                handle: bid.handle,
                value: dec!(65000)
            },
            ValueUpdate {
                handle: ask.handle,
                value: dec!(65000.5)
            },
        ]
    );
    assert!(e.sink.take().is_empty());
}

#[tokio::test]
async fn test_no_pushes_after_shutdown() {
    let e = engine();
    let (tx, rx) = mpsc::channel(16);
    e.server.spawn_dispatcher(rx);

    let conn = e.server.connect("XBTUSD", "Bid", None).unwrap();

    tx.send(BitmexUpdate::DepthDelta(book("XBTUSD", dec!(1))))
        .await
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(2), e.sink.changed())
        .await
        .unwrap();
    assert_eq!(first[0].handle, conn.handle);

    e.server.shutdown().await;
    assert!(e.server.is_shut_down());
    assert_eq!(e.server.registry().total_handles(), 0);

    // Dispatcher is gone, nothing is delivered any more
    let _ = tx.send(BitmexUpdate::DepthDelta(book("XBTUSD", dec!(2)))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(e.sink.take().is_empty());
}
