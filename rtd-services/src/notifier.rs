//! Notifier
//!
//! Turns a book or trade event into per-handle value pushes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, trace};

use rtd_core::{DataKey, DataPoint, MarketDataSnapshot, MarketDepth, ValueSink};

use crate::subscription::SubscriptionRegistry;

/// Pushes changed values to subscribed handles
pub struct Notifier {
    registry: Arc<SubscriptionRegistry>,
    sink: Arc<dyn ValueSink>,
    closed: AtomicBool,
}

impl Notifier {
    pub fn new(registry: Arc<SubscriptionRegistry>, sink: Arc<dyn ValueSink>) -> Self {
        Self {
            registry,
            sink,
            closed: AtomicBool::new(false),
        }
    }

    /// Push every book value of `snapshot` that has subscribers
    ///
    /// Returns the number of pushes made.
    pub fn notify_depth(&self, snapshot: &MarketDataSnapshot) -> usize {
        if self.is_closed() {
            return 0;
        }

        let bid_pushes = self.notify_side(
            &snapshot.symbol,
            &snapshot.bids,
            DataPoint::Bid,
            DataPoint::BidVolume,
        );
        let ask_pushes = self.notify_side(
            &snapshot.symbol,
            &snapshot.asks,
            DataPoint::Ask,
            DataPoint::AskVolume,
        );

        let pushes = bid_pushes + ask_pushes;
        if pushes > 0 {
            trace!("[Notifier] {} -> {} pushes", snapshot, pushes);
        }
        pushes
    }

    fn notify_side(
        &self,
        symbol: &str,
        levels: &[MarketDepth],
        price_point: DataPoint,
        volume_point: DataPoint,
    ) -> usize {
        let mut pushes = 0;
        for (level, depth) in levels.iter().enumerate() {
            for (data_point, value) in [(price_point, depth.price), (volume_point, depth.quantity)] {
                if let Some(key) = DataKey::book(symbol, data_point, level) {
                    pushes += self.push(&key, value);
                }
            }
        }
        pushes
    }

    /// Push a trade price to `Last` subscribers of the symbol
    pub fn notify_trade(&self, symbol: &str, price: Decimal) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.push(&DataKey::last(symbol), price)
    }

    fn push(&self, key: &DataKey, value: Decimal) -> usize {
        let handles = self.registry.lookup(key);
        for handle in &handles {
            if self.is_closed() {
                return 0;
            }
            self.sink.on_value_changed(*handle, value);
        }
        handles.len()
    }

    /// Stop all further pushes
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("[Notifier] Closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("registry", &self.registry)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtd_core::{ConflatingSink, ValueUpdate};
    use rust_decimal_macros::dec;

    fn setup() -> (Notifier, Arc<SubscriptionRegistry>, Arc<ConflatingSink>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let sink = Arc::new(ConflatingSink::new());
        let notifier = Notifier::new(Arc::clone(&registry), sink.clone());
        (notifier, registry, sink)
    }

    fn two_level_book() -> MarketDataSnapshot {
        MarketDataSnapshot::from_levels(
            "XBTUSD",
            vec![
                MarketDepth::new(dec!(64000.5), dec!(100)),
                MarketDepth::new(dec!(64000), dec!(250)),
            ],
            vec![MarketDepth::new(dec!(64001), dec!(75))],
        )
    }

    #[test]
    fn test_no_subscribers_no_pushes() {
        let (notifier, _registry, sink) = setup();
        assert_eq!(notifier.notify_depth(&two_level_book()), 0);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_depth_pushes_only_subscribed_keys() {
        let (notifier, registry, sink) = setup();

        let bid1 = registry.new_handle();
        registry.subscribe(bid1, DataKey::new("XBTUSD", DataPoint::Bid, 1).unwrap());
        let ask_vol = registry.new_handle();
        registry.subscribe(ask_vol, DataKey::new("XBTUSD", DataPoint::AskVolume, 0).unwrap());
        let other = registry.new_handle();
        registry.subscribe(other, DataKey::new("ETHUSD", DataPoint::Bid, 0).unwrap());

        assert_eq!(notifier.notify_depth(&two_level_book()), 2);

        let updates = sink.take();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], ValueUpdate { handle: bid1, value: dec!(64000) });
        assert_eq!(updates[1], ValueUpdate { handle: ask_vol, value: dec!(75) });
        assert_eq!(sink.latest(other), None);
    }

    #[test]
    fn test_trade_pushes_last() {
        let (notifier, registry, sink) = setup();
        let h = registry.new_handle();
        registry.subscribe(h, DataKey::last("XBTUSD"));

        assert_eq!(notifier.notify_trade("XBTUSD", dec!(64002)), 1);
        assert_eq!(sink.latest(h), Some(dec!(64002)));
    }

    #[test]
    fn test_closed_notifier_pushes_nothing() {
        let (notifier, registry, sink) = setup();
        let h = registry.new_handle();
        registry.subscribe(h, DataKey::new("XBTUSD", DataPoint::Bid, 0).unwrap());

        notifier.close();
        notifier.close();

        assert_eq!(notifier.notify_depth(&two_level_book()), 0);
        assert_eq!(notifier.notify_trade("XBTUSD", dec!(1)), 0);
        assert!(sink.take().is_empty());
    }
}
