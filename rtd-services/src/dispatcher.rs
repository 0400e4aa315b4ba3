//! Update dispatcher
//!
//! Single consumer of the WebSocket worker's updates and the only writer to
//! the [`DepthCache`]. Each update is applied to the cache first, then fanned
//! out through the [`Notifier`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rtd_bitmex::{BitmexUpdate, BookAction};
use rtd_core::{LevelUpdate, MarketDataSnapshot, RtdError, Trade, MAX_DEPTH};

use crate::depth_cache::DepthCache;
use crate::notifier::Notifier;

/// If no message for this long while connected, consider the feed stale
const STALE_THRESHOLD_SECS: u64 = 60;

/// Health of the exchange feed
#[derive(Debug, Clone, Serialize)]
pub struct FeedHealth {
    pub connected: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub dropped_count: u64,
    pub is_stale: bool,
}

/// Feed metrics (atomic for thread-safe access)
#[derive(Debug, Default)]
pub struct FeedMetrics {
    connected: AtomicBool,
    last_message_epoch_ms: AtomicU64,
    message_count: AtomicU64,
    dropped_count: AtomicU64,
}

impl FeedMetrics {
    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn record_message(&self) {
        self.last_message_epoch_ms.store(now_ms(), Ordering::SeqCst);
        self.message_count.fetch_add(1, Ordering::SeqCst);
    }

    fn record_drop(&self) {
        self.dropped_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn health(&self) -> FeedHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        let last_ms = self.last_message_epoch_ms.load(Ordering::SeqCst);

        let last_message_time = if last_ms > 0 {
            DateTime::from_timestamp(
                (last_ms / 1000) as i64,
                ((last_ms % 1000) * 1_000_000) as u32,
            )
        } else {
            None
        };

        let is_stale = if connected && last_ms > 0 {
            now_ms().saturating_sub(last_ms) > STALE_THRESHOLD_SECS * 1000
        } else {
            !connected
        };

        FeedHealth {
            connected,
            last_message_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            dropped_count: self.dropped_count.load(Ordering::SeqCst),
            is_stale,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Applies exchange updates to the cache and notifies subscribers
pub struct UpdateDispatcher {
    cache: Arc<DepthCache>,
    notifier: Arc<Notifier>,
    metrics: Arc<FeedMetrics>,
}

impl UpdateDispatcher {
    pub fn new(cache: Arc<DepthCache>, notifier: Arc<Notifier>, metrics: Arc<FeedMetrics>) -> Self {
        Self {
            cache,
            notifier,
            metrics,
        }
    }

    /// Drain updates until the worker drops its sender
    pub async fn run(self, mut rx: mpsc::Receiver<BitmexUpdate>) {
        info!("[Dispatcher] Starting update processor");

        while let Some(update) = rx.recv().await {
            self.handle_update(update);
        }

        info!("[Dispatcher] Update channel closed, stopping");
    }

    pub fn handle_update(&self, update: BitmexUpdate) {
        match update {
            BitmexUpdate::DepthDelta(snapshot) => {
                self.metrics.record_message();
                self.apply_depth_delta(snapshot);
            }
            BitmexUpdate::DepthSnapshot { action, levels } => {
                self.metrics.record_message();
                self.apply_depth_snapshot(action, levels);
            }
            BitmexUpdate::Trade(trade) => {
                self.metrics.record_message();
                self.apply_trade(trade);
            }
            BitmexUpdate::ConnectionState(state) => {
                info!("[Dispatcher] Feed {}", state);
                self.metrics.set_connected(state.is_open());
            }
        }
    }

    fn apply_depth_delta(&self, snapshot: MarketDataSnapshot) {
        self.cache.replace_snapshot(snapshot.clone());
        self.notifier.notify_depth(&snapshot);
    }

    fn apply_depth_snapshot(&self, action: BookAction, levels: Vec<LevelUpdate>) {
        if action != BookAction::Partial {
            debug!(
                "[Dispatcher] Ignoring {:?} depth snapshot with {} rows",
                action,
                levels.len()
            );
            self.metrics.record_drop();
            return;
        }

        let mut by_symbol: IndexMap<String, Vec<LevelUpdate>> = IndexMap::new();
        for level in levels {
            by_symbol.entry(level.symbol.clone()).or_default().push(level);
        }

        for (symbol, updates) in by_symbol {
            let mut snapshot = self
                .cache
                .get_snapshot(&symbol)
                .unwrap_or_else(|| MarketDataSnapshot::new(symbol.as_str()));

            // orderBook25 rows past the tracked depth are expected, not faults
            let mut beyond_depth = 0usize;
            for update in &updates {
                if update.level >= MAX_DEPTH {
                    beyond_depth += 1;
                    continue;
                }
                if let Err(e) = snapshot.apply_level_update(update) {
                    warn!("[Dispatcher] Skipping level row: {}", e);
                    self.metrics.record_drop();
                }
            }

            debug!(
                "[Dispatcher] Merged {} rows into {} ({} beyond depth {})",
                updates.len() - beyond_depth,
                snapshot,
                beyond_depth,
                MAX_DEPTH
            );
            self.cache.replace_snapshot(snapshot.clone());
            self.notifier.notify_depth(&snapshot);
        }
    }

    fn apply_trade(&self, trade: Trade) {
        if !self.cache.update_last_price(&trade.symbol, trade.price) {
            debug!("[Dispatcher] {}", RtdError::unknown_symbol(trade.symbol.as_str()));
            self.metrics.record_drop();
            return;
        }
        self.notifier.notify_trade(&trade.symbol, trade.price);
    }
}

impl std::fmt::Debug for UpdateDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateDispatcher")
            .field("cache", &self.cache.stats())
            .field("notifier", &self.notifier)
            .finish()
    }
}
