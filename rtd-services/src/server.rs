//! Market data server
//!
//! Composes the depth cache, subscription registry, notifier and the BitMEX
//! connection into the consumer-facing `connect`/`disconnect` interface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rtd_bitmex::types::BITMEX_API_BASE;
use rtd_bitmex::{BitmexClient, BitmexUpdate, BitmexWebSocket, BitmexWebSocketConfig};
use rtd_core::{
    Connection, ConnectionState, DataKey, DataPoint, DataValue, RtdError, RtdResult,
    SnapshotRequester, SubscriberHandle, ValueSink,
};

use crate::depth_cache::{DepthCache, DepthCacheStats};
use crate::dispatcher::{FeedHealth, FeedMetrics, UpdateDispatcher};
use crate::notifier::Notifier;
use crate::subscription::SubscriptionRegistry;

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub websocket: BitmexWebSocketConfig,
    /// REST base used for the instrument preload
    pub api_base: String,
    pub preload_instruments: bool,
    /// Only preload instruments in this state (e.g. "Open")
    pub instrument_state_filter: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            websocket: BitmexWebSocketConfig::default(),
            api_base: BITMEX_API_BASE.to_string(),
            preload_instruments: true,
            instrument_state_filter: None,
        }
    }
}

impl ServerConfig {
    /// Load from environment variables
    ///
    /// - `BITMEX_API_URL`: REST base
    /// - `RTD_PRELOAD_INSTRUMENTS`: `true`/`false` (default true)
    /// - `RTD_INSTRUMENT_STATE`: state filter for the preload
    ///
    /// plus the WebSocket variables read by [`BitmexWebSocketConfig::from_env`].
    pub fn from_env() -> RtdResult<Self> {
        let mut config = Self {
            websocket: BitmexWebSocketConfig::from_env()?,
            ..Self::default()
        };

        if let Ok(url) = std::env::var("BITMEX_API_URL") {
            config.api_base = url;
        }

        if let Ok(raw) = std::env::var("RTD_PRELOAD_INSTRUMENTS") {
            config.preload_instruments = raw.trim().parse::<bool>().map_err(|_| {
                RtdError::config(format!("RTD_PRELOAD_INSTRUMENTS '{}' is not a bool", raw))
            })?;
        }

        config.instrument_state_filter = std::env::var("RTD_INSTRUMENT_STATE")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(config)
    }
}

/// Overall server health
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub connection: Option<ConnectionState>,
    pub feed: FeedHealth,
    pub cache: DepthCacheStats,
    pub subscribed_keys: usize,
    pub subscribers: usize,
    pub healthy: bool,
}

/// Real-time depth server
pub struct MarketDataServer {
    cache: Arc<DepthCache>,
    registry: Arc<SubscriptionRegistry>,
    notifier: Arc<Notifier>,
    requester: Arc<dyn SnapshotRequester>,
    metrics: Arc<FeedMetrics>,
    websocket: Option<Arc<BitmexWebSocket>>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl MarketDataServer {
    /// Build a server from explicit parts, without any exchange connection
    pub fn new(
        cache: Arc<DepthCache>,
        registry: Arc<SubscriptionRegistry>,
        requester: Arc<dyn SnapshotRequester>,
        sink: Arc<dyn ValueSink>,
    ) -> Self {
        let notifier = Arc::new(Notifier::new(Arc::clone(&registry), sink));
        Self {
            cache,
            registry,
            notifier,
            requester,
            metrics: Arc::new(FeedMetrics::default()),
            websocket: None,
            dispatcher_task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Preload instruments, connect to BitMEX and start dispatching updates
    pub async fn start(config: ServerConfig, sink: Arc<dyn ValueSink>) -> RtdResult<Self> {
        let cache = Arc::new(DepthCache::new());
        let registry = Arc::new(SubscriptionRegistry::new());

        if config.preload_instruments {
            Self::preload_instruments(&cache, &config).await;
        }

        let (websocket, update_rx) = BitmexWebSocket::new(config.websocket.clone());
        let websocket = Arc::new(websocket);
        let requester: Arc<dyn SnapshotRequester> = websocket.clone();

        let mut server = Self::new(cache, registry, requester, sink);
        server.websocket = Some(Arc::clone(&websocket));
        server.spawn_dispatcher(update_rx);
        websocket.start()?;

        info!("[Server] Started against {}", config.websocket.url);
        Ok(server)
    }

    async fn preload_instruments(cache: &DepthCache, config: &ServerConfig) {
        let client = match BitmexClient::with_base_url(config.api_base.as_str()) {
            Ok(client) => client,
            Err(e) => {
                warn!("[Server] Skipping instrument preload: {}", e);
                return;
            }
        };

        match client
            .list_instruments(config.instrument_state_filter.as_deref())
            .await
        {
            Ok(instruments) => {
                let loaded = cache.load_instruments(instruments);
                info!("[Server] Preloaded {} instruments", loaded);
            }
            Err(e) => warn!("[Server] Instrument preload failed: {}", e),
        }
    }

    /// Dispatcher sharing this server's cache, notifier and metrics
    pub fn dispatcher(&self) -> UpdateDispatcher {
        UpdateDispatcher::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.notifier),
            Arc::clone(&self.metrics),
        )
    }

    /// Run the dispatcher over `rx` on a background task
    pub fn spawn_dispatcher(&self, rx: mpsc::Receiver<BitmexUpdate>) {
        let dispatcher = self.dispatcher();
        let handle = tokio::spawn(dispatcher.run(rx));
        if let Some(previous) = self.dispatcher_task.lock().replace(handle) {
            warn!("[Server] Replacing running dispatcher");
            previous.abort();
        }
    }

    /// Subscribe to one value
    ///
    /// A missing or empty `level` means level 0. Invalid input fails with
    /// [`RtdError::InvalidRequest`] before anything is registered. A book key
    /// for a symbol with no cached book also requests a snapshot for it.
    pub fn connect(
        &self,
        symbol: &str,
        data_point: &str,
        level: Option<&str>,
    ) -> RtdResult<Connection> {
        let key = DataKey::parse(symbol, data_point, level)?;
        self.connect_key(key)
    }

    /// Subscribe with a topic list: `[symbol, data point, level?]`
    pub fn connect_topic(&self, topic: &[String]) -> RtdResult<Connection> {
        match topic {
            [symbol, data_point] => self.connect(symbol, data_point, None),
            [symbol, data_point, level] => self.connect(symbol, data_point, Some(level)),
            _ => Err(RtdError::invalid_request(format!(
                "expected [symbol, data point, level?], got {} fields",
                topic.len()
            ))),
        }
    }

    /// Subscribe with an already validated key
    pub fn connect_key(&self, key: DataKey) -> RtdResult<Connection> {
        if self.is_shut_down() {
            return Err(RtdError::internal("server is shut down"));
        }

        let handle = self.registry.new_handle();
        self.registry.subscribe(handle, key.clone());

        let value = match self.cache.value_of(&key) {
            Some(v) => DataValue::Value(v),
            None => DataValue::Pending,
        };

        if key.data_point() != DataPoint::Last && self.cache.get_snapshot(key.symbol()).is_none() {
            debug!("[Server] No book for {}, requesting snapshot", key.symbol());
            self.requester.request_snapshot(key.symbol());
        }

        debug!("[Server] {} connected to {} ({:?})", handle, key, value);
        Ok(Connection { handle, key, value })
    }

    /// Drop a subscription; unknown handles are logged and ignored
    pub fn disconnect(&self, handle: SubscriberHandle) {
        if let Some(key) = self.registry.unsubscribe(handle) {
            debug!("[Server] {} disconnected from {}", handle, key);
        }
    }

    pub fn cache(&self) -> &Arc<DepthCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop pushes, close the connection and release all state. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[Server] Shutting down");

        self.notifier.close();

        if let Some(websocket) = &self.websocket {
            websocket.shutdown().await;
        }

        let task = self.dispatcher_task.lock().take();
        if let Some(task) = task {
            if self.websocket.is_some() {
                // Worker is gone, so the channel closes and the task ends
                if let Err(e) = task.await {
                    warn!("[Server] Dispatcher ended abnormally: {}", e);
                }
            } else {
                task.abort();
            }
        }

        self.registry.clear();
        self.cache.clear();
        info!("[Server] Shutdown complete");
    }

    pub fn health(&self) -> ServerHealth {
        let connection = self.websocket.as_ref().map(|ws| ws.state());
        let feed = self.metrics.health();
        let feed_ok = match connection {
            Some(state) => state.is_open() && !feed.is_stale,
            None => true,
        };
        let healthy = !self.is_shut_down() && feed_ok;

        ServerHealth {
            connection,
            feed,
            cache: self.cache.stats(),
            subscribed_keys: self.registry.total_keys(),
            subscribers: self.registry.total_handles(),
            healthy,
        }
    }
}

impl std::fmt::Debug for MarketDataServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataServer")
            .field("registry", &self.registry)
            .field("websocket", &self.websocket)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtd_core::ConflatingSink;

    struct NoopRequester;

    impl SnapshotRequester for NoopRequester {
        fn request_snapshot(&self, _symbol: &str) {}
    }

    fn server() -> MarketDataServer {
        MarketDataServer::new(
            Arc::new(DepthCache::new()),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(NoopRequester),
            Arc::new(ConflatingSink::new()),
        )
    }

    #[test]
    fn test_connect_topic_arity() {
        let server = server();

        let conn = server
            .connect_topic(&["XBTUSD".to_string(), "Bid".to_string()])
            .unwrap();
        assert_eq!(conn.key.level(), 0);

        let conn = server
            .connect_topic(&["XBTUSD".to_string(), "askvol".to_string(), "4".to_string()])
            .unwrap();
        assert_eq!(conn.key.data_point(), DataPoint::AskVolume);
        assert_eq!(conn.key.level(), 4);

        let err = server.connect_topic(&["XBTUSD".to_string()]).unwrap_err();
        assert!(err.is_invalid_request());
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.preload_instruments);
        assert_eq!(config.api_base, BITMEX_API_BASE);
        assert_eq!(config.websocket.depth_channel, "orderBook10");
    }

    #[tokio::test]
    async fn test_connect_after_shutdown_fails() {
        let server = server();
        server.shutdown().await;
        server.shutdown().await;

        assert!(server.connect("XBTUSD", "Bid", None).is_err());
        assert!(!server.health().healthy);
    }
}
