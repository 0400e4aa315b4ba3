//! BitMEX WebSocket client for real-time depth and trades
//!
//! Owns the single streaming connection to the exchange. A background
//! worker connects, waits for the Welcome greeting, subscribes to the trade
//! and depth channels, and forwards decoded updates over a channel. Failures
//! reconnect with exponential backoff until [`BitmexWebSocket::close`].

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use rtd_core::{
    ConnectionState, LevelUpdate, MarketDataSnapshot, RtdError, RtdResult, SnapshotRequester,
    Trade,
};

use crate::decoder::{self, BookAction, Frame};
use crate::types::{OpRequest, BITMEX_WS_URL, DEPTH_DELTA_TABLE, TRADE_TABLE};

/// Reconnect delay base
const RECONNECT_DELAY_BASE: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Text heartbeat interval; BitMEX drops idle sockets after a minute or so
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the update channel to the dispatcher
const UPDATE_CHANNEL_CAPACITY: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// ============================================================================
// Updates
// ============================================================================

/// Decoded update from the BitMEX WebSocket
#[derive(Debug, Clone, PartialEq)]
pub enum BitmexUpdate {
    /// Full replacement book from the depth-delta channel
    DepthDelta(MarketDataSnapshot),
    /// Sparse level rows answering a snapshot request
    DepthSnapshot {
        action: BookAction,
        levels: Vec<LevelUpdate>,
    },
    Trade(Trade),
    ConnectionState(ConnectionState),
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for BitmexWebSocket
#[derive(Clone, Debug)]
pub struct BitmexWebSocketConfig {
    pub url: String,
    /// Depth channel subscribed next to `trade`
    pub depth_channel: String,
    pub auto_reconnect: bool,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay_base: Duration,
    pub max_reconnect_delay: Duration,
    pub ping_interval: Duration,
}

impl Default for BitmexWebSocketConfig {
    fn default() -> Self {
        Self {
            url: BITMEX_WS_URL.to_string(),
            depth_channel: DEPTH_DELTA_TABLE.to_string(),
            auto_reconnect: true,
            max_reconnect_attempts: None,
            reconnect_delay_base: RECONNECT_DELAY_BASE,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
            ping_interval: PING_INTERVAL,
        }
    }
}

impl BitmexWebSocketConfig {
    /// Defaults overridden by `BITMEX_WS_URL` and `BITMEX_WS_MAX_RECONNECTS`
    pub fn from_env() -> RtdResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("BITMEX_WS_URL") {
            url::Url::parse(&url)
                .map_err(|e| RtdError::config(format!("BITMEX_WS_URL '{}': {}", url, e)))?;
            config.url = url;
        }

        if let Ok(raw) = std::env::var("BITMEX_WS_MAX_RECONNECTS") {
            let max = raw.parse::<u32>().map_err(|e| {
                RtdError::config(format!("BITMEX_WS_MAX_RECONNECTS '{}': {}", raw, e))
            })?;
            config.max_reconnect_attempts = Some(max);
        }

        Ok(config)
    }

    /// Delay before reconnect attempt number `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_delay_base
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

// ============================================================================
// BitMEX WebSocket Client
// ============================================================================

/// Commands sent to the WebSocket task
#[derive(Debug)]
enum WebSocketCommand {
    RequestSnapshot { symbol: String },
}

/// Channel ends handed to the worker on start
struct WorkerChannels {
    update_tx: mpsc::Sender<BitmexUpdate>,
    command_rx: mpsc::UnboundedReceiver<WebSocketCommand>,
}

/// How a connected session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Reconnect,
    Shutdown,
}

/// BitMEX WebSocket client (connection manager)
pub struct BitmexWebSocket {
    config: BitmexWebSocketConfig,
    command_tx: mpsc::UnboundedSender<WebSocketCommand>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    channels: Mutex<Option<WorkerChannels>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BitmexWebSocket {
    /// Create a new client and the receiver for its updates
    ///
    /// Snapshot requests made before [`start`](Self::start) are queued and
    /// sent once the first connection is open.
    pub fn new(config: BitmexWebSocketConfig) -> (Self, mpsc::Receiver<BitmexUpdate>) {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        (
            Self {
                config,
                command_tx,
                state_tx,
                shutdown_tx,
                channels: Mutex::new(Some(WorkerChannels {
                    update_tx,
                    command_rx,
                })),
                worker: Mutex::new(None),
            },
            update_rx,
        )
    }

    /// Spawn the background worker
    pub fn start(&self) -> RtdResult<()> {
        if *self.shutdown_tx.borrow() {
            return Err(RtdError::internal("BitMEX WebSocket already closed"));
        }

        let channels = self
            .channels
            .lock()
            .take()
            .ok_or_else(|| RtdError::internal("BitMEX WebSocket already started"))?;

        let config = self.config.clone();
        let state_tx = self.state_tx.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            Self::connection_loop(config, channels, state_tx, shutdown_rx).await;
        });
        *self.worker.lock() = Some(handle);

        Ok(())
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Stop the connection. Idempotent; never reconnects afterwards.
    pub fn close(&self) {
        let already_closed = self.shutdown_tx.send_replace(true);
        set_state(&self.state_tx, ConnectionState::Closed);
        if !already_closed {
            info!("[BitMEX WS] Close requested");
        }
    }

    /// Close and wait for the worker to exit
    pub async fn shutdown(&self) {
        self.close();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("[BitMEX WS] Worker ended abnormally: {}", e);
            }
        }
    }

    /// Main connection loop with reconnection logic
    async fn connection_loop(
        config: BitmexWebSocketConfig,
        channels: WorkerChannels,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let WorkerChannels {
            update_tx,
            mut command_rx,
        } = channels;
        let mut pending: IndexSet<String> = IndexSet::new();
        let mut reconnect_attempts = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            publish_state(&state_tx, &update_tx, ConnectionState::Connecting).await;
            info!("[BitMEX WS] Connecting to {}", config.url);

            let connected = tokio::select! {
                result = connect_async(config.url.as_str()) => result,
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            };

            match connected {
                Ok((ws_stream, _)) => {
                    info!("[BitMEX WS] Connected, waiting for welcome");
                    let (write, read) = ws_stream.split();

                    let end = Self::run_session(
                        &config,
                        write,
                        read,
                        &update_tx,
                        &mut command_rx,
                        &state_tx,
                        &mut shutdown_rx,
                        &mut pending,
                        &mut reconnect_attempts,
                    )
                    .await;

                    if end == SessionEnd::Shutdown {
                        break;
                    }
                }
                Err(e) => {
                    error!("[BitMEX WS] {}", RtdError::transport(e.to_string()));
                }
            }

            publish_state(&state_tx, &update_tx, ConnectionState::Disconnected).await;

            if !config.auto_reconnect {
                info!("[BitMEX WS] Auto reconnect disabled, stopping");
                break;
            }

            reconnect_attempts += 1;
            if let Some(max) = config.max_reconnect_attempts {
                if reconnect_attempts > max {
                    error!("[BitMEX WS] Max reconnect attempts reached");
                    break;
                }
            }

            let delay = config.reconnect_delay(reconnect_attempts);
            info!(
                "[BitMEX WS] Reconnecting in {:?} (attempt {})",
                delay, reconnect_attempts
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        set_state(&state_tx, ConnectionState::Closed);
        let _ = update_tx
            .send(BitmexUpdate::ConnectionState(ConnectionState::Closed))
            .await;
        info!("[BitMEX WS] Worker stopped");
    }

    /// Drive one connected socket until it fails or shutdown is requested
    #[allow(clippy::too_many_arguments)]
    async fn run_session(
        config: &BitmexWebSocketConfig,
        mut write: WsWrite,
        mut read: WsRead,
        update_tx: &mpsc::Sender<BitmexUpdate>,
        command_rx: &mut mpsc::UnboundedReceiver<WebSocketCommand>,
        state_tx: &watch::Sender<ConnectionState>,
        shutdown_rx: &mut watch::Receiver<bool>,
        pending: &mut IndexSet<String>,
        reconnect_attempts: &mut u32,
    ) -> SessionEnd {
        let mut open = false;
        let mut ping_timer = interval_at(Instant::now() + config.ping_interval, config.ping_interval);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown_rx) => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }

                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                warn!("[BitMEX WS] Failed to send pong: {}", e);
                                return SessionEnd::Reconnect;
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("[BitMEX WS] Connection closed by server");
                            return SessionEnd::Reconnect;
                        }
                        Some(Err(e)) => {
                            error!("[BitMEX WS] {}", RtdError::transport(e.to_string()));
                            return SessionEnd::Reconnect;
                        }
                        None => {
                            info!("[BitMEX WS] Stream ended");
                            return SessionEnd::Reconnect;
                        }
                        _ => continue,
                    };

                    let frame = match decoder::decode(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("[BitMEX WS] Dropping frame: {} - {}", e, text.as_str());
                            continue;
                        }
                    };

                    match frame {
                        Frame::Welcome => {
                            let subscribe = OpRequest::subscribe(&[TRADE_TABLE, config.depth_channel.as_str()]);
                            if let Err(e) = send_request(&mut write, &subscribe).await {
                                warn!("[BitMEX WS] Failed to subscribe: {}", e);
                                return SessionEnd::Reconnect;
                            }

                            open = true;
                            ping_timer.reset();
                            *reconnect_attempts = 0;
                            publish_state(state_tx, update_tx, ConnectionState::Open).await;

                            if let Err(e) = flush_pending(&mut write, pending).await {
                                warn!("[BitMEX WS] Failed to flush snapshot requests: {}", e);
                                return SessionEnd::Reconnect;
                            }
                        }
                        Frame::Error(message) => {
                            warn!("[BitMEX WS] Server error, reconnecting: {}", message);
                            return SessionEnd::Reconnect;
                        }
                        Frame::DepthDelta(snapshots) => {
                            for snapshot in snapshots {
                                if update_tx.send(BitmexUpdate::DepthDelta(snapshot)).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                        Frame::DepthSnapshot { action, levels } => {
                            debug!("[BitMEX WS] Depth snapshot: {:?}, {} rows", action, levels.len());
                            if update_tx.send(BitmexUpdate::DepthSnapshot { action, levels }).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Frame::Trades(trades) => {
                            for trade in trades {
                                if update_tx.send(BitmexUpdate::Trade(trade)).await.is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                        }
                        Frame::Pong => {}
                        Frame::Ignored => {
                            debug!("[BitMEX WS] Ignored: {}", text.as_str());
                        }
                    }
                }

                cmd = command_rx.recv() => {
                    let Some(WebSocketCommand::RequestSnapshot { symbol }) = cmd else {
                        // Every handle is gone
                        return SessionEnd::Shutdown;
                    };

                    if !open {
                        debug!("[BitMEX WS] Queueing snapshot request for {}", symbol);
                        pending.insert(symbol);
                        continue;
                    }

                    if let Err(e) = send_request(&mut write, &OpRequest::get_symbol(&symbol)).await {
                        warn!("[BitMEX WS] Failed to request snapshot for {}: {}", symbol, e);
                        pending.insert(symbol);
                        return SessionEnd::Reconnect;
                    }
                }

                // Subscribe must be the first frame we send
                _ = ping_timer.tick(), if open => {
                    if let Err(e) = write.send(Message::Text("ping".to_string().into())).await {
                        warn!("[BitMEX WS] Failed to send ping: {}", e);
                        return SessionEnd::Reconnect;
                    }
                }
            }
        }
    }
}

impl SnapshotRequester for BitmexWebSocket {
    fn request_snapshot(&self, symbol: &str) {
        if self
            .command_tx
            .send(WebSocketCommand::RequestSnapshot {
                symbol: symbol.to_string(),
            })
            .is_err()
        {
            warn!("[BitMEX WS] Worker gone, dropping snapshot request for {}", symbol);
        }
    }
}

impl Drop for BitmexWebSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BitmexWebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmexWebSocket")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Send queued snapshot requests in arrival order; anything unsent stays queued
async fn flush_pending(
    write: &mut WsWrite,
    pending: &mut IndexSet<String>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    while let Some(symbol) = pending.first().cloned() {
        send_request(write, &OpRequest::get_symbol(&symbol)).await?;
        info!("[BitMEX WS] Sent queued snapshot request for {}", symbol);
        pending.shift_remove(&symbol);
    }
    Ok(())
}

async fn send_request(
    write: &mut WsWrite,
    request: &OpRequest,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    // OpRequest is plain strings, serialization cannot fail
    let json = serde_json::to_string(request).unwrap_or_default();
    debug!("[BitMEX WS] Sending {}", json);
    write.send(Message::Text(json.into())).await
}

/// Resolves once shutdown is flagged or the client handle is dropped
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Update the watched state unless already terminal
fn set_state(state_tx: &watch::Sender<ConnectionState>, state: ConnectionState) -> bool {
    state_tx.send_if_modified(|current| {
        if current.is_terminal() || *current == state {
            return false;
        }
        *current = state;
        true
    })
}

async fn publish_state(
    state_tx: &watch::Sender<ConnectionState>,
    update_tx: &mpsc::Sender<BitmexUpdate>,
    state: ConnectionState,
) {
    if set_state(state_tx, state) {
        debug!("[BitMEX WS] State -> {}", state);
        let _ = update_tx.send(BitmexUpdate::ConnectionState(state)).await;
    }
}
