//! Reconnecting market-data stream client.
//!
//! One long-lived task owns [`MarketStreamClient::run`]; everything else
//! talks to the client through its query surface and handler registration.
//! The price cache and history rings are mutated only from the read loop's
//! dispatch step.

use crate::message::{PriceTick, RawTick, StreamMessage};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use market_core::config::StreamConfig;
use market_core::Result;
use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Consumer of accepted ticks.
///
/// A handler returning `Err` is logged and skipped; it never aborts the
/// remaining handlers or the read loop.
#[async_trait::async_trait]
pub trait TickHandler: Send + Sync {
    async fn on_tick(&self, tick: &PriceTick) -> Result<()>;
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub connected: bool,
    pub subscribed_tokens: usize,
    pub cached_prices: usize,
    pub total_messages: u64,
}

enum LoopExit {
    Stopped,
    Disconnected,
}

/// Streaming client for real-time market data.
pub struct MarketStreamClient {
    config: StreamConfig,
    subscribed: RwLock<HashSet<String>>,
    cache: DashMap<String, PriceTick>,
    history: DashMap<String, VecDeque<PriceTick>>,
    tick_handlers: RwLock<Vec<Arc<dyn TickHandler>>>,
    position_handlers: RwLock<Vec<Arc<dyn TickHandler>>>,
    /// Writer-half channel, present only while connected.
    outbound: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    running: AtomicBool,
    connected: AtomicBool,
    messages_seen: AtomicU64,
    stop_tx: watch::Sender<bool>,
}

impl MarketStreamClient {
    pub fn new(config: StreamConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            subscribed: RwLock::new(HashSet::new()),
            cache: DashMap::new(),
            history: DashMap::new(),
            tick_handlers: RwLock::new(Vec::new()),
            position_handlers: RwLock::new(Vec::new()),
            outbound: StdMutex::new(None),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            messages_seen: AtomicU64::new(0),
            stop_tx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register a handler for every accepted tick.
    pub async fn on_tick(&self, handler: Arc<dyn TickHandler>) {
        self.tick_handlers.write().await.push(handler);
    }

    /// Register a handler fired only for instruments in the subscription
    /// set (the position-relevant audience).
    pub async fn on_position_tick(&self, handler: Arc<dyn TickHandler>) {
        self.position_handlers.write().await.push(handler);
    }

    /// Track instruments, sending a wire subscription only for the ones not
    /// already tracked. Idempotent.
    pub async fn subscribe(&self, token_ids: impl IntoIterator<Item = String>) {
        let mut delta = Vec::new();
        {
            let mut subscribed = self.subscribed.write().await;
            for token in token_ids {
                if subscribed.insert(token.clone()) {
                    delta.push(token);
                }
            }
        }
        for token in &delta {
            self.history
                .entry(token.clone())
                .or_insert_with(|| VecDeque::with_capacity(self.config.history_capacity));
        }
        if !delta.is_empty() {
            self.send_subscribe(&delta);
        }
    }

    /// Stop tracking instruments. They drop out of future (re)subscribe
    /// messages; no wire message is sent.
    pub async fn unsubscribe(&self, token_ids: impl IntoIterator<Item = String>) {
        let mut subscribed = self.subscribed.write().await;
        for token in token_ids {
            subscribed.remove(&token);
        }
    }

    pub async fn subscribed_tokens(&self) -> Vec<String> {
        self.subscribed.read().await.iter().cloned().collect()
    }

    /// Latest tick for an instrument.
    pub fn latest(&self, token_id: &str) -> Option<PriceTick> {
        self.cache.get(token_id).map(|t| t.clone())
    }

    pub fn price(&self, token_id: &str) -> Option<Decimal> {
        self.latest(token_id).map(|t| t.price)
    }

    pub fn best_bid(&self, token_id: &str) -> Option<Decimal> {
        self.latest(token_id).map(|t| t.best_bid)
    }

    pub fn best_ask(&self, token_id: &str) -> Option<Decimal> {
        self.latest(token_id).map(|t| t.best_ask)
    }

    pub fn spread(&self, token_id: &str) -> Option<Decimal> {
        self.latest(token_id).map(|t| t.spread)
    }

    /// Most recent `limit` ticks for an instrument, oldest first.
    pub fn history(&self, token_id: &str, limit: usize) -> Vec<PriceTick> {
        self.history
            .get(token_id)
            .map(|ring| {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> StreamStats {
        StreamStats {
            connected: self.is_connected(),
            subscribed_tokens: self.subscribed.read().await.len(),
            cached_prices: self.cache.len(),
            total_messages: self.messages_seen.load(Ordering::Relaxed),
        }
    }

    /// Signal the run loop to exit cleanly.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
    }

    /// Connect and read until stopped, reconnecting with exponential
    /// backoff on any close. Backoff starts at the floor, doubles per
    /// consecutive failure, caps, and resets to the floor after a
    /// successful connect.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut stop_rx = self.stop_tx.subscribe();
        let floor = Duration::from_secs(self.config.reconnect_floor_secs.max(1));
        let cap = Duration::from_secs(self.config.reconnect_cap_secs.max(1));
        let mut delay = floor;

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = stop_rx.changed() => break,
                conn = connect_async(self.config.ws_url.as_str()) => match conn {
                    Ok((ws, _)) => {
                        info!(url = %self.config.ws_url, "Market stream connected");
                        delay = floor;
                        self.connected.store(true, Ordering::SeqCst);
                        let exit = self.read_loop(ws, &mut stop_rx).await;
                        self.connected.store(false, Ordering::SeqCst);
                        *self.outbound.lock().unwrap() = None;
                        if matches!(exit, LoopExit::Stopped) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Market stream connect failed");
                    }
                }
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            warn!(delay_secs = delay.as_secs(), "Reconnecting market stream");
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = next_backoff(delay, cap);
        }

        self.connected.store(false, Ordering::SeqCst);
        info!("Market stream loop exited");
    }

    async fn read_loop(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> LoopExit {
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock().unwrap() = Some(out_tx);

        // Re-announce the full subscription set on every (re)connect.
        let tokens = self.subscribed_tokens().await;
        if !tokens.is_empty() {
            if write
                .send(Message::Text(subscribe_message(&tokens)))
                .await
                .is_err()
            {
                return LoopExit::Disconnected;
            }
            info!(count = tokens.len(), "Subscribed instruments on connect");
        }

        let mut ping = tokio::time::interval(Duration::from_secs(10));
        ping.tick().await;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return LoopExit::Stopped;
                }
                _ = ping.tick() => {
                    if write.send(Message::Text("PING".to_string())).await.is_err() {
                        return LoopExit::Disconnected;
                    }
                }
                Some(outgoing) = out_rx.recv() => {
                    if write.send(Message::Text(outgoing)).await.is_err() {
                        return LoopExit::Disconnected;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Market stream closed by server");
                        return LoopExit::Disconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Market stream receive error");
                        return LoopExit::Disconnected;
                    }
                    None => {
                        warn!("Market stream ended");
                        return LoopExit::Disconnected;
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, raw: &str) {
        self.messages_seen.fetch_add(1, Ordering::Relaxed);
        let Some(message) = StreamMessage::parse(raw) else {
            return;
        };
        for tick in message.ticks() {
            self.apply_tick(tick).await;
        }
    }

    /// Sanity-check, cache, record, and dispatch one price observation.
    ///
    /// This is the single entry point for price data; the read loop goes
    /// through it, and replay/simulation feeds may call it directly.
    pub async fn apply_tick(&self, raw: RawTick) {
        // Exchange prices are probabilities; anything else is a glitch.
        if raw.price <= Decimal::ZERO || raw.price > Decimal::ONE {
            debug!(token = %raw.token_id, price = %raw.price, "Dropping out-of-range price");
            return;
        }

        // Synthesize a missing book side so spread is always computable.
        let best_ask = if raw.best_ask > Decimal::ZERO {
            raw.best_ask
        } else {
            raw.price
        };
        let best_bid = if raw.best_bid > Decimal::ZERO {
            raw.best_bid
        } else {
            (raw.price - Decimal::new(1, 2)).max(Decimal::ZERO)
        };
        let spread = if best_ask > best_bid {
            best_ask - best_bid
        } else {
            Decimal::ZERO
        };

        let tick = PriceTick {
            token_id: raw.token_id,
            price: raw.price,
            best_bid,
            best_ask,
            spread,
            timestamp: Utc::now(),
            received: Instant::now(),
        };

        self.cache.insert(tick.token_id.clone(), tick.clone());

        let tracked = self.subscribed.read().await.contains(&tick.token_id);
        if let Some(mut ring) = self.history.get_mut(&tick.token_id) {
            if ring.len() >= self.config.history_capacity {
                ring.pop_front();
            }
            ring.push_back(tick.clone());
        } else if tracked {
            let mut ring = VecDeque::with_capacity(self.config.history_capacity);
            ring.push_back(tick.clone());
            self.history.insert(tick.token_id.clone(), ring);
        }

        let handlers = self.tick_handlers.read().await.clone();
        for handler in handlers {
            if let Err(e) = handler.on_tick(&tick).await {
                warn!(token = %tick.token_id, error = %e, "Tick handler failed");
            }
        }

        if tracked {
            let handlers = self.position_handlers.read().await.clone();
            for handler in handlers {
                if let Err(e) = handler.on_tick(&tick).await {
                    warn!(token = %tick.token_id, error = %e, "Position tick handler failed");
                }
            }
        }
    }

    fn send_subscribe(&self, tokens: &[String]) {
        let guard = self.outbound.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if tx.send(subscribe_message(tokens)).is_ok() {
                debug!(count = tokens.len(), "Queued subscribe message");
            }
        }
    }
}

fn subscribe_message(tokens: &[String]) -> String {
    serde_json::json!({
        "assets_ids": tokens,
        "type": "market",
    })
    .to_string()
}

/// Doubling backoff, saturating at the cap.
fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}
