//! Live position tracking with fee-aware P&L.
//!
//! The tracker owns the position set outright: a load replaces the whole
//! set from the exchange's query snapshot, ticks from the stream update
//! quote fields in place, and value/P&L are computed on demand, never
//! stored.

use dashmap::DashMap;
use market_core::api::ClobClient;
use market_core::config::StreamConfig;
use market_core::fees;
use market_core::types::{self, ExchangePosition};
use market_core::Result;
use market_stream::{MarketStreamClient, PriceTick, TickHandler};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One open position enriched with live quote data.
#[derive(Debug, Clone)]
pub struct TrackedPosition {
    pub token_id: String,
    pub market_id: String,
    pub label: String,
    pub outcome: String,
    pub size: Decimal,
    pub avg_price: Decimal,
    pub current_price: Decimal,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub spread: Decimal,
    pub last_update: Option<Instant>,
}

impl TrackedPosition {
    /// Price achievable on exit: the bid when one is known.
    fn exit_price(&self) -> Decimal {
        if self.best_bid > Decimal::ZERO {
            self.best_bid
        } else {
            self.current_price
        }
    }

    pub fn value(&self) -> Decimal {
        self.exit_price() * self.size
    }

    pub fn cost_basis(&self) -> Decimal {
        self.avg_price * self.size
    }

    /// Raw P&L, no fees.
    pub fn pnl(&self) -> Decimal {
        fees::raw_pnl(self.avg_price, self.exit_price(), self.size)
    }

    /// P&L after entry and exit fees.
    pub fn pnl_with_fees(&self, base_fee: Decimal) -> Decimal {
        let exit = self.exit_price();
        if exit <= Decimal::ZERO || self.avg_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        fees::fee_adjusted_pnl(base_fee, self.avg_price, exit, self.size)
    }

    pub fn pnl_percent(&self) -> Decimal {
        let basis = self.cost_basis();
        if basis <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.pnl() / basis * Decimal::ONE_HUNDRED
    }

    /// No tick has landed within the staleness window. Callers surface
    /// this; it is never hidden.
    pub fn is_stale(&self, stale_after: Duration) -> bool {
        match self.last_update {
            Some(at) => at.elapsed() > stale_after,
            None => true,
        }
    }
}

impl From<ExchangePosition> for TrackedPosition {
    fn from(p: ExchangePosition) -> Self {
        TrackedPosition {
            token_id: p.token_id,
            market_id: p.market_id,
            label: p.label,
            outcome: p.outcome,
            size: p.size,
            avg_price: p.avg_price,
            current_price: p.current_price,
            best_bid: p.current_price,
            best_ask: Decimal::ZERO,
            spread: Decimal::ZERO,
            last_update: Some(Instant::now()),
        }
    }
}

/// Tracks open positions against the live feed for one funder address.
pub struct PositionTracker {
    positions: DashMap<String, TrackedPosition>,
    stream: Arc<MarketStreamClient>,
    clob: Arc<ClobClient>,
    stream_config: StreamConfig,
    base_fee: Decimal,
    funder: RwLock<Option<String>>,
}

impl PositionTracker {
    pub fn new(
        stream: Arc<MarketStreamClient>,
        clob: Arc<ClobClient>,
        stream_config: StreamConfig,
        base_fee: Decimal,
    ) -> Self {
        Self {
            positions: DashMap::new(),
            stream,
            clob,
            stream_config,
            base_fee,
            funder: RwLock::new(None),
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stream_config.stale_after_secs)
    }

    /// Funder address the current snapshot was loaded for.
    pub async fn funder(&self) -> Option<String> {
        self.funder.read().await.clone()
    }

    pub fn base_fee(&self) -> Decimal {
        self.base_fee
    }

    /// Load the full open-position snapshot for `funder`, replacing the
    /// in-memory set, and subscribe every instrument on the stream.
    /// Positions absent from the fresh load are dropped, never carried
    /// over stale.
    pub async fn load(&self, funder: &str) -> Result<usize> {
        let snapshot = self.clob.positions(funder).await?;
        *self.funder.write().await = Some(funder.to_string());
        let count = self.apply_snapshot(snapshot);

        let tokens: Vec<String> = self.positions.iter().map(|e| e.key().clone()).collect();
        self.stream.subscribe(tokens).await;

        info!(funder, count, "Loaded positions for tracking");
        Ok(count)
    }

    fn apply_snapshot(&self, snapshot: Vec<ExchangePosition>) -> usize {
        self.positions.clear();
        for position in snapshot {
            if position.size <= types::dust_size() {
                continue;
            }
            self.positions
                .insert(position.token_id.clone(), position.into());
        }
        self.positions.len()
    }

    pub fn get(&self, token_id: &str) -> Option<TrackedPosition> {
        self.positions.get(token_id).map(|p| p.clone())
    }

    pub fn all(&self) -> Vec<TrackedPosition> {
        self.positions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn total_value(&self) -> Decimal {
        self.positions.iter().map(|e| e.value().value()).sum()
    }

    pub fn total_pnl(&self) -> Decimal {
        self.positions.iter().map(|e| e.value().pnl()).sum()
    }

    pub fn total_pnl_with_fees(&self) -> Decimal {
        self.positions
            .iter()
            .map(|e| e.value().pnl_with_fees(self.base_fee))
            .sum()
    }

    /// Record an out-of-band fill (e.g. a manual buy) and start tracking
    /// its instrument.
    pub async fn add_position(
        &self,
        token_id: &str,
        market_id: &str,
        label: &str,
        outcome: &str,
        size: Decimal,
        avg_price: Decimal,
    ) {
        let current = self.stream.price(token_id).unwrap_or(avg_price);
        self.positions.insert(
            token_id.to_string(),
            TrackedPosition {
                token_id: token_id.to_string(),
                market_id: market_id.to_string(),
                label: label.to_string(),
                outcome: outcome.to_string(),
                size,
                avg_price,
                current_price: current,
                best_bid: current,
                best_ask: Decimal::ZERO,
                spread: Decimal::ZERO,
                last_update: Some(Instant::now()),
            },
        );
        self.stream.subscribe([token_id.to_string()]).await;
    }

    pub fn remove_position(&self, token_id: &str) -> bool {
        self.positions.remove(token_id).is_some()
    }

    /// Shrink (or grow) a position after a partial fill; dust removes it.
    pub fn resize(&self, token_id: &str, new_size: Decimal) {
        if new_size <= types::dust_size() {
            self.positions.remove(token_id);
            return;
        }
        if let Some(mut position) = self.positions.get_mut(token_id) {
            position.size = new_size;
        }
    }

    /// Forced REST refresh of every tracked price, the fallback for when
    /// the stream has gone quiet past the refresh interval.
    pub async fn refresh_all(&self) -> usize {
        let tokens: Vec<String> = self.positions.iter().map(|e| e.key().clone()).collect();
        let mut refreshed = 0;
        for token in tokens {
            match self.clob.midpoint(&token).await {
                Ok(price) if price > Decimal::ZERO => {
                    if let Some(mut position) = self.positions.get_mut(&token) {
                        position.current_price = price;
                        if position.best_bid <= Decimal::ZERO {
                            position.best_bid = price;
                        }
                        position.last_update = Some(Instant::now());
                        refreshed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(token, error = %e, "Price refresh failed"),
            }
        }
        refreshed
    }
}

#[async_trait::async_trait]
impl TickHandler for PositionTracker {
    async fn on_tick(&self, tick: &PriceTick) -> Result<()> {
        if let Some(mut position) = self.positions.get_mut(&tick.token_id) {
            position.current_price = tick.price;
            position.best_bid = tick.best_bid;
            position.best_ask = tick.best_ask;
            position.spread = tick.spread;
            position.last_update = Some(tick.received);
        }
        Ok(())
    }
}
