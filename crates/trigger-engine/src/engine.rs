//! Alert storage access, tick evaluation, and auto-trade dispatch.

use auth::SessionManager;
use market_core::db::alerts::{AlertRepository, NewAlert};
use market_core::types::{self, Alert, AlertKind, AlertSide, OrderResult};
use market_core::Result;
use market_stream::{MarketStreamClient, PriceTick, TickHandler};
use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use trading_engine::{SellAmount, TradeExecutor};

/// How long the in-memory alert cache is trusted before re-reading the
/// store. Keeps a storage round-trip off the per-tick path.
const CACHE_TTL: Duration = Duration::from_secs(5);

/// Cap on the in-memory executed-alert set; oldest ids are evicted first.
const EXECUTED_CAPACITY: usize = 1024;

/// What happened when an alert fired.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// Plain price alert; nothing to execute.
    Notified,
    /// Auto-trade sell went through.
    Executed(OrderResult),
    /// Auto-trade sell was attempted and failed.
    ExecutionFailed(String),
    /// Auto-trade wanted, but the user holds no active session.
    NoSession,
}

/// Emitted once per fired alert, consumed by the front-end boundary.
#[derive(Debug)]
pub struct TriggerEvent {
    pub alert: Alert,
    pub price: Decimal,
    pub outcome: TriggerOutcome,
}

/// FIFO-evicting set of already-executed alert ids. Guards against rapid
/// repeated ticks racing the persisted `triggered` flag, without growing
/// forever.
struct BoundedIdSet {
    order: VecDeque<i64>,
    seen: HashSet<i64>,
    capacity: usize,
}

impl BoundedIdSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if the id was already present.
    fn insert(&mut self, id: i64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

struct AlertCache {
    fetched_at: Option<Instant>,
    alerts: Vec<Alert>,
}

/// Evaluates alerts against ticks and dispatches their consequences.
pub struct TriggerEngine {
    alerts: AlertRepository,
    sessions: Arc<SessionManager>,
    executor: Arc<TradeExecutor>,
    stream: Arc<MarketStreamClient>,
    cache: RwLock<AlertCache>,
    executed: StdMutex<BoundedIdSet>,
    events_tx: mpsc::UnboundedSender<TriggerEvent>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<TriggerEvent>>>,
}

impl TriggerEngine {
    pub fn new(
        alerts: AlertRepository,
        sessions: Arc<SessionManager>,
        executor: Arc<TradeExecutor>,
        stream: Arc<MarketStreamClient>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            alerts,
            sessions,
            executor,
            stream,
            cache: RwLock::new(AlertCache {
                fetched_at: None,
                alerts: Vec::new(),
            }),
            executed: StdMutex::new(BoundedIdSet::new(EXECUTED_CAPACITY)),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
        }
    }

    /// Take the trigger-event receiver (can only be taken once).
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TriggerEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// Store a new alert and start watching its instrument on the stream.
    pub async fn add_alert(&self, alert: NewAlert) -> Result<i64> {
        let token = alert.token_id.clone();
        let id = self.alerts.insert(alert).await?;
        self.invalidate_cache().await;
        self.stream.subscribe([token]).await;
        info!(alert_id = id, "Alert added");
        Ok(id)
    }

    /// Stop-loss: sells when the price drops to the threshold.
    pub async fn add_stop_loss(
        &self,
        user_id: i64,
        token_id: &str,
        label: &str,
        stop_price: Decimal,
        sell_amount: Option<Decimal>,
    ) -> Result<i64> {
        self.add_alert(NewAlert {
            user_id,
            token_id: token_id.to_string(),
            label: label.to_string(),
            kind: AlertKind::StopLoss,
            trigger_price: stop_price,
            side: AlertSide::Below,
            auto_trade: true,
            trade_amount: sell_amount,
        })
        .await
    }

    /// Take-profit: sells when the price rises to the threshold.
    pub async fn add_take_profit(
        &self,
        user_id: i64,
        token_id: &str,
        label: &str,
        target_price: Decimal,
        sell_amount: Option<Decimal>,
    ) -> Result<i64> {
        self.add_alert(NewAlert {
            user_id,
            token_id: token_id.to_string(),
            label: label.to_string(),
            kind: AlertKind::TakeProfit,
            trigger_price: target_price,
            side: AlertSide::Above,
            auto_trade: true,
            trade_amount: sell_amount,
        })
        .await
    }

    pub async fn remove_alert(&self, alert_id: i64, user_id: i64) -> Result<bool> {
        let removed = self.alerts.remove(alert_id, user_id).await?;
        if removed {
            self.invalidate_cache().await;
        }
        Ok(removed)
    }

    pub async fn alerts_for_user(&self, user_id: i64, active_only: bool) -> Result<Vec<Alert>> {
        self.alerts.for_user(user_id, active_only).await
    }

    async fn invalidate_cache(&self) {
        self.cache.write().await.fetched_at = None;
    }

    /// Active alerts, served from the short-TTL cache. A failed refresh
    /// falls back to the stale copy rather than dropping evaluation.
    async fn cached_alerts(&self) -> Vec<Alert> {
        {
            let cache = self.cache.read().await;
            if let Some(at) = cache.fetched_at {
                if at.elapsed() <= CACHE_TTL {
                    return cache.alerts.clone();
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another tick may have refreshed while we waited for the lock.
        if let Some(at) = cache.fetched_at {
            if at.elapsed() <= CACHE_TTL {
                return cache.alerts.clone();
            }
        }
        match self.alerts.active().await {
            Ok(alerts) => {
                cache.alerts = alerts;
                cache.fetched_at = Some(Instant::now());
            }
            Err(e) => {
                warn!(error = %e, "Alert cache refresh failed; using stale alerts");
            }
        }
        cache.alerts.clone()
    }

    async fn fire(&self, alert: Alert, price: Decimal) {
        let auto = alert.auto_trade
            && matches!(alert.kind, AlertKind::StopLoss | AlertKind::TakeProfit);

        if !auto {
            self.emit(TriggerEvent {
                alert,
                price,
                outcome: TriggerOutcome::Notified,
            });
            return;
        }

        // Live trading needs the user's signing session; paper mode does
        // not. A trigger with no session is still reported, never dropped.
        if !self.executor.is_paper() && self.sessions.session(alert.user_id).await.is_none() {
            info!(alert_id = alert.id, user_id = alert.user_id, "Trigger fired without session");
            self.emit(TriggerEvent {
                alert,
                price,
                outcome: TriggerOutcome::NoSession,
            });
            return;
        }

        // Hand the order off so the stream's dispatch step never waits on
        // fills or retry backoff.
        let executor = self.executor.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = executor
                .sell(
                    alert.user_id,
                    &alert.token_id,
                    SellAmount::Percent(Decimal::ONE_HUNDRED),
                )
                .await;
            let outcome = if result.success {
                info!(alert_id = alert.id, filled = %result.filled_size, "Auto-sell executed");
                TriggerOutcome::Executed(result)
            } else {
                let reason = result.error.unwrap_or_else(|| "unknown error".to_string());
                warn!(alert_id = alert.id, %reason, "Auto-sell failed");
                TriggerOutcome::ExecutionFailed(reason)
            };
            let _ = events.send(TriggerEvent {
                alert,
                price,
                outcome,
            });
        });
    }

    fn emit(&self, event: TriggerEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait::async_trait]
impl TickHandler for TriggerEngine {
    async fn on_tick(&self, tick: &PriceTick) -> Result<()> {
        // Reject stream glitches so they cannot fire stop-loss orders.
        if tick.price < types::min_price() || tick.price > types::max_price() {
            return Ok(());
        }

        let alerts = self.cached_alerts().await;
        for alert in alerts {
            if alert.token_id != tick.token_id || alert.triggered {
                continue;
            }
            if !alert.matches(tick.price) {
                continue;
            }
            // Claim the alert in memory first; repeated ticks inside the
            // cache window must not fire it twice.
            if !self.executed.lock().unwrap().insert(alert.id) {
                continue;
            }
            if let Err(e) = self.alerts.mark_triggered(alert.id).await {
                warn!(alert_id = alert.id, error = %e, "Failed to persist triggered flag");
            }
            info!(
                alert_id = alert.id,
                token = %alert.token_id,
                price = %tick.price,
                trigger = %alert.trigger_price,
                "Alert triggered"
            );
            self.fire(alert, tick.price).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use market_core::config::AppConfig;
    use market_core::db::memory_pool;
    use market_core::db::paper::PaperRepository;
    use market_core::db::users::UserRepository;
    use market_stream::RawTick;
    use rust_decimal_macros::dec;
    use trading_engine::PaperEngine;

    struct Fixture {
        engine: Arc<TriggerEngine>,
        stream: Arc<MarketStreamClient>,
        executor: Arc<TradeExecutor>,
        events: mpsc::UnboundedReceiver<TriggerEvent>,
    }

    async fn fixture(paper: bool) -> Fixture {
        let cfg = AppConfig::test_config();
        let pool = memory_pool().await.unwrap();
        let clob = Arc::new(market_core::api::ClobClient::new(&cfg.exchange));
        let stream = Arc::new(MarketStreamClient::new(cfg.stream.clone()));
        let sessions = Arc::new(SessionManager::new(
            cfg.session.clone(),
            cfg.exchange.clone(),
            clob.clone(),
            UserRepository::new(pool.clone()),
        ));
        let paper_engine = paper.then(|| {
            PaperEngine::new(
                cfg.trading.clone(),
                PaperRepository::new(pool.clone()),
                stream.clone(),
                clob.clone(),
            )
        });
        let mut trading = cfg.trading.clone();
        if !paper {
            trading.mode = market_core::config::TradingMode::Live;
        }
        let executor = Arc::new(TradeExecutor::new(
            trading,
            clob.clone(),
            stream.clone(),
            sessions.clone(),
            paper_engine,
        ));
        let engine = Arc::new(TriggerEngine::new(
            AlertRepository::new(pool),
            sessions,
            executor.clone(),
            stream.clone(),
        ));
        let events = engine.take_events().unwrap();
        Fixture {
            engine,
            stream,
            executor,
            events,
        }
    }

    fn tick(token: &str, price: Decimal) -> PriceTick {
        PriceTick {
            token_id: token.to_string(),
            price,
            best_bid: price - dec!(0.01),
            best_ask: price,
            spread: dec!(0.01),
            timestamp: Utc::now(),
            received: Instant::now(),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<TriggerEvent>) -> TriggerEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for trigger event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn tick_without_alert_does_nothing() {
        let mut fx = fixture(true).await;
        fx.engine.on_tick(&tick("tok", dec!(0.62))).await.unwrap();
        assert!(fx.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn take_profit_fires_once_and_sells_full_position() {
        let mut fx = fixture(true).await;

        // Give user 7 a paper position to protect.
        fx.stream
            .apply_tick(RawTick {
                token_id: "tok".into(),
                price: dec!(0.62),
                best_bid: dec!(0.61),
                best_ask: dec!(0.62),
            })
            .await;
        let buy = fx.executor.buy(7, "tok", dec!(10), None, None).await;
        assert!(buy.success);

        fx.engine
            .add_take_profit(7, "tok", "Will it happen?", dec!(0.65), None)
            .await
            .unwrap();

        // Below the threshold: nothing fires.
        fx.engine.on_tick(&tick("tok", dec!(0.62))).await.unwrap();
        assert!(fx.events.try_recv().is_err());

        // Crossing tick fires exactly one auto-sell for 100%.
        fx.engine.on_tick(&tick("tok", dec!(0.66))).await.unwrap();
        let event = next_event(&mut fx.events).await;
        match event.outcome {
            TriggerOutcome::Executed(result) => {
                assert!(result.success);
                assert_eq!(result.filled_size, buy.filled_size);
            }
            other => panic!("expected Executed, got {other:?}"),
        }
        assert!(fx.executor.open_positions(7).await.unwrap().is_empty());

        // A rapid repeat tick must not fire the alert again.
        fx.engine.on_tick(&tick("tok", dec!(0.67))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.events.try_recv().is_err());

        // The persisted flag moved exactly once.
        let history = fx.engine.alerts_for_user(7, false).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].triggered);
    }

    #[tokio::test]
    async fn glitch_prices_never_fire_triggers() {
        let mut fx = fixture(true).await;
        fx.engine
            .add_take_profit(7, "tok", "Q", dec!(0.65), None)
            .await
            .unwrap();

        fx.engine.on_tick(&tick("tok", dec!(0.999))).await.unwrap();
        fx.engine.on_tick(&tick("tok", dec!(0.005))).await.unwrap();
        assert!(fx.events.try_recv().is_err());

        let active = fx.engine.alerts_for_user(7, true).await.unwrap();
        assert_eq!(active.len(), 1, "alert must remain active");
    }

    #[tokio::test]
    async fn plain_price_alert_only_notifies() {
        let mut fx = fixture(true).await;
        fx.engine
            .add_alert(NewAlert {
                user_id: 7,
                token_id: "tok".into(),
                label: "Q".into(),
                kind: AlertKind::PriceAlert,
                trigger_price: dec!(0.60),
                side: AlertSide::Above,
                auto_trade: false,
                trade_amount: None,
            })
            .await
            .unwrap();

        fx.engine.on_tick(&tick("tok", dec!(0.61))).await.unwrap();
        let event = next_event(&mut fx.events).await;
        assert!(matches!(event.outcome, TriggerOutcome::Notified));
        assert_eq!(event.price, dec!(0.61));
    }

    #[tokio::test]
    async fn auto_trade_without_session_reports_no_session() {
        let mut fx = fixture(false).await;
        fx.engine
            .add_stop_loss(7, "tok", "Q", dec!(0.40), None)
            .await
            .unwrap();

        fx.engine.on_tick(&tick("tok", dec!(0.39))).await.unwrap();
        let event = next_event(&mut fx.events).await;
        assert!(matches!(event.outcome, TriggerOutcome::NoSession));

        // Triggered anyway; the condition is reported, not dropped.
        let history = fx.engine.alerts_for_user(7, false).await.unwrap();
        assert!(history[0].triggered);
    }

    #[tokio::test]
    async fn stop_loss_fires_below_threshold() {
        let mut fx = fixture(true).await;
        fx.stream
            .apply_tick(RawTick {
                token_id: "tok".into(),
                price: dec!(0.50),
                best_bid: dec!(0.49),
                best_ask: dec!(0.50),
            })
            .await;
        assert!(fx.executor.buy(7, "tok", dec!(10), None, None).await.success);

        fx.engine
            .add_stop_loss(7, "tok", "Q", dec!(0.40), None)
            .await
            .unwrap();

        fx.engine.on_tick(&tick("tok", dec!(0.45))).await.unwrap();
        assert!(fx.events.try_recv().is_err());

        fx.engine.on_tick(&tick("tok", dec!(0.39))).await.unwrap();
        let event = next_event(&mut fx.events).await;
        assert!(matches!(event.outcome, TriggerOutcome::Executed(_)));
    }

    #[test]
    fn bounded_set_evicts_oldest_first() {
        let mut set = BoundedIdSet::new(3);
        assert!(set.insert(1));
        assert!(!set.insert(1), "duplicate insert must report already-seen");
        assert!(set.insert(2));
        assert!(set.insert(3));
        assert!(set.insert(4)); // evicts 1
        assert!(set.insert(1), "evicted id is insertable again");
        assert!(!set.insert(4));
    }
}
