//! Augury: prediction-market trading core.
//!
//! This root crate is the composition surface consumed by the chat front
//! end. It wires the services together in dependency order, owns the
//! long-lived background tasks, and exposes the narrow per-user call
//! surface; it formats and sends nothing itself.
//!
//! The crates underneath:
//!
//! - `market-core`: shared types, exchange API clients, database models
//! - `market-stream`: live price feed, cache, and tick dispatch
//! - `trading-engine`: order execution, paper trading, position tracking
//! - `trigger-engine`: alert evaluation and auto-liquidation
//! - `auth`: encrypted credentials and session lifecycle

use anyhow::Result;
use auth::SessionManager;
use market_core::api::ClobClient;
use market_core::config::{AppConfig, TradingMode};
use market_core::db::{self, alerts::AlertRepository, paper::PaperRepository, users::UserRepository};
use market_core::types::{Alert, OrderResult, SignatureMode};
use market_stream::MarketStreamClient;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use trading_engine::{MarketRef, PaperEngine, PositionTracker, SellAmount, TradeExecutor, TrackedPosition};
use trigger_engine::{TriggerEngine, TriggerEvent};

pub use market_core::db::alerts::NewAlert;
pub use market_core::types;
pub use market_core::Error;
pub use trigger_engine::TriggerOutcome;

/// Install the process-wide tracing subscriber. Call once at startup.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// A snapshot of one user's session state for the front end.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user_id: i64,
    pub funder_address: String,
    pub display_name: String,
    pub signature_mode: SignatureMode,
}

/// The assembled trading core.
pub struct App {
    pub config: AppConfig,
    pool: SqlitePool,
    pub stream: Arc<MarketStreamClient>,
    pub sessions: Arc<SessionManager>,
    pub executor: Arc<TradeExecutor>,
    pub tracker: Arc<PositionTracker>,
    pub triggers: Arc<TriggerEngine>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Construct every service in dependency order: store and stream
    /// first, then sessions, then the engines that consume them. No
    /// ambient globals; everything is owned here.
    pub async fn init(config: AppConfig) -> Result<Self> {
        let pool = db::create_pool(&config.database).await?;
        db::init_schema(&pool).await?;

        let clob = Arc::new(ClobClient::new(&config.exchange));
        let stream = Arc::new(MarketStreamClient::new(config.stream.clone()));
        let sessions = Arc::new(SessionManager::new(
            config.session.clone(),
            config.exchange.clone(),
            clob.clone(),
            UserRepository::new(pool.clone()),
        ));

        let paper = (config.trading.mode == TradingMode::Paper).then(|| {
            PaperEngine::new(
                config.trading.clone(),
                PaperRepository::new(pool.clone()),
                stream.clone(),
                clob.clone(),
            )
        });
        let executor = Arc::new(TradeExecutor::new(
            config.trading.clone(),
            clob.clone(),
            stream.clone(),
            sessions.clone(),
            paper,
        ));

        let tracker = Arc::new(PositionTracker::new(
            stream.clone(),
            clob.clone(),
            config.stream.clone(),
            config.trading.base_fee,
        ));
        let triggers = Arc::new(TriggerEngine::new(
            AlertRepository::new(pool.clone()),
            sessions.clone(),
            executor.clone(),
            stream.clone(),
        ));

        // The stream's dispatch step is the single event source: triggers
        // see every tick, the tracker sees position-relevant ones.
        stream.on_tick(triggers.clone()).await;
        stream.on_position_tick(tracker.clone()).await;

        info!(mode = ?config.trading.mode, "Trading core assembled");
        Ok(Self {
            config,
            pool,
            stream,
            sessions,
            executor,
            tracker,
            triggers,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the long-lived tasks: the stream read loop, the session
    /// expiry sweep, and the fallback price refresh.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();

        let stream = self.stream.clone();
        tasks.push(tokio::spawn(async move { stream.run().await }));

        let sessions = self.sessions.clone();
        let sweep_every = Duration::from_secs(self.config.session.sweep_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_every);
            tick.tick().await;
            loop {
                tick.tick().await;
                sessions.cleanup_expired().await;
            }
        }));

        let tracker = self.tracker.clone();
        let refresh_every = Duration::from_secs(self.config.stream.refresh_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(refresh_every);
            tick.tick().await;
            loop {
                tick.tick().await;
                // Only fall back to REST when the stream has gone quiet for
                // a position.
                let silent = tracker.all().iter().any(|p| p.is_stale(refresh_every));
                if silent {
                    tracker.refresh_all().await;
                }
            }
        }));

        info!("Background tasks started");
    }

    /// Stop the stream loop and tear down background tasks.
    pub async fn shutdown(&self) {
        self.stream.stop();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.pool.close().await;
        info!("Trading core shut down");
    }

    // ------------------------------------------------------------------
    // Front-end call surface
    // ------------------------------------------------------------------

    /// Take the trigger-event receiver; the front end turns these into
    /// user notifications. Can only be taken once.
    pub fn take_trigger_events(
        &self,
    ) -> Option<tokio::sync::mpsc::UnboundedReceiver<TriggerEvent>> {
        self.triggers.take_events()
    }

    pub async fn alerts_for_user(
        &self,
        user_id: i64,
        active_only: bool,
    ) -> market_core::Result<Vec<Alert>> {
        self.triggers.alerts_for_user(user_id, active_only).await
    }

    pub async fn add_alert(&self, alert: NewAlert) -> market_core::Result<i64> {
        self.triggers.add_alert(alert).await
    }

    pub async fn add_stop_loss(
        &self,
        user_id: i64,
        token_id: &str,
        label: &str,
        stop_price: Decimal,
        sell_amount: Option<Decimal>,
    ) -> market_core::Result<i64> {
        self.triggers
            .add_stop_loss(user_id, token_id, label, stop_price, sell_amount)
            .await
    }

    pub async fn add_take_profit(
        &self,
        user_id: i64,
        token_id: &str,
        label: &str,
        target_price: Decimal,
        sell_amount: Option<Decimal>,
    ) -> market_core::Result<i64> {
        self.triggers
            .add_take_profit(user_id, token_id, label, target_price, sell_amount)
            .await
    }

    pub async fn remove_alert(&self, alert_id: i64, user_id: i64) -> market_core::Result<bool> {
        self.triggers.remove_alert(alert_id, user_id).await
    }

    /// Open positions for a user, from the paper book or the exchange.
    pub async fn positions_for_user(
        &self,
        user_id: i64,
    ) -> market_core::Result<Vec<types::ExchangePosition>> {
        self.executor.open_positions(user_id).await
    }

    /// The live-tracked position set (value/P&L computed against the feed).
    pub fn tracked_positions(&self) -> Vec<TrackedPosition> {
        self.tracker.all()
    }

    pub async fn balance(&self, user_id: i64) -> market_core::Result<Decimal> {
        self.executor.balance(user_id).await
    }

    pub async fn buy(
        &self,
        user_id: i64,
        token_id: &str,
        amount: Decimal,
        slippage_pct: Option<Decimal>,
        market: Option<MarketRef>,
    ) -> OrderResult {
        self.executor
            .buy(user_id, token_id, amount, slippage_pct, market)
            .await
    }

    pub async fn sell(&self, user_id: i64, token_id: &str, amount: SellAmount) -> OrderResult {
        self.executor.sell(user_id, token_id, amount).await
    }

    pub async fn register_credentials(
        &self,
        user_id: i64,
        secret_key: &str,
        password: &str,
        funder_address: &str,
        signature_mode: SignatureMode,
        display_name: &str,
    ) -> market_core::Result<()> {
        self.sessions
            .register(
                user_id,
                secret_key,
                password,
                funder_address,
                signature_mode,
                display_name,
            )
            .await
    }

    pub async fn unlock(&self, user_id: i64, password: &str) -> market_core::Result<SessionInfo> {
        let session = self.sessions.unlock(user_id, password).await?;
        Ok(SessionInfo {
            user_id: session.user_id,
            funder_address: session.funder_address.clone(),
            display_name: session.display_name.clone(),
            signature_mode: session.signature_mode,
        })
    }

    pub async fn lock(&self, user_id: i64) -> bool {
        self.sessions.lock(user_id).await
    }

    pub async fn delete_credentials(&self, user_id: i64) -> market_core::Result<bool> {
        self.sessions.delete_credentials(user_id).await
    }

    /// Active session info, or `None` when locked or expired.
    pub async fn session_for(&self, user_id: i64) -> Option<SessionInfo> {
        let session = self.sessions.session(user_id).await?;
        Some(SessionInfo {
            user_id: session.user_id,
            funder_address: session.funder_address.clone(),
            display_name: session.display_name.clone(),
            signature_mode: session.signature_mode,
        })
    }
}
