//! Order execution with multi-tier fallback.
//!
//! Buys try the immediate path twice before resting a limit order above the
//! ask; sells walk immediate-partial, then all-or-nothing, then a resting
//! ladder that discounts one tick per retry. Every failure path comes back
//! as an [`OrderResult`] with a human-readable reason.

use crate::guard::CallGuard;
use crate::paper::PaperEngine;
use auth::SessionManager;
use market_core::api::{ClobClient, OrderResponse};
use market_core::config::{TradingConfig, TradingMode};
use market_core::types::{self, OrderResult, OrderType, Side};
use market_core::{Error, Result};
use market_stream::MarketStreamClient;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How much of a position to sell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SellAmount {
    Shares(Decimal),
    Percent(Decimal),
}

/// Market metadata carried along for display and paper bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct MarketRef {
    pub market_id: String,
    pub label: String,
    pub outcome: String,
}

/// The one seam to the matching engine: sign-and-submit a single order.
/// The live implementation routes through the guarded call path.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub(crate) trait OrderPlacer: Send + Sync {
    async fn place(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        order_type: OrderType,
    ) -> Result<OrderResponse>;
}

struct SessionPlacer<'g> {
    guard: &'g CallGuard,
    session: Arc<auth::UserSession>,
}

#[async_trait::async_trait]
impl OrderPlacer for SessionPlacer<'_> {
    async fn place(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        order_type: OrderType,
    ) -> Result<OrderResponse> {
        let token = token_id.to_string();
        self.guard
            .call(&self.session, move |client| {
                let token = token.clone();
                Box::pin(
                    async move { client.place_order(&token, side, price, size, order_type).await },
                )
            })
            .await
    }
}

/// Order execution engine serving every user through their own session.
pub struct TradeExecutor {
    config: TradingConfig,
    clob: Arc<ClobClient>,
    stream: Arc<MarketStreamClient>,
    sessions: Arc<SessionManager>,
    paper: Option<PaperEngine>,
    guard: CallGuard,
}

impl TradeExecutor {
    /// `paper` must be `Some` exactly when the configured mode is paper.
    pub fn new(
        config: TradingConfig,
        clob: Arc<ClobClient>,
        stream: Arc<MarketStreamClient>,
        sessions: Arc<SessionManager>,
        paper: Option<PaperEngine>,
    ) -> Self {
        Self {
            config,
            clob,
            stream,
            sessions,
            paper,
            guard: CallGuard::new(),
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.config.mode
    }

    pub fn is_paper(&self) -> bool {
        self.config.mode == TradingMode::Paper
    }

    /// Buy `amount` of quote currency worth of `token_id`.
    pub async fn buy(
        &self,
        user_id: i64,
        token_id: &str,
        amount: Decimal,
        slippage_pct: Option<Decimal>,
        market: Option<MarketRef>,
    ) -> OrderResult {
        if let Err(reason) = validate_buy_amount(&self.config, amount) {
            return OrderResult::failure(reason);
        }

        if let Some(paper) = &self.paper {
            return paper.buy(user_id, token_id, amount, market.as_ref()).await;
        }

        let Some(session) = self.sessions.session(user_id).await else {
            return OrderResult::failure(Error::SessionRequired(user_id).to_string());
        };

        let Some(ask) = self.ask_quote(token_id).await else {
            return OrderResult::failure(format!("no ask quote available for {token_id}"));
        };
        if let Err(reason) = validate_price(ask) {
            return OrderResult::failure(reason);
        }

        let slippage = slippage_pct.unwrap_or(self.config.default_slippage_pct);
        let placer = SessionPlacer {
            guard: &self.guard,
            session,
        };
        execute_buy(&self.config, &placer, token_id, ask, amount, slippage).await
    }

    /// Sell shares of `token_id`, either an explicit share count or a
    /// percentage of the currently held position.
    pub async fn sell(&self, user_id: i64, token_id: &str, amount: SellAmount) -> OrderResult {
        if let Some(paper) = &self.paper {
            return paper.sell(user_id, token_id, amount).await;
        }

        let Some(session) = self.sessions.session(user_id).await else {
            return OrderResult::failure(Error::SessionRequired(user_id).to_string());
        };

        let size = match self.resolve_sell_size(&session.funder_address, token_id, amount).await {
            Ok(size) => size,
            Err(e) => return OrderResult::failure(e.to_string()),
        };

        let Some(bid) = self.bid_quote(token_id).await else {
            return OrderResult::failure(format!("no bid quote available for {token_id}"));
        };
        if let Err(reason) = validate_price(bid) {
            return OrderResult::failure(reason);
        }

        let placer = SessionPlacer {
            guard: &self.guard,
            session,
        };
        execute_sell(&self.config, &placer, token_id, bid, size).await
    }

    /// Quote-currency balance for a user (paper or exchange-custodied).
    pub async fn balance(&self, user_id: i64) -> Result<Decimal> {
        if let Some(paper) = &self.paper {
            return paper.balance(user_id).await;
        }
        let session = self
            .sessions
            .session(user_id)
            .await
            .ok_or(Error::SessionRequired(user_id))?;
        self.clob.balance(&session.funder_address).await
    }

    /// Open positions for a user, from the paper book or the exchange query.
    pub async fn open_positions(
        &self,
        user_id: i64,
    ) -> Result<Vec<market_core::types::ExchangePosition>> {
        if let Some(paper) = &self.paper {
            return paper.positions(user_id).await;
        }
        let session = self
            .sessions
            .session(user_id)
            .await
            .ok_or(Error::SessionRequired(user_id))?;
        self.clob.positions(&session.funder_address).await
    }

    async fn resolve_sell_size(
        &self,
        funder: &str,
        token_id: &str,
        amount: SellAmount,
    ) -> Result<Decimal> {
        let size = match amount {
            SellAmount::Shares(size) => size,
            SellAmount::Percent(pct) => {
                if pct <= Decimal::ZERO || pct > Decimal::ONE_HUNDRED {
                    return Err(Error::Validation(format!(
                        "sell percent must be in (0, 100], got {pct}"
                    )));
                }
                let positions = self.clob.positions(funder).await?;
                let position = positions
                    .into_iter()
                    .find(|p| p.token_id == token_id)
                    .ok_or_else(|| Error::PositionNotFound(token_id.to_string()))?;
                (position.size * pct / Decimal::ONE_HUNDRED).round_dp(2)
            }
        };
        if size <= types::dust_size() {
            return Err(Error::Validation(format!(
                "sell size {size} is below the tradable minimum"
            )));
        }
        Ok(size)
    }

    /// Prevailing ask: live cache first, REST book as fallback.
    async fn ask_quote(&self, token_id: &str) -> Option<Decimal> {
        if let Some(ask) = self.stream.best_ask(token_id) {
            return Some(ask);
        }
        self.clob.book(token_id).await.ok()?.best_ask()
    }

    /// Prevailing bid: live cache first, REST book as fallback.
    async fn bid_quote(&self, token_id: &str) -> Option<Decimal> {
        if let Some(bid) = self.stream.best_bid(token_id) {
            return Some(bid);
        }
        self.clob.book(token_id).await.ok()?.best_bid()
    }
}

fn validate_buy_amount(config: &TradingConfig, amount: Decimal) -> std::result::Result<(), String> {
    if amount < config.min_trade {
        return Err(format!("minimum trade is {}", config.min_trade));
    }
    if amount > config.max_trade {
        return Err(format!("maximum trade is {}", config.max_trade));
    }
    Ok(())
}

fn validate_price(price: Decimal) -> std::result::Result<(), String> {
    if price < types::min_price() || price > types::max_price() {
        return Err(format!(
            "price {price} is outside the tradable range [{}, {}]",
            types::min_price(),
            types::max_price()
        ));
    }
    Ok(())
}

/// Buy protocol: `buy_attempts` fill-and-kill orders at the ask with a
/// short pause between, then one resting limit at
/// `min(ask * (1 + slippage/100), 0.99)` sized so price × size ≈ amount.
async fn execute_buy(
    config: &TradingConfig,
    placer: &dyn OrderPlacer,
    token_id: &str,
    ask: Decimal,
    amount: Decimal,
    slippage_pct: Decimal,
) -> OrderResult {
    let size = (amount / ask).round_dp(2);
    if size <= Decimal::ZERO {
        return OrderResult::failure(format!("amount {amount} buys no shares at {ask}"));
    }

    let mut last_error = String::from("immediate orders returned zero fill");
    for attempt in 0..config.buy_attempts {
        if attempt > 0 && config.retry_pause_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.retry_pause_ms)).await;
        }
        match placer.place(token_id, Side::Buy, ask, size, OrderType::Fak).await {
            Ok(resp) if resp.is_accepted() => {
                let filled = resp.filled_size.unwrap_or(size);
                if filled > Decimal::ZERO {
                    info!(token_id, %filled, attempt, "Immediate buy filled");
                    return OrderResult::filled(
                        resp.order_id,
                        filled,
                        resp.avg_price.unwrap_or(ask),
                    );
                }
                last_error = "immediate order accepted but filled nothing".to_string();
            }
            Ok(resp) => {
                last_error = format!("immediate order not filled (status {})", resp.status);
            }
            Err(e @ Error::GeoBlocked { .. }) => return OrderResult::failure(e.to_string()),
            Err(e) => {
                warn!(token_id, attempt, error = %e, "Immediate buy attempt failed");
                last_error = e.to_string();
            }
        }
    }

    // Resting fallback priced through the ask by the slippage allowance.
    let limit = (ask * (Decimal::ONE + slippage_pct / Decimal::ONE_HUNDRED))
        .min(types::max_price())
        .round_dp(2);
    let size = (amount / limit).round_dp(2);
    match placer.place(token_id, Side::Buy, limit, size, OrderType::Gtc).await {
        Ok(resp) if resp.is_accepted() => {
            info!(token_id, %limit, %size, "Resting buy placed");
            OrderResult::resting(resp.order_id, limit)
        }
        Ok(resp) => OrderResult::failure(format!(
            "resting order not accepted (status {}); {last_error}",
            resp.status
        )),
        Err(e) => OrderResult::failure(format!("{e}; {last_error}")),
    }
}

/// Sell protocol: fill-and-kill, then fill-or-kill at the bid, then a
/// resting ladder discounting one tick per retry.
async fn execute_sell(
    config: &TradingConfig,
    placer: &dyn OrderPlacer,
    token_id: &str,
    bid: Decimal,
    size: Decimal,
) -> OrderResult {
    let mut failures: Vec<String> = Vec::new();

    for order_type in [OrderType::Fak, OrderType::Fok] {
        match placer.place(token_id, Side::Sell, bid, size, order_type).await {
            Ok(resp) if resp.is_accepted() => {
                let filled = resp.filled_size.unwrap_or(size);
                if filled > Decimal::ZERO {
                    info!(token_id, %filled, ?order_type, "Immediate sell filled");
                    return OrderResult::filled(
                        resp.order_id,
                        filled,
                        resp.avg_price.unwrap_or(bid),
                    );
                }
                failures.push(format!("{order_type:?} accepted but filled nothing"));
            }
            Ok(resp) => failures.push(format!("{order_type:?} status {}", resp.status)),
            Err(e @ Error::GeoBlocked { .. }) => return OrderResult::failure(e.to_string()),
            Err(e) => {
                warn!(token_id, ?order_type, error = %e, "Immediate sell attempt failed");
                failures.push(e.to_string());
            }
        }
    }

    let mut price = bid;
    for retry in 0..config.max_sell_retries {
        match placer.place(token_id, Side::Sell, price, size, OrderType::Gtc).await {
            Ok(resp) if resp.is_accepted() => {
                info!(token_id, %price, retry, "Resting sell placed");
                return OrderResult::resting(resp.order_id, price);
            }
            Ok(resp) => failures.push(format!("Gtc at {price} status {}", resp.status)),
            Err(e @ Error::GeoBlocked { .. }) => return OrderResult::failure(e.to_string()),
            Err(e) => failures.push(format!("Gtc at {price}: {e}")),
        }
        // Walk the price down a tick to improve fill probability.
        price = (price - config.sell_retry_discount).max(types::min_price());
    }

    OrderResult::failure(format!("all sell attempts failed: {}", failures.join("; ")))
}
