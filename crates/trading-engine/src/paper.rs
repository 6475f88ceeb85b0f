//! Paper-trading engine for simulation mode.
//!
//! Fills instantly at the cached quote, settles against a persisted paper
//! balance, and keeps simulated positions in the store so they survive
//! restarts. The front-end surface behaves identically in both modes.

use crate::executor::{MarketRef, SellAmount};
use market_core::api::ClobClient;
use market_core::config::TradingConfig;
use market_core::db::paper::{PaperPosition, PaperRepository};
use market_core::types::{self, ExchangePosition, OrderResult};
use market_core::Result;
use market_stream::MarketStreamClient;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

pub struct PaperEngine {
    config: TradingConfig,
    repo: PaperRepository,
    stream: Arc<MarketStreamClient>,
    clob: Arc<ClobClient>,
}

impl PaperEngine {
    pub fn new(
        config: TradingConfig,
        repo: PaperRepository,
        stream: Arc<MarketStreamClient>,
        clob: Arc<ClobClient>,
    ) -> Self {
        Self {
            config,
            repo,
            stream,
            clob,
        }
    }

    pub async fn balance(&self, user_id: i64) -> Result<Decimal> {
        self.repo
            .balance(user_id, self.config.paper_starting_balance)
            .await
    }

    pub async fn positions(&self, user_id: i64) -> Result<Vec<ExchangePosition>> {
        let positions = self.repo.positions(user_id).await?;
        Ok(positions
            .into_iter()
            .map(|p| {
                let current = self.stream.price(&p.token_id).unwrap_or(p.avg_price);
                ExchangePosition {
                    token_id: p.token_id,
                    market_id: p.market_id,
                    label: p.label,
                    outcome: p.outcome,
                    size: p.size,
                    avg_price: p.avg_price,
                    current_price: current,
                }
            })
            .collect())
    }

    /// Simulated buy at the prevailing quote.
    pub async fn buy(
        &self,
        user_id: i64,
        token_id: &str,
        amount: Decimal,
        market: Option<&MarketRef>,
    ) -> OrderResult {
        let balance = match self.balance(user_id).await {
            Ok(b) => b,
            Err(e) => return OrderResult::failure(e.to_string()),
        };
        if amount > balance {
            return OrderResult::failure(format!(
                "insufficient paper balance: have {balance}, need {amount}"
            ));
        }

        let Some(price) = self.fill_price(token_id, types::Side::Buy).await else {
            return OrderResult::failure(format!("no price available for {token_id}"));
        };

        let shares = (amount / price).round_dp(2);
        let existing = match self.repo.position(user_id, token_id).await {
            Ok(p) => p,
            Err(e) => return OrderResult::failure(e.to_string()),
        };

        // Average-cost merge with any existing position.
        let merged = match existing {
            Some(pos) => {
                let total_cost = pos.avg_price * pos.size + amount;
                let total_shares = pos.size + shares;
                PaperPosition {
                    size: total_shares,
                    avg_price: (total_cost / total_shares).round_dp(4),
                    ..pos
                }
            }
            None => PaperPosition {
                user_id,
                token_id: token_id.to_string(),
                market_id: market.map(|m| m.market_id.clone()).unwrap_or_default(),
                label: market
                    .map(|m| m.label.clone())
                    .unwrap_or_else(|| "Paper trade".to_string()),
                outcome: market.map(|m| m.outcome.clone()).unwrap_or_default(),
                size: shares,
                avg_price: price,
            },
        };

        if let Err(e) = self.repo.upsert_position(&merged).await {
            return OrderResult::failure(e.to_string());
        }
        if let Err(e) = self.repo.set_balance(user_id, balance - amount).await {
            return OrderResult::failure(e.to_string());
        }

        info!(user_id, token_id, %shares, %price, "[PAPER] Buy filled");
        OrderResult::filled(paper_order_id("buy", token_id), shares, price)
    }

    /// Simulated sell at the prevailing quote.
    pub async fn sell(&self, user_id: i64, token_id: &str, amount: SellAmount) -> OrderResult {
        let Some(position) = (match self.repo.position(user_id, token_id).await {
            Ok(p) => p,
            Err(e) => return OrderResult::failure(e.to_string()),
        }) else {
            return OrderResult::failure(format!("no open position for {token_id}"));
        };

        let requested = match amount {
            SellAmount::Shares(shares) => shares,
            SellAmount::Percent(pct) => {
                if pct <= Decimal::ZERO || pct > Decimal::ONE_HUNDRED {
                    return OrderResult::failure(format!(
                        "sell percent must be in (0, 100], got {pct}"
                    ));
                }
                (position.size * pct / Decimal::ONE_HUNDRED).round_dp(2)
            }
        };
        let shares = requested.min(position.size);
        if shares <= Decimal::ZERO {
            return OrderResult::failure("sell size must be positive".to_string());
        }

        let Some(price) = self.fill_price(token_id, types::Side::Sell).await else {
            return OrderResult::failure(format!("no price available for {token_id}"));
        };
        let proceeds = shares * price;

        let remaining = position.size - shares;
        let store_result = if remaining <= types::dust_size() {
            self.repo.remove_position(user_id, token_id).await
        } else {
            self.repo
                .upsert_position(&PaperPosition {
                    size: remaining,
                    ..position
                })
                .await
        };
        if let Err(e) = store_result {
            return OrderResult::failure(e.to_string());
        }

        let balance = match self.balance(user_id).await {
            Ok(b) => b,
            Err(e) => return OrderResult::failure(e.to_string()),
        };
        if let Err(e) = self.repo.set_balance(user_id, balance + proceeds).await {
            return OrderResult::failure(e.to_string());
        }

        info!(user_id, token_id, %shares, %price, "[PAPER] Sell filled");
        OrderResult::filled(paper_order_id("sell", token_id), shares, price)
    }

    /// Fill price for simulation: the live cache's book side when present,
    /// the REST midpoint otherwise.
    async fn fill_price(&self, token_id: &str, side: types::Side) -> Option<Decimal> {
        let cached = match side {
            types::Side::Buy => self.stream.best_ask(token_id),
            types::Side::Sell => self.stream.best_bid(token_id),
        };
        if let Some(price) = cached.filter(|p| *p > Decimal::ZERO) {
            return Some(price);
        }
        self.clob.midpoint(token_id).await.ok()
    }
}

fn paper_order_id(side: &str, token_id: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let token8: String = token_id.chars().take(8).collect();
    format!("paper_{side}_{token8}_{ts}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_core::config::AppConfig;
    use market_core::db::memory_pool;
    use market_stream::RawTick;
    use rust_decimal_macros::dec;

    async fn engine() -> PaperEngine {
        let cfg = AppConfig::test_config();
        let pool = memory_pool().await.unwrap();
        PaperEngine::new(
            cfg.trading.clone(),
            PaperRepository::new(pool),
            Arc::new(MarketStreamClient::new(cfg.stream.clone())),
            Arc::new(ClobClient::new(&cfg.exchange)),
        )
    }

    async fn seed_price(engine: &PaperEngine, token: &str, bid: Decimal, ask: Decimal) {
        engine
            .stream
            .apply_tick(RawTick {
                token_id: token.to_string(),
                price: (bid + ask) / Decimal::TWO,
                best_bid: bid,
                best_ask: ask,
            })
            .await;
    }

    #[tokio::test]
    async fn buy_creates_position_and_debits_balance() {
        let engine = engine().await;
        seed_price(&engine, "tok", dec!(0.49), dec!(0.50)).await;

        let result = engine.buy(1, "tok", dec!(10), None).await;
        assert!(result.success);
        assert_eq!(result.filled_size, dec!(20));
        assert_eq!(result.avg_price, dec!(0.50));

        assert_eq!(engine.balance(1).await.unwrap(), dec!(990));
        let positions = engine.positions(1).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(20));
    }

    #[tokio::test]
    async fn repeat_buys_merge_at_average_cost() {
        let engine = engine().await;
        seed_price(&engine, "tok", dec!(0.39), dec!(0.40)).await;
        assert!(engine.buy(1, "tok", dec!(10), None).await.success); // 25 @ 0.40

        seed_price(&engine, "tok", dec!(0.59), dec!(0.60)).await;
        assert!(engine.buy(1, "tok", dec!(12), None).await.success); // 20 @ 0.60

        let positions = engine.positions(1).await.unwrap();
        assert_eq!(positions[0].size, dec!(45));
        // (10 + 12) / 45 ≈ 0.4889
        assert_eq!(positions[0].avg_price, dec!(0.4889));
    }

    #[tokio::test]
    async fn buy_rejects_insufficient_balance() {
        let engine = engine().await;
        seed_price(&engine, "tok", dec!(0.49), dec!(0.50)).await;
        engine.repo.set_balance(1, dec!(5)).await.unwrap();

        let result = engine.buy(1, "tok", dec!(10), None).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("insufficient"));
    }

    #[tokio::test]
    async fn full_sell_closes_the_position() {
        let engine = engine().await;
        seed_price(&engine, "tok", dec!(0.49), dec!(0.50)).await;
        assert!(engine.buy(1, "tok", dec!(10), None).await.success);

        seed_price(&engine, "tok", dec!(0.60), dec!(0.61)).await;
        let result = engine.sell(1, "tok", SellAmount::Percent(dec!(100))).await;
        assert!(result.success);
        assert_eq!(result.filled_size, dec!(20));
        assert_eq!(result.avg_price, dec!(0.60)); // sells hit the bid

        assert!(engine.positions(1).await.unwrap().is_empty());
        // 990 + 20 * 0.60 = 1002
        assert_eq!(engine.balance(1).await.unwrap(), dec!(1002.0));
    }

    #[tokio::test]
    async fn partial_sell_resizes_the_position() {
        let engine = engine().await;
        seed_price(&engine, "tok", dec!(0.49), dec!(0.50)).await;
        assert!(engine.buy(1, "tok", dec!(10), None).await.success);

        let result = engine.sell(1, "tok", SellAmount::Shares(dec!(8))).await;
        assert!(result.success);
        assert_eq!(result.filled_size, dec!(8));

        let positions = engine.positions(1).await.unwrap();
        assert_eq!(positions[0].size, dec!(12));
    }

    #[tokio::test]
    async fn sell_without_position_fails() {
        let engine = engine().await;
        seed_price(&engine, "tok", dec!(0.49), dec!(0.50)).await;
        let result = engine.sell(1, "tok", SellAmount::Percent(dec!(100))).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("no open position"));
    }

    #[tokio::test]
    async fn oversized_sell_is_clamped_to_position() {
        let engine = engine().await;
        seed_price(&engine, "tok", dec!(0.49), dec!(0.50)).await;
        assert!(engine.buy(1, "tok", dec!(10), None).await.success);

        let result = engine.sell(1, "tok", SellAmount::Shares(dec!(500))).await;
        assert!(result.success);
        assert_eq!(result.filled_size, dec!(20));
        assert!(engine.positions(1).await.unwrap().is_empty());
    }
}
