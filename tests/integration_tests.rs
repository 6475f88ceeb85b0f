//! Integration tests for component interactions.
//!
//! Everything runs in paper mode against an in-memory store, with prices
//! fed through the stream client's normalization entry point so the real
//! dispatch wiring (cache, history, trigger evaluation, position updates)
//! is exercised end to end.

use augury::{App, NewAlert, SessionInfo, TriggerOutcome};
use market_core::config::AppConfig;
use market_core::types::{AlertKind, AlertSide, SignatureMode};
use market_stream::RawTick;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;
use trading_engine::SellAmount;

const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const USER: i64 = 7;

async fn app() -> App {
    App::init(AppConfig::test_config()).await.unwrap()
}

async fn feed(app: &App, token: &str, bid: Decimal, ask: Decimal) {
    app.stream
        .apply_tick(RawTick {
            token_id: token.to_string(),
            price: (bid + ask) / Decimal::TWO,
            best_bid: bid,
            best_ask: ask,
        })
        .await;
}

#[tokio::test]
async fn credential_lifecycle_round_trip() {
    let app = app().await;

    assert!(app.session_for(USER).await.is_none());

    app.register_credentials(USER, TEST_KEY, "correct-horse", "", SignatureMode::Eoa, "tester")
        .await
        .unwrap();

    let info: SessionInfo = app.unlock(USER, "correct-horse").await.unwrap();
    assert_eq!(info.user_id, USER);
    assert!(info.funder_address.starts_with("0x"));
    assert!(app.session_for(USER).await.is_some());

    assert!(app.lock(USER).await);
    assert!(app.session_for(USER).await.is_none());

    assert!(app.delete_credentials(USER).await.unwrap());
    assert!(app.unlock(USER, "correct-horse").await.is_err());
}

#[tokio::test]
async fn wrong_password_never_unlocks() {
    let app = app().await;
    app.register_credentials(USER, TEST_KEY, "correct-horse", "", SignatureMode::Eoa, "")
        .await
        .unwrap();

    assert!(app.unlock(USER, "wrong-password").await.is_err());
    assert!(app.session_for(USER).await.is_none());
}

#[tokio::test]
async fn paper_buy_sell_round_trip() {
    let app = app().await;
    feed(&app, "tok-y", dec!(0.49), dec!(0.50)).await;

    let buy = app.buy(USER, "tok-y", dec!(10), None, None).await;
    assert!(buy.success, "paper buy failed: {:?}", buy.error);
    assert_eq!(buy.filled_size, dec!(20));
    assert_eq!(app.balance(USER).await.unwrap(), dec!(990));

    let positions = app.positions_for_user(USER).await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].size, dec!(20));

    feed(&app, "tok-y", dec!(0.60), dec!(0.61)).await;
    let sell = app.sell(USER, "tok-y", SellAmount::Percent(dec!(100))).await;
    assert!(sell.success);
    assert_eq!(sell.filled_size, dec!(20));

    assert!(app.positions_for_user(USER).await.unwrap().is_empty());
    assert_eq!(app.balance(USER).await.unwrap(), dec!(1002));
}

#[tokio::test]
async fn buy_validation_happens_before_any_fill() {
    let app = app().await;
    feed(&app, "tok-y", dec!(0.49), dec!(0.50)).await;

    let too_small = app.buy(USER, "tok-y", dec!(0.50), None, None).await;
    assert!(!too_small.success);
    assert!(too_small.error.unwrap().contains("minimum"));

    let too_big = app.buy(USER, "tok-y", dec!(500), None, None).await;
    assert!(!too_big.success);
    assert!(too_big.error.unwrap().contains("maximum"));

    // Balance untouched by rejected orders.
    assert_eq!(app.balance(USER).await.unwrap(), dec!(1000));
}

#[tokio::test]
async fn take_profit_auto_sells_through_the_stream_path() {
    let app = app().await;
    let mut events = app.take_trigger_events().unwrap();

    // A tick with no alert in place does nothing.
    feed(&app, "tok-x", dec!(0.61), dec!(0.62)).await;
    assert!(events.try_recv().is_err());

    let buy = app.buy(USER, "tok-x", dec!(10), None, None).await;
    assert!(buy.success);

    app.add_take_profit(USER, "tok-x", "Will X happen?", dec!(0.65), None)
        .await
        .unwrap();

    // Still below target: no trigger.
    feed(&app, "tok-x", dec!(0.62), dec!(0.63)).await;
    assert!(events.try_recv().is_err());

    // Crossing tick: exactly one trigger, one sell of the full position.
    feed(&app, "tok-x", dec!(0.66), dec!(0.67)).await;
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no trigger event arrived")
        .unwrap();
    match event.outcome {
        TriggerOutcome::Executed(result) => {
            assert!(result.success);
            assert_eq!(result.filled_size, buy.filled_size);
        }
        other => panic!("expected Executed, got {other:?}"),
    }
    assert!(app.positions_for_user(USER).await.unwrap().is_empty());

    // Repeated ticks past the threshold never re-fire the alert.
    feed(&app, "tok-x", dec!(0.70), dec!(0.71)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    let history = app.alerts_for_user(USER, false).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].triggered);
    assert!(app.alerts_for_user(USER, true).await.unwrap().is_empty());
}

#[tokio::test]
async fn plain_alert_notifies_without_trading() {
    let app = app().await;
    let mut events = app.take_trigger_events().unwrap();

    app.add_alert(NewAlert {
        user_id: USER,
        token_id: "tok-a".into(),
        label: "Watch this".into(),
        kind: AlertKind::PriceAlert,
        trigger_price: dec!(0.30),
        side: AlertSide::Below,
        auto_trade: false,
        trade_amount: None,
    })
    .await
    .unwrap();

    feed(&app, "tok-a", dec!(0.28), dec!(0.29)).await;
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("no trigger event arrived")
        .unwrap();
    assert!(matches!(event.outcome, TriggerOutcome::Notified));
}

#[tokio::test]
async fn tracker_follows_position_relevant_ticks() {
    let app = app().await;

    app.tracker
        .add_position("tok-p", "m-1", "Will P happen?", "Yes", dec!(50), dec!(0.40))
        .await;

    feed(&app, "tok-p", dec!(0.54), dec!(0.56)).await;

    let tracked = app.tracked_positions();
    assert_eq!(tracked.len(), 1);
    let position = &tracked[0];
    assert_eq!(position.best_bid, dec!(0.54));
    assert_eq!(position.value(), dec!(27)); // 0.54 * 50
    assert_eq!(position.pnl(), dec!(7));
    assert!(!position.is_stale(Duration::from_secs(30)));

    // Fees always pull a favorable P&L toward zero.
    let with_fees = position.pnl_with_fees(app.config.trading.base_fee);
    assert!(with_fees < position.pnl());

    // History accumulated through the same dispatch path.
    assert_eq!(app.stream.history("tok-p", 10).len(), 1);
}

#[tokio::test]
async fn out_of_range_stream_prices_are_ignored_end_to_end() {
    let app = app().await;
    let mut events = app.take_trigger_events().unwrap();

    app.add_take_profit(USER, "tok-z", "Q", dec!(0.65), None)
        .await
        .unwrap();

    // A glitched price above 1.0 must be dropped before caching or
    // evaluation.
    app.stream
        .apply_tick(RawTick {
            token_id: "tok-z".into(),
            price: dec!(1.7),
            best_bid: dec!(1.6),
            best_ask: dec!(1.7),
        })
        .await;

    assert!(app.stream.price("tok-z").is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn shutdown_is_clean() {
    let app = app().await;
    app.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    app.shutdown().await;
}
