//! Dynamic fee curve and fee-aware P&L.
//!
//! The exchange charges a price-dependent taker fee that peaks at even odds
//! and tapers to zero at the extremes: `base_fee * 4 * p * (1 - p)`.

use rust_decimal::Decimal;

/// Effective fee rate for a fill at `price`.
pub fn fee_rate(base_fee: Decimal, price: Decimal) -> Decimal {
    base_fee * Decimal::from(4) * price * (Decimal::ONE - price)
}

/// Raw P&L with no fee adjustment.
pub fn raw_pnl(entry_price: Decimal, exit_price: Decimal, size: Decimal) -> Decimal {
    (exit_price - entry_price) * size
}

/// P&L accounting for both the entry and exit fee: the entry price is
/// inflated by the buy fee and the exit price deflated by the sell fee
/// before differencing.
pub fn fee_adjusted_pnl(
    base_fee: Decimal,
    entry_price: Decimal,
    exit_price: Decimal,
    size: Decimal,
) -> Decimal {
    let buy_fee = fee_rate(base_fee, entry_price);
    let sell_fee = fee_rate(base_fee, exit_price);
    let effective_entry = entry_price * (Decimal::ONE + buy_fee);
    let effective_exit = exit_price * (Decimal::ONE - sell_fee);
    (effective_exit - effective_entry) * size
}
