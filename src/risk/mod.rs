use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

use crate::exchange::{ExchangeApi, ExchangeError};
use crate::types::{ExitReason, Order, Position, PositionSide, TradingMode};

/// A position at or below this P&L percentage is force-closed.
/// Stop-loss bypasses minimum-hold and minimum-profit.
pub const STOP_LOSS_PCT: Decimal = Decimal::from_parts(20, 0, 0, true, 1); // -2.0
/// Minimum P&L percentage before a profit-taking close is allowed.
pub const TAKE_PROFIT_MIN_PCT: Decimal = Decimal::from_parts(20, 0, 0, false, 1); // +2.0
/// Trailing take-profit triggers when price drops this far from the
/// high-water mark while the position is still in profit.
pub const TRAILING_DRAWDOWN_PCT: Decimal = Decimal::from_parts(30, 0, 0, false, 1); // 3.0
/// A position younger than this cannot be closed, except by stop-loss.
pub const MIN_HOLDING_MINUTES: i64 = 15;
/// Minimum strategy confidence before the runtime acts on a signal.
pub const SIGNAL_MIN_CONFIDENCE: Decimal = Decimal::from_parts(6, 0, 0, false, 1); // 0.6
/// Exchange taker fee per leg (market orders).
pub const TAKER_FEE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001
/// Minimum profit after both fee legs for a round trip to be worth taking.
pub const MIN_PROFIT_AFTER_FEES_PCT: Decimal = Decimal::from_parts(3, 0, 0, false, 1); // 0.3

/// Round-trip fee drag in percent (both taker legs).
pub fn round_trip_fee_pct() -> Decimal {
    TAKER_FEE * Decimal::from(2) * Decimal::from(100)
}

/// P&L percentage net of the round-trip fee drag.
pub fn net_pnl_after_fees_pct(pnl_pct: Decimal) -> Decimal {
    pnl_pct - round_trip_fee_pct()
}

/// Outcome of a guard evaluation. Guards are values, never errors: the
/// runtime reacts to `Block` by leaving the position open and logging
/// the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Block { reason: String },
}

impl GuardDecision {
    pub fn block(reason: impl Into<String>) -> Self {
        GuardDecision::Block { reason: reason.into() }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardDecision::Allow)
    }
}

/// A close forced or made eligible by the per-tick guard scan.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseTrigger {
    /// P&L fell through the stop-loss floor. Forced, bypasses all other guards.
    StopLoss { pnl_pct: Decimal },
    /// Trailing take-profit: price dropped from the high-water mark
    /// with the profit target met and minimum hold satisfied.
    TrailingTakeProfit { pnl_pct: Decimal, drop_pct: Decimal },
}

/// Per-tick scan of an open position. Returns the close the guards
/// demand, if any.
pub fn scan_close_triggers(
    position: &Position,
    current_price: Decimal,
    now: DateTime<Utc>,
) -> Option<CloseTrigger> {
    let pnl_pct = position.unrealized_pnl_pct(current_price)?;

    if pnl_pct <= STOP_LOSS_PCT {
        return Some(CloseTrigger::StopLoss { pnl_pct });
    }

    // Trailing take-profit applies to longs only.
    if position.side == PositionSide::Long && position.high_price_since_entry > Decimal::ZERO {
        let high = position.high_price_since_entry;
        let trigger_price = high * (Decimal::ONE - TRAILING_DRAWDOWN_PCT / Decimal::from(100));
        let drop_pct = (high - current_price) / high * Decimal::from(100);
        let holding_ok = position
            .holding_minutes(now)
            .is_some_and(|m| m >= MIN_HOLDING_MINUTES);

        if current_price <= trigger_price
            && pnl_pct >= TAKE_PROFIT_MIN_PCT
            && pnl_pct > Decimal::ZERO
            && holding_ok
        {
            return Some(CloseTrigger::TrailingTakeProfit { pnl_pct, drop_pct });
        }
    }

    None
}

/// Guards on a signal- or manually-initiated close. Stop-loss always
/// passes; otherwise minimum-hold, minimum-profit and loss-prevention
/// each block in turn.
pub fn evaluate_signal_close(
    position: &Position,
    current_price: Decimal,
    now: DateTime<Utc>,
) -> GuardDecision {
    let Some(pnl_pct) = position.unrealized_pnl_pct(current_price) else {
        return GuardDecision::block("no open position");
    };

    if pnl_pct <= STOP_LOSS_PCT {
        return GuardDecision::Allow;
    }

    if let Some(held) = position.holding_minutes(now) {
        if held < MIN_HOLDING_MINUTES {
            return GuardDecision::block(format!(
                "Position held for {held} minutes, minimum required: {MIN_HOLDING_MINUTES} minutes"
            ));
        }
    }

    if pnl_pct < TAKE_PROFIT_MIN_PCT {
        return GuardDecision::block(format!(
            "Current profit {:.2}% < minimum required {:.2}% (net of fees: {:.2}%)",
            pnl_pct,
            TAKE_PROFIT_MIN_PCT,
            net_pnl_after_fees_pct(pnl_pct)
        ));
    }

    let losing = match position.side {
        PositionSide::Long => current_price < position.entry_price,
        PositionSide::Short => current_price > position.entry_price,
        PositionSide::Flat => false,
    };
    if losing {
        return GuardDecision::block(format!(
            "Current price {} is on the losing side of entry {}",
            current_price, position.entry_price
        ));
    }

    GuardDecision::Allow
}

/// Inputs for the open-side guards. The caller resolves the async facts
/// (tradability, net spent) before evaluation.
#[derive(Debug, Clone)]
pub struct OpenContext {
    pub confidence: Decimal,
    pub tradable: bool,
    pub net_spent: Decimal,
    pub budget_cap: Decimal,
}

impl OpenContext {
    /// Quote budget still available: configured cap minus net spent.
    pub fn remaining_budget(&self) -> Decimal {
        (self.budget_cap - self.net_spent).max(Decimal::ZERO)
    }
}

/// Guards before a position-opening BUY (or SHORT-opening SELL).
pub fn evaluate_open(ctx: &OpenContext) -> GuardDecision {
    if ctx.confidence < SIGNAL_MIN_CONFIDENCE {
        return GuardDecision::block(format!(
            "Signal confidence {:.2} below minimum {SIGNAL_MIN_CONFIDENCE}",
            ctx.confidence
        ));
    }
    if !ctx.tradable {
        return GuardDecision::block("symbol is not tradable");
    }
    if ctx.net_spent >= ctx.budget_cap {
        return GuardDecision::block(format!(
            "Budget exhausted: net spent {} of {} quote budget",
            ctx.net_spent, ctx.budget_cap
        ));
    }
    GuardDecision::Allow
}

#[derive(Debug, Error)]
pub enum TradeError {
    /// No execution price could be derived, even after re-fetching the
    /// order. The trade must not be persisted; there is no fallback to
    /// the ticker price.
    #[error("execution price unavailable for order {order_id} ({symbol})")]
    ExecutionPriceUnavailable { order_id: String, symbol: String },
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Derives the realized average price from exchange-reported order
/// data, in strict preference order:
///
/// 1. sum of fill quote amounts over fill quantities;
/// 2. sum of fill price x quantity over fill quantities;
/// 3. cumulative quote quantity over executed quantity;
/// 4. the order's own price field.
///
/// Returns `None` when none of the sources yields a positive price.
pub fn execution_price_from_order(order: &Order) -> Option<Decimal> {
    if !order.fills.is_empty() {
        let total_qty: Decimal = order.fills.iter().map(|f| f.qty).sum();
        if total_qty > Decimal::ZERO {
            let total_quote: Decimal =
                order.fills.iter().filter_map(|f| f.quote_qty).sum();
            if total_quote > Decimal::ZERO {
                return Some(total_quote / total_qty);
            }
            let total_value: Decimal = order
                .fills
                .iter()
                .filter_map(|f| f.price.map(|p| p * f.qty))
                .sum();
            if total_value > Decimal::ZERO {
                return Some(total_value / total_qty);
            }
        }
    }

    if let Some(cumulative) = order.cumulative_quote_qty {
        if cumulative > Decimal::ZERO && order.executed_qty > Decimal::ZERO {
            return Some(cumulative / order.executed_qty);
        }
    }

    order.price.filter(|p| *p > Decimal::ZERO)
}

/// Full derivation including the re-fetch fallback: when the immediate
/// reply is unusable, the order is re-read from the exchange and the
/// chain retried once. Failing that, the trade is fatal - the caller
/// must attempt to cancel and must not persist anything.
pub async fn derive_execution_price(
    api: &dyn ExchangeApi,
    order: &Order,
    mode: TradingMode,
) -> Result<Decimal, TradeError> {
    if let Some(price) = execution_price_from_order(order) {
        return Ok(price);
    }

    warn!(
        "Order {} has no usable execution data, re-fetching from exchange",
        order.order_id
    );
    match api.order_status(&order.symbol, &order.order_id, mode).await {
        Ok(full_order) => {
            if let Some(price) = execution_price_from_order(&full_order) {
                return Ok(price);
            }
        }
        Err(e) => {
            warn!("Re-fetch of order {} failed: {}", order.order_id, e);
        }
    }

    Err(TradeError::ExecutionPriceUnavailable {
        order_id: order.order_id.clone(),
        symbol: order.symbol.to_string(),
    })
}

/// Realized P&L for a close at `execution_price`, sign-adjusted for the
/// position side.
pub fn pnl_for_close(
    side: PositionSide,
    entry_price: Decimal,
    execution_price: Decimal,
    quantity: Decimal,
) -> (Decimal, Decimal) {
    if entry_price <= Decimal::ZERO {
        return (Decimal::ZERO, Decimal::ZERO);
    }
    let per_unit = match side {
        PositionSide::Short => entry_price - execution_price,
        _ => execution_price - entry_price,
    };
    let pnl_abs = per_unit * quantity;
    let pnl_pct = per_unit / entry_price * Decimal::from(100);
    (pnl_abs, pnl_pct)
}

/// Re-derives the exit reason from the final realized P&L. A close that
/// started as a plain signal becomes STOP_LOSS or TAKE_PROFIT when the
/// realized percentage crossed the corresponding threshold; manual and
/// guard-forced closes keep their reason.
pub fn derive_exit_reason(original: ExitReason, pnl_pct: Decimal) -> ExitReason {
    match original {
        ExitReason::Signal => {
            if pnl_pct <= STOP_LOSS_PCT {
                ExitReason::StopLoss
            } else if pnl_pct >= TAKE_PROFIT_MIN_PCT {
                ExitReason::TakeProfit
            } else {
                ExitReason::Signal
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    use crate::types::{Fill, OrderStatus, Side, Symbol};

    fn long(entry: Decimal, minutes_ago: i64) -> Position {
        let mut pos = Position::open_long(dec!(1), entry, Utc::now() - Duration::minutes(minutes_ago));
        pos.observe_price(entry);
        pos
    }

    #[test]
    fn constants_match_the_contract() {
        assert_eq!(STOP_LOSS_PCT, dec!(-2.0));
        assert_eq!(TAKE_PROFIT_MIN_PCT, dec!(2.0));
        assert_eq!(TRAILING_DRAWDOWN_PCT, dec!(3.0));
        assert_eq!(SIGNAL_MIN_CONFIDENCE, dec!(0.6));
        assert_eq!(TAKER_FEE, dec!(0.001));
        assert_eq!(MIN_PROFIT_AFTER_FEES_PCT, dec!(0.3));
        assert_eq!(round_trip_fee_pct(), dec!(0.2));
    }

    #[test]
    fn stop_loss_fires_even_inside_minimum_hold() {
        // Bought at 100 two minutes ago, price now 97: -3% <= -2%.
        let pos = long(dec!(100), 2);
        let trigger = scan_close_triggers(&pos, dec!(97), Utc::now());
        assert_eq!(trigger, Some(CloseTrigger::StopLoss { pnl_pct: dec!(-3) }));
        // The signal-close path also lets it through.
        assert!(evaluate_signal_close(&pos, dec!(97), Utc::now()).is_allowed());
    }

    #[test]
    fn trailing_take_profit_requires_every_condition() {
        let now = Utc::now();
        let mut pos = long(dec!(30000), 60);
        pos.observe_price(dec!(31500));

        // Drop 0.95% from high: hold.
        assert_eq!(scan_close_triggers(&pos, dec!(31200), now), None);

        // Drop 3.02% but pnl only +1.83%: blocked by the profit target.
        assert_eq!(scan_close_triggers(&pos, dec!(30550), now), None);

        // Drop 1.9% with pnl +3%: drawdown condition not met.
        assert_eq!(scan_close_triggers(&pos, dec!(30900), now), None);

        // Raise the high so that a >=3% drop still leaves >=2% profit.
        pos.observe_price(dec!(31800));
        let trigger = scan_close_triggers(&pos, dec!(30800), now);
        match trigger {
            Some(CloseTrigger::TrailingTakeProfit { pnl_pct, drop_pct }) => {
                assert!(pnl_pct >= TAKE_PROFIT_MIN_PCT);
                assert!(drop_pct >= TRAILING_DRAWDOWN_PCT);
            }
            other => panic!("expected trailing take-profit, got {other:?}"),
        }
    }

    #[test]
    fn trailing_respects_minimum_hold() {
        let now = Utc::now();
        let mut pos = long(dec!(30000), 5); // only 5 minutes old
        pos.observe_price(dec!(31800));
        assert_eq!(scan_close_triggers(&pos, dec!(30800), now), None);
    }

    #[test]
    fn signal_close_blocked_by_min_hold_then_min_profit() {
        let now = Utc::now();

        let young = long(dec!(100), 5);
        let decision = evaluate_signal_close(&young, dec!(103), now);
        assert!(matches!(decision, GuardDecision::Block { ref reason } if reason.contains("minimum required: 15")));

        let old_low_profit = long(dec!(100), 30);
        let decision = evaluate_signal_close(&old_low_profit, dec!(101), now);
        assert!(matches!(decision, GuardDecision::Block { ref reason } if reason.contains("minimum required")));

        let old_in_profit = long(dec!(100), 30);
        assert!(evaluate_signal_close(&old_in_profit, dec!(103), now).is_allowed());
    }

    #[test]
    fn loss_prevention_blocks_underwater_closes() {
        // -1% is above the stop-loss floor but below entry; min-profit
        // already blocks it, and the loss-prevention guard backs it up.
        let pos = long(dec!(100), 30);
        let decision = evaluate_signal_close(&pos, dec!(99), Utc::now());
        assert!(!decision.is_allowed());
    }

    #[test]
    fn open_guards_enforce_confidence_and_budget() {
        let ok = OpenContext {
            confidence: dec!(0.7),
            tradable: true,
            net_spent: dec!(40),
            budget_cap: dec!(100),
        };
        assert!(evaluate_open(&ok).is_allowed());
        assert_eq!(ok.remaining_budget(), dec!(60));

        let weak = OpenContext { confidence: dec!(0.59), ..ok.clone() };
        assert!(!evaluate_open(&weak).is_allowed());

        let untradable = OpenContext { tradable: false, ..ok.clone() };
        assert!(!evaluate_open(&untradable).is_allowed());

        let exhausted = OpenContext { net_spent: dec!(100), ..ok };
        assert!(!evaluate_open(&exhausted).is_allowed());
    }

    fn order_with(
        fills: Vec<Fill>,
        executed_qty: Decimal,
        cumulative: Option<Decimal>,
        price: Option<Decimal>,
    ) -> Order {
        Order {
            order_id: "42".to_string(),
            client_order_id: None,
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            side: Side::Buy,
            status: OrderStatus::Filled,
            orig_qty: executed_qty,
            executed_qty,
            cumulative_quote_qty: cumulative,
            price,
            fills,
            transact_time: Some(Utc::now()),
        }
    }

    #[test]
    fn derivation_prefers_fill_quote_amounts() {
        let order = order_with(
            vec![
                Fill { qty: dec!(0.5), price: Some(dec!(30000)), quote_qty: Some(dec!(15000)) },
                Fill { qty: dec!(0.5), price: Some(dec!(30100)), quote_qty: Some(dec!(15050)) },
            ],
            dec!(1),
            Some(dec!(99999)), // ignored: fills win
            Some(dec!(1)),
        );
        assert_eq!(execution_price_from_order(&order), Some(dec!(30050)));
    }

    #[test]
    fn derivation_falls_back_through_the_chain() {
        // Fills without quote amounts: price * qty.
        let order = order_with(
            vec![Fill { qty: dec!(2), price: Some(dec!(50)), quote_qty: None }],
            dec!(2),
            None,
            None,
        );
        assert_eq!(execution_price_from_order(&order), Some(dec!(50)));

        // No fills: cumulative quote over executed.
        let order = order_with(Vec::new(), dec!(2), Some(dec!(100)), None);
        assert_eq!(execution_price_from_order(&order), Some(dec!(50)));

        // Only the order price.
        let order = order_with(Vec::new(), Decimal::ZERO, None, Some(dec!(50)));
        assert_eq!(execution_price_from_order(&order), Some(dec!(50)));
    }

    #[test]
    fn degenerate_order_yields_no_price() {
        // The S3 shape: FILLED claim with zero quantities and no data.
        let order = order_with(Vec::new(), Decimal::ZERO, Some(Decimal::ZERO), None);
        assert_eq!(execution_price_from_order(&order), None);
    }

    #[test]
    fn pnl_sign_follows_position_side() {
        let (abs, pct) = pnl_for_close(PositionSide::Long, dec!(100), dec!(103), dec!(2));
        assert_eq!(abs, dec!(6));
        assert_eq!(pct, dec!(3));

        let (abs, pct) = pnl_for_close(PositionSide::Short, dec!(100), dec!(97), dec!(2));
        assert_eq!(abs, dec!(6));
        assert_eq!(pct, dec!(3));
    }

    #[test]
    fn exit_reason_rederivation() {
        assert_eq!(derive_exit_reason(ExitReason::Signal, dec!(-2.5)), ExitReason::StopLoss);
        assert_eq!(derive_exit_reason(ExitReason::Signal, dec!(2.5)), ExitReason::TakeProfit);
        assert_eq!(derive_exit_reason(ExitReason::Signal, dec!(1.0)), ExitReason::Signal);
        // Manual and guard-forced closes keep their reason.
        assert_eq!(derive_exit_reason(ExitReason::Manual, dec!(5)), ExitReason::Manual);
        assert_eq!(derive_exit_reason(ExitReason::StopLoss, dec!(1)), ExitReason::StopLoss);
    }
}
