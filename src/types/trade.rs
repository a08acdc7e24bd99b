use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExitReason, Side, Symbol, TimeFrame, TradingMode};

/// An immutable, fully denormalized trade document. Closing trades
/// additionally carry `pnl_abs`, `pnl_pct` and `position_entry_price`
/// so P&L can be reconstructed without joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Exchange order id; doubles as the trade id for candle windows.
    pub order_id: String,
    pub bot_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    /// Realized average fill price. Always present and positive: trades
    /// without a derivable execution price are never persisted.
    pub execution_price: Decimal,
    /// Quote-asset value of the execution (`quantity * execution_price`
    /// unless the exchange reported an exact cumulative quote amount).
    pub quote_qty: Decimal,
    pub strategy: String,
    pub trading_mode: TradingMode,
    pub exit_reason: Option<ExitReason>,
    pub decision_price: Option<Decimal>,
    pub decision_ts: Option<DateTime<Utc>>,
    pub execution_ts: DateTime<Utc>,
    pub slippage_abs: Option<Decimal>,
    pub slippage_pct: Option<Decimal>,
    pub delay_seconds: Option<i64>,
    pub confidence: Decimal,
    pub indicators: serde_json::Value,
    pub pnl_abs: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
    pub position_entry_price: Option<Decimal>,
    /// For a closing SELL, the order id of the BUY that opened the position.
    pub buy_trade_id: Option<String>,
}

impl TradeRecord {
    /// Persistence-boundary validation. Rejects phantom trades before
    /// they can reach the store.
    pub fn validate(&self) -> Result<(), String> {
        if self.execution_price <= Decimal::ZERO {
            return Err(format!(
                "trade {} has non-positive execution price {}",
                self.order_id, self.execution_price
            ));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(format!("trade {} has non-positive quantity", self.order_id));
        }
        if self.quantity > Decimal::ZERO {
            let implied = self.execution_price * self.quantity;
            let tolerance = self.quote_qty.abs() * Decimal::new(1, 6);
            if (self.quote_qty - implied).abs() > tolerance.max(Decimal::new(1, 6)) {
                return Err(format!(
                    "trade {}: quote_qty {} inconsistent with {} x {}",
                    self.order_id, self.quote_qty, self.quantity, self.execution_price
                ));
            }
        }
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.position_entry_price.is_some()
    }
}

/// Configuration captured when a bot starts. Immutable afterwards,
/// except that `stopped_at` is stamped on stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub bot_id: String,
    pub strategy: super::StrategyKind,
    pub symbol: Symbol,
    /// Quote-asset budget cap. Net spent (buys minus sells) never
    /// exceeds this amount.
    pub amount: Decimal,
    pub timeframe: TimeFrame,
    pub trading_mode: TradingMode,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub started_by: Option<String>,
    pub autonomous: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(execution_price: Decimal, quantity: Decimal, quote_qty: Decimal) -> TradeRecord {
        TradeRecord {
            order_id: "1".to_string(),
            bot_id: "bot".to_string(),
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            side: Side::Buy,
            quantity,
            execution_price,
            quote_qty,
            strategy: "combined".to_string(),
            trading_mode: TradingMode::Spot,
            exit_reason: None,
            decision_price: None,
            decision_ts: None,
            execution_ts: Utc::now(),
            slippage_abs: None,
            slippage_pct: None,
            delay_seconds: None,
            confidence: dec!(0.7),
            indicators: serde_json::Value::Null,
            pnl_abs: None,
            pnl_pct: None,
            position_entry_price: None,
            buy_trade_id: None,
        }
    }

    #[test]
    fn quote_qty_must_match_price_times_quantity() {
        assert!(trade(dec!(30000), dec!(0.001), dec!(30)).validate().is_ok());
        assert!(trade(dec!(30000), dec!(0.001), dec!(31)).validate().is_err());
    }

    #[test]
    fn zero_execution_price_is_rejected() {
        assert!(trade(Decimal::ZERO, dec!(1), Decimal::ZERO).validate().is_err());
    }
}
