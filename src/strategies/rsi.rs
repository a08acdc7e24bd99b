use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::indicators::Rsi;
use crate::types::{candle::closes, Candle, SignalKind};

use super::{Strategy, StrategySignal};

/// Mean-reversion on RSI: buy the exit from oversold territory, sell
/// the exit from overbought, with higher conviction at the extremes.
pub struct RsiStrategy {
    period: usize,
    oversold: Decimal,
    overbought: Decimal,
}

impl RsiStrategy {
    pub fn new(period: usize, oversold: Decimal, overbought: Decimal) -> Self {
        Self { period, oversold, overbought }
    }
}

impl Default for RsiStrategy {
    fn default() -> Self {
        Self::new(14, dec!(30), dec!(70))
    }
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &'static str {
        "rsi"
    }

    fn min_candles(&self) -> usize {
        // period deltas for the seed average, plus one more value for
        // the previous-RSI comparison.
        self.period + 2
    }

    fn analyze(&self, candles: &[Candle]) -> StrategySignal {
        if candles.len() < self.min_candles() {
            return StrategySignal::degenerate(
                format!(
                    "Insufficient data for RSI calculation (need {} periods, got {})",
                    self.min_candles(),
                    candles.len()
                ),
                "insufficient_data",
            );
        }

        let closes = closes(candles);
        let (rsi_prev, rsi_current) = match Rsi::last_two(&closes, self.period) {
            Some(values) => values,
            None => {
                return StrategySignal::degenerate(
                    "RSI calculation unavailable (insufficient history)",
                    "insufficient_data",
                )
            }
        };

        if rsi_current < Decimal::ZERO || rsi_current > dec!(100) {
            return StrategySignal::degenerate(
                format!("Invalid RSI value: {rsi_current:.2}"),
                "invalid_rsi_value",
            );
        }

        let current_price = closes.last().copied().unwrap_or_default();
        let indicators = json!({
            "rsi": rsi_current,
            "rsi_prev": rsi_prev,
            "oversold_level": self.oversold,
            "overbought_level": self.overbought,
            "current_price": current_price,
        });

        if rsi_current > self.oversold && rsi_prev <= self.oversold {
            return StrategySignal {
                signal: SignalKind::Buy,
                confidence: dec!(0.7),
                reason: format!("RSI crossed above oversold level ({})", self.oversold),
                indicators,
            };
        }
        if rsi_current < self.overbought && rsi_prev >= self.overbought {
            return StrategySignal {
                signal: SignalKind::Sell,
                confidence: dec!(0.7),
                reason: format!("RSI crossed below overbought level ({})", self.overbought),
                indicators,
            };
        }
        if rsi_current < dec!(25) {
            return StrategySignal {
                signal: SignalKind::Buy,
                confidence: dec!(0.85),
                reason: format!("RSI extremely oversold ({rsi_current:.1})"),
                indicators,
            };
        }
        if rsi_current > dec!(75) {
            return StrategySignal {
                signal: SignalKind::Sell,
                confidence: dec!(0.85),
                reason: format!("RSI extremely overbought ({rsi_current:.1})"),
                indicators,
            };
        }

        StrategySignal::hold("RSI in neutral zone", indicators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::candles_from_closes;

    #[test]
    fn extreme_oversold_is_a_strong_buy() {
        let strategy = RsiStrategy::default();
        // Straight decline pins RSI near zero.
        let closes: Vec<Decimal> = (0..30).map(|i| Decimal::from(300 - i * 5)).collect();
        let signal = strategy.analyze(&candles_from_closes(&closes));
        assert_eq!(signal.signal, SignalKind::Buy);
        assert_eq!(signal.confidence, dec!(0.85));
    }

    #[test]
    fn extreme_overbought_is_a_strong_sell() {
        let strategy = RsiStrategy::default();
        let closes: Vec<Decimal> = (0..30).map(|i| Decimal::from(100 + i * 5)).collect();
        let signal = strategy.analyze(&candles_from_closes(&closes));
        assert_eq!(signal.signal, SignalKind::Sell);
        assert_eq!(signal.confidence, dec!(0.85));
    }

    #[test]
    fn short_history_degrades() {
        let strategy = RsiStrategy::default();
        let closes: Vec<Decimal> = (0..10).map(Decimal::from).collect();
        let signal = strategy.analyze(&candles_from_closes(&closes));
        assert!(signal.is_degenerate());
    }
}
