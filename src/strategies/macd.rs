use rust_decimal_macros::dec;
use serde_json::json;

use crate::indicators::Macd;
use crate::types::{candle::closes, Candle, SignalKind};

use super::{Strategy, StrategySignal};

/// Trades MACD line / signal line crossings at fixed 0.75 confidence.
pub struct MacdStrategy {
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
}

impl MacdStrategy {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Self {
        Self { fast_period, slow_period, signal_period }
    }
}

impl Default for MacdStrategy {
    fn default() -> Self {
        Self::new(12, 26, 9)
    }
}

impl Strategy for MacdStrategy {
    fn name(&self) -> &'static str {
        "macd"
    }

    fn min_candles(&self) -> usize {
        self.slow_period + self.signal_period
    }

    fn analyze(&self, candles: &[Candle]) -> StrategySignal {
        if candles.len() < self.min_candles() {
            return StrategySignal::degenerate(
                format!(
                    "Insufficient data for MACD calculation (need {} periods, got {})",
                    self.min_candles(),
                    candles.len()
                ),
                "insufficient_data",
            );
        }

        let closes = closes(candles);
        let mut macd = Macd::new(self.fast_period, self.slow_period, self.signal_period);
        for price in &closes {
            macd.update(*price);
        }

        let output = match macd.output() {
            Some(output) => output,
            None => {
                return StrategySignal::degenerate(
                    "MACD calculation unavailable (insufficient history)",
                    "insufficient_data",
                )
            }
        };

        let current_price = closes.last().copied().unwrap_or_default();
        let indicators = json!({
            "macd": output.macd_line,
            "macd_signal": output.signal_line,
            "macd_diff": output.histogram,
            "current_price": current_price,
        });

        if macd.crossed_above() {
            return StrategySignal {
                signal: SignalKind::Buy,
                confidence: dec!(0.75),
                reason: "MACD crossed above signal line".to_string(),
                indicators,
            };
        }
        if macd.crossed_below() {
            return StrategySignal {
                signal: SignalKind::Sell,
                confidence: dec!(0.75),
                reason: "MACD crossed below signal line".to_string(),
                indicators,
            };
        }

        StrategySignal::hold("No clear MACD signal", indicators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::candles_from_closes;
    use rust_decimal::Decimal;

    #[test]
    fn warmup_shortfall_degrades() {
        let strategy = MacdStrategy::default();
        let closes: Vec<Decimal> = (0..30).map(Decimal::from).collect();
        let signal = strategy.analyze(&candles_from_closes(&closes));
        assert!(signal.is_degenerate());
    }

    #[test]
    fn v_shaped_series_produces_buy_crossover() {
        let strategy = MacdStrategy::new(3, 6, 3);
        // Accelerating decline keeps the histogram clearly negative,
        // then a single spike flips it positive on the last candle.
        let closes: Vec<Decimal> = [100, 98, 94, 88, 80, 70, 58, 44, 28, 10, 150]
            .iter()
            .map(|v| Decimal::from(*v))
            .collect();
        let signal = strategy.analyze(&candles_from_closes(&closes));
        assert_eq!(signal.signal, SignalKind::Buy);
        assert_eq!(signal.confidence, dec!(0.75));
    }
}
