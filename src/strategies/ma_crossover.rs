use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::indicators::{sma, sma_at};
use crate::types::{candle::closes, Candle, SignalKind};

use super::{Strategy, StrategySignal};

/// BUY when the fast SMA crosses above the slow SMA, SELL on the
/// opposite cross. Confidence grows with the distance between the
/// averages relative to price, capped at 0.9.
pub struct MaCrossoverStrategy {
    fast_period: usize,
    slow_period: usize,
}

impl MaCrossoverStrategy {
    pub fn new(fast_period: usize, slow_period: usize) -> Self {
        Self { fast_period, slow_period }
    }
}

impl Default for MaCrossoverStrategy {
    fn default() -> Self {
        Self::new(20, 50)
    }
}

impl Strategy for MaCrossoverStrategy {
    fn name(&self) -> &'static str {
        "ma_crossover"
    }

    fn min_candles(&self) -> usize {
        // One extra candle so the previous averages exist for cross detection.
        self.slow_period + 1
    }

    fn analyze(&self, candles: &[Candle]) -> StrategySignal {
        if candles.len() < self.min_candles() {
            return StrategySignal::degenerate(
                format!(
                    "Insufficient data for MA calculation (need {} periods, got {})",
                    self.min_candles(),
                    candles.len()
                ),
                "insufficient_data",
            );
        }

        let closes = closes(candles);
        let (fast, slow, fast_prev, slow_prev) = match (
            sma(&closes, self.fast_period),
            sma(&closes, self.slow_period),
            sma_at(&closes, self.fast_period, 1),
            sma_at(&closes, self.slow_period, 1),
        ) {
            (Some(f), Some(s), Some(fp), Some(sp)) => (f, s, fp, sp),
            _ => {
                return StrategySignal::degenerate(
                    "SMA calculation unavailable (insufficient history)",
                    "insufficient_data",
                )
            }
        };

        let current_price = closes.last().copied().unwrap_or_default();
        let indicators = json!({
            "sma_fast": fast,
            "sma_slow": slow,
            "current_price": current_price,
        });

        let confidence_for = |fast: Decimal, slow: Decimal| {
            let distance = if current_price > Decimal::ZERO {
                (fast - slow).abs() / current_price
            } else {
                Decimal::ZERO
            };
            dec!(0.9).min(dec!(0.6) + distance * Decimal::from(100))
        };

        if fast > slow && fast_prev <= slow_prev {
            return StrategySignal {
                signal: SignalKind::Buy,
                confidence: confidence_for(fast, slow),
                reason: format!(
                    "Fast SMA ({}) crossed above Slow SMA ({})",
                    self.fast_period, self.slow_period
                ),
                indicators,
            };
        }
        if fast < slow && fast_prev >= slow_prev {
            return StrategySignal {
                signal: SignalKind::Sell,
                confidence: confidence_for(fast, slow),
                reason: format!(
                    "Fast SMA ({}) crossed below Slow SMA ({})",
                    self.fast_period, self.slow_period
                ),
                indicators,
            };
        }

        StrategySignal::hold("No clear signal", indicators)
    }
}
