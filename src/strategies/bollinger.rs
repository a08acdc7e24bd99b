use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::indicators::BollingerBands;
use crate::types::{candle::closes, Candle, SignalKind};

use super::{Strategy, StrategySignal};

/// Trades band touches: a bounce off the lower band is a buy, a
/// rejection at the upper band is a sell, and a close more than 2%
/// beyond a band is a stronger, stretched-market entry.
pub struct BollingerStrategy {
    period: usize,
    std_dev: Decimal,
}

impl BollingerStrategy {
    pub fn new(period: usize, std_dev: Decimal) -> Self {
        Self { period, std_dev }
    }
}

impl Default for BollingerStrategy {
    fn default() -> Self {
        Self::new(20, dec!(2))
    }
}

impl Strategy for BollingerStrategy {
    fn name(&self) -> &'static str {
        "bollinger_bands"
    }

    fn min_candles(&self) -> usize {
        self.period + 1
    }

    fn analyze(&self, candles: &[Candle]) -> StrategySignal {
        if candles.len() < self.min_candles() {
            return StrategySignal::degenerate(
                format!(
                    "Insufficient data for Bollinger Bands calculation (need {} periods, got {})",
                    self.min_candles(),
                    candles.len()
                ),
                "insufficient_data",
            );
        }

        let closes = closes(candles);
        let bands = match BollingerBands::over_series(&closes, self.period, self.std_dev) {
            Some(bands) => bands,
            None => {
                return StrategySignal::degenerate(
                    "Bollinger Bands calculation unavailable (insufficient history)",
                    "insufficient_data",
                )
            }
        };

        if !(bands.upper >= bands.middle && bands.middle >= bands.lower) {
            return StrategySignal::degenerate(
                "Invalid Bollinger Bands calculation (bands not in correct order)",
                "invalid_band_order",
            );
        }

        let price = closes[closes.len() - 1];
        let prev_price = closes[closes.len() - 2];
        let indicators = json!({
            "bb_upper": bands.upper,
            "bb_middle": bands.middle,
            "bb_lower": bands.lower,
            "current_price": price,
        });

        if prev_price <= bands.lower && price > bands.lower {
            return StrategySignal {
                signal: SignalKind::Buy,
                confidence: dec!(0.7),
                reason: "Price bounced off lower Bollinger Band".to_string(),
                indicators,
            };
        }
        if prev_price >= bands.upper && price < bands.upper {
            return StrategySignal {
                signal: SignalKind::Sell,
                confidence: dec!(0.7),
                reason: "Price bounced off upper Bollinger Band".to_string(),
                indicators,
            };
        }
        if price < bands.lower * dec!(0.98) {
            return StrategySignal {
                signal: SignalKind::Buy,
                confidence: dec!(0.8),
                reason: "Price significantly below lower band (oversold)".to_string(),
                indicators,
            };
        }
        if price > bands.upper * dec!(1.02) {
            return StrategySignal {
                signal: SignalKind::Sell,
                confidence: dec!(0.8),
                reason: "Price significantly above upper band (overbought)".to_string(),
                indicators,
            };
        }

        StrategySignal::hold("Price within bands", indicators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::candles_from_closes;

    #[test]
    fn deep_break_below_band_is_strong_buy() {
        let strategy = BollingerStrategy::default();
        // Stable series, then a crash far below the lower band.
        let mut closes = vec![dec!(100); 25];
        closes.push(dec!(60));
        let signal = strategy.analyze(&candles_from_closes(&closes));
        assert_eq!(signal.signal, SignalKind::Buy);
        assert_eq!(signal.confidence, dec!(0.8));
    }

    #[test]
    fn within_bands_holds() {
        let strategy = BollingerStrategy::default();
        let closes: Vec<Decimal> = (0..30)
            .map(|i| dec!(100) + Decimal::from(i % 3))
            .collect();
        let signal = strategy.analyze(&candles_from_closes(&closes));
        assert_eq!(signal.signal, SignalKind::Hold);
        assert!(!signal.is_degenerate());
    }

    #[test]
    fn short_series_degrades() {
        let strategy = BollingerStrategy::default();
        let signal = strategy.analyze(&candles_from_closes(&vec![dec!(100); 10]));
        assert!(signal.is_degenerate());
    }
}
