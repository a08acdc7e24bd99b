use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tracing::warn;

use crate::indicators::{sma, sqrt_decimal};
use crate::types::{Candle, MarketPhase};

/// Classification of a candle window into a market regime.
#[derive(Debug, Clone)]
pub struct PhaseAnalysis {
    pub phase: MarketPhase,
    pub confidence: Decimal,
    pub indicators: serde_json::Value,
    pub description: String,
}

impl PhaseAnalysis {
    fn unknown(description: impl Into<String>) -> Self {
        Self {
            phase: MarketPhase::Unknown,
            confidence: Decimal::ZERO,
            indicators: json!({}),
            description: description.into(),
        }
    }
}

/// Classifies a recent candle window as BULLISH, BEARISH or SIDEWAYS
/// from price change, SMA alignment, volatility of returns, higher-high
/// / lower-low patterns and momentum.
pub struct MarketPhaseAnalyzer {
    bullish_threshold: Decimal,
    bearish_threshold: Decimal,
    sideways_threshold: Decimal,
}

impl MarketPhaseAnalyzer {
    pub fn new() -> Self {
        Self {
            bullish_threshold: dec!(2.0),
            bearish_threshold: dec!(-2.0),
            sideways_threshold: dec!(0.5),
        }
    }

    pub fn analyze(&self, candles: &[Candle], lookback: usize) -> PhaseAnalysis {
        if candles.len() < lookback {
            warn!(
                "Insufficient data for phase analysis. Need {}, got {}",
                lookback,
                candles.len()
            );
            return PhaseAnalysis::unknown("Insufficient data");
        }

        let window = &candles[candles.len() - lookback..];
        let closes: Vec<Decimal> = window.iter().map(|c| c.close).collect();
        let first_price = closes[0];
        let last_price = closes[lookback - 1];
        if first_price.is_zero() {
            return PhaseAnalysis::unknown("Degenerate window (zero price)");
        }

        let price_change_pct = ((last_price - first_price) / first_price) * Decimal::from(100);
        // Rate of change over the window; tracked separately from the
        // price change so both appear in the indicator map.
        let momentum = price_change_pct;

        let sma_short = sma(&closes, 5).unwrap_or(last_price);
        let sma_long = sma(&closes, lookback).unwrap_or(last_price);

        let volatility = returns_stddev(&closes) * Decimal::from(100);

        let higher_highs = window
            .windows(2)
            .filter(|w| w[1].high > w[0].high)
            .count() as i64;
        let lower_lows = window
            .windows(2)
            .filter(|w| w[1].low < w[0].low)
            .count() as i64;

        let phase = self.determine_phase(
            price_change_pct,
            momentum,
            volatility,
            sma_short,
            sma_long,
            higher_highs,
            lower_lows,
        );
        let confidence = self.confidence(
            price_change_pct,
            momentum,
            volatility,
            sma_short,
            sma_long,
            higher_highs,
            lower_lows,
        );

        let description = match phase {
            MarketPhase::Bullish => format!(
                "Bullish market: price up {price_change_pct:.2}%, momentum {momentum:.2}%, volatility {volatility:.2}%"
            ),
            MarketPhase::Bearish => format!(
                "Bearish market: price down {:.2}%, momentum {momentum:.2}%, volatility {volatility:.2}%",
                price_change_pct.abs()
            ),
            MarketPhase::Sideways => format!(
                "Sideways market: price move {price_change_pct:.2}%, momentum {momentum:.2}%, volatility {volatility:.2}%"
            ),
            MarketPhase::Unknown => "Unclear market phase".to_string(),
        };

        PhaseAnalysis {
            phase,
            confidence,
            indicators: json!({
                "price_change_pct": price_change_pct.round_dp(2),
                "momentum": momentum.round_dp(2),
                "volatility": volatility.round_dp(2),
                "sma_short": sma_short.round_dp(8),
                "sma_long": sma_long.round_dp(8),
                "higher_highs": higher_highs,
                "lower_lows": lower_lows,
                "trend_strength": momentum.abs().round_dp(2),
            }),
            description,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn determine_phase(
        &self,
        price_change_pct: Decimal,
        momentum: Decimal,
        volatility: Decimal,
        sma_short: Decimal,
        sma_long: Decimal,
        higher_highs: i64,
        lower_lows: i64,
    ) -> MarketPhase {
        if price_change_pct > self.bullish_threshold && momentum > dec!(1.0) {
            if higher_highs > lower_lows && sma_short > sma_long {
                return MarketPhase::Bullish;
            }
            if higher_highs > lower_lows * 2 {
                return MarketPhase::Bullish;
            }
        }

        if price_change_pct < self.bearish_threshold && momentum < dec!(-1.0) {
            if lower_lows > higher_highs && sma_short < sma_long {
                return MarketPhase::Bearish;
            }
            if lower_lows > higher_highs * 2 {
                return MarketPhase::Bearish;
            }
        }

        if price_change_pct.abs() < self.sideways_threshold {
            return MarketPhase::Sideways;
        }
        if volatility < dec!(1.0) && momentum.abs() < dec!(0.5) {
            return MarketPhase::Sideways;
        }

        if price_change_pct > Decimal::ZERO {
            MarketPhase::Bullish
        } else if price_change_pct < Decimal::ZERO {
            MarketPhase::Bearish
        } else {
            MarketPhase::Sideways
        }
    }

    /// Bounded weighted blend of change magnitude, momentum, SMA
    /// alignment and pattern share, attenuated when volatility is high.
    #[allow(clippy::too_many_arguments)]
    fn confidence(
        &self,
        price_change_pct: Decimal,
        momentum: Decimal,
        volatility: Decimal,
        sma_short: Decimal,
        sma_long: Decimal,
        higher_highs: i64,
        lower_lows: i64,
    ) -> Decimal {
        let base = (price_change_pct.abs() / dec!(5.0)).min(Decimal::ONE);
        let momentum_confirmation = (momentum.abs() / dec!(3.0)).min(Decimal::ONE);

        let aligned = (sma_short > sma_long && price_change_pct > Decimal::ZERO)
            || (sma_short < sma_long && price_change_pct < Decimal::ZERO);
        let sma_confirmation = if aligned { Decimal::ONE } else { dec!(0.5) };

        let total_patterns = higher_highs + lower_lows;
        let pattern_confirmation = if total_patterns > 0 {
            let leading = if price_change_pct > Decimal::ZERO { higher_highs } else { lower_lows };
            Decimal::from(leading) / Decimal::from(total_patterns)
        } else {
            dec!(0.5)
        };

        let volatility_factor = dec!(0.5).max(Decimal::ONE - volatility / dec!(5.0));

        let confidence = (base * dec!(0.3)
            + momentum_confirmation * dec!(0.25)
            + sma_confirmation * dec!(0.25)
            + pattern_confirmation * dec!(0.2))
            * volatility_factor;

        confidence.clamp(Decimal::ZERO, Decimal::ONE).round_dp(2)
    }
}

impl Default for MarketPhaseAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sample standard deviation of candle-to-candle percentage returns.
fn returns_stddev(closes: &[Decimal]) -> Decimal {
    let returns: Vec<Decimal> = closes
        .windows(2)
        .filter(|w| !w[0].is_zero())
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return Decimal::ZERO;
    }
    let n = Decimal::from(returns.len() as u64);
    let mean: Decimal = returns.iter().sum::<Decimal>() / n;
    let variance: Decimal = returns
        .iter()
        .map(|r| {
            let diff = *r - mean;
            diff * diff
        })
        .sum::<Decimal>()
        / (n - Decimal::ONE);
    sqrt_decimal(variance)
}
