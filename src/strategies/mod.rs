pub mod ma_crossover;
pub mod rsi;
pub mod macd;
pub mod bollinger;
pub mod combined;

pub use ma_crossover::MaCrossoverStrategy;
pub use rsi::RsiStrategy;
pub use macd::MacdStrategy;
pub use bollinger::BollingerStrategy;
pub use combined::CombinedStrategy;

use rust_decimal::Decimal;
use serde_json::json;

use crate::types::{Candle, SignalKind, StrategyKind};

/// Result of analyzing one candle series. Strategies are pure: the same
/// series always yields the same signal, and they never fail - degenerate
/// input degrades to a zero-confidence HOLD.
#[derive(Debug, Clone)]
pub struct StrategySignal {
    pub signal: SignalKind,
    pub confidence: Decimal,
    pub reason: String,
    pub indicators: serde_json::Value,
}

impl StrategySignal {
    pub fn hold(reason: impl Into<String>, indicators: serde_json::Value) -> Self {
        Self {
            signal: SignalKind::Hold,
            confidence: Decimal::ZERO,
            reason: reason.into(),
            indicators,
        }
    }

    /// HOLD caused by unusable input (too little history, NaN-like
    /// degeneracy). Marked in the indicator map so aggregating
    /// strategies can exclude it from their vote.
    pub fn degenerate(reason: impl Into<String>, error: &str) -> Self {
        Self::hold(reason, json!({ "error": error }))
    }

    pub fn is_degenerate(&self) -> bool {
        self.indicators.get("error").is_some()
    }

    pub fn is_actionable(&self) -> bool {
        self.signal.is_actionable() && !self.is_degenerate()
    }
}

/// A trading strategy over a candle series.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candles needed before the strategy can emit a non-degenerate signal.
    fn min_candles(&self) -> usize;

    fn analyze(&self, candles: &[Candle]) -> StrategySignal;
}

pub fn strategy_for(kind: StrategyKind) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::MaCrossover => Box::new(MaCrossoverStrategy::default()),
        StrategyKind::Rsi => Box::new(RsiStrategy::default()),
        StrategyKind::Macd => Box::new(MacdStrategy::default()),
        StrategyKind::BollingerBands => Box::new(BollingerStrategy::default()),
        StrategyKind::Combined => Box::new(CombinedStrategy::default()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_signals_are_not_actionable() {
        let signal = StrategySignal::degenerate("no data", "insufficient_data");
        assert!(signal.is_degenerate());
        assert!(!signal.is_actionable());
        assert_eq!(signal.confidence, Decimal::ZERO);
    }
}
