use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use crate::types::{Candle, SignalKind};

use super::{MaCrossoverStrategy, MacdStrategy, RsiStrategy, Strategy, StrategySignal};

/// Majority vote over MA-crossover, RSI and MACD. Emits BUY/SELL only
/// when at least two of the sub-strategies that produced a usable
/// signal agree; degrades gracefully as sub-strategies drop out.
pub struct CombinedStrategy {
    ma: MaCrossoverStrategy,
    rsi: RsiStrategy,
    macd: MacdStrategy,
}

impl Default for CombinedStrategy {
    fn default() -> Self {
        Self {
            ma: MaCrossoverStrategy::default(),
            rsi: RsiStrategy::default(),
            macd: MacdStrategy::default(),
        }
    }
}

impl Strategy for CombinedStrategy {
    fn name(&self) -> &'static str {
        "combined"
    }

    fn min_candles(&self) -> usize {
        // The smallest sub-strategy warm-up; the vote tolerates the
        // others still being degenerate.
        self.rsi.min_candles()
    }

    fn analyze(&self, candles: &[Candle]) -> StrategySignal {
        let ma = self.ma.analyze(candles);
        let rsi = self.rsi.analyze(candles);
        let macd = self.macd.analyze(candles);

        let subs = [&ma, &rsi, &macd];
        let valid = subs.iter().filter(|s| !s.is_degenerate()).count();
        let buys = subs
            .iter()
            .filter(|s| !s.is_degenerate() && s.signal == SignalKind::Buy)
            .count();
        let sells = subs
            .iter()
            .filter(|s| !s.is_degenerate() && s.signal == SignalKind::Sell)
            .count();

        let current_price = candles.last().map(|c| c.close).unwrap_or_default();
        let indicators = json!({
            "buy_signals": buys,
            "sell_signals": sells,
            "valid_strategies": valid,
            "current_price": current_price,
            "sub_strategies": {
                "ma_crossover": { "signal": ma.signal.as_str(), "confidence": ma.confidence },
                "rsi": { "signal": rsi.signal.as_str(), "confidence": rsi.confidence },
                "macd": { "signal": macd.signal.as_str(), "confidence": macd.confidence },
            },
        });

        if valid == 0 {
            return StrategySignal::degenerate(
                "All strategies failed (insufficient data or calculation errors)",
                "no_valid_strategies",
            );
        }

        let agreement_confidence = |agree: usize| {
            dec!(0.6) + (Decimal::from(agree as u32) / Decimal::from(valid as u32)) * dec!(0.3)
        };

        if buys >= 2 {
            return StrategySignal {
                signal: SignalKind::Buy,
                confidence: agreement_confidence(buys),
                reason: format!("{buys}/{valid} indicators suggest BUY"),
                indicators,
            };
        }
        if sells >= 2 {
            return StrategySignal {
                signal: SignalKind::Sell,
                confidence: agreement_confidence(sells),
                reason: format!("{sells}/{valid} indicators suggest SELL"),
                indicators,
            };
        }

        StrategySignal::hold(
            format!("Mixed signals: {buys} BUY, {sells} SELL from {valid} valid indicators"),
            indicators,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::candles_from_closes;

    #[test]
    fn empty_series_is_degenerate() {
        let strategy = CombinedStrategy::default();
        let signal = strategy.analyze(&[]);
        assert!(signal.is_degenerate());
        assert_eq!(signal.confidence, Decimal::ZERO);
    }

    #[test]
    fn lone_buy_vote_holds() {
        let strategy = CombinedStrategy::default();
        // Enough candles for RSI only; a straight decline makes RSI
        // scream BUY, but one vote is not a majority.
        let closes: Vec<Decimal> = (0..18).map(|i| Decimal::from(500 - i * 10)).collect();
        let signal = strategy.analyze(&candles_from_closes(&closes));
        assert_eq!(signal.signal, SignalKind::Hold);
        assert!(!signal.is_degenerate());
    }

    #[test]
    fn two_votes_carry_the_decision() {
        let strategy = CombinedStrategy::default();
        // Long slide into a deep oversold market: RSI pins low (BUY)
        // and eventually the extreme-band rules of the other
        // strategies line up; assert only the contract that a 2-vote
        // majority yields confidence in [0.6, 0.9].
        let closes: Vec<Decimal> = (0..80).map(|i| Decimal::from(4000 - i * 40)).collect();
        let signal = strategy.analyze(&candles_from_closes(&closes));
        if signal.signal.is_actionable() {
            assert!(signal.confidence >= dec!(0.6));
            assert!(signal.confidence <= dec!(0.9));
        }
    }
}
