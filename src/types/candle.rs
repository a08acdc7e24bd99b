use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLCV candle. `ts` is the candle open time (UTC); a series is
/// always strictly increasing by `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(rename = "timestamp")]
    pub ts: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn change_percentage(&self) -> Decimal {
        if self.open.is_zero() {
            return Decimal::ZERO;
        }
        ((self.close - self.open) / self.open) * Decimal::from(100)
    }
}

/// Closing prices of a series, oldest first.
pub fn closes(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.close).collect()
}

pub fn highs(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.high).collect()
}

pub fn lows(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.low).collect()
}

/// True iff candle timestamps are strictly increasing.
pub fn is_strictly_ordered(candles: &[Candle]) -> bool {
    candles.windows(2).all(|w| w[0].ts < w[1].ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle(ts_min: i64, close: Decimal) -> Candle {
        Candle {
            ts: Utc.timestamp_opt(ts_min * 60, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
        }
    }

    #[test]
    fn ordering_check_catches_duplicates() {
        let ordered = vec![candle(0, dec!(1)), candle(5, dec!(2)), candle(10, dec!(3))];
        assert!(is_strictly_ordered(&ordered));

        let duplicated = vec![candle(0, dec!(1)), candle(5, dec!(2)), candle(5, dec!(2))];
        assert!(!is_strictly_ordered(&duplicated));
    }
}
