use rust_decimal::Decimal;
use super::{ema::Ema, Indicator};

#[derive(Debug, Clone, Copy)]
pub struct MacdOutput {
    pub macd_line: Decimal,
    pub signal_line: Decimal,
    pub histogram: Decimal,
}

/// MACD line (fast EMA minus slow EMA) with a signal EMA over it.
/// Tracks the previous histogram so crossings are observable.
#[derive(Debug, Clone)]
pub struct Macd {
    fast_ema: Ema,
    slow_ema: Ema,
    signal_ema: Ema,
    histogram: Option<Decimal>,
    prev_histogram: Option<Decimal>,
    output: Option<MacdOutput>,
}

impl Macd {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Self {
        Self {
            fast_ema: Ema::new(fast_period),
            slow_ema: Ema::new(slow_period),
            signal_ema: Ema::new(signal_period),
            histogram: None,
            prev_histogram: None,
            output: None,
        }
    }

    pub fn default_params() -> Self {
        Self::new(12, 26, 9)
    }

    pub fn update(&mut self, price: Decimal) -> Option<MacdOutput> {
        let fast = self.fast_ema.update(price);
        let slow = self.slow_ema.update(price);

        if let (Some(f), Some(s)) = (fast, slow) {
            let macd_line = f - s;
            if let Some(signal) = self.signal_ema.update(macd_line) {
                self.prev_histogram = self.histogram;
                let histogram = macd_line - signal;
                self.histogram = Some(histogram);
                self.output = Some(MacdOutput { macd_line, signal_line: signal, histogram });
                return self.output;
            }
        }
        None
    }

    pub fn output(&self) -> Option<MacdOutput> {
        self.output
    }

    /// MACD line crossed above the signal line on the latest update.
    pub fn crossed_above(&self) -> bool {
        match (self.histogram, self.prev_histogram) {
            (Some(curr), Some(prev)) => curr > Decimal::ZERO && prev <= Decimal::ZERO,
            _ => false,
        }
    }

    /// MACD line crossed below the signal line on the latest update.
    pub fn crossed_below(&self) -> bool {
        match (self.histogram, self.prev_histogram) {
            (Some(curr), Some(prev)) => curr < Decimal::ZERO && prev >= Decimal::ZERO,
            _ => false,
        }
    }
}

impl Indicator for Macd {
    fn name(&self) -> &'static str {
        "MACD"
    }

    fn is_ready(&self) -> bool {
        self.histogram.is_some()
    }

    fn reset(&mut self) {
        self.fast_ema.reset();
        self.slow_ema.reset();
        self.signal_ema.reset();
        self.histogram = None;
        self.prev_histogram = None;
        self.output = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn detects_bullish_crossover() {
        let mut macd = Macd::new(2, 4, 2);
        // A falling then sharply rising series forces the MACD line
        // through its signal line.
        let prices = [
            dec!(10), dec!(9), dec!(8), dec!(7), dec!(6), dec!(5),
            dec!(4), dec!(3), dec!(8), dec!(12), dec!(16),
        ];
        let mut crossed = false;
        for p in prices {
            macd.update(p);
            crossed |= macd.crossed_above();
        }
        assert!(crossed);
    }

    #[test]
    fn not_ready_before_warmup() {
        let mut macd = Macd::default_params();
        for i in 1..30 {
            macd.update(Decimal::from(i));
        }
        // 12/26/9 needs 26 + 9 - 1 = 34 points for the signal EMA.
        assert!(!macd.is_ready());
        for i in 30..40 {
            macd.update(Decimal::from(i));
        }
        assert!(macd.is_ready());
    }
}
