use rust_decimal::Decimal;
use super::Indicator;

/// Wilder-smoothed relative strength index.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    avg_gain: Option<Decimal>,
    avg_loss: Option<Decimal>,
    prev_price: Option<Decimal>,
    gains: Vec<Decimal>,
    losses: Vec<Decimal>,
    value: Option<Decimal>,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            avg_gain: None,
            avg_loss: None,
            prev_price: None,
            gains: Vec::with_capacity(period),
            losses: Vec::with_capacity(period),
            value: None,
        }
    }

    pub fn update(&mut self, price: Decimal) -> Option<Decimal> {
        if let Some(prev) = self.prev_price {
            let change = price - prev;
            let gain = if change > Decimal::ZERO { change } else { Decimal::ZERO };
            let loss = if change < Decimal::ZERO { change.abs() } else { Decimal::ZERO };

            if self.gains.len() < self.period {
                self.gains.push(gain);
                self.losses.push(loss);

                if self.gains.len() == self.period {
                    let sum_gain: Decimal = self.gains.iter().sum();
                    let sum_loss: Decimal = self.losses.iter().sum();
                    self.avg_gain = Some(sum_gain / Decimal::from(self.period as u32));
                    self.avg_loss = Some(sum_loss / Decimal::from(self.period as u32));
                    self.value = self.calculate();
                }
            } else if let (Some(avg_gain), Some(avg_loss)) = (self.avg_gain, self.avg_loss) {
                let period = Decimal::from(self.period as u32);
                self.avg_gain = Some((avg_gain * (period - Decimal::ONE) + gain) / period);
                self.avg_loss = Some((avg_loss * (period - Decimal::ONE) + loss) / period);
                self.value = self.calculate();
            }
        }

        self.prev_price = Some(price);
        self.value
    }

    fn calculate(&self) -> Option<Decimal> {
        match (self.avg_gain, self.avg_loss) {
            (Some(avg_gain), Some(avg_loss)) => {
                if avg_loss.is_zero() {
                    Some(Decimal::from(100))
                } else {
                    let rs = avg_gain / avg_loss;
                    Some(Decimal::from(100) - (Decimal::from(100) / (Decimal::ONE + rs)))
                }
            }
            _ => None,
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }

    /// Runs the indicator over a full price series, returning the last
    /// two RSI values (previous, current) when available.
    pub fn last_two(prices: &[Decimal], period: usize) -> Option<(Decimal, Decimal)> {
        let mut rsi = Rsi::new(period);
        let mut prev = None;
        let mut current = None;
        for price in prices {
            prev = current;
            current = rsi.update(*price);
        }
        match (prev, current) {
            (Some(p), Some(c)) => Some((p, c)),
            _ => None,
        }
    }
}

impl Indicator for Rsi {
    fn name(&self) -> &'static str {
        "RSI"
    }

    fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    fn reset(&mut self) {
        self.avg_gain = None;
        self.avg_loss = None;
        self.prev_price = None;
        self.gains.clear();
        self.losses.clear();
        self.value = None;
    }
}
