use rust_decimal::Decimal;
use super::{sma, stddev, Indicator};

#[derive(Debug, Clone, Copy)]
pub struct BollingerOutput {
    pub upper: Decimal,
    pub middle: Decimal,
    pub lower: Decimal,
}

/// SMA-centered bands at a configurable number of standard deviations.
#[derive(Debug, Clone)]
pub struct BollingerBands {
    period: usize,
    std_dev_multiplier: Decimal,
    prices: Vec<Decimal>,
    output: Option<BollingerOutput>,
}

impl BollingerBands {
    pub fn new(period: usize, std_dev_multiplier: Decimal) -> Self {
        Self {
            period,
            std_dev_multiplier,
            prices: Vec::with_capacity(period),
            output: None,
        }
    }

    pub fn default_params() -> Self {
        Self::new(20, Decimal::from(2))
    }

    pub fn update(&mut self, price: Decimal) -> Option<BollingerOutput> {
        self.prices.push(price);
        if self.prices.len() > self.period {
            self.prices.remove(0);
        }
        if self.prices.len() < self.period {
            return None;
        }

        let middle = sma(&self.prices, self.period)?;
        let deviation = stddev(&self.prices, self.period)? * self.std_dev_multiplier;
        self.output = Some(BollingerOutput {
            upper: middle + deviation,
            middle,
            lower: middle - deviation,
        });
        self.output
    }

    pub fn output(&self) -> Option<BollingerOutput> {
        self.output
    }

    /// Bands at the end of a full price series.
    pub fn over_series(prices: &[Decimal], period: usize, multiplier: Decimal) -> Option<BollingerOutput> {
        let mut bands = Self::new(period, multiplier);
        let mut last = None;
        for price in prices {
            last = bands.update(*price);
        }
        last
    }
}

impl Indicator for BollingerBands {
    fn name(&self) -> &'static str {
        "BollingerBands"
    }

    fn is_ready(&self) -> bool {
        self.output.is_some()
    }

    fn reset(&mut self) {
        self.prices.clear();
        self.output = None;
    }
}
