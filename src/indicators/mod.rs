pub mod ema;
pub mod rsi;
pub mod macd;
pub mod bollinger;

pub use ema::*;
pub use rsi::*;
pub use macd::*;
pub use bollinger::*;

use rust_decimal::Decimal;

pub trait Indicator {
    fn name(&self) -> &'static str;
    fn is_ready(&self) -> bool;
    fn reset(&mut self);
}

/// Simple moving average over the trailing `period` values.
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: Decimal = values.iter().rev().take(period).sum();
    Some(sum / Decimal::from(period as u32))
}

/// SMA over the trailing `period` values ending `offset` entries before
/// the last one. `offset = 0` is the same as [`sma`]; `offset = 1`
/// gives the previous candle's value, used for crossover detection.
pub fn sma_at(values: &[Decimal], period: usize, offset: usize) -> Option<Decimal> {
    if values.len() < offset {
        return None;
    }
    sma(&values[..values.len() - offset], period)
}

/// Population standard deviation over the trailing `period` values.
pub fn stddev(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let mean = sma(values, period)?;
    let variance: Decimal = values
        .iter()
        .rev()
        .take(period)
        .map(|v| {
            let diff = *v - mean;
            diff * diff
        })
        .sum::<Decimal>()
        / Decimal::from(period as u32);

    Some(sqrt_decimal(variance))
}

/// Newton-iteration square root; good to ~10 decimal places.
pub fn sqrt_decimal(value: Decimal) -> Decimal {
    if value.is_zero() || value.is_sign_negative() {
        return Decimal::ZERO;
    }

    let mut guess = value / Decimal::from(2);
    if guess.is_zero() {
        guess = value;
    }
    let epsilon = Decimal::new(1, 10);

    for _ in 0..50 {
        let new_guess = (guess + value / guess) / Decimal::from(2);
        if (new_guess - guess).abs() < epsilon {
            return new_guess;
        }
        guess = new_guess;
    }
    guess
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sma_of_trailing_window() {
        let values = vec![dec!(1), dec!(2), dec!(3), dec!(4)];
        assert_eq!(sma(&values, 2), Some(dec!(3.5)));
        assert_eq!(sma(&values, 4), Some(dec!(2.5)));
        assert_eq!(sma(&values, 5), None);
    }

    #[test]
    fn sma_at_offset_sees_previous_candle() {
        let values = vec![dec!(1), dec!(2), dec!(3), dec!(4)];
        assert_eq!(sma_at(&values, 2, 0), Some(dec!(3.5)));
        assert_eq!(sma_at(&values, 2, 1), Some(dec!(2.5)));
    }

    #[test]
    fn sqrt_converges() {
        let root = sqrt_decimal(dec!(2));
        assert!((root - dec!(1.41421356)).abs() < dec!(0.0000001));
        assert_eq!(sqrt_decimal(Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn stddev_population() {
        // Values 2,4,4,4,5,5,7,9 have population stddev 2.
        let values: Vec<Decimal> =
            [2, 4, 4, 4, 5, 5, 7, 9].iter().map(|v| Decimal::from(*v)).collect();
        let sd = stddev(&values, 8).unwrap();
        assert!((sd - dec!(2)).abs() < dec!(0.0000001));
    }
}
