use serde::{Deserialize, Serialize};
use std::fmt;

/// An exchange trading symbol, e.g. `BTCUSDT`.
///
/// The symbol string is opaque: base and quote assets are never derived
/// from it by suffix stripping (that corrupts pairs like `SOLBTC`), only
/// from the exchange metadata carried by [`SymbolMeta`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Normalizes to uppercase. Returns `None` for empty or
    /// non-alphanumeric input.
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_uppercase();
        if upper.is_empty() || !upper.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(Self(upper))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Base/quote decomposition as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub symbol: Symbol,
    pub base_asset: String,
    pub quote_asset: String,
    pub status: String,
}

impl SymbolMeta {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kline intervals supported by the exchange. The strings returned by
/// `as_str` are sent verbatim in kline requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
    D3,
    W1,
    Mo1,
}

impl TimeFrame {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::M1 => "1m",
            TimeFrame::M3 => "3m",
            TimeFrame::M5 => "5m",
            TimeFrame::M15 => "15m",
            TimeFrame::M30 => "30m",
            TimeFrame::H1 => "1h",
            TimeFrame::H2 => "2h",
            TimeFrame::H4 => "4h",
            TimeFrame::H6 => "6h",
            TimeFrame::H8 => "8h",
            TimeFrame::H12 => "12h",
            TimeFrame::D1 => "1d",
            TimeFrame::D3 => "3d",
            TimeFrame::W1 => "1w",
            TimeFrame::Mo1 => "1M",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(TimeFrame::M1),
            "3m" => Some(TimeFrame::M3),
            "5m" => Some(TimeFrame::M5),
            "15m" => Some(TimeFrame::M15),
            "30m" => Some(TimeFrame::M30),
            "1h" => Some(TimeFrame::H1),
            "2h" => Some(TimeFrame::H2),
            "4h" => Some(TimeFrame::H4),
            "6h" => Some(TimeFrame::H6),
            "8h" => Some(TimeFrame::H8),
            "12h" => Some(TimeFrame::H12),
            "1d" => Some(TimeFrame::D1),
            "3d" => Some(TimeFrame::D3),
            "1w" => Some(TimeFrame::W1),
            "1M" => Some(TimeFrame::Mo1),
            _ => None,
        }
    }

    pub fn all() -> &'static [TimeFrame] {
        &[
            TimeFrame::M1,
            TimeFrame::M3,
            TimeFrame::M5,
            TimeFrame::M15,
            TimeFrame::M30,
            TimeFrame::H1,
            TimeFrame::H2,
            TimeFrame::H4,
            TimeFrame::H6,
            TimeFrame::H8,
            TimeFrame::H12,
            TimeFrame::D1,
            TimeFrame::D3,
            TimeFrame::W1,
            TimeFrame::Mo1,
        ]
    }

    pub fn to_minutes(&self) -> u64 {
        match self {
            TimeFrame::M1 => 1,
            TimeFrame::M3 => 3,
            TimeFrame::M5 => 5,
            TimeFrame::M15 => 15,
            TimeFrame::M30 => 30,
            TimeFrame::H1 => 60,
            TimeFrame::H2 => 120,
            TimeFrame::H4 => 240,
            TimeFrame::H6 => 360,
            TimeFrame::H8 => 480,
            TimeFrame::H12 => 720,
            TimeFrame::D1 => 1440,
            TimeFrame::D3 => 4320,
            TimeFrame::W1 => 10080,
            // Calendar months vary; the exchange treats 1M as ~30 days.
            TimeFrame::Mo1 => 43200,
        }
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Spot,
    Margin,
    Futures,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Spot => "SPOT",
            TradingMode::Margin => "MARGIN",
            TradingMode::Futures => "FUTURES",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SPOT" => Some(TradingMode::Spot),
            "MARGIN" => Some(TradingMode::Margin),
            "FUTURES" => Some(TradingMode::Futures),
            _ => None,
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Signal emitted by a strategy for one candle series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Buy => "BUY",
            SignalKind::Sell => "SELL",
            SignalKind::Hold => "HOLD",
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, SignalKind::Hold)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Signal => "SIGNAL",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SIGNAL" => Some(ExitReason::Signal),
            "STOP_LOSS" => Some(ExitReason::StopLoss),
            "TAKE_PROFIT" => Some(ExitReason::TakeProfit),
            "MANUAL" => Some(ExitReason::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Market regime over a recent candle window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketPhase {
    Bullish,
    Bearish,
    Sideways,
    /// Not enough candles to classify.
    Unknown,
}

impl MarketPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketPhase::Bullish => "BULLISH",
            MarketPhase::Bearish => "BEARISH",
            MarketPhase::Sideways => "SIDEWAYS",
            MarketPhase::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for MarketPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The strategy a bot runs. `as_str` values are the persisted tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    MaCrossover,
    Rsi,
    Macd,
    BollingerBands,
    Combined,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::MaCrossover => "ma_crossover",
            StrategyKind::Rsi => "rsi",
            StrategyKind::Macd => "macd",
            StrategyKind::BollingerBands => "bollinger_bands",
            StrategyKind::Combined => "combined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "ma_crossover" => Some(StrategyKind::MaCrossover),
            "rsi" => Some(StrategyKind::Rsi),
            "macd" => Some(StrategyKind::Macd),
            "bollinger_bands" => Some(StrategyKind::BollingerBands),
            "combined" => Some(StrategyKind::Combined),
            _ => None,
        }
    }

    pub fn all() -> &'static [StrategyKind] {
        &[
            StrategyKind::MaCrossover,
            StrategyKind::Rsi,
            StrategyKind::Macd,
            StrategyKind::BollingerBands,
            StrategyKind::Combined,
        ]
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_normalizes_and_rejects_garbage() {
        assert_eq!(Symbol::parse("btcusdt").unwrap().as_str(), "BTCUSDT");
        assert!(Symbol::parse("").is_none());
        assert!(Symbol::parse("BTC/USDT").is_none());
    }

    #[test]
    fn timeframe_roundtrips_every_interval() {
        for tf in TimeFrame::all() {
            assert_eq!(TimeFrame::parse(tf.as_str()), Some(*tf));
        }
        assert!(TimeFrame::parse("2m").is_none());
    }

    #[test]
    fn strategy_kind_tags_roundtrip() {
        for kind in StrategyKind::all() {
            assert_eq!(StrategyKind::parse(kind.as_str()), Some(*kind));
        }
    }
}
