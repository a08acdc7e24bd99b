pub mod binance;
pub mod price_cache;

pub use binance::BinanceClient;
pub use price_cache::PriceCache;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{
    Candle, Order, OrderRequest, Symbol, SymbolFilters, SymbolMeta, TimeFrame, TradingMode,
};

/// Exchange failures, classified by how the caller should react.
/// Only `Transient` is worth retrying (at the next tick).
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("symbol error: {0}")]
    Symbol(String),
    #[error("filter violation: {0}")]
    Filter(String),
    #[error("rate limited: {0}")]
    Rate(String),
}

impl ExchangeError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::Transient(_) => "transient",
            ExchangeError::Permission(_) => "permission",
            ExchangeError::Symbol(_) => "symbol",
            ExchangeError::Filter(_) => "filter",
            ExchangeError::Rate(_) => "rate",
        }
    }
}

/// Whether a symbol can currently be traded; carries suggestions when
/// the symbol is unknown.
#[derive(Debug, Clone)]
pub struct Tradability {
    pub tradable: bool,
    pub reason: Option<String>,
}

impl Tradability {
    pub fn ok() -> Self {
        Self { tradable: true, reason: None }
    }

    pub fn rejected(reason: String) -> Self {
        Self { tradable: false, reason: Some(reason) }
    }
}

/// The seam between the trading core and the exchange. Bots, the risk
/// engine and the candle tracker depend on this trait; tests substitute
/// a scripted fake.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Current last price.
    async fn price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError>;

    /// Most recent `limit` candles, oldest first.
    async fn klines(
        &self,
        symbol: &Symbol,
        interval: TimeFrame,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Free balance of `asset` for the given trading mode.
    async fn balance(&self, asset: &str, mode: TradingMode) -> Result<Decimal, ExchangeError>;

    async fn symbol_filters(&self, symbol: &Symbol) -> Result<SymbolFilters, ExchangeError>;

    /// Base/quote decomposition from exchange metadata.
    async fn symbol_meta(&self, symbol: &Symbol) -> Result<SymbolMeta, ExchangeError>;

    /// True iff the exchange lists the symbol in TRADING status.
    async fn is_tradable(&self, symbol: &Symbol) -> Result<Tradability, ExchangeError>;

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError>;

    async fn order_status(
        &self,
        symbol: &Symbol,
        order_id: &str,
        mode: TradingMode,
    ) -> Result<Order, ExchangeError>;

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
        mode: TradingMode,
    ) -> Result<(), ExchangeError>;

    /// Floors to step size and clamps into the lot bounds.
    async fn adjust_to_lot(&self, symbol: &Symbol, qty: Decimal) -> Result<Decimal, ExchangeError> {
        let filters = self.symbol_filters(symbol).await?;
        Ok(filters.adjust_to_lot(qty))
    }

    /// Raises the quantity to meet MIN_NOTIONAL; `None` when infeasible.
    async fn adjust_to_notional(
        &self,
        symbol: &Symbol,
        qty: Decimal,
        price: Decimal,
    ) -> Result<Option<Decimal>, ExchangeError> {
        let filters = self.symbol_filters(symbol).await?;
        Ok(filters.adjust_to_notional(qty, price))
    }

    /// Largest buy quantity that passes both filters while staying
    /// within `budget_quote` and the free quote balance. `None` when no
    /// such quantity exists.
    async fn optimal_buy_quantity(
        &self,
        symbol: &Symbol,
        budget_quote: Decimal,
        price: Decimal,
        mode: TradingMode,
    ) -> Result<Option<Decimal>, ExchangeError> {
        if price <= Decimal::ZERO || budget_quote <= Decimal::ZERO {
            return Ok(None);
        }
        let meta = self.symbol_meta(symbol).await?;
        let balance = self.balance(&meta.quote_asset, mode).await?;
        let cap = budget_quote.min(balance);
        if cap <= Decimal::ZERO {
            return Ok(None);
        }

        let filters = self.symbol_filters(symbol).await?;
        let qty = filters.adjust_to_lot(cap / price);
        let qty = match filters.adjust_to_notional(qty, price) {
            Some(q) => q,
            None => return Ok(None),
        };
        // Lot/notional adjustment may have raised the quantity past what
        // the budget or balance covers.
        if qty <= Decimal::ZERO || qty * price > cap {
            return Ok(None);
        }
        Ok(Some(qty))
    }
}
