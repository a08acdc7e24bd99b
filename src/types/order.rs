use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Side, Symbol, TradingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Unknown,
}

impl OrderStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => OrderStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
        }
    }
}

/// One partial execution reported by the exchange. `price` and
/// `quote_qty` can each be missing in degenerate replies; execution
/// price derivation handles every combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub quote_qty: Option<Decimal>,
}

/// Exchange reply for a placed or queried order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub status: OrderStatus,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub cumulative_quote_qty: Option<Decimal>,
    pub price: Option<Decimal>,
    pub fills: Vec<Fill>,
    pub transact_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub mode: TradingMode,
    pub client_order_id: String,
}

/// Per-symbol exchange filters (LOT_SIZE and MIN_NOTIONAL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
}

impl SymbolFilters {
    pub fn validate(&self) -> Result<(), String> {
        if self.step_size <= Decimal::ZERO {
            return Err(format!("step_size must be > 0, got {}", self.step_size));
        }
        if self.min_notional < Decimal::ZERO {
            return Err(format!("min_notional must be >= 0, got {}", self.min_notional));
        }
        Ok(())
    }

    /// Floors `qty` to the step size and clamps it into `[min_qty, max_qty]`.
    pub fn adjust_to_lot(&self, qty: Decimal) -> Decimal {
        let mut adjusted = if self.step_size > Decimal::ZERO {
            ((qty / self.step_size).floor() * self.step_size).normalize()
        } else {
            qty
        };
        if self.min_qty > Decimal::ZERO && adjusted < self.min_qty {
            adjusted = self.min_qty;
        }
        if self.max_qty > Decimal::ZERO && adjusted > self.max_qty {
            adjusted = self.max_qty;
        }
        adjusted
    }

    /// Raises `qty` until `qty * price >= min_notional`, stepping in
    /// `step_size` increments. Returns `None` when the requirement
    /// cannot be met within the lot bounds.
    pub fn adjust_to_notional(&self, qty: Decimal, price: Decimal) -> Option<Decimal> {
        if self.min_notional.is_zero() || qty * price >= self.min_notional {
            return Some(qty);
        }
        if price <= Decimal::ZERO || self.step_size <= Decimal::ZERO {
            return None;
        }

        let steps = (self.min_notional / price / self.step_size).ceil();
        let mut raised = (steps * self.step_size).normalize();
        if self.min_qty > Decimal::ZERO && raised < self.min_qty {
            raised = self.min_qty;
        }
        if self.max_qty > Decimal::ZERO && raised > self.max_qty {
            return None;
        }
        if raised * price < self.min_notional {
            return None;
        }
        Some(raised)
    }
}
