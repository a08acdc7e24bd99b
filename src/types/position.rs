use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
            PositionSide::Flat => "NONE",
        }
    }
}

/// In-memory position of a single bot. The bot task is the only writer.
///
/// Invariant: `side == Flat` iff `size`, `entry_price` and
/// `high_price_since_entry` are all zero. For a long,
/// `high_price_since_entry >= entry_price` from the moment of entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub entry_time: Option<DateTime<Utc>>,
    pub high_price_since_entry: Decimal,
}

impl Position {
    pub fn flat() -> Self {
        Self {
            side: PositionSide::Flat,
            size: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            entry_time: None,
            high_price_since_entry: Decimal::ZERO,
        }
    }

    pub fn is_open(&self) -> bool {
        self.side != PositionSide::Flat
    }

    pub fn open_long(size: Decimal, entry_price: Decimal, entry_time: DateTime<Utc>) -> Self {
        Self {
            side: PositionSide::Long,
            size,
            entry_price,
            entry_time: Some(entry_time),
            high_price_since_entry: entry_price,
        }
    }

    pub fn open_short(size: Decimal, entry_price: Decimal, entry_time: DateTime<Utc>) -> Self {
        Self {
            side: PositionSide::Short,
            size,
            entry_price,
            entry_time: Some(entry_time),
            high_price_since_entry: entry_price,
        }
    }

    /// Adds to an open long; the entry price becomes the
    /// quantity-weighted average of both fills.
    pub fn add_to_long(&mut self, size: Decimal, price: Decimal) {
        debug_assert_eq!(self.side, PositionSide::Long);
        let total = self.size + size;
        if total.is_zero() {
            return;
        }
        self.entry_price = (self.entry_price * self.size + price * size) / total;
        self.size = total;
        if self.high_price_since_entry < price {
            self.high_price_since_entry = price;
        }
        // A weighted-average entry below the running high is fine; the
        // high must never fall below the new entry.
        if self.high_price_since_entry < self.entry_price {
            self.high_price_since_entry = self.entry_price;
        }
    }

    /// Records a price observation, tracking the high-water mark used
    /// by the trailing take-profit guard.
    pub fn observe_price(&mut self, price: Decimal) {
        if self.is_open() && price > self.high_price_since_entry {
            self.high_price_since_entry = price;
        }
    }

    /// Unrealized P&L in percent at `current_price`, sign-adjusted for
    /// shorts. `None` when flat or the entry price is unusable.
    pub fn unrealized_pnl_pct(&self, current_price: Decimal) -> Option<Decimal> {
        if !self.is_open() || self.entry_price <= Decimal::ZERO {
            return None;
        }
        let pct = match self.side {
            PositionSide::Long => (current_price - self.entry_price) / self.entry_price,
            PositionSide::Short => (self.entry_price - current_price) / self.entry_price,
            PositionSide::Flat => unreachable!(),
        };
        Some(pct * Decimal::from(100))
    }

    pub fn holding_minutes(&self, now: DateTime<Utc>) -> Option<i64> {
        self.entry_time.map(|t| (now - t).num_minutes())
    }

    /// Resets every field, restoring the flat-state invariant.
    pub fn close(&mut self) {
        *self = Self::flat();
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::flat()
    }
}
