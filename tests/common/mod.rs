use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cryptofleet::config::Settings;
use cryptofleet::engine::Services;
use cryptofleet::exchange::{ExchangeApi, ExchangeError, Tradability};
use cryptofleet::storage::Database;
use cryptofleet::types::{
    Candle, Fill, Order, OrderRequest, OrderStatus, Symbol, SymbolFilters, SymbolMeta, TimeFrame,
    TradingMode,
};

/// Scripted exchange double: fills every market order at the current
/// fake price, or returns degenerate replies when told to.
pub struct FakeExchange {
    price: Mutex<Decimal>,
    klines: Mutex<Vec<Candle>>,
    balances: Mutex<HashMap<String, Decimal>>,
    filters: SymbolFilters,
    next_order_id: AtomicU64,
    orders: Mutex<HashMap<String, Order>>,
    pub placed: Mutex<Vec<OrderRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    degenerate_replies: AtomicBool,
}

impl FakeExchange {
    pub fn new(initial_price: Decimal) -> Arc<Self> {
        Arc::new(Self {
            price: Mutex::new(initial_price),
            klines: Mutex::new(flat_series(initial_price, 60, Utc::now())),
            balances: Mutex::new(HashMap::from([("USDT".to_string(), dec!(10000))])),
            filters: SymbolFilters {
                min_qty: dec!(0.00001),
                max_qty: dec!(9000),
                step_size: dec!(0.00001),
                min_notional: dec!(10),
            },
            next_order_id: AtomicU64::new(1),
            orders: Mutex::new(HashMap::new()),
            placed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            degenerate_replies: AtomicBool::new(false),
        })
    }

    pub fn set_price(&self, price: Decimal) {
        *self.price.lock().unwrap() = price;
    }

    pub fn set_klines(&self, candles: Vec<Candle>) {
        *self.klines.lock().unwrap() = candles;
    }

    pub fn set_balance(&self, asset: &str, amount: Decimal) {
        self.balances.lock().unwrap().insert(asset.to_string(), amount);
    }

    /// Switches order placement and status lookups to the degenerate
    /// shape: FILLED with zero quantities, no fills, no price.
    pub fn set_degenerate_replies(&self, on: bool) {
        self.degenerate_replies.store(on, Ordering::SeqCst);
    }

    pub fn placed_count(&self) -> usize {
        self.placed.lock().unwrap().len()
    }

    pub fn placed_sides(&self) -> Vec<String> {
        self.placed
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.side.as_str().to_string())
            .collect()
    }

    fn degenerate_order(&self, order_id: String, request: &OrderRequest) -> Order {
        Order {
            order_id,
            client_order_id: Some(request.client_order_id.clone()),
            symbol: request.symbol.clone(),
            side: request.side,
            status: OrderStatus::Filled,
            orig_qty: request.quantity,
            executed_qty: Decimal::ZERO,
            cumulative_quote_qty: Some(Decimal::ZERO),
            price: None,
            fills: Vec::new(),
            transact_time: Some(Utc::now()),
        }
    }
}

#[async_trait]
impl ExchangeApi for FakeExchange {
    async fn price(&self, _symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        Ok(*self.price.lock().unwrap())
    }

    async fn klines(
        &self,
        _symbol: &Symbol,
        _interval: TimeFrame,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let candles = self.klines.lock().unwrap().clone();
        let skip = candles.len().saturating_sub(limit as usize);
        Ok(candles[skip..].to_vec())
    }

    async fn balance(&self, asset: &str, _mode: TradingMode) -> Result<Decimal, ExchangeError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn symbol_filters(&self, _symbol: &Symbol) -> Result<SymbolFilters, ExchangeError> {
        Ok(self.filters.clone())
    }

    async fn symbol_meta(&self, symbol: &Symbol) -> Result<SymbolMeta, ExchangeError> {
        let base = symbol.as_str().trim_end_matches("USDT").to_string();
        Ok(SymbolMeta {
            symbol: symbol.clone(),
            base_asset: base,
            quote_asset: "USDT".to_string(),
            status: "TRADING".to_string(),
        })
    }

    async fn is_tradable(&self, _symbol: &Symbol) -> Result<Tradability, ExchangeError> {
        Ok(Tradability::ok())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.placed.lock().unwrap().push(request.clone());

        let order = if self.degenerate_replies.load(Ordering::SeqCst) {
            self.degenerate_order(order_id, request)
        } else {
            let price = *self.price.lock().unwrap();
            Order {
                order_id,
                client_order_id: Some(request.client_order_id.clone()),
                symbol: request.symbol.clone(),
                side: request.side,
                status: OrderStatus::Filled,
                orig_qty: request.quantity,
                executed_qty: request.quantity,
                cumulative_quote_qty: Some(request.quantity * price),
                price: None,
                fills: vec![Fill {
                    qty: request.quantity,
                    price: Some(price),
                    quote_qty: Some(request.quantity * price),
                }],
                transact_time: Some(Utc::now()),
            }
        };
        self.orders
            .lock()
            .unwrap()
            .insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn order_status(
        &self,
        _symbol: &Symbol,
        order_id: &str,
        _mode: TradingMode,
    ) -> Result<Order, ExchangeError> {
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::Symbol(format!("order {order_id} unknown")))
    }

    async fn cancel_order(
        &self,
        _symbol: &Symbol,
        order_id: &str,
        _mode: TradingMode,
    ) -> Result<(), ExchangeError> {
        self.cancelled.lock().unwrap().push(order_id.to_string());
        Ok(())
    }
}

/// A flat candle series (every OHLC equal) ending at `end`, spaced five
/// minutes apart. Flat series keep every strategy on HOLD.
pub fn flat_series(price: Decimal, count: usize, end: DateTime<Utc>) -> Vec<Candle> {
    (0..count)
        .map(|i| Candle {
            ts: end - Duration::minutes(5 * (count - 1 - i) as i64),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: Decimal::ONE,
        })
        .collect()
}

pub fn test_settings() -> Settings {
    Settings {
        api_key: "test-key".to_string(),
        api_secret: "test-secret".to_string(),
        use_testnet: false,
        database_url: "sqlite::memory:".to_string(),
        web_port: 8000,
        news_enabled: false,
    }
}

pub async fn test_services(exchange: Arc<FakeExchange>) -> Arc<Services> {
    let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
    Services::new(exchange as Arc<dyn ExchangeApi>, db, test_settings())
}

pub fn btc() -> Symbol {
    Symbol::parse("BTCUSDT").unwrap()
}
