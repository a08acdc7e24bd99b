use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

use crate::types::Symbol;

use super::{ExchangeApi, ExchangeError};

/// Maximum age of a cached price before readers fall through to the
/// exchange.
pub const PRICE_CACHE_TTL: Duration = Duration::from_secs(30);

/// Shared last-price cache for all running bots.
///
/// Readers take the freshest snapshot; the cache map is written only by
/// the sweeping refresher task (and the initial prime on `track`).
/// Reads of untracked or stale symbols fall through to the exchange
/// without populating the cache.
pub struct PriceCache {
    api: Arc<dyn ExchangeApi>,
    ttl: Duration,
    prices: RwLock<HashMap<Symbol, (Decimal, Instant)>>,
    tracked: RwLock<HashSet<Symbol>>,
}

impl PriceCache {
    pub fn new(api: Arc<dyn ExchangeApi>) -> Self {
        Self {
            api,
            ttl: PRICE_CACHE_TTL,
            prices: RwLock::new(HashMap::new()),
            tracked: RwLock::new(HashSet::new()),
        }
    }

    #[cfg(test)]
    pub fn with_ttl(api: Arc<dyn ExchangeApi>, ttl: Duration) -> Self {
        Self {
            api,
            ttl,
            prices: RwLock::new(HashMap::new()),
            tracked: RwLock::new(HashSet::new()),
        }
    }

    /// Registers a symbol with the refresher and primes its entry.
    pub async fn track(&self, symbol: &Symbol) {
        self.tracked.write().await.insert(symbol.clone());
        if let Ok(price) = self.api.price(symbol).await {
            self.prices
                .write()
                .await
                .insert(symbol.clone(), (price, Instant::now()));
        }
    }

    pub async fn untrack(&self, symbol: &Symbol) {
        self.tracked.write().await.remove(symbol);
    }

    /// Cached price if fresh, otherwise a direct exchange lookup.
    pub async fn price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        if let Some((price, at)) = self.prices.read().await.get(symbol) {
            if at.elapsed() <= self.ttl {
                return Ok(*price);
            }
        }
        self.api.price(symbol).await
    }

    /// One refresher sweep over all tracked symbols.
    pub async fn refresh_all(&self) {
        let symbols: Vec<Symbol> = self.tracked.read().await.iter().cloned().collect();
        for symbol in symbols {
            match self.api.price(&symbol).await {
                Ok(price) => {
                    self.prices
                        .write()
                        .await
                        .insert(symbol.clone(), (price, Instant::now()));
                    debug!("Price cache refreshed {} = {}", symbol, price);
                }
                Err(e) if e.is_retriable() => {
                    debug!("Price refresh for {} failed transiently: {}", symbol, e);
                }
                Err(e) => {
                    warn!("Price refresh for {} failed: {}", symbol, e);
                }
            }
        }
    }

    /// Spawns the sweeping refresher. It exits when `shutdown` flips to
    /// true.
    pub fn spawn_refresher(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(PRICE_CACHE_TTL) => {
                        cache.refresh_all().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::exchange::Tradability;
    use crate::types::{
        Candle, Order, OrderRequest, SymbolFilters, SymbolMeta, TimeFrame, TradingMode,
    };

    struct CountingExchange {
        price_calls: AtomicUsize,
    }

    #[async_trait]
    impl ExchangeApi for CountingExchange {
        async fn price(&self, _symbol: &Symbol) -> Result<Decimal, ExchangeError> {
            self.price_calls.fetch_add(1, Ordering::SeqCst);
            Ok(dec!(30000))
        }

        async fn klines(
            &self,
            _symbol: &Symbol,
            _interval: TimeFrame,
            _limit: u32,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn balance(&self, _asset: &str, _mode: TradingMode) -> Result<Decimal, ExchangeError> {
            Ok(Decimal::ZERO)
        }

        async fn symbol_filters(&self, _symbol: &Symbol) -> Result<SymbolFilters, ExchangeError> {
            Err(ExchangeError::Symbol("unused".to_string()))
        }

        async fn symbol_meta(&self, _symbol: &Symbol) -> Result<SymbolMeta, ExchangeError> {
            Err(ExchangeError::Symbol("unused".to_string()))
        }

        async fn is_tradable(&self, _symbol: &Symbol) -> Result<Tradability, ExchangeError> {
            Ok(Tradability::ok())
        }

        async fn place_order(&self, _request: &OrderRequest) -> Result<Order, ExchangeError> {
            Err(ExchangeError::Permission("unused".to_string()))
        }

        async fn order_status(
            &self,
            _symbol: &Symbol,
            _order_id: &str,
            _mode: TradingMode,
        ) -> Result<Order, ExchangeError> {
            Err(ExchangeError::Permission("unused".to_string()))
        }

        async fn cancel_order(
            &self,
            _symbol: &Symbol,
            _order_id: &str,
            _mode: TradingMode,
        ) -> Result<(), ExchangeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fresh_reads_are_served_from_cache() {
        let api = Arc::new(CountingExchange { price_calls: AtomicUsize::new(0) });
        let cache = PriceCache::new(api.clone() as Arc<dyn ExchangeApi>);
        let btc = Symbol::parse("BTCUSDT").unwrap();

        cache.track(&btc).await; // one priming call
        let p1 = cache.price(&btc).await.unwrap();
        let p2 = cache.price(&btc).await.unwrap();

        assert_eq!(p1, dec!(30000));
        assert_eq!(p2, dec!(30000));
        assert_eq!(api.price_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_reads_fall_through_to_exchange() {
        let api = Arc::new(CountingExchange { price_calls: AtomicUsize::new(0) });
        let cache =
            PriceCache::with_ttl(api.clone() as Arc<dyn ExchangeApi>, Duration::from_millis(0));
        let btc = Symbol::parse("BTCUSDT").unwrap();

        cache.track(&btc).await;
        cache.price(&btc).await.unwrap();

        // Priming call plus one fall-through (TTL zero means always stale).
        assert_eq!(api.price_calls.load(Ordering::SeqCst), 2);
    }
}
