use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::types::{
    Candle, Fill, Order, OrderRequest, OrderStatus, Side, Symbol, SymbolFilters, SymbolMeta,
    TimeFrame, TradingMode,
};

use super::{ExchangeApi, ExchangeError, Tradability};

const BINANCE_API: &str = "https://api.binance.com";
const BINANCE_TESTNET: &str = "https://testnet.binance.vision";
const BINANCE_FUTURES_API: &str = "https://fapi.binance.com";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const KLINES_TIMEOUT: Duration = Duration::from_secs(20);
/// Exchange info changes rarely; symbol lookups reuse a cached copy.
const EXCHANGE_INFO_TTL: Duration = Duration::from_secs(600);

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceClient {
    client: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    futures_url: String,
    exchange_info: Mutex<Option<(Instant, Vec<SymbolInfo>)>>,
}

impl BinanceClient {
    pub fn new(api_key: String, secret_key: String, use_testnet: bool) -> Self {
        let base_url = if use_testnet {
            BINANCE_TESTNET.to_string()
        } else {
            BINANCE_API.to_string()
        };

        Self {
            client: Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .expect("reqwest client"),
            api_key,
            secret_key,
            base_url,
            futures_url: BINANCE_FUTURES_API.to_string(),
            exchange_info: Mutex::new(None),
        }
    }

    pub fn public_only() -> Self {
        Self::new(String::new(), String::new(), false)
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn build_signed_query(&self, params: &[(&str, String)]) -> String {
        let timestamp = Utc::now().timestamp_millis();
        let mut query_parts: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        query_parts.push(format!("timestamp={}", timestamp));
        query_parts.push("recvWindow=5000".to_string());
        let query = query_parts.join("&");
        let signature = self.sign(&query);
        format!("{}&signature={}", query, signature)
    }

    async fn classify_response(resp: reqwest::Response, context: &str) -> ExchangeError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        classify(status, &body, context)
    }

    async fn symbol_infos(&self) -> Result<Vec<SymbolInfo>, ExchangeError> {
        {
            let cache = self.exchange_info.lock().expect("exchange info lock");
            if let Some((fetched_at, infos)) = cache.as_ref() {
                if fetched_at.elapsed() < EXCHANGE_INFO_TTL {
                    return Ok(infos.clone());
                }
            }
        }

        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(transport)?;
        if !resp.status().is_success() {
            return Err(Self::classify_response(resp, "exchangeInfo").await);
        }
        let info: ExchangeInfoResponse = resp.json().await.map_err(transport)?;

        let mut cache = self.exchange_info.lock().expect("exchange info lock");
        *cache = Some((Instant::now(), info.symbols.clone()));
        Ok(info.symbols)
    }

    async fn find_symbol(&self, symbol: &Symbol) -> Result<Option<SymbolInfo>, ExchangeError> {
        let infos = self.symbol_infos().await?;
        Ok(infos.into_iter().find(|s| s.symbol == symbol.as_str()))
    }

    fn convert_order(&self, resp: OrderResponse, symbol: &Symbol) -> Result<Order, ExchangeError> {
        let fills = resp
            .fills
            .unwrap_or_default()
            .into_iter()
            .map(|f| {
                Ok(Fill {
                    qty: parse_decimal(&f.qty)?,
                    price: f.price.as_deref().map(parse_decimal).transpose()?,
                    quote_qty: f.quote_qty.as_deref().map(parse_decimal).transpose()?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;

        Ok(Order {
            order_id: resp.order_id.to_string(),
            client_order_id: resp.client_order_id,
            symbol: symbol.clone(),
            side: Side::parse(&resp.side).unwrap_or(Side::Buy),
            status: OrderStatus::parse(&resp.status),
            orig_qty: parse_decimal(&resp.orig_qty)?,
            executed_qty: parse_decimal(&resp.executed_qty)?,
            cumulative_quote_qty: resp
                .cummulative_quote_qty
                .as_deref()
                .map(parse_decimal)
                .transpose()?,
            price: resp
                .price
                .as_deref()
                .map(parse_decimal)
                .transpose()?
                .filter(|p| !p.is_zero()),
            fills,
            transact_time: resp
                .transact_time
                .and_then(|t| Utc.timestamp_millis_opt(t).single()),
        })
    }
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    async fn price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.base_url,
            symbol.as_str()
        );
        let resp = self.client.get(&url).send().await.map_err(transport)?;
        if !resp.status().is_success() {
            return Err(Self::classify_response(resp, "ticker/price").await);
        }
        let ticker: PriceResponse = resp.json().await.map_err(transport)?;
        parse_decimal(&ticker.price)
    }

    async fn klines(
        &self,
        symbol: &Symbol,
        interval: TimeFrame,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol.as_str(),
            interval.as_str(),
            limit
        );

        let resp = self
            .client
            .get(&url)
            .timeout(KLINES_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        if !resp.status().is_success() {
            return Err(Self::classify_response(resp, "klines").await);
        }
        let rows: Vec<Vec<serde_json::Value>> = resp.json().await.map_err(transport)?;

        rows.into_iter()
            .map(|k| {
                let open_time = k.first().and_then(|v| v.as_i64()).unwrap_or(0);
                let ts = Utc
                    .timestamp_millis_opt(open_time)
                    .single()
                    .ok_or_else(|| {
                        ExchangeError::Transient(format!("bad kline timestamp {open_time}"))
                    })?;
                Ok(Candle {
                    ts,
                    open: parse_decimal(k.get(1).and_then(|v| v.as_str()).unwrap_or("0"))?,
                    high: parse_decimal(k.get(2).and_then(|v| v.as_str()).unwrap_or("0"))?,
                    low: parse_decimal(k.get(3).and_then(|v| v.as_str()).unwrap_or("0"))?,
                    close: parse_decimal(k.get(4).and_then(|v| v.as_str()).unwrap_or("0"))?,
                    volume: parse_decimal(k.get(5).and_then(|v| v.as_str()).unwrap_or("0"))?,
                })
            })
            .collect()
    }

    async fn balance(&self, asset: &str, mode: TradingMode) -> Result<Decimal, ExchangeError> {
        match mode {
            TradingMode::Spot => {
                let url = format!("{}/api/v3/account", self.base_url);
                let query = self.build_signed_query(&[]);
                let resp = self
                    .client
                    .get(format!("{}?{}", url, query))
                    .header("X-MBX-APIKEY", &self.api_key)
                    .send()
                    .await
                    .map_err(transport)?;
                if !resp.status().is_success() {
                    return Err(Self::classify_response(resp, "account").await);
                }
                let account: AccountResponse = resp.json().await.map_err(transport)?;
                for balance in account.balances {
                    if balance.asset == asset {
                        return parse_decimal(&balance.free);
                    }
                }
                Ok(Decimal::ZERO)
            }
            TradingMode::Margin => {
                let url = format!("{}/sapi/v1/margin/account", self.base_url);
                let query = self.build_signed_query(&[]);
                let resp = self
                    .client
                    .get(format!("{}?{}", url, query))
                    .header("X-MBX-APIKEY", &self.api_key)
                    .send()
                    .await
                    .map_err(transport)?;
                if !resp.status().is_success() {
                    return Err(Self::classify_response(resp, "margin/account").await);
                }
                let account: MarginAccountResponse = resp.json().await.map_err(transport)?;
                for entry in account.user_assets {
                    if entry.asset == asset {
                        return parse_decimal(&entry.free);
                    }
                }
                Ok(Decimal::ZERO)
            }
            TradingMode::Futures => {
                let url = format!("{}/fapi/v2/balance", self.futures_url);
                let query = self.build_signed_query(&[]);
                let resp = self
                    .client
                    .get(format!("{}?{}", url, query))
                    .header("X-MBX-APIKEY", &self.api_key)
                    .send()
                    .await
                    .map_err(transport)?;
                if !resp.status().is_success() {
                    return Err(Self::classify_response(resp, "futures/balance").await);
                }
                let balances: Vec<FuturesBalanceResponse> =
                    resp.json().await.map_err(transport)?;
                for entry in balances {
                    if entry.asset == asset {
                        return parse_decimal(&entry.available_balance);
                    }
                }
                Ok(Decimal::ZERO)
            }
        }
    }

    async fn symbol_filters(&self, symbol: &Symbol) -> Result<SymbolFilters, ExchangeError> {
        let info = self
            .find_symbol(symbol)
            .await?
            .ok_or_else(|| ExchangeError::Symbol(format!("{symbol} not listed")))?;

        let mut filters = SymbolFilters {
            min_qty: Decimal::ZERO,
            max_qty: Decimal::ZERO,
            step_size: Decimal::ZERO,
            min_notional: Decimal::ZERO,
        };
        for f in &info.filters {
            match f.filter_type.as_str() {
                "LOT_SIZE" => {
                    filters.min_qty = parse_decimal(f.min_qty.as_deref().unwrap_or("0"))?;
                    filters.max_qty = parse_decimal(f.max_qty.as_deref().unwrap_or("0"))?;
                    filters.step_size = parse_decimal(f.step_size.as_deref().unwrap_or("0"))?;
                }
                "MIN_NOTIONAL" | "NOTIONAL" => {
                    filters.min_notional =
                        parse_decimal(f.min_notional.as_deref().unwrap_or("0"))?;
                }
                _ => {}
            }
        }
        filters
            .validate()
            .map_err(|e| ExchangeError::Filter(format!("{symbol}: {e}")))?;
        debug!("Filters for {}: {:?}", symbol, filters);
        Ok(filters)
    }

    async fn symbol_meta(&self, symbol: &Symbol) -> Result<SymbolMeta, ExchangeError> {
        let info = self
            .find_symbol(symbol)
            .await?
            .ok_or_else(|| ExchangeError::Symbol(format!("{symbol} not listed")))?;
        Ok(SymbolMeta {
            symbol: symbol.clone(),
            base_asset: info.base_asset,
            quote_asset: info.quote_asset,
            status: info.status,
        })
    }

    async fn is_tradable(&self, symbol: &Symbol) -> Result<Tradability, ExchangeError> {
        let infos = self.symbol_infos().await?;

        if let Some(info) = infos.iter().find(|s| s.symbol == symbol.as_str()) {
            if info.status == "TRADING" {
                return Ok(Tradability::ok());
            }
            return Ok(Tradability::rejected(format!(
                "Symbol {} exists but is not tradable (status: {})",
                symbol, info.status
            )));
        }

        // Unknown symbol: suggest close matches so the caller can correct a typo.
        let prefix: String = symbol.as_str().chars().take(3).collect();
        let similar: Vec<&str> = infos
            .iter()
            .filter(|s| s.status == "TRADING")
            .filter(|s| s.symbol.contains(symbol.as_str()) || s.symbol.starts_with(&prefix))
            .take(5)
            .map(|s| s.symbol.as_str())
            .collect();

        let mut reason = format!("Symbol {} not found on the exchange", symbol);
        if !similar.is_empty() {
            reason.push_str(&format!(". Did you mean: {}?", similar.join(", ")));
        }
        Ok(Tradability::rejected(reason))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order, ExchangeError> {
        let url = format!("{}/api/v3/order", self.base_url);

        let params = [
            ("symbol", request.symbol.as_str().to_string()),
            ("side", request.side.as_str().to_string()),
            ("type", request.order_type.as_str().to_string()),
            ("quantity", request.quantity.to_string()),
            ("newClientOrderId", request.client_order_id.clone()),
            // FULL responses include the fills needed for execution-price derivation.
            ("newOrderRespType", "FULL".to_string()),
        ];
        let query = self.build_signed_query(&params);

        debug!("Placing order: {:?}", request);

        let resp = self
            .client
            .post(format!("{}?{}", url, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(Self::classify_response(resp, "order").await);
        }

        let order_resp: OrderResponse = resp.json().await.map_err(transport)?;
        let order = self.convert_order(order_resp, &request.symbol)?;
        info!(
            "Order {} {} {} {} -> {:?}",
            order.order_id, request.side, request.quantity, request.symbol, order.status
        );
        Ok(order)
    }

    async fn order_status(
        &self,
        symbol: &Symbol,
        order_id: &str,
        _mode: TradingMode,
    ) -> Result<Order, ExchangeError> {
        let url = format!("{}/api/v3/order", self.base_url);
        let params = [
            ("symbol", symbol.as_str().to_string()),
            ("orderId", order_id.to_string()),
        ];
        let query = self.build_signed_query(&params);

        let resp = self
            .client
            .get(format!("{}?{}", url, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(Self::classify_response(resp, "order status").await);
        }

        let order_resp: OrderResponse = resp.json().await.map_err(transport)?;
        self.convert_order(order_resp, symbol)
    }

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        order_id: &str,
        _mode: TradingMode,
    ) -> Result<(), ExchangeError> {
        let url = format!("{}/api/v3/order", self.base_url);
        let params = [
            ("symbol", symbol.as_str().to_string()),
            ("orderId", order_id.to_string()),
        ];
        let query = self.build_signed_query(&params);

        let resp = self
            .client
            .delete(format!("{}?{}", url, query))
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            let err = Self::classify_response(resp, "cancel").await;
            warn!("Cancel of order {} failed: {}", order_id, err);
            return Err(err);
        }

        info!("Order {} cancelled", order_id);
        Ok(())
    }
}

fn transport(err: reqwest::Error) -> ExchangeError {
    ExchangeError::Transient(err.to_string())
}

fn parse_decimal(s: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(s)
        .map_err(|e| ExchangeError::Transient(format!("unparseable decimal {s:?}: {e}")))
}

/// Maps an HTTP failure to an error kind, using the Binance error code
/// when the body carries one.
fn classify(status: StatusCode, body: &str, context: &str) -> ExchangeError {
    let code = serde_json::from_str::<BinanceErrorBody>(body)
        .ok()
        .map(|b| b.code);
    let message = format!("{context}: HTTP {status} {body}");

    match (status, code) {
        (StatusCode::TOO_MANY_REQUESTS, _) | (_, Some(-1003)) => ExchangeError::Rate(message),
        (StatusCode::UNAUTHORIZED, _) | (StatusCode::FORBIDDEN, _) | (_, Some(-2015)) | (_, Some(-2014)) => {
            ExchangeError::Permission(message)
        }
        (_, Some(-1121)) => ExchangeError::Symbol(message),
        (_, Some(-1013)) | (_, Some(-2010)) => ExchangeError::Filter(message),
        (s, _) if s.is_server_error() => ExchangeError::Transient(message),
        _ => ExchangeError::Transient(message),
    }
}

// API response types

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: String,
}

#[derive(Debug, Deserialize)]
struct BinanceErrorBody {
    code: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct SymbolInfo {
    symbol: String,
    status: String,
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    #[serde(default)]
    filters: Vec<FilterInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct FilterInfo {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "minQty")]
    min_qty: Option<String>,
    #[serde(rename = "maxQty")]
    max_qty: Option<String>,
    #[serde(rename = "stepSize")]
    step_size: Option<String>,
    #[serde(rename = "minNotional")]
    min_notional: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId")]
    order_id: u64,
    #[serde(rename = "clientOrderId")]
    client_order_id: Option<String>,
    status: String,
    side: String,
    #[serde(rename = "origQty")]
    orig_qty: String,
    #[serde(rename = "executedQty")]
    executed_qty: String,
    price: Option<String>,
    #[serde(rename = "cummulativeQuoteQty")]
    cummulative_quote_qty: Option<String>,
    #[serde(rename = "transactTime")]
    transact_time: Option<i64>,
    fills: Option<Vec<FillResponse>>,
}

#[derive(Debug, Deserialize)]
struct FillResponse {
    qty: String,
    price: Option<String>,
    #[serde(rename = "quoteQty")]
    quote_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<BalanceResponse>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
struct MarginAccountResponse {
    #[serde(rename = "userAssets")]
    user_assets: Vec<BalanceResponse>,
}

#[derive(Debug, Deserialize)]
struct FuturesBalanceResponse {
    asset: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_maps_codes_to_kinds() {
        let rate = classify(StatusCode::TOO_MANY_REQUESTS, "{}", "x");
        assert_eq!(rate.kind(), "rate");

        let symbol = classify(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1121,"msg":"Invalid symbol."}"#,
            "x",
        );
        assert_eq!(symbol.kind(), "symbol");

        let filter = classify(
            StatusCode::BAD_REQUEST,
            r#"{"code":-1013,"msg":"Filter failure: MIN_NOTIONAL"}"#,
            "x",
        );
        assert_eq!(filter.kind(), "filter");

        let perm = classify(StatusCode::UNAUTHORIZED, "{}", "x");
        assert_eq!(perm.kind(), "permission");

        let transient = classify(StatusCode::BAD_GATEWAY, "", "x");
        assert!(transient.is_retriable());
        assert!(!perm.is_retriable());
    }
}
