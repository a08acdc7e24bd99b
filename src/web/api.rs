use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::types::{Side, StrategyKind, Symbol, TimeFrame, TradingMode};

use super::AppState;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct StartBotRequest {
    pub strategy: String,
    pub symbol: String,
    pub amount: Decimal,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_trading_mode")]
    pub trading_mode: String,
}

fn default_timeframe() -> String {
    "5m".to_string()
}

fn default_trading_mode() -> String {
    "SPOT".to_string()
}

fn bad_request(error: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": error.into() })),
    )
}

pub async fn start_bot(
    State(state): State<AppState>,
    Json(request): Json<StartBotRequest>,
) -> impl IntoResponse {
    let Some(strategy) = StrategyKind::parse(&request.strategy) else {
        return bad_request(format!(
            "Unknown strategy '{}'. Available: {}",
            request.strategy,
            StrategyKind::all()
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    };
    let Some(symbol) = Symbol::parse(&request.symbol) else {
        return bad_request(format!("Invalid symbol '{}'", request.symbol));
    };
    let Some(timeframe) = TimeFrame::parse(&request.timeframe) else {
        return bad_request(format!(
            "Invalid timeframe '{}'. Valid timeframes: {}",
            request.timeframe,
            TimeFrame::all()
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    };
    let Some(trading_mode) = TradingMode::parse(&request.trading_mode) else {
        return bad_request(format!(
            "Invalid trading mode '{}'. Valid modes: SPOT, MARGIN, FUTURES",
            request.trading_mode
        ));
    };

    let bot = state.manager.get_bot(None).await;
    match bot
        .start(strategy, symbol, request.amount, timeframe, trading_mode)
        .await
    {
        Ok(config) => {
            let bot_id = config.bot_id.clone();
            (
                StatusCode::OK,
                Json(json!({ "success": true, "bot_id": bot_id, "config": config })),
            )
        }
        Err(error) => bad_request(error),
    }
}

pub async fn stop_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.find_bot(&bot_id).await {
        Some(bot) => match bot.stop().await {
            Ok(()) => (StatusCode::OK, Json(json!({ "success": true, "bot_id": bot_id }))),
            Err(error) => bad_request(error),
        },
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": format!("Bot {bot_id} not found") })),
        ),
    }
}

pub async fn bot_status(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.find_bot(&bot_id).await {
        Some(bot) => (StatusCode::OK, Json(bot.status().await)),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": format!("Bot {bot_id} not found") })),
        ),
    }
}

pub async fn all_bot_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.status_all().await)
}

/// Removes a stopped bot from the manager.
pub async fn remove_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.remove_bot(&bot_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true, "bot_id": bot_id }))),
        Err(error) => bad_request(error),
    }
}

#[derive(Debug, Deserialize)]
pub struct ManualTradeRequest {
    pub side: String,
    pub quantity: Option<Decimal>,
    pub amount_quote: Option<Decimal>,
}

pub async fn manual_trade(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    Json(request): Json<ManualTradeRequest>,
) -> impl IntoResponse {
    let Some(side) = Side::parse(&request.side) else {
        return bad_request(format!("Invalid side '{}'. Use BUY or SELL", request.side));
    };
    match state.manager.find_bot(&bot_id).await {
        Some(bot) => match bot
            .manual_trade(side, request.quantity, request.amount_quote)
            .await
        {
            Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
            Err(error) => bad_request(error),
        },
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": format!("Bot {bot_id} not found") })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct TradeHistoryQuery {
    pub symbol: Option<String>,
    #[serde(default = "default_trade_limit")]
    pub limit: i64,
}

fn default_trade_limit() -> i64 {
    100
}

pub async fn trade_history(
    State(state): State<AppState>,
    Query(query): Query<TradeHistoryQuery>,
) -> impl IntoResponse {
    let symbol = match &query.symbol {
        Some(s) => match Symbol::parse(s) {
            Some(symbol) => Some(symbol),
            None => return bad_request(format!("Invalid symbol '{s}'")),
        },
        None => None,
    };

    match state
        .manager
        .services()
        .db
        .trade_history(symbol.as_ref(), query.limit.clamp(1, 500))
        .await
    {
        Ok(trades) => (
            StatusCode::OK,
            Json(json!({ "success": true, "count": trades.len(), "trades": trades })),
        ),
        Err(e) => {
            warn!("Trade history query failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "trade history unavailable" })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AgentToolRequest {
    pub caller: String,
    #[serde(flatten)]
    pub tool: crate::agents::AgentTool,
}

/// Tool dispatch endpoint for the external agent wrappers.
pub async fn agent_tool(
    State(state): State<AppState>,
    Json(request): Json<AgentToolRequest>,
) -> impl IntoResponse {
    let Some(caller) = crate::agents::AgentName::parse(&request.caller) else {
        return bad_request(format!(
            "Unknown caller '{}'. Use chat, decision or execution",
            request.caller
        ));
    };
    let reply = state.autonomous.dispatch(caller, request.tool).await;
    let status = if reply.is_rejected() { StatusCode::BAD_REQUEST } else { StatusCode::OK };
    (status, Json(json!(reply)))
}

/// Streams event-bus events to the dashboard as JSON text frames.
pub async fn event_stream(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_event_socket(state, socket))
}

async fn handle_event_socket(state: AppState, socket: WebSocket) {
    let mut events = state
        .manager
        .services()
        .events
        .subscribe("websocket", 64)
        .await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(payload) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // dashboard pings are ignored
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    debug!("Event stream client disconnected");
}
