use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agents::AgentName;
use crate::analysis::MarketPhaseAnalyzer;
use crate::events::Event;
use crate::risk::{
    self, derive_execution_price, evaluate_open, evaluate_signal_close, scan_close_triggers,
    CloseTrigger, GuardDecision, OpenContext, TradeError, SIGNAL_MIN_CONFIDENCE,
};
use crate::strategies::{strategy_for, Strategy};
use crate::tracker::{PHASE_DURING_TRADE, PHASE_PRE_TRADE, PRE_TRADE_CANDLES};
use crate::types::{
    BotConfig, ExitReason, MarketPhase, Order, OrderRequest, OrderType, Position, PositionSide,
    Side, StrategyKind, Symbol, TimeFrame, TradeRecord, TradingMode,
};

use super::{Services, ERROR_RETRY_INTERVAL, TICK_INTERVAL};

/// Timeframes swept by the one-shot historical context analysis on start.
const CONTEXT_TIMEFRAMES: [TimeFrame; 5] = [
    TimeFrame::M5,
    TimeFrame::M15,
    TimeFrame::H1,
    TimeFrame::H4,
    TimeFrame::D1,
];

/// Minimum notional (in quote asset) for a balance snapshot to count as
/// an existing position.
const POSITION_SNAPSHOT_MIN_NOTIONAL: Decimal = Decimal::from_parts(10, 0, 0, false, 0);

/// Everything recorded at decision time, threaded through to the trade
/// record for slippage and delay accounting.
#[derive(Debug, Clone)]
struct DecisionContext {
    decision_price: Option<Decimal>,
    decision_ts: DateTime<Utc>,
    confidence: Decimal,
    indicators: Value,
    strategy_tag: String,
}

impl DecisionContext {
    fn manual() -> Self {
        Self {
            decision_price: None,
            decision_ts: Utc::now(),
            confidence: Decimal::ONE,
            indicators: json!({}),
            strategy_tag: "manual".to_string(),
        }
    }
}

/// One trading bot: a cooperative task running the
/// fetch -> phase -> strategy -> guards -> execute -> learn loop
/// against a single symbol.
pub struct TradingBot {
    bot_id: String,
    services: Arc<Services>,
    config: RwLock<Option<BotConfig>>,
    position: Mutex<Position>,
    market_phase: RwLock<Option<(MarketPhase, Decimal)>>,
    is_running: AtomicBool,
    needs_reconcile: AtomicBool,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl TradingBot {
    pub fn new(services: Arc<Services>, bot_id: Option<String>) -> Self {
        Self {
            bot_id: bot_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            services,
            config: RwLock::new(None),
            position: Mutex::new(Position::flat()),
            market_phase: RwLock::new(None),
            is_running: AtomicBool::new(false),
            needs_reconcile: AtomicBool::new(false),
            task: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub async fn config(&self) -> Option<BotConfig> {
        self.config.read().await.clone()
    }

    pub async fn position(&self) -> Position {
        self.position.lock().await.clone()
    }

    pub async fn start(
        self: &Arc<Self>,
        strategy: StrategyKind,
        symbol: Symbol,
        amount: Decimal,
        timeframe: TimeFrame,
        trading_mode: TradingMode,
    ) -> Result<BotConfig, String> {
        self.start_with_origin(strategy, symbol, amount, timeframe, trading_mode, None, false)
            .await
    }

    /// Full start entry point; the autonomous supervisor passes its
    /// origin flags through here.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_with_origin(
        self: &Arc<Self>,
        strategy: StrategyKind,
        symbol: Symbol,
        amount: Decimal,
        timeframe: TimeFrame,
        trading_mode: TradingMode,
        started_by: Option<String>,
        autonomous: bool,
    ) -> Result<BotConfig, String> {
        if self.is_running() {
            return Err(format!("Bot {} is already running", self.bot_id));
        }
        if amount <= Decimal::ZERO {
            return Err("amount must be positive".to_string());
        }

        // Testnet only supports spot trading.
        if self.services.settings.use_testnet && trading_mode != TradingMode::Spot {
            let error = format!(
                "{trading_mode} trading is not available on the testnet; only SPOT is supported"
            );
            self.emit_start_failed(&error).await;
            return Err(error);
        }

        match self.services.exchange.is_tradable(&symbol).await {
            Ok(t) if t.tradable => {}
            Ok(t) => {
                let error = t
                    .reason
                    .unwrap_or_else(|| format!("Symbol {symbol} is not tradable"));
                self.emit_start_failed(&error).await;
                return Err(error);
            }
            Err(e) => {
                let error = format!("Symbol validation failed: {e}");
                self.emit_start_failed(&error).await;
                return Err(error);
            }
        }

        let config = BotConfig {
            bot_id: self.bot_id.clone(),
            strategy,
            symbol: symbol.clone(),
            amount,
            timeframe,
            trading_mode,
            started_at: Utc::now(),
            stopped_at: None,
            started_by,
            autonomous,
        };

        // Adopt any position already held on the exchange.
        if let Err(e) = self.snapshot_position_from_balance(&config).await {
            warn!("Bot {}: position snapshot failed: {}", self.bot_id, e);
        }

        if let Err(e) = self.services.db.insert_bot_config(&config).await {
            let error = format!("Failed to persist bot config: {e}");
            self.emit_start_failed(&error).await;
            return Err(error);
        }

        // Best effort: a missing historical context never blocks the start.
        if let Err(e) = self.analyze_historical_context(&config).await {
            warn!("Bot {}: historical context analysis failed: {}", self.bot_id, e);
        }

        *self.config.write().await = Some(config.clone());
        self.is_running.store(true, Ordering::Release);
        self.services.prices.track(&symbol).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        let bot = Arc::clone(self);
        *self.task.lock().await = Some(tokio::spawn(async move {
            bot.run_loop(shutdown_rx).await;
        }));

        info!(
            "Bot {} started: strategy={}, symbol={}, amount={}",
            self.bot_id, strategy, symbol, amount
        );
        self.services
            .events
            .publish(Event::BotStarted {
                bot_id: self.bot_id.clone(),
                symbol: symbol.to_string(),
                strategy: strategy.as_str().to_string(),
            })
            .await;

        Ok(config)
    }

    pub async fn stop(&self) -> Result<(), String> {
        if !self.is_running() {
            return Err(format!("Bot {} is not running", self.bot_id));
        }
        self.is_running.store(false, Ordering::Release);

        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }

        let stopped_at = Utc::now();
        if let Some(config) = self.config.write().await.as_mut() {
            config.stopped_at = Some(stopped_at);
            if let Err(e) = self
                .services
                .db
                .mark_bot_stopped(&self.bot_id, config.started_at, stopped_at)
                .await
            {
                error!("Bot {}: failed to stamp stopped_at: {}", self.bot_id, e);
            }
        }

        info!("Bot {} stopped", self.bot_id);
        self.services
            .events
            .publish(Event::BotStopped { bot_id: self.bot_id.clone() })
            .await;
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Bot {}: starting bot loop", self.bot_id);
        while self.is_running() {
            let delay = match self.tick().await {
                Ok(()) => TICK_INTERVAL,
                Err(e) => {
                    error!("Bot {}: error in bot loop: {:#}", self.bot_id, e);
                    self.log_agent(
                        AgentName::Decision,
                        &format!("Error in trading loop: {e:#}"),
                        "error",
                    )
                    .await;
                    ERROR_RETRY_INTERVAL
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Bot {}: bot loop exited", self.bot_id);
    }

    /// One full iteration of the strategy loop. Public so tests and
    /// manual triggers can drive the bot without the 5-minute timer.
    pub async fn tick(&self) -> Result<()> {
        let Some(config) = self.config().await else {
            return Ok(());
        };
        let symbol = config.symbol.clone();
        let timeframe = config.timeframe;

        // A failed persist in the previous tick may have left the
        // stored state behind the exchange; balances are authoritative.
        if self.needs_reconcile.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.snapshot_position_from_balance(&config).await {
                warn!("Bot {}: reconcile from balance failed: {}", self.bot_id, e);
                self.needs_reconcile.store(true, Ordering::Release);
            }
        }

        let candles = self
            .services
            .exchange
            .klines(&symbol, timeframe, 100)
            .await
            .context("fetching klines")?;

        if let Err(e) = self
            .services
            .tracker
            .track_pre_trade(&self.bot_id, &symbol, timeframe, PRE_TRADE_CANDLES)
            .await
        {
            warn!("Bot {}: pre-trade candle tracking failed: {}", self.bot_id, e);
        }

        let phase_analysis = MarketPhaseAnalyzer::new().analyze(&candles, 20);
        *self.market_phase.write().await =
            Some((phase_analysis.phase, phase_analysis.confidence));
        self.log_agent(
            AgentName::Decision,
            &format!(
                "Market phase analysis: {} (confidence: {:.2})",
                phase_analysis.description, phase_analysis.confidence
            ),
            "analysis",
        )
        .await;

        let strategy = strategy_for(config.strategy);
        let signal = strategy.analyze(&candles);

        let decision_price = match self.services.prices.price(&symbol).await {
            Ok(price) => Some(price),
            Err(e) => {
                warn!("Bot {}: could not get current price: {}", self.bot_id, e);
                candles.last().map(|c| c.close)
            }
        };
        let ctx = DecisionContext {
            decision_price,
            decision_ts: Utc::now(),
            confidence: signal.confidence,
            indicators: signal.indicators.clone(),
            strategy_tag: config.strategy.as_str().to_string(),
        };

        self.log_agent(
            AgentName::Decision,
            &format!(
                "Recommendation for {symbol}: {} signal (confidence: {:.2}) | phase {} | {}",
                signal.signal, signal.confidence, phase_analysis.phase, signal.reason
            ),
            "analysis",
        )
        .await;
        self.log_agent(
            AgentName::Execution,
            &format!(
                "Recommendation from decision agent for {symbol}: {} (confidence: {:.2}); final call applies profit target and stop-loss guards",
                signal.signal, signal.confidence
            ),
            "recommendation",
        )
        .await;

        // Guard scan on the open position before any new decision.
        if self.position.lock().await.is_open() {
            self.run_close_guards(&config, &ctx).await?;
        }

        self.update_tracking_windows().await;

        if signal.signal.is_actionable() && signal.confidence >= SIGNAL_MIN_CONFIDENCE {
            info!(
                "Bot {}: strong {} signal (confidence {:.2}), executing",
                self.bot_id, signal.signal, signal.confidence
            );
            let side = match signal.signal {
                crate::types::SignalKind::Sell => Side::Sell,
                _ => Side::Buy,
            };
            self.execute_signal(&config, side, &ctx).await?;
        } else {
            info!(
                "Bot {}: signal {} (confidence {:.2}) - no trade",
                self.bot_id, signal.signal, signal.confidence
            );
        }

        self.services
            .events
            .publish(Event::StatusUpdate {
                bot_id: self.bot_id.clone(),
                status: self.status().await,
            })
            .await;

        Ok(())
    }

    /// Evaluates stop-loss and trailing take-profit on the open position.
    async fn run_close_guards(&self, config: &BotConfig, ctx: &DecisionContext) -> Result<()> {
        let Some(current_price) = ctx.decision_price else {
            return Ok(());
        };

        // Keep the trailing high-water mark current before scanning.
        let position = {
            let mut guard = self.position.lock().await;
            guard.observe_price(current_price);
            guard.clone()
        };

        match scan_close_triggers(&position, current_price, Utc::now()) {
            Some(CloseTrigger::StopLoss { pnl_pct }) => {
                warn!(
                    "Bot {}: STOP-LOSS triggered at {:.2}% (threshold {}%)",
                    self.bot_id,
                    pnl_pct,
                    risk::STOP_LOSS_PCT
                );
                self.log_agent(
                    AgentName::Execution,
                    &format!(
                        "STOP-LOSS triggered: position at {pnl_pct:.2}% - closing immediately"
                    ),
                    "trade",
                )
                .await;
                self.close_position(config, ExitReason::StopLoss, ctx).await?;
            }
            Some(CloseTrigger::TrailingTakeProfit { pnl_pct, drop_pct }) => {
                info!(
                    "Bot {}: trailing take-profit eligible (drop {:.2}% from high, P&L {:.2}%)",
                    self.bot_id, drop_pct, pnl_pct
                );
                // Re-read the price at execution time; abort if the
                // profit evaporated in the meantime.
                let fresh_price = self
                    .services
                    .exchange
                    .price(&config.symbol)
                    .await
                    .context("re-reading price for trailing close")?;
                let fresh_pnl = position.unrealized_pnl_pct(fresh_price).unwrap_or_default();
                if fresh_pnl <= Decimal::ZERO {
                    warn!(
                        "Bot {}: trailing close aborted, P&L now {:.2}%",
                        self.bot_id, fresh_pnl
                    );
                    return Ok(());
                }
                self.log_agent(
                    AgentName::Execution,
                    &format!(
                        "Trailing take-profit: price dropped {drop_pct:.2}% from high with {pnl_pct:.2}% profit - taking profit"
                    ),
                    "trade",
                )
                .await;
                self.close_position(config, ExitReason::TakeProfit, ctx).await?;
            }
            None => {}
        }
        Ok(())
    }

    /// Routes an actionable signal through the position state machine.
    async fn execute_signal(
        &self,
        config: &BotConfig,
        side: Side,
        ctx: &DecisionContext,
    ) -> Result<()> {
        let position_side = self.position.lock().await.side;
        match (position_side, side) {
            (PositionSide::Flat, Side::Buy) | (PositionSide::Long, Side::Buy) => {
                self.open_position(config, PositionSide::Long, ctx, Sizing::Auto).await?;
            }
            (PositionSide::Flat, Side::Sell) => {
                if config.trading_mode == TradingMode::Spot {
                    info!("Bot {}: SELL signal with no position (spot) - ignored", self.bot_id);
                } else {
                    self.open_position(config, PositionSide::Short, ctx, Sizing::Auto).await?;
                }
            }
            (PositionSide::Long, Side::Sell) | (PositionSide::Short, Side::Buy) => {
                self.close_with_guards(config, ctx).await?;
            }
            (PositionSide::Short, Side::Sell) => {
                info!("Bot {}: SELL signal while already short - ignored", self.bot_id);
            }
        }
        Ok(())
    }

    /// A signal-initiated close: the guard chain decides, the runtime
    /// reacts to the value.
    async fn close_with_guards(&self, config: &BotConfig, ctx: &DecisionContext) -> Result<()> {
        let position = self.position.lock().await.clone();
        let Some(current_price) = ctx.decision_price else {
            return Ok(());
        };

        match evaluate_signal_close(&position, current_price, Utc::now()) {
            GuardDecision::Allow => {
                self.close_position(config, ExitReason::Signal, ctx).await?;
            }
            GuardDecision::Block { reason } => {
                info!("Bot {}: close signal blocked: {}", self.bot_id, reason);
                self.log_agent(
                    AgentName::Execution,
                    &format!("Close signal BLOCKED: {reason}. Position stays open."),
                    "guard",
                )
                .await;
            }
        }
        Ok(())
    }

    /// Opens (or adds to) a position after the open-side guards pass.
    async fn open_position(
        &self,
        config: &BotConfig,
        target: PositionSide,
        ctx: &DecisionContext,
        sizing: Sizing,
    ) -> Result<()> {
        let exchange = &self.services.exchange;
        let symbol = &config.symbol;

        let net_spent = self.services.db.net_spent(&self.bot_id).await.unwrap_or(config.amount);
        let tradable = exchange
            .is_tradable(symbol)
            .await
            .map(|t| t.tradable)
            .unwrap_or(false);
        let open_ctx = OpenContext {
            confidence: ctx.confidence,
            tradable,
            net_spent,
            budget_cap: config.amount,
        };
        if let GuardDecision::Block { reason } = evaluate_open(&open_ctx) {
            info!("Bot {}: open blocked: {}", self.bot_id, reason);
            self.log_agent(
                AgentName::Execution,
                &format!("Open BLOCKED: {reason}"),
                "guard",
            )
            .await;
            return Ok(());
        }

        let price = match ctx.decision_price {
            Some(p) if p > Decimal::ZERO => p,
            _ => exchange.price(symbol).await.context("fetching price for sizing")?,
        };

        let remaining = open_ctx.remaining_budget();
        let sized = match sizing {
            Sizing::Auto => {
                exchange
                    .optimal_buy_quantity(symbol, remaining, price, config.trading_mode)
                    .await
            }
            Sizing::QuoteAmount(amount) => {
                exchange
                    .optimal_buy_quantity(symbol, amount.min(remaining), price, config.trading_mode)
                    .await
            }
            Sizing::Quantity(requested) => {
                let lot = exchange.adjust_to_lot(symbol, requested).await?;
                match exchange.adjust_to_notional(symbol, lot, price).await? {
                    Some(qty) if qty * price <= remaining => Ok(Some(qty)),
                    Some(_) => Ok(None), // would exceed the remaining budget
                    None => Ok(None),
                }
            }
        };

        let quantity = match sized {
            Ok(Some(qty)) => qty,
            Ok(None) => {
                warn!(
                    "Bot {}: no viable quantity within budget {} at price {} ({})",
                    self.bot_id, remaining, price, symbol
                );
                self.log_agent(
                    AgentName::Execution,
                    "Order skipped: budget or balance below the exchange minimum notional",
                    "warning",
                )
                .await;
                return Ok(());
            }
            Err(e @ crate::exchange::ExchangeError::Filter(_)) => {
                warn!("Bot {}: filter rejected sizing: {}", self.bot_id, e);
                return Ok(());
            }
            Err(e) => return Err(e).context("sizing buy order"),
        };

        let order_side = match target {
            PositionSide::Short => Side::Sell,
            _ => Side::Buy,
        };
        let Some((order, execution_price)) =
            self.place_and_derive(config, order_side, quantity).await?
        else {
            return Ok(());
        };

        let executed_qty = if order.executed_qty > Decimal::ZERO {
            order.executed_qty
        } else {
            quantity
        };
        let quote_qty = order
            .cumulative_quote_qty
            .filter(|q| *q > Decimal::ZERO)
            .unwrap_or(execution_price * executed_qty);

        // Position first, then the trade record: a persistence failure
        // must never leave a phantom flat position.
        {
            let mut position = self.position.lock().await;
            match target {
                PositionSide::Short => {
                    *position = Position::open_short(executed_qty, execution_price, Utc::now());
                }
                _ => {
                    if position.side == PositionSide::Long {
                        position.add_to_long(executed_qty, execution_price);
                    } else {
                        *position = Position::open_long(executed_qty, execution_price, Utc::now());
                    }
                }
            }
        }

        let trade = self.build_trade(config, order_side, executed_qty, execution_price, quote_qty, &order, ctx, None, None);
        if let Err(e) = self.services.db.insert_trade(&trade).await {
            error!("Bot {}: failed to persist trade {}: {}", self.bot_id, trade.order_id, e);
            self.needs_reconcile.store(true, Ordering::Release);
        }

        if let Err(e) = self
            .services
            .tracker
            .start_position_tracking(&self.bot_id, symbol, config.timeframe, &order.order_id)
            .await
        {
            warn!("Bot {}: position tracking not started: {}", self.bot_id, e);
        }

        info!(
            "Bot {}: {} {} {} at {} ({} quote)",
            self.bot_id, order_side, executed_qty, symbol, execution_price, quote_qty
        );
        self.publish_trade(&trade).await;
        Ok(())
    }

    /// Closes the open position with the given reason. The exit reason
    /// is re-derived from the realized P&L when the close came from a
    /// plain signal.
    async fn close_position(
        &self,
        config: &BotConfig,
        original_reason: ExitReason,
        ctx: &DecisionContext,
    ) -> Result<()> {
        let position = self.position.lock().await.clone();
        if !position.is_open() {
            return Ok(());
        }
        let symbol = &config.symbol;

        let quantity = self
            .services
            .exchange
            .adjust_to_lot(symbol, position.size)
            .await
            .unwrap_or(position.size);
        if quantity <= Decimal::ZERO {
            warn!("Bot {}: close skipped, lot-adjusted quantity is zero", self.bot_id);
            return Ok(());
        }

        let order_side = match position.side {
            PositionSide::Short => Side::Buy,
            _ => Side::Sell,
        };
        let Some((order, execution_price)) =
            self.place_and_derive(config, order_side, quantity).await?
        else {
            return Ok(());
        };

        let executed_qty = if order.executed_qty > Decimal::ZERO {
            order.executed_qty
        } else {
            quantity
        };
        let quote_qty = order
            .cumulative_quote_qty
            .filter(|q| *q > Decimal::ZERO)
            .unwrap_or(execution_price * executed_qty);

        let (pnl_abs, pnl_pct) = risk::pnl_for_close(
            position.side,
            position.entry_price,
            execution_price,
            executed_qty,
        );
        let exit_reason = risk::derive_exit_reason(original_reason, pnl_pct);

        // Mutate the position before writing the trade record.
        self.position.lock().await.close();

        let buy_trade_id = self
            .services
            .db
            .find_open_during_window(&self.bot_id)
            .await
            .ok()
            .flatten()
            .and_then(|w| w.buy_trade_id);

        let mut trade = self.build_trade(
            config,
            order_side,
            executed_qty,
            execution_price,
            quote_qty,
            &order,
            ctx,
            Some(exit_reason),
            buy_trade_id.clone(),
        );
        trade.pnl_abs = Some(pnl_abs);
        trade.pnl_pct = Some(pnl_pct);
        trade.position_entry_price = Some(position.entry_price);

        if let Err(e) = self.services.db.insert_trade(&trade).await {
            error!("Bot {}: failed to persist closing trade {}: {}", self.bot_id, trade.order_id, e);
            self.needs_reconcile.store(true, Ordering::Release);
        }

        // Candle windows: flip the during-trade window, open post-trade.
        let execution_ts = order.transact_time.unwrap_or(trade.execution_ts);
        if let Err(e) = self
            .services
            .tracker
            .stop_position_tracking(&self.bot_id, Some(&order.order_id))
            .await
        {
            warn!("Bot {}: position tracking not stopped: {}", self.bot_id, e);
        }
        if let Err(e) = self
            .services
            .tracker
            .start_post_trade(&self.bot_id, symbol, config.timeframe, &order.order_id, execution_ts)
            .await
        {
            warn!("Bot {}: post-trade tracking not started: {}", self.bot_id, e);
        }

        self.learn_from_close(&trade, buy_trade_id.as_deref()).await;

        info!(
            "Bot {}: {} closed {} {} at {} (P&L {:+.2} quote, {:+.2}%) [{}]",
            self.bot_id,
            order_side,
            executed_qty,
            symbol,
            execution_price,
            pnl_abs,
            pnl_pct,
            exit_reason
        );
        self.publish_trade(&trade).await;
        Ok(())
    }

    /// Places a market order and derives its execution price. A missing
    /// execution price is fatal for the trade: the order is cancelled
    /// on a best-effort basis, an error is surfaced, nothing persists.
    async fn place_and_derive(
        &self,
        config: &BotConfig,
        side: Side,
        quantity: Decimal,
    ) -> Result<Option<(Order, Decimal)>> {
        let request = OrderRequest {
            symbol: config.symbol.clone(),
            side,
            quantity,
            order_type: OrderType::Market,
            mode: config.trading_mode,
            client_order_id: Uuid::new_v4().to_string(),
        };
        let order = self
            .services
            .exchange
            .place_order(&request)
            .await
            .context("placing order")?;

        match derive_execution_price(self.services.exchange.as_ref(), &order, config.trading_mode)
            .await
        {
            Ok(price) => Ok(Some((order, price))),
            Err(TradeError::ExecutionPriceUnavailable { order_id, symbol }) => {
                error!(
                    "Bot {}: execution price unavailable for order {} ({}) - rejecting trade",
                    self.bot_id, order_id, symbol
                );
                if let Err(e) = self
                    .services
                    .exchange
                    .cancel_order(&config.symbol, &order_id, config.trading_mode)
                    .await
                {
                    warn!("Bot {}: cancel of order {} failed: {}", self.bot_id, order_id, e);
                }
                self.log_agent(
                    AgentName::Execution,
                    &format!(
                        "Trade rejected: execution price unavailable for order {order_id}; order cancel attempted"
                    ),
                    "error",
                )
                .await;
                Ok(None)
            }
            Err(TradeError::Exchange(e)) => Err(e).context("deriving execution price"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_trade(
        &self,
        config: &BotConfig,
        side: Side,
        quantity: Decimal,
        execution_price: Decimal,
        quote_qty: Decimal,
        order: &Order,
        ctx: &DecisionContext,
        exit_reason: Option<ExitReason>,
        buy_trade_id: Option<String>,
    ) -> TradeRecord {
        let execution_ts = order.transact_time.unwrap_or_else(Utc::now);
        let slippage_abs = ctx.decision_price.map(|d| execution_price - d);
        let slippage_pct = ctx.decision_price.and_then(|d| {
            if d.is_zero() {
                None
            } else {
                Some((execution_price - d) / d * Decimal::from(100))
            }
        });

        TradeRecord {
            order_id: order.order_id.clone(),
            bot_id: self.bot_id.clone(),
            symbol: config.symbol.clone(),
            side,
            quantity,
            execution_price,
            quote_qty,
            strategy: ctx.strategy_tag.clone(),
            trading_mode: config.trading_mode,
            exit_reason,
            decision_price: ctx.decision_price,
            decision_ts: Some(ctx.decision_ts),
            execution_ts,
            slippage_abs,
            slippage_pct,
            delay_seconds: Some((execution_ts - ctx.decision_ts).num_seconds()),
            confidence: ctx.confidence,
            indicators: ctx.indicators.clone(),
            pnl_abs: None,
            pnl_pct: None,
            position_entry_price: None,
            buy_trade_id,
        }
    }

    /// Feeds the closed trade into the learning store, attaching the
    /// captured candle windows when available.
    async fn learn_from_close(&self, trade: &TradeRecord, buy_trade_id: Option<&str>) {
        let tracker = &self.services.tracker;
        let mut windows = json!({});

        if let Ok(pre) = tracker
            .get_candles(&self.bot_id, Some(PHASE_PRE_TRADE), Some(&trade.symbol), None)
            .await
        {
            if let Some(window) = pre.first() {
                windows["pre_trade"] = json!({ "count": window.count });
            }
        }
        if let Some(buy_id) = buy_trade_id {
            if let Ok(Some(during)) = tracker.get_trade_candles(buy_id, PHASE_DURING_TRADE).await {
                windows["during_trade"] = json!({
                    "count": during.count,
                    "buy_trade_id": during.buy_trade_id,
                    "sell_trade_id": during.sell_trade_id,
                });
            }
        }

        let memory = self.services.memory.agent_memory(AgentName::Execution).await;
        match memory.learn_from_trade(trade, Some(windows)).await {
            Ok(outcome) => {
                self.services.memory.record_trade_completed(trade, outcome).await;
            }
            Err(e) => {
                error!("Bot {}: learning from trade failed: {}", self.bot_id, e);
            }
        }
    }

    /// Executes a user-initiated trade under the same guardrails as the
    /// automated path, tagged `manual`.
    pub async fn manual_trade(
        &self,
        side: Side,
        quantity: Option<Decimal>,
        amount_quote: Option<Decimal>,
    ) -> Result<(), String> {
        let Some(config) = self.config().await else {
            return Err(format!("Bot {} has no configuration", self.bot_id));
        };
        let mut ctx = DecisionContext::manual();
        ctx.decision_price = self.services.prices.price(&config.symbol).await.ok();

        match side {
            Side::Buy => {
                let sizing = match (quantity, amount_quote) {
                    (Some(qty), _) if qty <= Decimal::ZERO => {
                        return Err("quantity must be positive".to_string());
                    }
                    (Some(qty), _) => Sizing::Quantity(qty),
                    (None, Some(amount)) if amount <= Decimal::ZERO => {
                        return Err("amount must be positive".to_string());
                    }
                    (None, Some(amount)) => Sizing::QuoteAmount(amount),
                    (None, None) => Sizing::Auto,
                };
                self.open_position(&config, PositionSide::Long, &ctx, sizing)
                    .await
                    .map_err(|e| format!("{e:#}"))
            }
            Side::Sell => {
                let position = self.position.lock().await.clone();
                if !position.is_open() {
                    return Err("no open position to sell".to_string());
                }
                let Some(price) = ctx.decision_price else {
                    return Err("current price unavailable".to_string());
                };
                match evaluate_signal_close(&position, price, Utc::now()) {
                    GuardDecision::Allow => self
                        .close_position(&config, ExitReason::Manual, &ctx)
                        .await
                        .map_err(|e| format!("{e:#}")),
                    GuardDecision::Block { reason } => Err(reason),
                }
            }
        }
    }

    /// Reconstructs an existing long from exchange balances: when the
    /// base-asset holding is worth at least the snapshot minimum, the
    /// entry price comes from the most recent persisted BUY.
    async fn snapshot_position_from_balance(&self, config: &BotConfig) -> Result<()> {
        let exchange = &self.services.exchange;
        let meta = exchange.symbol_meta(&config.symbol).await?;
        let free = exchange.balance(&meta.base_asset, config.trading_mode).await?;
        let price = exchange.price(&config.symbol).await?;

        if free * price >= POSITION_SNAPSHOT_MIN_NOTIONAL {
            match self.services.db.last_buy_trade(&self.bot_id, &config.symbol).await {
                Ok(Some(last_buy)) => {
                    let quantity = exchange
                        .adjust_to_lot(&config.symbol, free)
                        .await
                        .unwrap_or(free);
                    let mut position = Position::open_long(
                        quantity,
                        last_buy.execution_price,
                        last_buy.execution_ts,
                    );
                    position.observe_price(price);
                    info!(
                        "Bot {}: adopted existing position of {} {} (entry {})",
                        self.bot_id, quantity, meta.base_asset, last_buy.execution_price
                    );
                    *self.position.lock().await = position;
                    return Ok(());
                }
                Ok(None) => {
                    warn!(
                        "Bot {}: {} balance found but no BUY history; starting flat",
                        self.bot_id, meta.base_asset
                    );
                }
                Err(e) => {
                    warn!("Bot {}: could not look up last BUY: {}", self.bot_id, e);
                }
            }
        }
        *self.position.lock().await = Position::flat();
        Ok(())
    }

    /// One-shot sweep of the configured strategy across standard
    /// timeframes, pushed to the analyses collection and the decision
    /// agent's memory.
    async fn analyze_historical_context(&self, config: &BotConfig) -> Result<()> {
        let strategy = strategy_for(config.strategy);
        let analyzer = MarketPhaseAnalyzer::new();
        let mut tally = json!({});
        let mut buys = 0u32;
        let mut sells = 0u32;
        let mut holds = 0u32;
        let mut confidence_sum = Decimal::ZERO;
        let mut samples = 0u32;

        for timeframe in CONTEXT_TIMEFRAMES {
            let candles = match self
                .services
                .exchange
                .klines(&config.symbol, timeframe, 100)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    warn!(
                        "Bot {}: historical context fetch failed for {}: {}",
                        self.bot_id, timeframe, e
                    );
                    continue;
                }
            };
            let signal = strategy.analyze(&candles);
            let phase = analyzer.analyze(&candles, 20);
            match signal.signal {
                crate::types::SignalKind::Buy => buys += 1,
                crate::types::SignalKind::Sell => sells += 1,
                crate::types::SignalKind::Hold => holds += 1,
            }
            confidence_sum += signal.confidence;
            samples += 1;
            tally[timeframe.as_str()] = json!({
                "signal": signal.signal.as_str(),
                "confidence": signal.confidence,
                "phase": phase.phase.as_str(),
            });
        }

        if samples == 0 {
            return Ok(());
        }
        let avg_confidence = confidence_sum / Decimal::from(samples);
        let content = json!({
            "timeframes": tally,
            "buy_signals": buys,
            "sell_signals": sells,
            "hold_signals": holds,
            "avg_confidence": avg_confidence,
        });

        self.services
            .db
            .insert_analysis(&self.bot_id, &config.symbol, config.strategy.as_str(), &content)
            .await
            .ok();
        let memory = self.services.memory.agent_memory(AgentName::Decision).await;
        memory
            .store(
                "historical_context",
                content,
                json!({ "symbol": config.symbol, "bot_id": self.bot_id }),
            )
            .await
            .ok();
        self.log_agent(
            AgentName::Decision,
            &format!(
                "Historical context for {}: {buys} BUY / {sells} SELL / {holds} HOLD across {samples} timeframes (avg confidence {avg_confidence:.2})",
                config.symbol
            ),
            "analysis",
        )
        .await;
        Ok(())
    }

    /// Appends open during-trade and unfinished post-trade windows.
    async fn update_tracking_windows(&self) {
        let tracker = &self.services.tracker;
        if self.position.lock().await.is_open() {
            if let Err(e) = tracker.update_position_tracking(&self.bot_id).await {
                warn!("Bot {}: during-trade window update failed: {}", self.bot_id, e);
            }
        }
        match self.services.db.unfinished_post_trade_windows(&self.bot_id).await {
            Ok(windows) => {
                for window in windows {
                    if let Some(trade_id) = window.trade_id {
                        if let Err(e) = tracker.update_post_trade(&trade_id).await {
                            warn!(
                                "Bot {}: post-trade window update failed for {}: {}",
                                self.bot_id, trade_id, e
                            );
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Bot {}: post-trade window scan failed: {}", self.bot_id, e);
            }
        }
    }

    pub async fn status(&self) -> Value {
        let config = self.config().await;
        let position = self.position.lock().await.clone();
        let phase = *self.market_phase.read().await;

        let unrealized = match (&config, position.is_open()) {
            (Some(config), true) => match self.services.prices.price(&config.symbol).await {
                Ok(price) => position.unrealized_pnl_pct(price),
                Err(_) => None,
            },
            _ => None,
        };
        let net_spent = self.services.db.net_spent(&self.bot_id).await.unwrap_or_default();

        json!({
            "bot_id": self.bot_id,
            "is_running": self.is_running(),
            "config": config,
            "position": {
                "side": position.side.as_str(),
                "size": position.size,
                "entry_price": position.entry_price,
                "entry_time": position.entry_time,
                "high_price_since_entry": position.high_price_since_entry,
            },
            "unrealized_pnl_pct": unrealized,
            "net_spent": net_spent,
            "market_phase": phase.map(|(p, c)| json!({ "phase": p.as_str(), "confidence": c })),
        })
    }

    async fn log_agent(&self, agent: AgentName, message: &str, kind: &str) {
        if let Err(e) = self
            .services
            .db
            .insert_agent_log(agent.as_str(), message, kind)
            .await
        {
            error!("Bot {}: agent log write failed: {}", self.bot_id, e);
        }
        self.services
            .events
            .publish(Event::LogMessage {
                agent: agent.as_str().to_string(),
                message: message.to_string(),
                message_type: kind.to_string(),
            })
            .await;
    }

    async fn publish_trade(&self, trade: &TradeRecord) {
        self.services
            .events
            .publish(Event::TradeExecuted {
                bot_id: trade.bot_id.clone(),
                symbol: trade.symbol.to_string(),
                side: trade.side.as_str().to_string(),
                quantity: trade.quantity,
                execution_price: trade.execution_price,
                quote_qty: trade.quote_qty,
                exit_reason: trade.exit_reason.map(|r| r.as_str().to_string()),
                pnl_pct: trade.pnl_pct,
            })
            .await;
    }

    async fn emit_start_failed(&self, error: &str) {
        self.services
            .events
            .publish(Event::BotStartFailed {
                bot_id: self.bot_id.clone(),
                error: error.to_string(),
            })
            .await;
    }
}

/// How a position-opening order is sized.
#[derive(Debug, Clone, Copy)]
enum Sizing {
    /// Spend the remaining budget, filter-adjusted.
    Auto,
    /// Spend at most this quote amount (manual trades).
    QuoteAmount(Decimal),
    /// Buy exactly this base quantity, filter-adjusted (manual trades).
    Quantity(Decimal),
}
