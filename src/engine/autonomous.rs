use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::agents::{AgentName, AgentTool, DecisionAgent, StartAutonomousBotParams, ToolReply};
use crate::analysis::MarketPhaseAnalyzer;
use crate::events::Event;
use crate::news::{filter_important, NewsProvider, MIN_IMPORTANCE_SCORE};
use crate::strategies::{strategy_for, Strategy};
use crate::types::TimeFrame;

use super::BotManager;

/// Hard cap on concurrently running autonomous bots.
pub const MAX_AUTONOMOUS_BOTS: usize = 2;
/// Analysis score a coin must reach before the decision agent may spawn
/// a bot for it.
pub const MIN_COIN_SCORE: Decimal = Decimal::from_parts(4, 0, 0, false, 1); // 0.4

pub const NEWS_FETCH_INTERVAL: Duration = Duration::from_secs(1800);
pub const ANALYSIS_INTERVAL: Duration = Duration::from_secs(3600);

const NEWS_LOOP_WARMUP: Duration = Duration::from_secs(60);
const ANALYSIS_LOOP_WARMUP: Duration = Duration::from_secs(300);
/// Candle windows untouched for this many days are deleted.
const CANDLE_RETENTION_DAYS: i64 = 30;

/// Default budget assumed when no other bots are running.
const DEFAULT_BUDGET: Decimal = Decimal::from_parts(100, 0, 0, false, 0);
/// Floor for a computed autonomous budget.
const MIN_BUDGET: Decimal = Decimal::from_parts(10, 0, 0, false, 0);
/// Share of the free quote balance an autonomous bot may claim.
const BALANCE_SHARE: Decimal = Decimal::from_parts(4, 0, 0, false, 1); // 0.4

/// Runs the two autonomous loops (news-triggered and periodic analysis)
/// and owns the bot-spawn contract available to the decision agent.
pub struct AutonomousSupervisor {
    manager: Arc<BotManager>,
    agent: Arc<dyn DecisionAgent>,
    news: Option<Arc<dyn NewsProvider>>,
    is_running: AtomicBool,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl AutonomousSupervisor {
    pub fn new(
        manager: Arc<BotManager>,
        agent: Arc<dyn DecisionAgent>,
        news: Option<Arc<dyn NewsProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            agent,
            news,
            is_running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub async fn start(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::AcqRel) {
            warn!("AutonomousSupervisor is already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let mut tasks = self.tasks.lock().await;
        let supervisor = Arc::clone(self);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            supervisor.news_loop(rx).await;
        }));
        let supervisor = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            supervisor.analysis_loop(shutdown_rx).await;
        }));

        info!("AutonomousSupervisor started");
    }

    pub async fn stop(&self) {
        self.is_running.store(false, Ordering::Release);
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(true);
        }
        for task in self.tasks.lock().await.drain(..) {
            let _ = task.await;
        }
        info!("AutonomousSupervisor stopped");
    }

    /// Fetches news every half hour, shares the important articles and
    /// activates the decision agent with the digest. Every iteration is
    /// isolated: a failure logs and the loop continues.
    async fn news_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("News fetch loop started");
        let mut delay = NEWS_LOOP_WARMUP;

        while self.is_running() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
            delay = NEWS_FETCH_INTERVAL;
            if !self.is_running() {
                break;
            }
            if let Err(e) = self.fetch_and_share_news().await {
                error!("Error in news fetch loop: {:#}", e);
            }
        }
        info!("News fetch loop exited");
    }

    async fn fetch_and_share_news(&self) -> anyhow::Result<()> {
        let Some(news) = &self.news else {
            return Ok(());
        };

        info!("Fetching important crypto news...");
        let articles = news.fetch_news(5, 20).await?;
        let important = filter_important(articles, MIN_IMPORTANCE_SCORE);
        if important.is_empty() {
            return Ok(());
        }

        info!("Found {} important news articles, sharing with agents", important.len());
        let titles: Vec<String> = important.iter().map(|a| a.title.clone()).collect();
        self.manager
            .services()
            .events
            .publish(Event::NewsShared { count: important.len(), titles })
            .await;

        let mut digest = String::from("IMPORTANT MARKET NEWS:\n\n");
        for article in important.iter().take(5) {
            digest.push_str(&format!("- {} (source: {})\n", article.title, article.source));
            let summary: String = article.summary.chars().take(200).collect();
            digest.push_str(&format!("  {summary}\n"));
            if !article.symbols.is_empty() {
                digest.push_str(&format!("  Relevant coins: {}\n", article.symbols.join(", ")));
            }
            digest.push('\n');
        }
        digest.push_str(
            "TASK:\n\
             1. Analyze this news for trading opportunities.\n\
             2. Run a coin analysis for the affected coins.\n\
             3. When an opportunity scores at or above the minimum, start an autonomous bot immediately.\n\
             4. Goal: profit from news-driven market moves.",
        );

        if let Err(e) = self.agent.activate(&digest).await {
            // Agent failures are surfaced but never crash the loop.
            error!("Decision agent activation with news failed: {:#}", e);
        }
        Ok(())
    }

    /// Hourly scan: when there is spare autonomy capacity and exchange
    /// credentials are configured, hands the decision agent a standing
    /// analyze-and-spawn directive.
    async fn analysis_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("Autonomous analysis loop started");
        let mut delay = ANALYSIS_LOOP_WARMUP;

        while self.is_running() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
            delay = ANALYSIS_INTERVAL;
            if !self.is_running() {
                break;
            }
            self.run_housekeeping().await;
            if let Err(e) = self.run_analysis_pass().await {
                error!("Error in autonomous analysis loop: {:#}", e);
            }
        }
        info!("Autonomous analysis loop exited");
    }

    /// Retention sweep piggybacking on the hourly loop: old candle
    /// windows and stale agent memories age out.
    async fn run_housekeeping(&self) {
        let services = self.manager.services();
        if let Err(e) = services.tracker.cleanup(CANDLE_RETENTION_DAYS).await {
            warn!("Candle window cleanup failed: {}", e);
        }
        for agent in AgentName::all() {
            let memory = services.memory.agent_memory(*agent).await;
            if let Err(e) = memory.cleanup(crate::memory::DEFAULT_CLEANUP_DAYS).await {
                warn!("Memory cleanup for {} failed: {}", agent, e);
            }
        }
    }

    async fn run_analysis_pass(&self) -> anyhow::Result<()> {
        if !self.manager.services().settings.has_credentials() {
            warn!("Exchange credentials not configured, skipping autonomous analysis");
            return Ok(());
        }

        let autonomous = self.manager.autonomous_bot_count().await;
        if autonomous >= MAX_AUTONOMOUS_BOTS {
            info!("Max autonomous bots ({MAX_AUTONOMOUS_BOTS}) already running, skipping analysis");
            return Ok(());
        }

        let running = self
            .manager
            .all_bots()
            .await
            .iter()
            .filter(|b| b.is_running())
            .count();
        let headroom = MAX_AUTONOMOUS_BOTS - autonomous;
        let directive = format!(
            "AUTONOMOUS ANALYSIS TASK:\n\n\
             Currently {running} bots are running, {autonomous} of them autonomous.\n\
             You may start up to {headroom} more autonomous bots.\n\n\
             TASK:\n\
             1. Run a coin analysis to find the best trading opportunities.\n\
             2. When a coin scores at least {MIN_COIN_SCORE}, start an autonomous bot for it.\n\
             3. Pick the best strategy for each coin based on the analysis.\n\n\
             RULES:\n\
             - Consider recent news in the analysis.\n\
             - Only start bots when the profit chance is high (score >= {MIN_COIN_SCORE}).\n\
             - At most {MAX_AUTONOMOUS_BOTS} autonomous bots in total.\n\
             - The budget is computed automatically (average of running bots, at most 40% of capital)."
        );

        if let Err(e) = self.agent.activate(&directive).await {
            error!("Decision agent activation for analysis failed: {:#}", e);
        }
        Ok(())
    }

    /// Spawn contract for the decision agent. The budget is computed
    /// here, never passed in: the average budget of running bots
    /// (default 100), capped at 40% of the free quote balance, floored
    /// at 10.
    pub async fn start_autonomous_bot(
        &self,
        caller: AgentName,
        params: StartAutonomousBotParams,
    ) -> Result<(String, Decimal), String> {
        if caller != AgentName::Decision {
            warn!("start_autonomous_bot called by {caller}, but only the decision agent may start bots");
            return Err("only the decision agent may start autonomous bots".to_string());
        }

        if self.manager.autonomous_bot_count().await >= MAX_AUTONOMOUS_BOTS {
            return Err("autonomy cap reached".to_string());
        }

        let services = self.manager.services();
        let running: Vec<Decimal> = {
            let mut amounts = Vec::new();
            for bot in self.manager.all_bots().await {
                if bot.is_running() {
                    if let Some(config) = bot.config().await {
                        amounts.push(config.amount);
                    }
                }
            }
            amounts
        };
        let avg_budget = if running.is_empty() {
            DEFAULT_BUDGET
        } else {
            running.iter().sum::<Decimal>() / Decimal::from(running.len() as u64)
        };

        let quote_asset = services
            .exchange
            .symbol_meta(&params.symbol)
            .await
            .map(|m| m.quote_asset)
            .map_err(|e| format!("symbol metadata unavailable: {e}"))?;
        let quote_balance = services
            .exchange
            .balance(&quote_asset, params.trading_mode)
            .await
            .map_err(|e| format!("balance lookup failed: {e}"))?;

        let budget = avg_budget.min(quote_balance * BALANCE_SHARE).max(MIN_BUDGET);

        let bot = self.manager.get_bot(None).await;
        info!(
            "Starting autonomous bot {}: symbol={}, strategy={}, budget={:.2}",
            bot.bot_id(),
            params.symbol,
            params.strategy,
            budget
        );
        bot.start_with_origin(
            params.strategy,
            params.symbol.clone(),
            budget,
            params.timeframe,
            params.trading_mode,
            Some(AgentName::Decision.as_str().to_string()),
            true,
        )
        .await?;

        // Verify the start actually took: the loop must be running and
        // the configuration persisted.
        let persisted = services
            .db
            .get_bot_config(bot.bot_id())
            .await
            .ok()
            .flatten()
            .is_some();
        if !bot.is_running() || !persisted {
            return Err(format!(
                "bot {} failed post-start verification (running={}, persisted={})",
                bot.bot_id(),
                bot.is_running(),
                persisted
            ));
        }

        Ok((bot.bot_id().to_string(), budget))
    }
}

/// Typed entry points the agent wrappers call. Dispatches the tool
/// registry onto the supervisor and manager.
pub struct AutonomousApi {
    supervisor: Arc<AutonomousSupervisor>,
    manager: Arc<BotManager>,
}

impl AutonomousApi {
    pub fn new(supervisor: Arc<AutonomousSupervisor>, manager: Arc<BotManager>) -> Self {
        Self { supervisor, manager }
    }

    pub async fn dispatch(&self, caller: AgentName, tool: AgentTool) -> ToolReply {
        match tool {
            AgentTool::StartAutonomousBot(params) => {
                match self.supervisor.start_autonomous_bot(caller, params).await {
                    Ok((bot_id, budget)) => ToolReply::BotStarted { bot_id, budget },
                    Err(error) => ToolReply::rejected(error),
                }
            }
            AgentTool::StopBot { bot_id } => match self.manager.find_bot(&bot_id).await {
                Some(bot) => match bot.stop().await {
                    Ok(()) => ToolReply::BotStopped { bot_id },
                    Err(error) => ToolReply::rejected(error),
                },
                None => ToolReply::rejected(format!("Bot {bot_id} not found")),
            },
            AgentTool::GetBotStatus { bot_id } => match bot_id {
                Some(id) => match self.manager.find_bot(&id).await {
                    Some(bot) => ToolReply::BotStatus { status: bot.status().await },
                    None => ToolReply::rejected(format!("Bot {id} not found")),
                },
                None => ToolReply::BotStatus { status: self.manager.status_all().await },
            },
            AgentTool::GetTradeHistory { symbol, limit } => {
                match self
                    .manager
                    .services()
                    .db
                    .trade_history(symbol.as_ref(), limit.clamp(1, 500))
                    .await
                {
                    Ok(trades) => ToolReply::TradeHistory { trades },
                    Err(error) => ToolReply::rejected(error.to_string()),
                }
            }
            AgentTool::AnalyzeSymbol { symbol, timeframe } => {
                self.analyze_symbol(&symbol, timeframe).await
            }
        }
    }

    async fn analyze_symbol(&self, symbol: &crate::types::Symbol, timeframe: TimeFrame) -> ToolReply {
        let exchange = &self.manager.services().exchange;
        let candles = match exchange.klines(symbol, timeframe, 100).await {
            Ok(candles) => candles,
            Err(error) => return ToolReply::rejected(error.to_string()),
        };
        let signal = strategy_for(crate::types::StrategyKind::Combined).analyze(&candles);
        let phase = MarketPhaseAnalyzer::new().analyze(&candles, 20);
        ToolReply::Analysis {
            signal: signal.signal.as_str().to_string(),
            confidence: signal.confidence,
            phase: phase.phase.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn budget_constants_match_the_contract() {
        assert_eq!(MIN_COIN_SCORE, dec!(0.4));
        assert_eq!(DEFAULT_BUDGET, dec!(100));
        assert_eq!(MIN_BUDGET, dec!(10));
        assert_eq!(BALANCE_SHARE, dec!(0.4));
        assert_eq!(MAX_AUTONOMOUS_BOTS, 2);
    }
}
