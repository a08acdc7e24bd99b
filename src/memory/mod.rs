use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

use crate::agents::AgentName;
use crate::risk::TAKE_PROFIT_MIN_PCT;
use crate::storage::{Database, MemoryEntryDoc, StoreResult};
use crate::types::TradeRecord;

pub const MAX_SHORT_TERM_MEMORY: usize = 50;
pub const DEFAULT_RETRIEVAL_LIMIT: i64 = 20;
pub const DEFAULT_DAYS_BACK: i64 = 30;
pub const DEFAULT_CLEANUP_DAYS: i64 = 90;

/// Absolute quote-asset P&L beyond which a trade counts as a clear
/// success or failure.
pub const MIN_PROFIT_LOSS_THRESHOLD: Decimal = Decimal::from_parts(2, 0, 0, false, 0); // 2.0
/// Profitable trades below this percentage are flagged as `low_profit`,
/// a negative signal that teaches the agents to respect thresholds.
pub const LOW_PROFIT_THRESHOLD: Decimal = Decimal::from_parts(1, 0, 0, false, 0); // 1.0

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    HighSuccess,
    Success,
    NeutralPositive,
    Neutral,
    NeutralNegative,
    LowProfit,
    Failure,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::HighSuccess => "high_success",
            TradeOutcome::Success => "success",
            TradeOutcome::NeutralPositive => "neutral_positive",
            TradeOutcome::Neutral => "neutral",
            TradeOutcome::NeutralNegative => "neutral_negative",
            TradeOutcome::LowProfit => "low_profit",
            TradeOutcome::Failure => "failure",
        }
    }
}

/// Classifies a closed trade. Percentage P&L takes precedence (the
/// reward system keys on it); absolute P&L decides the rest.
pub fn classify_outcome(pnl_abs: Decimal, pnl_pct: Option<Decimal>) -> TradeOutcome {
    if let Some(pct) = pnl_pct {
        if pct >= TAKE_PROFIT_MIN_PCT {
            return TradeOutcome::HighSuccess;
        }
        if pct > Decimal::ZERO && pct < LOW_PROFIT_THRESHOLD {
            return TradeOutcome::LowProfit;
        }
    }
    if pnl_abs > MIN_PROFIT_LOSS_THRESHOLD {
        TradeOutcome::Success
    } else if pnl_abs < -MIN_PROFIT_LOSS_THRESHOLD {
        TradeOutcome::Failure
    } else if pnl_abs > Decimal::ZERO {
        TradeOutcome::NeutralPositive
    } else if pnl_abs < Decimal::ZERO {
        TradeOutcome::NeutralNegative
    } else {
        TradeOutcome::Neutral
    }
}

/// Append-only event log for one agent, with a small in-RAM ring of the
/// most recent entries.
pub struct AgentMemory {
    agent: AgentName,
    db: Arc<Database>,
    short_term: Mutex<VecDeque<MemoryEntryDoc>>,
}

impl AgentMemory {
    pub fn new(db: Arc<Database>, agent: AgentName) -> Self {
        Self {
            agent,
            db,
            short_term: Mutex::new(VecDeque::with_capacity(MAX_SHORT_TERM_MEMORY)),
        }
    }

    pub async fn store(
        &self,
        entry_type: &str,
        content: Value,
        metadata: Value,
    ) -> StoreResult<()> {
        let entry = MemoryEntryDoc {
            agent: self.agent.as_str().to_string(),
            entry_type: entry_type.to_string(),
            content,
            metadata,
            ts: Utc::now(),
        };
        self.db.insert_memory(&entry).await?;

        let mut ring = self.short_term.lock().await;
        if ring.len() >= MAX_SHORT_TERM_MEMORY {
            ring.pop_front();
        }
        ring.push_back(entry);

        info!("{} stored memory: {}", self.agent, entry_type);
        Ok(())
    }

    pub async fn retrieve(
        &self,
        entry_type: Option<&str>,
        limit: i64,
        days_back: i64,
    ) -> StoreResult<Vec<MemoryEntryDoc>> {
        let since = Utc::now() - Duration::days(days_back);
        self.db
            .query_memories(self.agent.as_str(), entry_type, since, limit)
            .await
    }

    pub async fn short_term_snapshot(&self) -> Vec<MemoryEntryDoc> {
        self.short_term.lock().await.iter().cloned().collect()
    }

    /// Learns from a completed closing trade, attaching any captured
    /// candle windows.
    pub async fn learn_from_trade(
        &self,
        trade: &TradeRecord,
        candle_windows: Option<Value>,
    ) -> StoreResult<TradeOutcome> {
        let pnl_abs = trade.pnl_abs.unwrap_or(Decimal::ZERO);
        let outcome = classify_outcome(pnl_abs, trade.pnl_pct);
        let lessons = extract_lessons(trade, outcome, pnl_abs);

        let content = json!({
            "trade_id": trade.order_id,
            "symbol": trade.symbol,
            "side": trade.side.as_str(),
            "strategy": trade.strategy,
            "entry_price": trade.position_entry_price,
            "exit_price": trade.execution_price,
            "outcome": outcome.as_str(),
            "profit_loss": pnl_abs,
            "pnl_percent": trade.pnl_pct,
            "indicators_at_entry": trade.indicators,
            "signal_confidence": trade.confidence,
            "lessons": lessons,
            "candle_windows": candle_windows,
        });

        self.store(
            "trade_learning",
            content,
            json!({ "outcome": outcome.as_str(), "profit_loss": pnl_abs }),
        )
        .await?;

        info!("{} learned from trade: {}", self.agent, outcome.as_str());
        Ok(outcome)
    }

    /// Aggregated history for a symbol/strategy combination.
    pub async fn pattern_insights(&self, symbol: &str, strategy: &str) -> StoreResult<Value> {
        let entries = self.retrieve(Some("trade_learning"), 100, 365).await?;
        let relevant: Vec<&MemoryEntryDoc> = entries
            .iter()
            .filter(|e| {
                e.content.get("symbol").and_then(Value::as_str) == Some(symbol)
                    && e.content.get("strategy").and_then(Value::as_str) == Some(strategy)
            })
            .collect();

        if relevant.is_empty() {
            return Ok(json!({
                "total_trades": 0,
                "insights": ["No historical data for this symbol/strategy combination"],
            }));
        }

        let outcome_of = |e: &MemoryEntryDoc| {
            e.content
                .get("outcome")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        };
        let pnl_of = |e: &MemoryEntryDoc| {
            e.content
                .get("profit_loss")
                .and_then(|v| v.as_str().map(str::to_string).or_else(|| Some(v.to_string())))
                .and_then(|s| s.parse::<Decimal>().ok())
                .unwrap_or(Decimal::ZERO)
        };

        let successes = relevant
            .iter()
            .filter(|e| matches!(outcome_of(e).as_str(), "success" | "high_success"))
            .count();
        let failures = relevant.iter().filter(|e| outcome_of(e) == "failure").count();
        let total_profit: Decimal = relevant.iter().map(|e| pnl_of(e)).sum();
        let total = relevant.len();
        let success_rate =
            Decimal::from(successes as u64) / Decimal::from(total as u64) * dec!(100);
        let avg_profit = total_profit / Decimal::from(total as u64);

        Ok(json!({
            "total_trades": total,
            "success_rate": success_rate.round_dp(2),
            "total_profit_loss": total_profit.round_dp(2),
            "avg_profit_per_trade": avg_profit.round_dp(2),
            "successful_trades": successes,
            "failed_trades": failures,
            "recommendation": recommendation(success_rate, avg_profit, total),
        }))
    }

    /// Recent unique lesson strings, newest last.
    pub async fn recent_lessons(&self, limit: i64) -> StoreResult<Vec<String>> {
        let entries = self.retrieve(Some("trade_learning"), limit, DEFAULT_DAYS_BACK).await?;
        let mut seen = Vec::new();
        for entry in entries.iter().rev() {
            if let Some(lessons) = entry.content.get("lessons").and_then(Value::as_array) {
                for lesson in lessons.iter().filter_map(Value::as_str) {
                    if !seen.iter().any(|s: &String| s == lesson) {
                        seen.push(lesson.to_string());
                    }
                }
            }
        }
        let keep = seen.len().saturating_sub(limit as usize);
        Ok(seen.split_off(keep))
    }

    pub async fn cleanup(&self, days_to_keep: i64) -> StoreResult<u64> {
        let cutoff = Utc::now() - Duration::days(days_to_keep);
        let deleted = self
            .db
            .delete_memories_older_than(self.agent.as_str(), cutoff)
            .await?;
        info!("{} cleared {} old memories", self.agent, deleted);
        Ok(deleted)
    }
}

fn extract_lessons(trade: &TradeRecord, outcome: TradeOutcome, pnl_abs: Decimal) -> Vec<String> {
    let mut lessons = Vec::new();
    let strategy = &trade.strategy;
    let confidence = trade.confidence;

    match outcome {
        TradeOutcome::HighSuccess | TradeOutcome::Success => {
            lessons.push(format!(
                "Strategy '{strategy}' worked well with confidence {confidence:.2}"
            ));
            if pnl_abs > dec!(5) {
                lessons.push("High profit trade - similar conditions may be favorable".to_string());
            }
        }
        TradeOutcome::LowProfit => {
            lessons.push(format!(
                "Strategy '{strategy}' exited below the profit target - respect the minimum-profit threshold"
            ));
        }
        TradeOutcome::Failure => {
            lessons.push(format!(
                "Strategy '{strategy}' failed with confidence {confidence:.2}"
            ));
            if confidence < dec!(0.6) {
                lessons.push("Low confidence signals are risky - require higher threshold".to_string());
            }
            lessons.push("Review market conditions at entry time".to_string());
        }
        _ => {}
    }
    lessons
}

fn recommendation(success_rate: Decimal, avg_profit: Decimal, total: usize) -> &'static str {
    if total < 5 {
        return "Insufficient data - continue gathering experience";
    }
    if success_rate > dec!(60) && avg_profit > Decimal::ZERO {
        "POSITIVE - Strategy shows good performance"
    } else if success_rate > dec!(50) && avg_profit > Decimal::ZERO {
        "NEUTRAL - Strategy is profitable but inconsistent"
    } else if success_rate < dec!(40) || avg_profit < Decimal::ZERO {
        "NEGATIVE - Consider adjusting strategy or parameters"
    } else {
        "MIXED - Requires more data or parameter tuning"
    }
}

/// Central access point for per-agent memories and the collective log.
pub struct MemoryManager {
    db: Arc<Database>,
    memories: RwLock<HashMap<AgentName, Arc<AgentMemory>>>,
}

impl MemoryManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            memories: RwLock::new(HashMap::new()),
        }
    }

    pub async fn agent_memory(&self, agent: AgentName) -> Arc<AgentMemory> {
        if let Some(memory) = self.memories.read().await.get(&agent) {
            return Arc::clone(memory);
        }
        let mut memories = self.memories.write().await;
        Arc::clone(
            memories
                .entry(agent)
                .or_insert_with(|| Arc::new(AgentMemory::new(Arc::clone(&self.db), agent))),
        )
    }

    pub async fn store_collective(&self, memory_type: &str, content: Value) {
        if let Err(e) = self.db.insert_collective_memory(memory_type, &content).await {
            error!("Error storing collective memory: {}", e);
        }
    }

    /// Collective `trade_completed` summary emitted for every closing trade.
    pub async fn record_trade_completed(&self, trade: &TradeRecord, outcome: TradeOutcome) {
        self.store_collective(
            "trade_completed",
            json!({
                "bot_id": trade.bot_id,
                "trade_id": trade.order_id,
                "symbol": trade.symbol,
                "strategy": trade.strategy,
                "exit_reason": trade.exit_reason.map(|r| r.as_str()),
                "pnl_abs": trade.pnl_abs,
                "pnl_pct": trade.pnl_pct,
                "outcome": outcome.as_str(),
            }),
        )
        .await;
    }

    /// Text block of recent lessons and outcomes for prompt injection.
    pub async fn generate_summary(&self, agent: AgentName) -> String {
        let memory = self.agent_memory(agent).await;

        let lessons = memory.recent_lessons(5).await.unwrap_or_default();
        let recent = memory
            .retrieve(Some("trade_learning"), 5, DEFAULT_DAYS_BACK)
            .await
            .unwrap_or_default();

        let mut summary = format!("=== Memory Summary for {agent} ===\n");
        if !lessons.is_empty() {
            summary.push_str("\nRecent Lessons Learned:\n");
            for (i, lesson) in lessons.iter().enumerate() {
                summary.push_str(&format!("{}. {}\n", i + 1, lesson));
            }
        }
        if !recent.is_empty() {
            summary.push_str("\nRecent Trade Outcomes:\n");
            for entry in recent.iter().take(3) {
                let outcome = entry
                    .content
                    .get("outcome")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let strategy = entry
                    .content
                    .get("strategy")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                summary.push_str(&format!("- {strategy}: {outcome}\n"));
            }
        }
        if lessons.is_empty() && recent.is_empty() {
            summary.push_str("No prior learning data available yet.\n");
        }
        summary.push_str("=== End Memory Summary ===\n");
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Side, Symbol, TradingMode};

    fn closed_trade(strategy: &str, pnl_abs: Decimal, pnl_pct: Decimal) -> TradeRecord {
        TradeRecord {
            order_id: format!("t-{pnl_abs}"),
            bot_id: "bot".to_string(),
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            side: Side::Sell,
            quantity: dec!(1),
            execution_price: dec!(100),
            quote_qty: dec!(100),
            strategy: strategy.to_string(),
            trading_mode: TradingMode::Spot,
            exit_reason: None,
            decision_price: None,
            decision_ts: None,
            execution_ts: Utc::now(),
            slippage_abs: None,
            slippage_pct: None,
            delay_seconds: None,
            confidence: dec!(0.7),
            indicators: json!({}),
            pnl_abs: Some(pnl_abs),
            pnl_pct: Some(pnl_pct),
            position_entry_price: Some(dec!(100)),
            buy_trade_id: None,
        }
    }

    #[tokio::test]
    async fn learning_feeds_insights_and_lessons() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let manager = MemoryManager::new(Arc::clone(&db));
        let memory = manager.agent_memory(AgentName::Execution).await;

        // Two clear wins and a clear loss on the same symbol/strategy.
        for (abs, pct) in [(dec!(5), dec!(5)), (dec!(4), dec!(4)), (dec!(-6), dec!(-6))] {
            let outcome = memory
                .learn_from_trade(&closed_trade("combined", abs, pct), None)
                .await
                .unwrap();
            manager.record_trade_completed(&closed_trade("combined", abs, pct), outcome).await;
        }

        let insights = memory.pattern_insights("BTCUSDT", "combined").await.unwrap();
        assert_eq!(insights["total_trades"], 3);
        assert_eq!(insights["failed_trades"], 1);

        let lessons = memory.recent_lessons(10).await.unwrap();
        assert!(!lessons.is_empty());
        assert!(lessons.iter().any(|l| l.contains("combined")));

        let summary = manager.generate_summary(AgentName::Execution).await;
        assert!(summary.contains("Recent Lessons Learned"));

        // The in-RAM ring mirrors what was stored.
        assert_eq!(memory.short_term_snapshot().await.len(), 3);
    }

    #[tokio::test]
    async fn retrieval_filters_by_type() {
        let db = Arc::new(Database::new("sqlite::memory:").await.unwrap());
        let memory = AgentMemory::new(db, AgentName::Decision);

        memory.store("historical_context", json!({"a": 1}), json!({})).await.unwrap();
        memory.store("note", json!({"b": 2}), json!({})).await.unwrap();

        let context = memory.retrieve(Some("historical_context"), 10, 7).await.unwrap();
        assert_eq!(context.len(), 1);
        let all = memory.retrieve(None, 10, 7).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn outcome_classification_follows_the_reward_system() {
        // >= 2% is the reward signal regardless of absolute size.
        assert_eq!(
            classify_outcome(dec!(0.5), Some(dec!(2.0))),
            TradeOutcome::HighSuccess
        );
        // Profitable but under 1%: negative reinforcement.
        assert_eq!(
            classify_outcome(dec!(5), Some(dec!(0.5))),
            TradeOutcome::LowProfit
        );
        // Absolute thresholds decide the rest.
        assert_eq!(classify_outcome(dec!(3), Some(dec!(1.5))), TradeOutcome::Success);
        assert_eq!(classify_outcome(dec!(-3), Some(dec!(-1.5))), TradeOutcome::Failure);
        assert_eq!(
            classify_outcome(dec!(0.5), Some(dec!(1.2))),
            TradeOutcome::NeutralPositive
        );
        assert_eq!(
            classify_outcome(dec!(-0.5), Some(dec!(-0.2))),
            TradeOutcome::NeutralNegative
        );
        assert_eq!(classify_outcome(Decimal::ZERO, None), TradeOutcome::Neutral);
    }

    #[test]
    fn failure_lessons_flag_low_confidence() {
        let trade = TradeRecord {
            order_id: "1".to_string(),
            bot_id: "b".to_string(),
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            side: Side::Sell,
            quantity: dec!(1),
            execution_price: dec!(90),
            quote_qty: dec!(90),
            strategy: "rsi".to_string(),
            trading_mode: TradingMode::Spot,
            exit_reason: None,
            decision_price: None,
            decision_ts: None,
            execution_ts: Utc::now(),
            slippage_abs: None,
            slippage_pct: None,
            delay_seconds: None,
            confidence: dec!(0.5),
            indicators: json!({}),
            pnl_abs: Some(dec!(-10)),
            pnl_pct: Some(dec!(-10)),
            position_entry_price: Some(dec!(100)),
            buy_trade_id: None,
        };
        let lessons = extract_lessons(&trade, TradeOutcome::Failure, dec!(-10));
        assert!(lessons.iter().any(|l| l.contains("Low confidence")));
    }
}
