use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{StrategyKind, Symbol, TimeFrame, TradeRecord, TradingMode};

/// The three cooperating LLM-backed agents. Prompting and LLM
/// integration live outside the core; in here an agent is a name on
/// log/memory trails plus, for the decision agent, an activation hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentName {
    Chat,
    Decision,
    Execution,
}

impl AgentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::Chat => "chat",
            AgentName::Decision => "decision",
            AgentName::Execution => "execution",
        }
    }

    pub fn all() -> &'static [AgentName] {
        &[AgentName::Chat, AgentName::Decision, AgentName::Execution]
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chat" => Some(AgentName::Chat),
            "decision" => Some(AgentName::Decision),
            "execution" => Some(AgentName::Execution),
            _ => None,
        }
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hook the autonomous supervisor uses to wake the decision agent with
/// a context message (news digest, standing analysis directive). The
/// LLM wrapper implements this; failures are surfaced but must never
/// crash a supervisor loop.
#[async_trait]
pub trait DecisionAgent: Send + Sync {
    async fn activate(&self, context: &str) -> anyhow::Result<()>;
}

/// A no-op decision agent for deployments running without an LLM wrapper.
pub struct InertDecisionAgent;

#[async_trait]
impl DecisionAgent for InertDecisionAgent {
    async fn activate(&self, _context: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartAutonomousBotParams {
    pub symbol: Symbol,
    pub strategy: StrategyKind,
    pub timeframe: TimeFrame,
    pub trading_mode: TradingMode,
}

/// Typed tool registry exposed to the agent wrappers. Each variant
/// carries its full parameter schema; dispatch happens in
/// `AutonomousApi`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum AgentTool {
    StartAutonomousBot(StartAutonomousBotParams),
    StopBot { bot_id: String },
    GetBotStatus { bot_id: Option<String> },
    GetTradeHistory { symbol: Option<Symbol>, limit: i64 },
    AnalyzeSymbol { symbol: Symbol, timeframe: TimeFrame },
}

/// Typed result of a tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ToolReply {
    BotStarted {
        bot_id: String,
        budget: Decimal,
    },
    BotStopped {
        bot_id: String,
    },
    BotStatus {
        status: serde_json::Value,
    },
    TradeHistory {
        trades: Vec<TradeRecord>,
    },
    Analysis {
        signal: String,
        confidence: Decimal,
        phase: String,
    },
    Rejected {
        error: String,
    },
}

impl ToolReply {
    pub fn rejected(error: impl Into<String>) -> Self {
        ToolReply::Rejected { error: error.into() }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, ToolReply::Rejected { .. })
    }
}
