use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

use crate::types::{
    BotConfig, Candle, ExitReason, Side, StrategyKind, Symbol, TimeFrame, TradeRecord, TradingMode,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("invalid record: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored candle window document. Owned by the candle tracker;
/// persisted fully denormalized so lookups never need joins.
#[derive(Debug, Clone)]
pub struct CandleWindowDoc {
    pub id: i64,
    pub bot_id: String,
    pub symbol: Symbol,
    pub timeframe: TimeFrame,
    pub phase: String,
    pub trade_id: Option<String>,
    pub buy_trade_id: Option<String>,
    pub sell_trade_id: Option<String>,
    pub position_status: Option<String>,
    pub candles: Vec<Candle>,
    pub count: i64,
    pub target_count: Option<i64>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub updated_ts: DateTime<Utc>,
}

/// One entry in an agent's append-only memory log.
#[derive(Debug, Clone)]
pub struct MemoryEntryDoc {
    pub agent: String,
    pub entry_type: String,
    pub content: Value,
    pub metadata: Value,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AgentLogDoc {
    pub agent: String,
    pub message: String,
    pub message_type: String,
    pub ts: DateTime<Utc>,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> StoreResult<Self> {
        info!("Initializing SQLite database at: {}", db_url);

        let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
        // An in-memory database exists per connection; pooling more
        // than one would hand every caller a different empty database.
        let is_memory = db_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if is_memory { 1 } else { 5 })
            .min_connections(if is_memory { 1 } else { 0 })
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;
        info!("Database initialized successfully");
        Ok(db)
    }

    async fn create_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_config (
                bot_id TEXT NOT NULL,
                strategy TEXT NOT NULL,
                symbol TEXT NOT NULL,
                amount TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                trading_mode TEXT NOT NULL,
                started_at TEXT NOT NULL,
                stopped_at TEXT,
                started_by TEXT,
                autonomous INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (bot_id, started_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                order_id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                execution_price TEXT NOT NULL,
                quote_qty TEXT NOT NULL,
                strategy TEXT NOT NULL,
                trading_mode TEXT NOT NULL,
                exit_reason TEXT,
                decision_price TEXT,
                decision_ts TEXT,
                execution_ts TEXT NOT NULL,
                slippage_abs TEXT,
                slippage_pct TEXT,
                delay_seconds INTEGER,
                confidence TEXT NOT NULL,
                indicators TEXT NOT NULL,
                pnl_abs TEXT,
                pnl_pct TEXT,
                position_entry_price TEXT,
                buy_trade_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_trades_bot_ts ON trades(bot_id, execution_ts)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent TEXT NOT NULL,
                message TEXT NOT NULL,
                message_type TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_agent_logs_agent_ts ON agent_logs(agent, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analyses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                strategy TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_analyses_bot_ts ON analyses(bot_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bot_candles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                phase TEXT NOT NULL,
                trade_id TEXT,
                buy_trade_id TEXT,
                sell_trade_id TEXT,
                position_status TEXT,
                candles TEXT NOT NULL,
                count INTEGER NOT NULL,
                target_count INTEGER,
                start_ts TEXT,
                end_ts TEXT,
                updated_ts TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_candles_trade_phase ON bot_candles(trade_id, phase)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_candles_bot_phase ON bot_candles(bot_id, phase, position_status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent TEXT NOT NULL,
                type TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memory_agent_type_ts ON agent_memory(agent, type, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collective_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                memory_type TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // === bot_config ===

    pub async fn insert_bot_config(&self, config: &BotConfig) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bot_config (
                bot_id, strategy, symbol, amount, timeframe, trading_mode,
                started_at, stopped_at, started_by, autonomous
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&config.bot_id)
        .bind(config.strategy.as_str())
        .bind(config.symbol.as_str())
        .bind(config.amount.to_string())
        .bind(config.timeframe.as_str())
        .bind(config.trading_mode.as_str())
        .bind(config.started_at.to_rfc3339())
        .bind(config.stopped_at.map(|t| t.to_rfc3339()))
        .bind(&config.started_by)
        .bind(config.autonomous as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_bot_stopped(
        &self,
        bot_id: &str,
        started_at: DateTime<Utc>,
        stopped_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE bot_config SET stopped_at = ? WHERE bot_id = ? AND started_at = ?")
            .bind(stopped_at.to_rfc3339())
            .bind(bot_id)
            .bind(started_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Latest configuration row for a bot, if any.
    pub async fn get_bot_config(&self, bot_id: &str) -> StoreResult<Option<BotConfig>> {
        let row = sqlx::query(
            r#"
            SELECT bot_id, strategy, symbol, amount, timeframe, trading_mode,
                   started_at, stopped_at, started_by, autonomous
            FROM bot_config WHERE bot_id = ? ORDER BY started_at DESC LIMIT 1
            "#,
        )
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| parse_bot_config(&r)).transpose()
    }

    // === trades ===

    pub async fn insert_trade(&self, trade: &TradeRecord) -> StoreResult<()> {
        trade.validate().map_err(StoreError::Invalid)?;

        sqlx::query(
            r#"
            INSERT INTO trades (
                order_id, bot_id, symbol, side, quantity, execution_price, quote_qty,
                strategy, trading_mode, exit_reason, decision_price, decision_ts,
                execution_ts, slippage_abs, slippage_pct, delay_seconds, confidence,
                indicators, pnl_abs, pnl_pct, position_entry_price, buy_trade_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.order_id)
        .bind(&trade.bot_id)
        .bind(trade.symbol.as_str())
        .bind(trade.side.as_str())
        .bind(trade.quantity.to_string())
        .bind(trade.execution_price.to_string())
        .bind(trade.quote_qty.to_string())
        .bind(&trade.strategy)
        .bind(trade.trading_mode.as_str())
        .bind(trade.exit_reason.map(|r| r.as_str()))
        .bind(trade.decision_price.map(|p| p.to_string()))
        .bind(trade.decision_ts.map(|t| t.to_rfc3339()))
        .bind(trade.execution_ts.to_rfc3339())
        .bind(trade.slippage_abs.map(|s| s.to_string()))
        .bind(trade.slippage_pct.map(|s| s.to_string()))
        .bind(trade.delay_seconds)
        .bind(trade.confidence.to_string())
        .bind(trade.indicators.to_string())
        .bind(trade.pnl_abs.map(|p| p.to_string()))
        .bind(trade.pnl_pct.map(|p| p.to_string()))
        .bind(trade.position_entry_price.map(|p| p.to_string()))
        .bind(&trade.buy_trade_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn trades_for_bot(&self, bot_id: &str) -> StoreResult<Vec<TradeRecord>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE bot_id = ? ORDER BY execution_ts ASC")
            .bind(bot_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_trade).collect()
    }

    pub async fn trade_history(
        &self,
        symbol: Option<&Symbol>,
        limit: i64,
    ) -> StoreResult<Vec<TradeRecord>> {
        let rows = match symbol {
            Some(symbol) => {
                sqlx::query(
                    "SELECT * FROM trades WHERE symbol = ? ORDER BY execution_ts DESC LIMIT ?",
                )
                .bind(symbol.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM trades ORDER BY execution_ts DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(parse_trade).collect()
    }

    /// Most recent BUY for a bot and symbol; used to reconstruct an
    /// existing position from exchange balances on startup.
    pub async fn last_buy_trade(
        &self,
        bot_id: &str,
        symbol: &Symbol,
    ) -> StoreResult<Option<TradeRecord>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM trades WHERE bot_id = ? AND symbol = ? AND side = 'BUY'
            ORDER BY execution_ts DESC LIMIT 1
            "#,
        )
        .bind(bot_id)
        .bind(symbol.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_trade).transpose()
    }

    /// Net quote amount currently in use by a bot: BUY volume minus
    /// SELL volume, floored at zero. Once a position is fully closed
    /// the configured budget is available again.
    pub async fn net_spent(&self, bot_id: &str) -> StoreResult<Decimal> {
        let rows = sqlx::query(
            "SELECT side, quote_qty FROM trades WHERE bot_id = ?",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;

        let mut total_buy = Decimal::ZERO;
        let mut total_sell = Decimal::ZERO;
        for row in &rows {
            let amount = parse_decimal_col(row, "quote_qty")?;
            match row.get::<String, _>("side").as_str() {
                "BUY" => total_buy += amount,
                "SELL" => total_sell += amount,
                _ => {}
            }
        }
        Ok((total_buy - total_sell).max(Decimal::ZERO))
    }

    // === agent logs / analyses ===

    pub async fn insert_agent_log(
        &self,
        agent: &str,
        message: &str,
        message_type: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO agent_logs (agent, message, message_type, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(agent)
        .bind(message)
        .bind(message_type)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_agent_logs(&self, agent: &str, limit: i64) -> StoreResult<Vec<AgentLogDoc>> {
        let rows = sqlx::query(
            r#"
            SELECT agent, message, message_type, timestamp FROM agent_logs
            WHERE agent = ? ORDER BY timestamp DESC LIMIT ?
            "#,
        )
        .bind(agent)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AgentLogDoc {
                    agent: row.get("agent"),
                    message: row.get("message"),
                    message_type: row.get("message_type"),
                    ts: parse_ts_col(row, "timestamp")?,
                })
            })
            .collect()
    }

    pub async fn insert_analysis(
        &self,
        bot_id: &str,
        symbol: &Symbol,
        strategy: &str,
        content: &Value,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO analyses (bot_id, symbol, strategy, content, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(bot_id)
        .bind(symbol.as_str())
        .bind(strategy)
        .bind(content.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // === candle windows ===

    pub async fn insert_candle_window(&self, doc: &CandleWindowDoc) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO bot_candles (
                bot_id, symbol, timeframe, phase, trade_id, buy_trade_id, sell_trade_id,
                position_status, candles, count, target_count, start_ts, end_ts, updated_ts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.bot_id)
        .bind(doc.symbol.as_str())
        .bind(doc.timeframe.as_str())
        .bind(&doc.phase)
        .bind(&doc.trade_id)
        .bind(&doc.buy_trade_id)
        .bind(&doc.sell_trade_id)
        .bind(&doc.position_status)
        .bind(encode_candles(&doc.candles)?)
        .bind(doc.count)
        .bind(doc.target_count)
        .bind(doc.start_ts.map(|t| t.to_rfc3339()))
        .bind(doc.end_ts.map(|t| t.to_rfc3339()))
        .bind(doc.updated_ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Upserts the single pre-trade window keyed by
    /// `(bot_id, symbol, timeframe, phase)`.
    pub async fn upsert_pre_trade_window(&self, doc: &CandleWindowDoc) -> StoreResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE bot_candles
            SET candles = ?, count = ?, start_ts = ?, end_ts = ?, updated_ts = ?
            WHERE bot_id = ? AND symbol = ? AND timeframe = ? AND phase = 'pre_trade'
            "#,
        )
        .bind(encode_candles(&doc.candles)?)
        .bind(doc.count)
        .bind(doc.start_ts.map(|t| t.to_rfc3339()))
        .bind(doc.end_ts.map(|t| t.to_rfc3339()))
        .bind(doc.updated_ts.to_rfc3339())
        .bind(&doc.bot_id)
        .bind(doc.symbol.as_str())
        .bind(doc.timeframe.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            self.insert_candle_window(doc).await?;
        }
        Ok(())
    }

    pub async fn find_pre_trade_window(
        &self,
        bot_id: &str,
        symbol: &Symbol,
        timeframe: TimeFrame,
    ) -> StoreResult<Option<CandleWindowDoc>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM bot_candles
            WHERE bot_id = ? AND symbol = ? AND timeframe = ? AND phase = 'pre_trade'
            "#,
        )
        .bind(bot_id)
        .bind(symbol.as_str())
        .bind(timeframe.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_window).transpose()
    }

    /// The at-most-one open during-trade window of a bot.
    pub async fn find_open_during_window(
        &self,
        bot_id: &str,
    ) -> StoreResult<Option<CandleWindowDoc>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM bot_candles
            WHERE bot_id = ? AND phase = 'during_trade' AND position_status = 'open'
            "#,
        )
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_window).transpose()
    }

    pub async fn find_window_by_trade(
        &self,
        trade_id: &str,
        phase: &str,
    ) -> StoreResult<Option<CandleWindowDoc>> {
        let column = if phase == "during_trade" { "buy_trade_id" } else { "trade_id" };
        let query = format!("SELECT * FROM bot_candles WHERE {column} = ? AND phase = ?");
        let row = sqlx::query(&query)
            .bind(trade_id)
            .bind(phase)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_window).transpose()
    }

    pub async fn update_window_candles(
        &self,
        id: i64,
        candles: &[Candle],
        end_ts: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE bot_candles SET candles = ?, count = ?, end_ts = ?, updated_ts = ? WHERE id = ?",
        )
        .bind(encode_candles(candles)?)
        .bind(candles.len() as i64)
        .bind(end_ts.map(|t| t.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flips the open during-trade window of a bot to closed, stamping
    /// the closing trade id. Returns the window when one was open.
    pub async fn close_during_window(
        &self,
        bot_id: &str,
        sell_trade_id: Option<&str>,
        end_ts: DateTime<Utc>,
    ) -> StoreResult<Option<CandleWindowDoc>> {
        let open = self.find_open_during_window(bot_id).await?;
        let Some(doc) = open else { return Ok(None) };

        sqlx::query(
            r#"
            UPDATE bot_candles
            SET position_status = 'closed', sell_trade_id = ?, end_ts = ?, updated_ts = ?
            WHERE id = ?
            "#,
        )
        .bind(sell_trade_id)
        .bind(end_ts.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(doc.id)
        .execute(&self.pool)
        .await?;
        Ok(Some(doc))
    }

    pub async fn windows_for_bot(
        &self,
        bot_id: &str,
        phase: Option<&str>,
        symbol: Option<&Symbol>,
        timeframe: Option<TimeFrame>,
    ) -> StoreResult<Vec<CandleWindowDoc>> {
        let mut sql = String::from("SELECT * FROM bot_candles WHERE bot_id = ?");
        if phase.is_some() {
            sql.push_str(" AND phase = ?");
        }
        if symbol.is_some() {
            sql.push_str(" AND symbol = ?");
        }
        if timeframe.is_some() {
            sql.push_str(" AND timeframe = ?");
        }
        sql.push_str(" ORDER BY updated_ts DESC LIMIT 100");

        let mut query = sqlx::query(&sql).bind(bot_id);
        if let Some(phase) = phase {
            query = query.bind(phase);
        }
        if let Some(symbol) = symbol {
            query = query.bind(symbol.as_str());
        }
        if let Some(timeframe) = timeframe {
            query = query.bind(timeframe.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(parse_window).collect()
    }

    /// Post-trade windows of a bot that have not reached their target
    /// candle count yet.
    pub async fn unfinished_post_trade_windows(
        &self,
        bot_id: &str,
    ) -> StoreResult<Vec<CandleWindowDoc>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM bot_candles
            WHERE bot_id = ? AND phase = 'post_trade' AND count < target_count
            "#,
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_window).collect()
    }

    pub async fn delete_windows_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM bot_candles WHERE updated_ts < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // === agent memory ===

    pub async fn insert_memory(&self, entry: &MemoryEntryDoc) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO agent_memory (agent, type, content, metadata, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.agent)
        .bind(&entry.entry_type)
        .bind(entry.content.to_string())
        .bind(entry.metadata.to_string())
        .bind(entry.ts.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn query_memories(
        &self,
        agent: &str,
        entry_type: Option<&str>,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<MemoryEntryDoc>> {
        let rows = match entry_type {
            Some(entry_type) => {
                sqlx::query(
                    r#"
                    SELECT agent, type, content, metadata, timestamp FROM agent_memory
                    WHERE agent = ? AND type = ? AND timestamp >= ?
                    ORDER BY timestamp DESC LIMIT ?
                    "#,
                )
                .bind(agent)
                .bind(entry_type)
                .bind(since.to_rfc3339())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT agent, type, content, metadata, timestamp FROM agent_memory
                    WHERE agent = ? AND timestamp >= ?
                    ORDER BY timestamp DESC LIMIT ?
                    "#,
                )
                .bind(agent)
                .bind(since.to_rfc3339())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| {
                Ok(MemoryEntryDoc {
                    agent: row.get("agent"),
                    entry_type: row.get("type"),
                    content: parse_json_col(row, "content")?,
                    metadata: parse_json_col(row, "metadata")?,
                    ts: parse_ts_col(row, "timestamp")?,
                })
            })
            .collect()
    }

    pub async fn count_memories(&self, agent: &str) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM agent_memory WHERE agent = ?")
            .bind(agent)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    pub async fn delete_memories_older_than(
        &self,
        agent: &str,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM agent_memory WHERE agent = ? AND timestamp < ?")
            .bind(agent)
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_collective_memory(
        &self,
        memory_type: &str,
        content: &Value,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO collective_memory (memory_type, content, timestamp) VALUES (?, ?, ?)",
        )
        .bind(memory_type)
        .bind(content.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// === row parsing ===

fn parse_decimal_col(row: &sqlx::sqlite::SqliteRow, column: &str) -> StoreResult<Decimal> {
    let s: String = row.get(column);
    Decimal::from_str(&s).map_err(|e| StoreError::Corrupt(format!("{column}={s}: {e}")))
}

fn parse_opt_decimal_col(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> StoreResult<Option<Decimal>> {
    let s: Option<String> = row.get(column);
    s.map(|s| Decimal::from_str(&s).map_err(|e| StoreError::Corrupt(format!("{column}={s}: {e}"))))
        .transpose()
}

fn parse_ts_col(row: &sqlx::sqlite::SqliteRow, column: &str) -> StoreResult<DateTime<Utc>> {
    let s: String = row.get(column);
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("{column}={s}: {e}")))
}

fn parse_opt_ts_col(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> StoreResult<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(column);
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("{column}={s}: {e}")))
    })
    .transpose()
}

fn parse_json_col(row: &sqlx::sqlite::SqliteRow, column: &str) -> StoreResult<Value> {
    let s: String = row.get(column);
    serde_json::from_str(&s).map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn parse_symbol_col(row: &sqlx::sqlite::SqliteRow, column: &str) -> StoreResult<Symbol> {
    let s: String = row.get(column);
    Symbol::parse(&s).ok_or_else(|| StoreError::Corrupt(format!("bad symbol {s:?}")))
}

fn encode_candles(candles: &[Candle]) -> StoreResult<String> {
    serde_json::to_string(candles).map_err(|e| StoreError::Corrupt(format!("candles: {e}")))
}

fn parse_bot_config(row: &sqlx::sqlite::SqliteRow) -> StoreResult<BotConfig> {
    let strategy: String = row.get("strategy");
    let timeframe: String = row.get("timeframe");
    let mode: String = row.get("trading_mode");
    Ok(BotConfig {
        bot_id: row.get("bot_id"),
        strategy: StrategyKind::parse(&strategy)
            .ok_or_else(|| StoreError::Corrupt(format!("bad strategy {strategy:?}")))?,
        symbol: parse_symbol_col(row, "symbol")?,
        amount: parse_decimal_col(row, "amount")?,
        timeframe: TimeFrame::parse(&timeframe)
            .ok_or_else(|| StoreError::Corrupt(format!("bad timeframe {timeframe:?}")))?,
        trading_mode: TradingMode::parse(&mode)
            .ok_or_else(|| StoreError::Corrupt(format!("bad trading mode {mode:?}")))?,
        started_at: parse_ts_col(row, "started_at")?,
        stopped_at: parse_opt_ts_col(row, "stopped_at")?,
        started_by: row.get("started_by"),
        autonomous: row.get::<i64, _>("autonomous") != 0,
    })
}

fn parse_trade(row: &sqlx::sqlite::SqliteRow) -> StoreResult<TradeRecord> {
    let side: String = row.get("side");
    let mode: String = row.get("trading_mode");
    let exit_reason: Option<String> = row.get("exit_reason");
    Ok(TradeRecord {
        order_id: row.get("order_id"),
        bot_id: row.get("bot_id"),
        symbol: parse_symbol_col(row, "symbol")?,
        side: Side::parse(&side)
            .ok_or_else(|| StoreError::Corrupt(format!("bad side {side:?}")))?,
        quantity: parse_decimal_col(row, "quantity")?,
        execution_price: parse_decimal_col(row, "execution_price")?,
        quote_qty: parse_decimal_col(row, "quote_qty")?,
        strategy: row.get("strategy"),
        trading_mode: TradingMode::parse(&mode)
            .ok_or_else(|| StoreError::Corrupt(format!("bad trading mode {mode:?}")))?,
        exit_reason: exit_reason
            .map(|r| {
                ExitReason::parse(&r)
                    .ok_or_else(|| StoreError::Corrupt(format!("bad exit reason {r:?}")))
            })
            .transpose()?,
        decision_price: parse_opt_decimal_col(row, "decision_price")?,
        decision_ts: parse_opt_ts_col(row, "decision_ts")?,
        execution_ts: parse_ts_col(row, "execution_ts")?,
        slippage_abs: parse_opt_decimal_col(row, "slippage_abs")?,
        slippage_pct: parse_opt_decimal_col(row, "slippage_pct")?,
        delay_seconds: row.get("delay_seconds"),
        confidence: parse_decimal_col(row, "confidence")?,
        indicators: parse_json_col(row, "indicators")?,
        pnl_abs: parse_opt_decimal_col(row, "pnl_abs")?,
        pnl_pct: parse_opt_decimal_col(row, "pnl_pct")?,
        position_entry_price: parse_opt_decimal_col(row, "position_entry_price")?,
        buy_trade_id: row.get("buy_trade_id"),
    })
}

fn parse_window(row: &sqlx::sqlite::SqliteRow) -> StoreResult<CandleWindowDoc> {
    let timeframe: String = row.get("timeframe");
    let candles_json: String = row.get("candles");
    let candles: Vec<Candle> = serde_json::from_str(&candles_json)
        .map_err(|e| StoreError::Corrupt(format!("candles: {e}")))?;
    Ok(CandleWindowDoc {
        id: row.get("id"),
        bot_id: row.get("bot_id"),
        symbol: parse_symbol_col(row, "symbol")?,
        timeframe: TimeFrame::parse(&timeframe)
            .ok_or_else(|| StoreError::Corrupt(format!("bad timeframe {timeframe:?}")))?,
        phase: row.get("phase"),
        trade_id: row.get("trade_id"),
        buy_trade_id: row.get("buy_trade_id"),
        sell_trade_id: row.get("sell_trade_id"),
        position_status: row.get("position_status"),
        candles,
        count: row.get("count"),
        target_count: row.get("target_count"),
        start_ts: parse_opt_ts_col(row, "start_ts")?,
        end_ts: parse_opt_ts_col(row, "end_ts")?,
        updated_ts: parse_ts_col(row, "updated_ts")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    fn sample_trade(order_id: &str, side: Side, quote_qty: Decimal) -> TradeRecord {
        let quantity = dec!(0.001);
        TradeRecord {
            order_id: order_id.to_string(),
            bot_id: "bot-1".to_string(),
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            side,
            quantity,
            execution_price: quote_qty / quantity,
            quote_qty,
            strategy: "combined".to_string(),
            trading_mode: TradingMode::Spot,
            exit_reason: None,
            decision_price: None,
            decision_ts: None,
            execution_ts: Utc::now(),
            slippage_abs: None,
            slippage_pct: None,
            delay_seconds: None,
            confidence: dec!(0.7),
            indicators: serde_json::json!({}),
            pnl_abs: None,
            pnl_pct: None,
            position_entry_price: None,
            buy_trade_id: None,
        }
    }

    #[tokio::test]
    async fn trade_roundtrip_preserves_fields() {
        let db = test_db().await;
        let trade = sample_trade("42", Side::Buy, dec!(30));
        db.insert_trade(&trade).await.unwrap();

        let loaded = db.trades_for_bot("bot-1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].order_id, "42");
        assert_eq!(loaded[0].quote_qty, dec!(30));
        assert_eq!(loaded[0].execution_price, dec!(30000));
    }

    #[tokio::test]
    async fn invalid_trade_is_rejected_at_the_boundary() {
        let db = test_db().await;
        let mut trade = sample_trade("43", Side::Buy, dec!(30));
        trade.execution_price = Decimal::ZERO;
        assert!(matches!(
            db.insert_trade(&trade).await,
            Err(StoreError::Invalid(_))
        ));
        assert!(db.trades_for_bot("bot-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn net_spent_is_buys_minus_sells_floored_at_zero() {
        let db = test_db().await;
        db.insert_trade(&sample_trade("1", Side::Buy, dec!(50))).await.unwrap();
        assert_eq!(db.net_spent("bot-1").await.unwrap(), dec!(50));

        db.insert_trade(&sample_trade("2", Side::Sell, dec!(52))).await.unwrap();
        assert_eq!(db.net_spent("bot-1").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn pre_trade_upsert_keeps_a_single_row() {
        let db = test_db().await;
        let doc = CandleWindowDoc {
            id: 0,
            bot_id: "bot-1".to_string(),
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            timeframe: TimeFrame::M5,
            phase: "pre_trade".to_string(),
            trade_id: None,
            buy_trade_id: None,
            sell_trade_id: None,
            position_status: None,
            candles: Vec::new(),
            count: 0,
            target_count: None,
            start_ts: None,
            end_ts: None,
            updated_ts: Utc::now(),
        };

        db.upsert_pre_trade_window(&doc).await.unwrap();
        db.upsert_pre_trade_window(&doc).await.unwrap();

        let windows = db
            .windows_for_bot("bot-1", Some("pre_trade"), None, None)
            .await
            .unwrap();
        assert_eq!(windows.len(), 1);
    }

    #[tokio::test]
    async fn bot_config_roundtrip() {
        let db = test_db().await;
        let config = BotConfig {
            bot_id: "bot-1".to_string(),
            strategy: StrategyKind::Combined,
            symbol: Symbol::parse("BTCUSDT").unwrap(),
            amount: dec!(100),
            timeframe: TimeFrame::M5,
            trading_mode: TradingMode::Spot,
            started_at: Utc::now(),
            stopped_at: None,
            started_by: Some("decision_agent".to_string()),
            autonomous: true,
        };
        db.insert_bot_config(&config).await.unwrap();

        let loaded = db.get_bot_config("bot-1").await.unwrap().unwrap();
        assert_eq!(loaded.strategy, StrategyKind::Combined);
        assert!(loaded.autonomous);
        assert_eq!(loaded.started_by.as_deref(), Some("decision_agent"));
    }
}
