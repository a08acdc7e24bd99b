use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::exchange::{ExchangeApi, ExchangeError};
use crate::storage::{CandleWindowDoc, Database, StoreError};
use crate::types::{Candle, Symbol, TimeFrame};

/// Candles captured before each trade decision.
pub const PRE_TRADE_CANDLES: u32 = 200;
/// Candles tracked after a closing trade.
pub const POST_TRADE_CANDLES: i64 = 200;
/// A pre-trade capture below this size is rejected as unusable.
pub const MIN_PRE_TRADE_CANDLES: usize = 10;

pub const PHASE_PRE_TRADE: &str = "pre_trade";
pub const PHASE_DURING_TRADE: &str = "during_trade";
pub const PHASE_POST_TRADE: &str = "post_trade";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("insufficient candle data ({got} candles)")]
    InsufficientData { got: usize },
    #[error("tracking not found: {0}")]
    NotFound(String),
    #[error("tracking conflict: {0}")]
    Conflict(String),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Clone)]
pub struct TrackingStatus {
    pub current_count: usize,
    pub new_candles_added: usize,
    pub completed: bool,
}

/// Captures phase-keyed candle windows per bot and trade:
///
/// * `pre_trade` - the latest 200 candles before every decision,
///   upserted each tick;
/// * `during_trade` - every candle while a position is open, keyed by
///   the opening trade;
/// * `post_trade` - the 200 candles after a closing trade, for offline
///   learning about exit quality.
pub struct CandleTracker {
    db: Arc<Database>,
    api: Arc<dyn ExchangeApi>,
}

impl CandleTracker {
    pub fn new(db: Arc<Database>, api: Arc<dyn ExchangeApi>) -> Self {
        Self { db, api }
    }

    /// Fetches the latest candles and upserts the bot's pre-trade
    /// window. Repeating the call in one tick stores the same document.
    pub async fn track_pre_trade(
        &self,
        bot_id: &str,
        symbol: &Symbol,
        timeframe: TimeFrame,
        limit: u32,
    ) -> TrackerResult<TrackingStatus> {
        let fetched = self.api.klines(symbol, timeframe, limit).await?;
        if fetched.len() < MIN_PRE_TRADE_CANDLES {
            warn!(
                "CandleTracker: not enough candles for {} ({} candles)",
                symbol,
                fetched.len()
            );
            return Err(TrackerError::InsufficientData { got: fetched.len() });
        }

        let candles = dedupe_sorted(fetched, None);
        let count = candles.len();
        let doc = CandleWindowDoc {
            id: 0,
            bot_id: bot_id.to_string(),
            symbol: symbol.clone(),
            timeframe,
            phase: PHASE_PRE_TRADE.to_string(),
            trade_id: None,
            buy_trade_id: None,
            sell_trade_id: None,
            position_status: None,
            start_ts: candles.first().map(|c| c.ts),
            end_ts: candles.last().map(|c| c.ts),
            count: count as i64,
            target_count: None,
            candles,
            updated_ts: Utc::now(),
        };
        self.db.upsert_pre_trade_window(&doc).await?;

        info!(
            "CandleTracker: pre-trade window for bot {} ({}) updated: {} candles",
            bot_id, symbol, count
        );
        Ok(TrackingStatus { current_count: count, new_candles_added: count, completed: true })
    }

    /// Opens a during-trade window after a BUY. A bot has at most one
    /// open window; starting a second is a conflict.
    pub async fn start_position_tracking(
        &self,
        bot_id: &str,
        symbol: &Symbol,
        timeframe: TimeFrame,
        buy_trade_id: &str,
    ) -> TrackerResult<()> {
        if self.db.find_open_during_window(bot_id).await?.is_some() {
            return Err(TrackerError::Conflict(format!(
                "bot {bot_id} already has an open during-trade window"
            )));
        }

        let doc = CandleWindowDoc {
            id: 0,
            bot_id: bot_id.to_string(),
            symbol: symbol.clone(),
            timeframe,
            phase: PHASE_DURING_TRADE.to_string(),
            trade_id: None,
            buy_trade_id: Some(buy_trade_id.to_string()),
            sell_trade_id: None,
            position_status: Some("open".to_string()),
            candles: Vec::new(),
            count: 0,
            target_count: None,
            start_ts: Some(Utc::now()),
            end_ts: None,
            updated_ts: Utc::now(),
        };
        self.db.insert_candle_window(&doc).await?;

        info!(
            "CandleTracker: position tracking started for bot {} ({}) after BUY {}",
            bot_id, symbol, buy_trade_id
        );
        Ok(())
    }

    /// Appends fresh candles to the bot's open during-trade window.
    pub async fn update_position_tracking(&self, bot_id: &str) -> TrackerResult<TrackingStatus> {
        let doc = self
            .db
            .find_open_during_window(bot_id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(format!("no open position tracking for bot {bot_id}")))?;

        let fetched = self.api.klines(&doc.symbol, doc.timeframe, 100).await?;
        let before = doc.candles.len();

        let mut merged = doc.candles;
        merged.extend(fetched);
        let merged = dedupe_sorted(merged, doc.start_ts);
        let added = merged.len().saturating_sub(before);

        let end_ts = merged.last().map(|c| c.ts);
        self.db.update_window_candles(doc.id, &merged, end_ts).await?;

        debug!(
            "CandleTracker: position tracking for bot {} now at {} candles",
            bot_id,
            merged.len()
        );
        Ok(TrackingStatus {
            current_count: merged.len(),
            new_candles_added: added,
            completed: false,
        })
    }

    /// Flips the open during-trade window to closed, stamping the
    /// closing trade. Exactly-once: a second call finds no open window.
    pub async fn stop_position_tracking(
        &self,
        bot_id: &str,
        sell_trade_id: Option<&str>,
    ) -> TrackerResult<CandleWindowDoc> {
        let closed = self
            .db
            .close_during_window(bot_id, sell_trade_id, Utc::now())
            .await?
            .ok_or_else(|| TrackerError::NotFound(format!("no open position tracking for bot {bot_id}")))?;

        info!(
            "CandleTracker: position tracking for bot {} stopped ({} candles collected)",
            bot_id, closed.count
        );
        Ok(closed)
    }

    /// Opens an empty post-trade window that will accumulate the 200
    /// candles strictly after `executed_at`.
    pub async fn start_post_trade(
        &self,
        bot_id: &str,
        symbol: &Symbol,
        timeframe: TimeFrame,
        trade_id: &str,
        executed_at: DateTime<Utc>,
    ) -> TrackerResult<()> {
        let doc = CandleWindowDoc {
            id: 0,
            bot_id: bot_id.to_string(),
            symbol: symbol.clone(),
            timeframe,
            phase: PHASE_POST_TRADE.to_string(),
            trade_id: Some(trade_id.to_string()),
            buy_trade_id: None,
            sell_trade_id: None,
            position_status: None,
            candles: Vec::new(),
            count: 0,
            target_count: Some(POST_TRADE_CANDLES),
            start_ts: Some(executed_at),
            end_ts: None,
            updated_ts: Utc::now(),
        };
        self.db.insert_candle_window(&doc).await?;

        info!(
            "CandleTracker: post-trade tracking started for trade {} (bot {}, {})",
            trade_id, bot_id, symbol
        );
        Ok(())
    }

    /// Appends candles after the window start until the target count is
    /// reached.
    pub async fn update_post_trade(&self, trade_id: &str) -> TrackerResult<TrackingStatus> {
        let doc = self
            .db
            .find_window_by_trade(trade_id, PHASE_POST_TRADE)
            .await?
            .ok_or_else(|| TrackerError::NotFound(format!("no post-trade tracking for {trade_id}")))?;

        let target = doc.target_count.unwrap_or(POST_TRADE_CANDLES) as usize;
        if doc.candles.len() >= target {
            debug!(
                "CandleTracker: post-trade tracking for {} already complete ({}/{})",
                trade_id,
                doc.candles.len(),
                target
            );
            return Ok(TrackingStatus {
                current_count: doc.candles.len(),
                new_candles_added: 0,
                completed: true,
            });
        }

        let needed = target - doc.candles.len();
        let limit = (needed + 10).min(250) as u32;
        let fetched = self.api.klines(&doc.symbol, doc.timeframe, limit).await?;
        let before = doc.candles.len();

        let mut merged = doc.candles;
        merged.extend(fetched);
        let mut merged = dedupe_sorted(merged, doc.start_ts);
        merged.truncate(target);
        let added = merged.len().saturating_sub(before);

        let end_ts = merged.last().map(|c| c.ts);
        self.db.update_window_candles(doc.id, &merged, end_ts).await?;

        let completed = merged.len() >= target;
        if completed {
            info!(
                "CandleTracker: post-trade tracking for {} complete ({}/{})",
                trade_id,
                merged.len(),
                target
            );
        }
        Ok(TrackingStatus { current_count: merged.len(), new_candles_added: added, completed })
    }

    /// Read side: all windows of a bot, optionally narrowed by phase,
    /// symbol and timeframe.
    pub async fn get_candles(
        &self,
        bot_id: &str,
        phase: Option<&str>,
        symbol: Option<&Symbol>,
        timeframe: Option<TimeFrame>,
    ) -> TrackerResult<Vec<CandleWindowDoc>> {
        Ok(self.db.windows_for_bot(bot_id, phase, symbol, timeframe).await?)
    }

    pub async fn get_trade_candles(
        &self,
        trade_id: &str,
        phase: &str,
    ) -> TrackerResult<Option<CandleWindowDoc>> {
        Ok(self.db.find_window_by_trade(trade_id, phase).await?)
    }

    /// Deletes windows not touched for `days_to_keep` days.
    pub async fn cleanup(&self, days_to_keep: i64) -> TrackerResult<u64> {
        let cutoff = Utc::now() - Duration::days(days_to_keep);
        let deleted = self.db.delete_windows_older_than(cutoff).await?;
        info!(
            "CandleTracker: deleted {} tracking documents older than {} days",
            deleted, days_to_keep
        );
        Ok(deleted)
    }
}

/// Sorts by timestamp, removes duplicates and drops candles at or
/// before `after`. The result is strictly increasing by `ts`.
fn dedupe_sorted(candles: Vec<Candle>, after: Option<DateTime<Utc>>) -> Vec<Candle> {
    let mut by_ts: BTreeMap<DateTime<Utc>, Candle> = BTreeMap::new();
    for candle in candles {
        if let Some(after) = after {
            if candle.ts <= after {
                continue;
            }
        }
        by_ts.insert(candle.ts, candle);
    }
    by_ts.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn candle(minute: i64) -> Candle {
        Candle {
            ts: Utc.timestamp_opt(minute * 60, 0).unwrap(),
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: Decimal::ONE,
        }
    }

    #[test]
    fn dedupe_sorted_orders_and_deduplicates() {
        let merged = dedupe_sorted(vec![candle(10), candle(5), candle(10), candle(0)], None);
        let minutes: Vec<i64> = merged.iter().map(|c| c.ts.timestamp() / 60).collect();
        assert_eq!(minutes, vec![0, 5, 10]);
        assert!(crate::types::candle::is_strictly_ordered(&merged));
    }

    #[test]
    fn dedupe_sorted_drops_candles_at_or_before_cutoff() {
        let cutoff = Utc.timestamp_opt(5 * 60, 0).unwrap();
        let merged = dedupe_sorted(
            vec![candle(0), candle(5), candle(10), candle(15)],
            Some(cutoff),
        );
        let minutes: Vec<i64> = merged.iter().map(|c| c.ts.timestamp() / 60).collect();
        assert_eq!(minutes, vec![10, 15]);
    }
}
