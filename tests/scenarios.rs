//! End-to-end scenarios driving the bot runtime against a scripted
//! exchange and an in-memory store.

mod common;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;

use cryptofleet::agents::{AgentName, InertDecisionAgent, StartAutonomousBotParams};
use cryptofleet::engine::{AutonomousSupervisor, BotManager, Services, TradingBot};
use cryptofleet::types::{
    ExitReason, Side, StrategyKind, TimeFrame, TradeRecord, TradingMode,
};

use common::{btc, flat_series, test_services, FakeExchange};

/// Starts a bot and immediately stops the background loop so the test
/// can drive ticks deterministically.
async fn start_paused_bot(
    services: &Arc<Services>,
    amount: Decimal,
) -> Arc<TradingBot> {
    let bot = Arc::new(TradingBot::new(Arc::clone(services), None));
    bot.start(
        StrategyKind::Combined,
        btc(),
        amount,
        TimeFrame::M5,
        TradingMode::Spot,
    )
    .await
    .expect("bot start");
    bot.stop().await.expect("bot stop");
    bot
}

async fn set_price(services: &Arc<Services>, fake: &FakeExchange, price: Decimal) {
    fake.set_price(price);
    services.prices.refresh_all().await;
}

fn seed_buy_trade(bot_id: &str, price: Decimal, qty: Decimal, hours_ago: i64) -> TradeRecord {
    TradeRecord {
        order_id: "777".to_string(),
        bot_id: bot_id.to_string(),
        symbol: btc(),
        side: Side::Buy,
        quantity: qty,
        execution_price: price,
        quote_qty: price * qty,
        strategy: "combined".to_string(),
        trading_mode: TradingMode::Spot,
        exit_reason: None,
        decision_price: Some(price),
        decision_ts: Some(Utc::now() - Duration::hours(hours_ago)),
        execution_ts: Utc::now() - Duration::hours(hours_ago),
        slippage_abs: Some(Decimal::ZERO),
        slippage_pct: Some(Decimal::ZERO),
        delay_seconds: Some(0),
        confidence: dec!(0.7),
        indicators: json!({}),
        pnl_abs: None,
        pnl_pct: None,
        position_entry_price: None,
        buy_trade_id: None,
    }
}

/// Checks the persisted-trade invariants: positive execution price,
/// quote consistency, and exit-reason/P&L agreement on closing trades.
fn assert_trade_invariants(trades: &[TradeRecord]) {
    for trade in trades {
        assert!(trade.execution_price > Decimal::ZERO, "trade {} price", trade.order_id);
        if trade.quantity > Decimal::ZERO {
            let implied = trade.execution_price * trade.quantity;
            let tolerance = (trade.quote_qty * dec!(0.000001)).abs().max(dec!(0.000001));
            assert!(
                (trade.quote_qty - implied).abs() <= tolerance,
                "trade {} quote_qty {} vs {}",
                trade.order_id,
                trade.quote_qty,
                implied
            );
        }
        if let (Some(entry), Some(pnl_pct)) = (trade.position_entry_price, trade.pnl_pct) {
            if entry > Decimal::ZERO && trade.side == Side::Sell {
                assert_eq!(
                    pnl_pct > Decimal::ZERO,
                    trade.execution_price > entry,
                    "trade {} P&L sign",
                    trade.order_id
                );
                if trade.strategy != "manual" {
                    let expected = if pnl_pct <= dec!(-2) {
                        ExitReason::StopLoss
                    } else if pnl_pct >= dec!(2) {
                        ExitReason::TakeProfit
                    } else {
                        ExitReason::Signal
                    };
                    assert_eq!(trade.exit_reason, Some(expected), "trade {}", trade.order_id);
                }
                // A long never sells below entry unless the stop-loss fired.
                if trade.execution_price < entry {
                    assert_eq!(trade.exit_reason, Some(ExitReason::StopLoss));
                }
            }
        }
    }
}

/// S1 + S6: the trailing take-profit holds through every blocked path,
/// fires exactly when drop >= 3% with P&L >= 2%, and the candle windows
/// go through their full lifecycle.
#[tokio::test]
async fn trailing_take_profit_fires_only_at_the_contract_point() {
    let fake = FakeExchange::new(dec!(30000));
    let services = test_services(Arc::clone(&fake)).await;

    // An aged long is adopted from balances: 0.002 BTC bought at 30000
    // two hours ago, so the minimum hold is long satisfied.
    fake.set_balance("BTC", dec!(0.002));
    let bot = Arc::new(TradingBot::new(Arc::clone(&services), None));
    services
        .db
        .insert_trade(&seed_buy_trade(bot.bot_id(), dec!(30000), dec!(0.002), 2))
        .await
        .unwrap();
    bot.start(StrategyKind::Combined, btc(), dec!(100), TimeFrame::M5, TradingMode::Spot)
        .await
        .expect("bot start");
    bot.stop().await.expect("bot stop");

    let position = bot.position().await;
    assert!(position.is_open(), "position adopted from balance");
    assert_eq!(position.entry_price, dec!(30000));

    // The during-trade window a BUY would have opened (order 777).
    services
        .tracker
        .start_position_tracking(bot.bot_id(), &btc(), TimeFrame::M5, "777")
        .await
        .unwrap();
    let open_windows = services.db.find_open_during_window(bot.bot_id()).await.unwrap();
    assert!(open_windows.is_some(), "exactly one open during-trade window");

    // Climb to 31500, then probe every blocked path.
    for price in [dec!(31000), dec!(31500)] {
        set_price(&services, &fake, price).await;
        bot.tick().await.unwrap();
    }
    // Drop 0.95% from the high: nothing happens.
    set_price(&services, &fake, dec!(31200)).await;
    bot.tick().await.unwrap();
    // Drop 3.02% but P&L only +1.83%: blocked by the profit target.
    set_price(&services, &fake, dec!(30550)).await;
    bot.tick().await.unwrap();
    // Drop 1.9% with P&L +3%: drawdown condition not met.
    set_price(&services, &fake, dec!(30900)).await;
    bot.tick().await.unwrap();
    // Same blocked state again.
    set_price(&services, &fake, dec!(30550)).await;
    bot.tick().await.unwrap();

    assert_eq!(fake.placed_count(), 0, "no SELL under any blocked path");
    assert!(bot.position().await.is_open());

    // New high 31800, then a 3.1% drop leaving +2.67% profit: fires.
    set_price(&services, &fake, dec!(31800)).await;
    bot.tick().await.unwrap();
    set_price(&services, &fake, dec!(30800)).await;
    bot.tick().await.unwrap();

    assert_eq!(fake.placed_sides(), vec!["SELL"]);
    assert!(!bot.position().await.is_open());

    let trades = services.db.trades_for_bot(bot.bot_id()).await.unwrap();
    let sell = trades.iter().find(|t| t.side == Side::Sell).expect("closing trade");
    assert_eq!(sell.exit_reason, Some(ExitReason::TakeProfit));
    assert_eq!(sell.position_entry_price, Some(dec!(30000)));
    assert_eq!(sell.buy_trade_id.as_deref(), Some("777"));
    assert!(sell.pnl_pct.unwrap() >= dec!(2));
    assert_trade_invariants(&trades);

    // S6: the during-trade window flipped exactly once and a post-trade
    // window now targets the closing trade.
    assert!(
        services.db.find_open_during_window(bot.bot_id()).await.unwrap().is_none(),
        "during-trade window closed"
    );
    let during = services
        .tracker
        .get_trade_candles("777", "during_trade")
        .await
        .unwrap()
        .expect("during window");
    assert_eq!(during.position_status.as_deref(), Some("closed"));
    assert_eq!(during.sell_trade_id.as_deref(), Some(sell.order_id.as_str()));

    let post = services
        .tracker
        .get_trade_candles(&sell.order_id, "post_trade")
        .await
        .unwrap()
        .expect("post window");
    assert_eq!(post.target_count, Some(200));
    assert_eq!(post.count as usize, post.candles.len());

    // Feed future candles: the post-trade window accumulates only
    // candles strictly after the sell and stops at 200.
    fake.set_klines(flat_series(dec!(30800), 250, Utc::now() + Duration::hours(24)));
    bot.tick().await.unwrap();

    let post = services
        .tracker
        .get_trade_candles(&sell.order_id, "post_trade")
        .await
        .unwrap()
        .expect("post window");
    assert_eq!(post.count, 200);
    let start_ts = post.start_ts.unwrap();
    assert!(post.candles.iter().all(|c| c.ts > start_ts));
    assert!(cryptofleet::types::candle::is_strictly_ordered(&post.candles));
}

/// S2: the stop-loss overrides the minimum holding time.
#[tokio::test]
async fn stop_loss_overrides_minimum_hold() {
    let fake = FakeExchange::new(dec!(100));
    let services = test_services(Arc::clone(&fake)).await;
    let bot = start_paused_bot(&services, dec!(100)).await;

    // Manual BUY at 100; the position is minutes old.
    bot.manual_trade(Side::Buy, None, None).await.expect("manual buy");
    assert!(bot.position().await.is_open());

    // Price collapses to 97: -3% <= -2% closes immediately.
    set_price(&services, &fake, dec!(97)).await;
    bot.tick().await.unwrap();

    assert!(!bot.position().await.is_open());
    let trades = services.db.trades_for_bot(bot.bot_id()).await.unwrap();
    let sell = trades.iter().find(|t| t.side == Side::Sell).expect("stop-loss sell");
    assert_eq!(sell.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(sell.pnl_pct, Some(dec!(-3)));
    assert_trade_invariants(&trades);
}

/// S3: an order reply without a derivable execution price is fatal for
/// the trade: cancel attempted, nothing persisted, position unchanged.
#[tokio::test]
async fn execution_price_unavailable_rejects_the_trade() {
    let fake = FakeExchange::new(dec!(30000));
    let services = test_services(Arc::clone(&fake)).await;
    let bot = start_paused_bot(&services, dec!(100)).await;

    fake.set_degenerate_replies(true);
    bot.manual_trade(Side::Buy, None, None).await.expect("attempt runs");

    // The order went out, the cancel followed, and no trade exists.
    assert_eq!(fake.placed_count(), 1);
    assert_eq!(fake.cancelled.lock().unwrap().clone(), vec!["1".to_string()]);
    assert!(services.db.trades_for_bot(bot.bot_id()).await.unwrap().is_empty());
    assert!(!bot.position().await.is_open());

    // The bot keeps ticking afterwards.
    fake.set_degenerate_replies(false);
    bot.tick().await.unwrap();
}

/// S4: the autonomy cap rejects a third autonomous bot without writing
/// anything.
#[tokio::test]
async fn autonomy_cap_rejects_a_third_bot() {
    let fake = FakeExchange::new(dec!(30000));
    let services = test_services(Arc::clone(&fake)).await;
    let manager = BotManager::new(Arc::clone(&services));
    let supervisor = AutonomousSupervisor::new(
        Arc::clone(&manager),
        Arc::new(InertDecisionAgent),
        None,
    );

    let params = |symbol: &str| StartAutonomousBotParams {
        symbol: cryptofleet::types::Symbol::parse(symbol).unwrap(),
        strategy: StrategyKind::Combined,
        timeframe: TimeFrame::M5,
        trading_mode: TradingMode::Spot,
    };

    for symbol in ["BTCUSDT", "ETHUSDT"] {
        let (bot_id, budget) = supervisor
            .start_autonomous_bot(AgentName::Decision, params(symbol))
            .await
            .expect("autonomous start");
        assert!(budget >= dec!(10));
        let config = services.db.get_bot_config(&bot_id).await.unwrap().unwrap();
        assert!(config.autonomous);
        assert_eq!(config.started_by.as_deref(), Some("decision"));
    }

    let error = supervisor
        .start_autonomous_bot(AgentName::Decision, params("SOLUSDT"))
        .await
        .expect_err("third bot rejected");
    assert_eq!(error, "autonomy cap reached");
    assert_eq!(manager.all_bots().await.len(), 2, "no third bot created");

    // Only the decision agent may spawn.
    let error = supervisor
        .start_autonomous_bot(AgentName::Chat, params("SOLUSDT"))
        .await
        .expect_err("wrong caller rejected");
    assert!(error.contains("decision agent"));

    manager.shutdown().await;
}

/// S5: a completed round trip releases the budget for the next entry.
#[tokio::test]
async fn budget_recycles_after_a_full_round_trip() {
    let fake = FakeExchange::new(dec!(50000));
    let services = test_services(Arc::clone(&fake)).await;
    let bot = start_paused_bot(&services, dec!(50)).await;

    // A past cycle: bought for 50, sold for 52.
    let mut buy = seed_buy_trade(bot.bot_id(), dec!(50000), dec!(0.001), 3);
    buy.order_id = "90".to_string();
    services.db.insert_trade(&buy).await.unwrap();
    let mut sell = seed_buy_trade(bot.bot_id(), dec!(52000), dec!(0.001), 2);
    sell.order_id = "91".to_string();
    sell.side = Side::Sell;
    sell.exit_reason = Some(ExitReason::TakeProfit);
    sell.position_entry_price = Some(dec!(50000));
    sell.pnl_abs = Some(dec!(2));
    sell.pnl_pct = Some(dec!(4));
    services.db.insert_trade(&sell).await.unwrap();

    // Net spent is clamped at zero, so the full 50 is available again.
    assert_eq!(services.db.net_spent(bot.bot_id()).await.unwrap(), Decimal::ZERO);

    bot.manual_trade(Side::Buy, None, None).await.expect("new buy");
    assert_eq!(fake.placed_count(), 1);

    let trades = services.db.trades_for_bot(bot.bot_id()).await.unwrap();
    let new_buy = trades
        .iter()
        .filter(|t| t.side == Side::Buy)
        .max_by_key(|t| t.execution_ts)
        .unwrap();
    assert!(new_buy.quote_qty <= dec!(50), "spend stays within the recycled budget");
    assert!(services.db.net_spent(bot.bot_id()).await.unwrap() <= dec!(50));
    assert_trade_invariants(&trades);
}

/// A BUY opens the during-trade window keyed by its own order id, and a
/// stop-loss close flips it.
#[tokio::test]
async fn buy_opens_and_close_flips_the_during_trade_window() {
    let fake = FakeExchange::new(dec!(100));
    let services = test_services(Arc::clone(&fake)).await;
    let bot = start_paused_bot(&services, dec!(100)).await;

    bot.manual_trade(Side::Buy, None, None).await.expect("manual buy");
    let open = services
        .db
        .find_open_during_window(bot.bot_id())
        .await
        .unwrap()
        .expect("window opened by BUY");
    assert_eq!(open.buy_trade_id.as_deref(), Some("1"));
    assert_eq!(open.position_status.as_deref(), Some("open"));

    set_price(&services, &fake, dec!(97)).await;
    bot.tick().await.unwrap();

    let during = services
        .tracker
        .get_trade_candles("1", "during_trade")
        .await
        .unwrap()
        .expect("window still exists");
    assert_eq!(during.position_status.as_deref(), Some("closed"));
    assert_eq!(during.sell_trade_id.as_deref(), Some("2"));
    assert!(services.db.find_open_during_window(bot.bot_id()).await.unwrap().is_none());
}

/// Pre-trade windows are idempotent within a tick: tracking twice
/// stores one document with identical candles.
#[tokio::test]
async fn pre_trade_tracking_is_idempotent() {
    let fake = FakeExchange::new(dec!(30000));
    let services = test_services(Arc::clone(&fake)).await;

    let first = services
        .tracker
        .track_pre_trade("bot-x", &btc(), TimeFrame::M5, 200)
        .await
        .unwrap();
    let second = services
        .tracker
        .track_pre_trade("bot-x", &btc(), TimeFrame::M5, 200)
        .await
        .unwrap();
    assert_eq!(first.current_count, second.current_count);

    let windows = services
        .tracker
        .get_candles("bot-x", Some("pre_trade"), None, None)
        .await
        .unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].count as usize, windows[0].candles.len());
    assert!(cryptofleet::types::candle::is_strictly_ordered(&windows[0].candles));
}

/// Testnet configurations reject MARGIN and FUTURES bots.
#[tokio::test]
async fn testnet_forbids_leveraged_modes() {
    let fake = FakeExchange::new(dec!(30000));
    let db = Arc::new(cryptofleet::storage::Database::new("sqlite::memory:").await.unwrap());
    let mut settings = common::test_settings();
    settings.use_testnet = true;
    let services = Services::new(
        fake as Arc<dyn cryptofleet::exchange::ExchangeApi>,
        db,
        settings,
    );

    let bot = Arc::new(TradingBot::new(Arc::clone(&services), None));
    let error = bot
        .start(StrategyKind::Combined, btc(), dec!(100), TimeFrame::M5, TradingMode::Margin)
        .await
        .expect_err("margin on testnet");
    assert!(error.contains("testnet"));
    assert!(!bot.is_running());
}
