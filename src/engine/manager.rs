use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::info;

use super::{Services, TradingBot};

/// Owns the set of bots and the shared price cache refresher.
pub struct BotManager {
    services: Arc<Services>,
    bots: RwLock<HashMap<String, Arc<TradingBot>>>,
    refresher_shutdown: watch::Sender<bool>,
    refresher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BotManager {
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        let (refresher_shutdown, shutdown_rx) = watch::channel(false);
        let refresher = services.prices.spawn_refresher(shutdown_rx);
        Arc::new(Self {
            services,
            bots: RwLock::new(HashMap::new()),
            refresher_shutdown,
            refresher: Mutex::new(Some(refresher)),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Returns the bot with the given id, or creates a fresh one (with
    /// a generated id when none is supplied).
    pub async fn get_bot(&self, bot_id: Option<&str>) -> Arc<TradingBot> {
        if let Some(id) = bot_id {
            if let Some(bot) = self.bots.read().await.get(id) {
                return Arc::clone(bot);
            }
        }

        let bot = Arc::new(TradingBot::new(
            Arc::clone(&self.services),
            bot_id.map(str::to_string),
        ));
        self.bots
            .write()
            .await
            .insert(bot.bot_id().to_string(), Arc::clone(&bot));
        info!("BotManager: created bot {}", bot.bot_id());
        bot
    }

    pub async fn find_bot(&self, bot_id: &str) -> Option<Arc<TradingBot>> {
        self.bots.read().await.get(bot_id).cloned()
    }

    pub async fn all_bots(&self) -> Vec<Arc<TradingBot>> {
        self.bots.read().await.values().cloned().collect()
    }

    /// Currently running bots flagged autonomous.
    pub async fn autonomous_bot_count(&self) -> usize {
        let mut count = 0;
        for bot in self.all_bots().await {
            if bot.is_running() {
                if let Some(config) = bot.config().await {
                    if config.autonomous {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    pub async fn status_all(&self) -> Value {
        let mut statuses = Vec::new();
        for bot in self.all_bots().await {
            statuses.push(bot.status().await);
        }
        json!({
            "bot_count": statuses.len(),
            "bots": statuses,
        })
    }

    /// Removes a stopped bot. Running bots must be stopped first.
    pub async fn remove_bot(&self, bot_id: &str) -> Result<(), String> {
        let mut bots = self.bots.write().await;
        match bots.get(bot_id) {
            None => Err(format!("Bot {bot_id} not found")),
            Some(bot) if bot.is_running() => {
                Err(format!("Bot {bot_id} is running; stop it before removing"))
            }
            Some(_) => {
                bots.remove(bot_id);
                info!("BotManager: removed bot {}", bot_id);
                Ok(())
            }
        }
    }

    /// Stops every bot and the price refresher.
    pub async fn shutdown(&self) {
        for bot in self.all_bots().await {
            if bot.is_running() {
                let _ = bot.stop().await;
            }
        }
        let _ = self.refresher_shutdown.send(true);
        if let Some(handle) = self.refresher.lock().await.take() {
            let _ = handle.await;
        }
    }
}
