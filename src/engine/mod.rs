pub mod bot;
pub mod manager;
pub mod autonomous;

pub use autonomous::{AutonomousApi, AutonomousSupervisor, MAX_AUTONOMOUS_BOTS};
pub use bot::TradingBot;
pub use manager::BotManager;

use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::events::EventBus;
use crate::exchange::{ExchangeApi, PriceCache};
use crate::memory::MemoryManager;
use crate::storage::Database;
use crate::tracker::CandleTracker;

/// Bot loop period.
pub const TICK_INTERVAL: Duration = Duration::from_secs(300);
/// Back-off after a failed tick.
pub const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Shared collaborators, passed through constructors instead of being
/// reached for globally. Tests substitute fakes at this seam.
pub struct Services {
    pub exchange: Arc<dyn ExchangeApi>,
    pub db: Arc<Database>,
    pub events: EventBus,
    pub prices: Arc<PriceCache>,
    pub memory: Arc<MemoryManager>,
    pub tracker: Arc<CandleTracker>,
    pub settings: Settings,
}

impl Services {
    pub fn new(exchange: Arc<dyn ExchangeApi>, db: Arc<Database>, settings: Settings) -> Arc<Self> {
        let prices = Arc::new(PriceCache::new(Arc::clone(&exchange)));
        let memory = Arc::new(MemoryManager::new(Arc::clone(&db)));
        let tracker = Arc::new(CandleTracker::new(Arc::clone(&db), Arc::clone(&exchange)));
        Arc::new(Self {
            exchange,
            db,
            events: EventBus::new(),
            prices,
            memory,
            tracker,
            settings,
        })
    }
}
