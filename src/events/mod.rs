use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Events fanned out to in-process subscribers (WebSocket streams,
/// notifiers). Serialized as tagged JSON for the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    BotStarted {
        bot_id: String,
        symbol: String,
        strategy: String,
    },
    BotStopped {
        bot_id: String,
    },
    BotStartFailed {
        bot_id: String,
        error: String,
    },
    TradeExecuted {
        bot_id: String,
        symbol: String,
        side: String,
        quantity: Decimal,
        execution_price: Decimal,
        quote_qty: Decimal,
        exit_reason: Option<String>,
        pnl_pct: Option<Decimal>,
    },
    StatusUpdate {
        bot_id: String,
        status: serde_json::Value,
    },
    LogMessage {
        agent: String,
        message: String,
        message_type: String,
    },
    NewsShared {
        count: usize,
        titles: Vec<String>,
    },
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<Event>,
}

/// In-process publish/subscribe fan-out.
///
/// Each subscriber gets a bounded queue. Publishing never blocks: when
/// a subscriber's queue is full the event is dropped for that
/// subscriber only, and per-publisher ordering is preserved by the
/// underlying channel.
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn subscribe(&self, name: &str, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.write().await.push(Subscriber {
            name: name.to_string(),
            tx,
        });
        rx
    }

    pub async fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event bus: subscriber '{}' is full, dropping event", sub.name);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event bus: subscriber '{}' is gone, removing", sub.name);
                false
            }
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_event(message: &str) -> Event {
        Event::LogMessage {
            agent: "decision".to_string(),
            message: message.to_string(),
            message_type: "analysis".to_string(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_published_events() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe("a", 8).await;
        let mut rx2 = bus.subscribe("b", 8).await;

        bus.publish(log_event("hello")).await;

        assert!(matches!(rx1.recv().await, Some(Event::LogMessage { .. })));
        assert!(matches!(rx2.recv().await, Some(Event::LogMessage { .. })));
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("slow", 1).await;

        bus.publish(log_event("first")).await;
        bus.publish(log_event("second")).await; // dropped, queue is full

        let Some(Event::LogMessage { message, .. }) = rx.recv().await else {
            panic!("expected a log message");
        };
        assert_eq!(message, "first");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_publisher_order_is_preserved() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("ordered", 16).await;

        for i in 0..5 {
            bus.publish(log_event(&i.to_string())).await;
        }
        for i in 0..5 {
            let Some(Event::LogMessage { message, .. }) = rx.recv().await else {
                panic!("expected a log message");
            };
            assert_eq!(message, i.to_string());
        }
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe("gone", 1).await;
        drop(rx);

        bus.publish(log_event("x")).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
