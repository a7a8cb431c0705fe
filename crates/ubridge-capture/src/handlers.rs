//! Topic-keyed handler dispatch for capture events.
//!
//! Handlers run sequentially within a topic and are individually bounded by
//! a deadline; a slow or failing handler is logged and skipped without
//! affecting capture itself.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use ubridge_core::config::HANDLER_DEADLINE_MS;

use crate::types::{CaptureEvent, CaptureSession, Topic};

/// Payload delivered to handlers. `event` is set only for `event:received`.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: Topic,
    pub session: CaptureSession,
    pub event: Option<CaptureEvent>,
}

#[async_trait]
pub trait CaptureHandler: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    async fn handle(&self, event: &BusEvent) -> Result<(), String>;
}

/// Registry of (topic, handler) pairs. Registration order is dispatch order.
pub struct HandlerRegistry {
    handlers: RwLock<Vec<(Topic, Arc<dyn CaptureHandler>)>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, topic: Topic, handler: Arc<dyn CaptureHandler>) {
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        debug!(topic = topic.as_str(), name = handler.name(), "handler registered");
        handlers.push((topic, handler));
    }

    /// Run every handler subscribed to the event's topic, sequentially.
    pub async fn dispatch(&self, event: BusEvent) {
        let subscribed: Vec<Arc<dyn CaptureHandler>> = {
            let handlers = self.handlers.read().expect("handler registry poisoned");
            handlers
                .iter()
                .filter(|(topic, _)| *topic == event.topic)
                .map(|(_, h)| Arc::clone(h))
                .collect()
        };

        for handler in subscribed {
            let started = Instant::now();
            let result = tokio::time::timeout(
                Duration::from_millis(HANDLER_DEADLINE_MS),
                handler.handle(&event),
            )
            .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(Ok(())) => {
                    debug!(
                        name = handler.name(),
                        topic = event.topic.as_str(),
                        duration_ms = elapsed_ms,
                        "handler completed"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        name = handler.name(),
                        topic = event.topic.as_str(),
                        error = %e,
                        "handler failed"
                    );
                }
                Err(_) => {
                    warn!(
                        name = handler.name(),
                        topic = event.topic.as_str(),
                        deadline_ms = HANDLER_DEADLINE_MS,
                        "handler timed out, skipped"
                    );
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().expect("handler registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
