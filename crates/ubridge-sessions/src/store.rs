use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use ubridge_core::types::{Message, SessionConfig, Usage};

use crate::devices::DeviceRegistry;
use crate::error::{Result, SessionError};
use crate::types::{Session, SessionStatus};

/// One live session behind its own mutex.
///
/// The lock is a `tokio::sync::Mutex` deliberately: the orchestrator holds it
/// across the whole append-call-append cycle of a turn so message ordering
/// within a session is total. The mutex lives in an `Arc` so streaming turns
/// can take an owned guard into a spawned task.
pub struct SessionSlot {
    pub id: String,
    state: Arc<tokio::sync::Mutex<Session>>,
}

impl SessionSlot {
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Session> {
        self.state.lock().await
    }

    pub async fn lock_owned(&self) -> tokio::sync::OwnedMutexGuard<Session> {
        Arc::clone(&self.state).lock_owned().await
    }
}

#[derive(Default)]
pub struct SessionStats {
    pub created: AtomicU64,
    pub evicted: AtomicU64,
    pub messages: AtomicU64,
}

/// Keyed map of live sessions. The map itself is concurrent; each session
/// serializes its own turns through the slot mutex.
pub struct SessionStore {
    slots: DashMap<String, Arc<SessionSlot>>,
    ttl: Duration,
    pub stats: SessionStats,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
            stats: SessionStats::default(),
        }
    }

    /// Create a session for a registered device. Seeds the system message
    /// when the config carries a system prompt.
    pub fn create(
        &self,
        devices: &DeviceRegistry,
        device_id: &str,
        config: SessionConfig,
    ) -> Result<Session> {
        if let Err((field, message)) = config.validate() {
            return Err(SessionError::InvalidConfig {
                field: field.to_string(),
                message,
            });
        }
        if !devices.contains(device_id) {
            return Err(SessionError::DeviceUnknown(device_id.to_string()));
        }
        devices.touch(device_id);

        let now = Utc::now();
        let mut messages = Vec::new();
        if !config.system_prompt.is_empty() {
            messages.push(Message::system(config.system_prompt.clone()));
        }

        let session = Session {
            id: format!("ses_{}", Uuid::now_v7()),
            device_id: device_id.to_string(),
            config,
            messages,
            usage: Usage::default(),
            created_at: now,
            last_activity_at: now,
            status: SessionStatus::Active,
        };

        debug!(id = %session.id, provider = %session.config.provider, "session created");
        self.stats.created.fetch_add(1, Ordering::Relaxed);
        let snapshot = session.clone();
        self.slots.insert(
            session.id.clone(),
            Arc::new(SessionSlot {
                id: session.id.clone(),
                state: Arc::new(tokio::sync::Mutex::new(session)),
            }),
        );
        Ok(snapshot)
    }

    pub fn slot(&self, id: &str) -> Option<Arc<SessionSlot>> {
        self.slots.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Read-only snapshot of the session, messages cloned.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        Some(guard.clone())
    }

    /// Single-message append under the session lock. For whole-turn work the
    /// orchestrator locks the slot itself instead.
    pub async fn append(&self, id: &str, msg: Message) -> Result<()> {
        let slot = self
            .slot(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let mut guard = slot.lock().await;
        if guard.is_ended() {
            return Err(SessionError::Ended(id.to_string()));
        }
        guard.push_message(msg);
        self.stats.messages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_messages(&self, n: u64) {
        self.stats.messages.fetch_add(n, Ordering::Relaxed);
    }

    /// Transition to ended. Idempotent: ending an ended session returns the
    /// same snapshot again.
    pub async fn end(&self, id: &str) -> Result<Session> {
        let slot = self
            .slot(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let mut guard = slot.lock().await;
        if !guard.is_ended() {
            guard.status = SessionStatus::Ended;
            guard.last_activity_at = Utc::now();
            debug!(id, "session ended");
        }
        Ok(guard.clone())
    }

    pub fn delete(&self, id: &str) -> bool {
        self.slots.remove(id).is_some()
    }

    /// Evict sessions idle past the TTL. Returns the eviction count.
    pub fn sweep(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.ttl).unwrap_or_default();
        let mut evicted = 0;
        self.slots.retain(|_, slot| {
            // try_lock: a session mid-turn is active by definition.
            match slot.state.try_lock() {
                Ok(guard) => {
                    let keep = guard.last_activity_at >= cutoff;
                    if !keep {
                        evicted += 1;
                    }
                    keep
                }
                Err(_) => true,
            }
        });
        if evicted > 0 {
            self.stats.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
            info!(evicted, "idle sessions evicted");
        }
        evicted
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Capabilities, DeviceType};
    use ubridge_core::types::{ProviderId, Role};

    fn fixtures() -> (DeviceRegistry, SessionStore, String) {
        let devices = DeviceRegistry::new(Duration::from_secs(3600));
        let store = SessionStore::new(Duration::from_secs(3600));
        let device = devices.register("T", DeviceType::Server, Capabilities::default());
        (devices, store, device.id)
    }

    fn config() -> SessionConfig {
        SessionConfig {
            provider: ProviderId::Claude,
            model: "claude-sonnet-4-5".into(),
            temperature: 0.0,
            max_tokens: 128,
            system_prompt: "SYS".into(),
            tools: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_seeds_system_message() {
        let (devices, store, device_id) = fixtures();
        let session = store.create(&devices, &device_id, config()).unwrap();
        assert!(session.id.starts_with("ses_"));
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, Role::System);
        assert_eq!(session.messages[0].content, "SYS");
    }

    #[tokio::test]
    async fn create_without_prompt_has_empty_log() {
        let (devices, store, device_id) = fixtures();
        let mut cfg = config();
        cfg.system_prompt = String::new();
        let session = store.create(&devices, &device_id, cfg).unwrap();
        assert!(session.messages.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_unknown_device() {
        let (devices, store, _) = fixtures();
        let err = store.create(&devices, "dev_missing", config()).unwrap_err();
        assert!(matches!(err, SessionError::DeviceUnknown(_)));
    }

    #[tokio::test]
    async fn create_rejects_bad_temperature() {
        let (devices, store, device_id) = fixtures();
        let mut cfg = config();
        cfg.temperature = 2.0000001;
        let err = store.create(&devices, &device_id, cfg).unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn append_rejected_after_end() {
        let (devices, store, device_id) = fixtures();
        let session = store.create(&devices, &device_id, config()).unwrap();
        store.end(&session.id).await.unwrap();
        let err = store
            .append(&session.id, Message::user("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Ended(_)));
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let (devices, store, device_id) = fixtures();
        let session = store.create(&devices, &device_id, config()).unwrap();
        let first = store.end(&session.id).await.unwrap();
        let second = store.end(&session.id).await.unwrap();
        assert_eq!(first.status, SessionStatus::Ended);
        assert_eq!(second.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn observations_are_prefix_ordered() {
        let (devices, store, device_id) = fixtures();
        let session = store.create(&devices, &device_id, config()).unwrap();

        store.append(&session.id, Message::user("one")).await.unwrap();
        let o1 = store.get(&session.id).await.unwrap();
        store.append(&session.id, Message::assistant("two")).await.unwrap();
        let o2 = store.get(&session.id).await.unwrap();

        assert!(o2.messages.len() > o1.messages.len());
        for (a, b) in o1.messages.iter().zip(o2.messages.iter()) {
            assert_eq!(a.content, b.content);
        }
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions() {
        let (devices, _, device_id) = fixtures();
        let store = SessionStore::new(Duration::ZERO);
        store.create(&devices, &device_id, config()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.active_count(), 0);
        assert_eq!(store.stats.evicted.load(Ordering::Relaxed), 1);
    }
}
