//! The capture bus: per-session event buffers, periodic disk flush, and
//! handler dispatch. WebSocket and REST callers share one instance.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ubridge_core::config::{CAPTURE_FLUSH_INTERVAL_SECS, CAPTURE_FLUSH_THRESHOLD};

use crate::error::{CaptureError, Result};
use crate::handlers::{BusEvent, HandlerRegistry};
use crate::types::{CaptureEvent, CaptureSession, CaptureStatus, Topic};

struct SlotState {
    meta: CaptureSession,
    buffer: Vec<CaptureEvent>,
}

/// One capture session; the mutex makes the buffer single-writer and
/// serializes flushes per session.
struct CaptureSlot {
    state: tokio::sync::Mutex<SlotState>,
}

#[derive(Default)]
pub struct CaptureStats {
    pub sessions_created: AtomicU64,
    pub events_received: AtomicU64,
    pub flushes: AtomicU64,
}

pub struct CaptureBus {
    slots: DashMap<String, Arc<CaptureSlot>>,
    dir: PathBuf,
    pub handlers: HandlerRegistry,
    pub stats: CaptureStats,
}

impl CaptureBus {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            slots: DashMap::new(),
            dir,
            handlers: HandlerRegistry::new(),
            stats: CaptureStats::default(),
        })
    }

    /// Session ids become file names; anything outside [A-Za-z0-9._-] or a
    /// dot-leading name is refused.
    fn check_session_id(id: &str) -> Result<()> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(CaptureError::InvalidSessionId(id.to_string()))
        }
    }

    fn file_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    pub async fn create_session(
        &self,
        id: &str,
        title: Option<String>,
        platform: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<CaptureSession> {
        Self::check_session_id(id)?;
        if self.slots.contains_key(id) {
            return Err(CaptureError::AlreadyExists(id.to_string()));
        }

        let meta = CaptureSession {
            id: id.to_string(),
            title: title.unwrap_or_else(|| id.to_string()),
            platform: platform.unwrap_or_else(|| "unknown".to_string()),
            started_at: Utc::now(),
            ended_at: None,
            status: CaptureStatus::Active,
            event_count: 0,
            metadata,
        };
        self.slots.insert(
            id.to_string(),
            Arc::new(CaptureSlot {
                state: tokio::sync::Mutex::new(SlotState {
                    meta: meta.clone(),
                    buffer: Vec::new(),
                }),
            }),
        );
        self.stats.sessions_created.fetch_add(1, Ordering::Relaxed);
        info!(id, platform = %meta.platform, "capture session created");

        self.handlers
            .dispatch(BusEvent {
                topic: Topic::SessionCreated,
                session: meta.clone(),
                event: None,
            })
            .await;
        Ok(meta)
    }

    /// Buffer a batch of raw client events, attaching the server timestamp
    /// when absent. Triggers a flush once the buffer crosses the threshold.
    pub async fn append_events(
        &self,
        session_id: &str,
        raw_events: Vec<serde_json::Value>,
    ) -> Result<u64> {
        let slot = self
            .slots
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| CaptureError::NotFound(session_id.to_string()))?;

        let count = raw_events.len() as u64;
        let mut flush_batch = None;
        {
            let mut state = slot.state.lock().await;
            if state.meta.status == CaptureStatus::Ended {
                return Err(CaptureError::Ended(session_id.to_string()));
            }
            let platform = state.meta.platform.clone();
            for raw in raw_events {
                state.buffer.push(normalize_event(session_id, &platform, raw));
            }
            state.meta.event_count += count;
            self.stats.events_received.fetch_add(count, Ordering::Relaxed);

            if state.buffer.len() >= CAPTURE_FLUSH_THRESHOLD {
                flush_batch = Some(self.flush_locked(&mut state)?);
            }
        }

        if let Some((meta, events)) = flush_batch {
            self.dispatch_flush(meta, events).await;
        }
        Ok(count)
    }

    /// Write buffered events to `<dir>/<id>.json`: read-modify-write with
    /// write-to-temp + fsync + rename. Returns the flushed batch for handler
    /// dispatch. Caller holds the slot lock.
    fn flush_locked(
        &self,
        state: &mut SlotState,
    ) -> Result<(CaptureSession, Vec<CaptureEvent>)> {
        let events: Vec<CaptureEvent> = state.buffer.drain(..).collect();
        if !events.is_empty() {
            let path = self.file_path(&state.meta.id);
            let mut on_disk: Vec<CaptureEvent> = match fs::read_to_string(&path) {
                Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
                Err(_) => Vec::new(),
            };
            on_disk.extend(events.iter().cloned());

            let tmp = self.dir.join(format!("{}.json.tmp", state.meta.id));
            {
                let mut file = fs::File::create(&tmp)?;
                file.write_all(serde_json::to_string_pretty(&on_disk)?.as_bytes())?;
                file.sync_all()?;
            }
            fs::rename(&tmp, &path)?;
            self.stats.flushes.fetch_add(1, Ordering::Relaxed);
            debug!(id = %state.meta.id, flushed = events.len(), "capture buffer flushed");
        }
        Ok((state.meta.clone(), events))
    }

    /// `event:received` per event, then `session:flushed` once.
    async fn dispatch_flush(&self, meta: CaptureSession, events: Vec<CaptureEvent>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            self.handlers
                .dispatch(BusEvent {
                    topic: Topic::EventReceived,
                    session: meta.clone(),
                    event: Some(event),
                })
                .await;
        }
        self.handlers
            .dispatch(BusEvent {
                topic: Topic::SessionFlushed,
                session: meta,
                event: None,
            })
            .await;
    }

    /// Force a flush of one session's buffer.
    pub async fn flush(&self, session_id: &str) -> Result<()> {
        let slot = self
            .slots
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| CaptureError::NotFound(session_id.to_string()))?;
        let batch = {
            let mut state = slot.state.lock().await;
            self.flush_locked(&mut state)?
        };
        self.dispatch_flush(batch.0, batch.1).await;
        Ok(())
    }

    /// End a session: forced flush, then `session:ended`. Idempotent.
    pub async fn end_session(&self, session_id: &str) -> Result<CaptureSession> {
        let slot = self
            .slots
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| CaptureError::NotFound(session_id.to_string()))?;

        let (meta, batch, newly_ended) = {
            let mut state = slot.state.lock().await;
            let newly_ended = state.meta.status == CaptureStatus::Active;
            if newly_ended {
                state.meta.status = CaptureStatus::Ended;
                state.meta.ended_at = Some(Utc::now());
            }
            let batch = self.flush_locked(&mut state)?;
            (state.meta.clone(), batch, newly_ended)
        };

        self.dispatch_flush(batch.0, batch.1).await;
        if newly_ended {
            info!(id = session_id, events = meta.event_count, "capture session ended");
            self.handlers
                .dispatch(BusEvent {
                    topic: Topic::SessionEnded,
                    session: meta.clone(),
                    event: None,
                })
                .await;
        }
        Ok(meta)
    }

    pub async fn get(&self, session_id: &str) -> Option<CaptureSession> {
        let slot = self.slots.get(session_id).map(|s| Arc::clone(s.value()))?;
        let state = slot.state.lock().await;
        Some(state.meta.clone())
    }

    pub async fn list(&self) -> Vec<CaptureSession> {
        let mut sessions = Vec::new();
        let slots: Vec<Arc<CaptureSlot>> =
            self.slots.iter().map(|s| Arc::clone(s.value())).collect();
        for slot in slots {
            let state = slot.state.lock().await;
            sessions.push(state.meta.clone());
        }
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// Read a session's persisted events back from disk.
    pub fn events_on_disk(&self, session_id: &str) -> Result<Vec<CaptureEvent>> {
        Self::check_session_id(session_id)?;
        let path = self.file_path(session_id);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Flush every active session: the periodic tick.
    pub async fn flush_all(&self) {
        let ids: Vec<String> = self.slots.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.flush(&id).await {
                warn!(id, error = %e, "periodic capture flush failed");
            }
        }
    }

    /// Background task flushing all buffers every few seconds until cancelled.
    pub fn spawn_flusher(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(CAPTURE_FLUSH_INTERVAL_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => bus.flush_all().await,
                    _ = cancel.cancelled() => {
                        // Final flush so buffered events survive shutdown.
                        bus.flush_all().await;
                        break;
                    }
                }
            }
        })
    }
}

/// Shape a raw client event into a `CaptureEvent`. Clients may send either a
/// bare payload (`{"a":1}`) or a structured event carrying its own `data`,
/// `timestamp` and `metadata` fields.
fn normalize_event(
    session_id: &str,
    platform: &str,
    raw: serde_json::Value,
) -> CaptureEvent {
    let structured = raw.get("data").is_some();
    let timestamp = raw
        .get("timestamp")
        .and_then(|t| t.as_str())
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    if structured {
        CaptureEvent {
            session_id: session_id.to_string(),
            timestamp,
            platform: raw
                .get("platform")
                .and_then(|p| p.as_str())
                .unwrap_or(platform)
                .to_string(),
            data: raw.get("data").cloned().unwrap_or(serde_json::Value::Null),
            metadata: raw.get("metadata").cloned().unwrap_or(serde_json::Value::Null),
        }
    } else {
        CaptureEvent {
            session_id: session_id.to_string(),
            timestamp,
            platform: platform.to_string(),
            data: raw,
            metadata: serde_json::Value::Null,
        }
    }
}
