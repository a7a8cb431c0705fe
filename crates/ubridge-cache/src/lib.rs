//! Content-addressed memoization of completed non-streaming chat responses.
//!
//! Keys are SHA-256 fingerprints of the normalized request: provider, model,
//! system prompt, message sequence, temperature and max_tokens. Timestamps
//! and other per-request noise are excluded so that identical conversations
//! from different sessions hit the same entry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use ubridge_core::types::{FinishReason, Message, ProviderId, ToolDefinition};
use ubridge_providers::adapter::ChatResponse;

/// Field separator inside the fingerprint preimage: keeps "ab"+"c" and
/// "a"+"bc" from colliding.
const SEP: u8 = 0x1f;

struct CacheEntry {
    response: ChatResponse,
    cost: f64,
    stored_at: Instant,
    last_accessed: Instant,
    hits: u64,
    size: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub saved_usd: f64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    saved_usd: f64,
}

/// Single-writer response cache with TTL expiry and LRU eviction over a byte
/// budget.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_bytes: usize,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_bytes: usize, enabled: bool) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                saved_usd: 0.0,
            }),
            ttl,
            max_bytes,
            enabled,
        }
    }

    /// Normalize one text field: CRLF to LF, trailing whitespace stripped.
    fn normalize_text(s: &str) -> String {
        s.replace("\r\n", "\n").trim_end().to_string()
    }

    /// Fingerprint of a chat request. `pending_user` is the user message
    /// about to be appended: hashed as part of the sequence so the probe can
    /// run before the session is mutated.
    pub fn fingerprint(
        provider: ProviderId,
        model: &str,
        system: &str,
        messages: &[Message],
        pending_user: &str,
        temperature: f32,
        max_tokens: u32,
        tools: &[ToolDefinition],
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_str().as_bytes());
        hasher.update([SEP]);
        hasher.update(model.as_bytes());
        hasher.update([SEP]);
        hasher.update(Self::normalize_text(system).as_bytes());
        hasher.update([SEP]);

        for msg in messages {
            let role = serde_json::to_value(msg.role)
                .map(|v| v.to_string())
                .unwrap_or_default();
            hasher.update(role.as_bytes());
            hasher.update([SEP]);
            hasher.update(Self::normalize_text(&msg.content).as_bytes());
            if let Some(id) = &msg.tool_call_id {
                hasher.update([SEP]);
                hasher.update(id.as_bytes());
            }
            // serde_json maps are sorted, so this is canonical JSON.
            for call in &msg.tool_calls {
                hasher.update([SEP]);
                hasher.update(call.name.as_bytes());
                hasher.update(call.args.to_string().as_bytes());
            }
            hasher.update([SEP]);
        }

        hasher.update(Self::normalize_text(pending_user).as_bytes());
        hasher.update([SEP]);
        hasher.update(format!("{temperature}").as_bytes());
        hasher.update([SEP]);
        hasher.update(format!("{max_tokens}").as_bytes());
        hasher.update([SEP]);
        for tool in tools {
            hasher.update(serde_json::to_string(tool).unwrap_or_default().as_bytes());
            hasher.update([SEP]);
        }

        hex::encode(hasher.finalize())
    }

    /// Look up a non-expired entry, bumping its hit count and LRU position.
    pub fn lookup(&self, key: &str) -> Option<ChatResponse> {
        if !self.enabled {
            return None;
        }
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();

        let expired = inner
            .entries
            .get(key)
            .is_some_and(|e| now.duration_since(e.stored_at) > self.ttl);
        if expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.bytes -= entry.size;
            }
        }

        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.hits += 1;
                entry.last_accessed = now;
                let response = entry.response.clone();
                let cost = entry.cost;
                inner.hits += 1;
                inner.saved_usd += cost;
                debug!(key = &key[..12], "cache hit");
                Some(response)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Whether a response may be stored: completed, no tool calls.
    pub fn cacheable(response: &ChatResponse) -> bool {
        response.tool_calls.is_empty()
            && matches!(
                response.finish_reason,
                FinishReason::Stop | FinishReason::Length
            )
    }

    /// Store a completed response, evicting least-recently-accessed entries
    /// when the byte budget is exceeded.
    pub fn store(&self, key: String, response: ChatResponse) {
        if !self.enabled || !Self::cacheable(&response) {
            return;
        }
        let size = response.content.len() + 256; // envelope estimate
        let cost = response.usage.cost;
        let now = Instant::now();

        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(old) = inner.entries.remove(&key) {
            inner.bytes -= old.size;
        }
        inner.bytes += size;
        inner.entries.insert(
            key,
            CacheEntry {
                response,
                cost,
                stored_at: now,
                last_accessed: now,
                hits: 0,
                size,
            },
        );

        while inner.bytes > self.max_bytes && inner.entries.len() > 1 {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone());
            let Some(oldest) = oldest else { break };
            if let Some(entry) = inner.entries.remove(&oldest) {
                inner.bytes -= entry.size;
                inner.evictions += 1;
                debug!(key = &oldest[..12], "cache entry evicted");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            saved_usd: inner.saved_usd,
        }
    }
}
