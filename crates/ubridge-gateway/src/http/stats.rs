use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use ubridge_cache::CacheStats;

use crate::app::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReply {
    pub uptime_secs: u64,
    pub requests: u64,
    pub chats: u64,
    pub stream_chats: u64,
    pub tool_rounds: u64,
    pub rate_limited: u64,
    pub summarizations: u64,
    pub tokens: TokenStats,
    pub cost_usd: f64,
    pub cache: CacheStats,
    pub sessions: SessionStats,
    pub devices: DeviceStats,
    pub capture: CaptureStats,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStats {
    pub input: u64,
    pub output: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub active: usize,
    pub created: u64,
    pub evicted: u64,
    pub messages: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub registered: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStats {
    pub sessions: u64,
    pub events: u64,
    pub flushes: u64,
}

/// GET /stats: global counters snapshot.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsReply> {
    let stats = &state.stats;
    Json(StatsReply {
        uptime_secs: state.uptime_secs(),
        requests: stats.requests.load(Ordering::Relaxed),
        chats: stats.chats.load(Ordering::Relaxed),
        stream_chats: stats.stream_chats.load(Ordering::Relaxed),
        tool_rounds: stats.tool_rounds.load(Ordering::Relaxed),
        rate_limited: stats.rate_limited.load(Ordering::Relaxed),
        summarizations: stats.summarizations.load(Ordering::Relaxed),
        tokens: TokenStats {
            input: stats.tokens_in.load(Ordering::Relaxed),
            output: stats.tokens_out.load(Ordering::Relaxed),
        },
        cost_usd: stats.cost_usd(),
        cache: state.cache.stats(),
        sessions: SessionStats {
            active: state.sessions.active_count(),
            created: state.sessions.stats.created.load(Ordering::Relaxed),
            evicted: state.sessions.stats.evicted.load(Ordering::Relaxed),
            messages: state.sessions.stats.messages.load(Ordering::Relaxed),
        },
        devices: DeviceStats {
            registered: state.devices.len(),
        },
        capture: CaptureStats {
            sessions: state.capture.stats.sessions_created.load(Ordering::Relaxed),
            events: state.capture.stats.events_received.load(Ordering::Relaxed),
            flushes: state.capture.stats.flushes.load(Ordering::Relaxed),
        },
    })
}
