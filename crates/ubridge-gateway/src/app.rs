use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ubridge_cache::ResponseCache;
use ubridge_capture::CaptureBus;
use ubridge_core::config::{BridgeConfig, KeyedProviderConfig};
use ubridge_core::types::Usage;
use ubridge_limiter::RateLimiter;
use ubridge_providers::registry::ProviderRegistry;
use ubridge_sessions::{DeviceRegistry, SessionStore};
use ubridge_vault::SecretsVault;

use crate::audit::AuditLog;

/// Global request counters surfaced by `GET /stats`.
#[derive(Default)]
pub struct GlobalStats {
    pub requests: AtomicU64,
    pub chats: AtomicU64,
    pub stream_chats: AtomicU64,
    pub tool_rounds: AtomicU64,
    pub rate_limited: AtomicU64,
    pub summarizations: AtomicU64,
    pub tokens_in: AtomicU64,
    pub tokens_out: AtomicU64,
    /// Micro-dollars so the counter stays atomic.
    pub cost_microusd: AtomicU64,
}

impl GlobalStats {
    pub fn record_turn(&self, usage: &Usage) {
        self.tokens_in
            .fetch_add(usage.input_tokens as u64, Ordering::Relaxed);
        self.tokens_out
            .fetch_add(usage.output_tokens as u64, Ordering::Relaxed);
        self.cost_microusd
            .fetch_add((usage.cost * 1e6) as u64, Ordering::Relaxed);
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_microusd.load(Ordering::Relaxed) as f64 / 1e6
    }
}

/// Central shared state, constructed once in a fixed order at startup and
/// passed as `Arc<AppState>` to every handler. Tests build their own with
/// `AppState::init`.
pub struct AppState {
    pub config: BridgeConfig,
    pub vault: SecretsVault,
    pub registry: ProviderRegistry,
    pub sessions: SessionStore,
    pub devices: DeviceRegistry,
    pub cache: ResponseCache,
    pub limiter: RateLimiter,
    pub capture: Arc<CaptureBus>,
    pub audit: AuditLog,
    pub stats: GlobalStats,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
    /// Shared client for vault validation probes.
    pub http: reqwest::Client,
}

impl AppState {
    /// Construct the runtime. Init order: vault → providers → sessions →
    /// devices → cache → limiter → capture → audit.
    pub fn init(mut config: BridgeConfig) -> anyhow::Result<Arc<Self>> {
        let vault = SecretsVault::open(&config.storage.secrets_dir)?;
        let imported = vault.import_env()?;
        if !imported.is_empty() {
            info!(count = imported.len(), "secrets imported from environment");
        }
        if Path::new(".git").exists() {
            if let Err(e) = ubridge_vault::vault::ensure_gitignored(Path::new(".")) {
                warn!(error = %e, "could not update .gitignore");
            }
        }

        apply_vault_keys(&mut config, &vault);
        if !config.providers.any_configured() {
            anyhow::bail!("no providers configured: set at least one provider key or URL");
        }

        let registry = ProviderRegistry::from_config(&config)?;
        let sessions = SessionStore::new(Duration::from_secs(config.chat.session_ttl_secs));
        let devices = DeviceRegistry::new(Duration::from_secs(config.chat.device_ttl_secs));
        let cache = ResponseCache::new(
            Duration::from_secs(config.optimizer.cache_expiration_hours * 3600),
            (config.optimizer.max_cache_mb as usize) * 1024 * 1024,
            config.optimizer.enabled,
        );
        let limiter = RateLimiter::new(config.limits.clone());
        let capture = Arc::new(CaptureBus::new(&config.storage.capture_dir)?);
        let audit = AuditLog::open(
            &config.storage.audit_path,
            config.server.session_secret.as_deref(),
        )?;

        Ok(Arc::new(Self {
            config,
            vault,
            registry,
            sessions,
            devices,
            cache,
            limiter,
            capture,
            audit,
            stats: GlobalStats::default(),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            http: reqwest::Client::new(),
        }))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Fill empty provider slots from vault-held keys so a key stored through
/// `/secrets/set-and-validate` in a previous run still wires the provider up.
fn apply_vault_keys(config: &mut BridgeConfig, vault: &SecretsVault) {
    let slots: [(&str, &mut Option<KeyedProviderConfig>); 3] = [
        ("ANTHROPIC_API_KEY", &mut config.providers.anthropic),
        ("OPENAI_API_KEY", &mut config.providers.openai),
        ("GOOGLE_API_KEY", &mut config.providers.gemini),
    ];
    for (name, slot) in slots {
        let missing = slot.as_ref().map(|s| s.api_key.is_empty()).unwrap_or(true);
        if !missing {
            continue;
        }
        if let Ok(Some(key)) = vault.get(name) {
            let entry = slot.get_or_insert(KeyedProviderConfig {
                api_key: String::new(),
                base_url: None,
                model: None,
            });
            entry.api_key = key;
        }
    }
    if let Some(cloud) = config.providers.ollama_cloud.as_mut() {
        if cloud.api_key.is_none() {
            if let Ok(Some(key)) = vault.get("OLLAMA_CLOUD_API_KEY") {
                cloud.api_key = Some(key);
            }
        }
    }
}

/// Periodic sweepers and the capture flusher, all bound to the shutdown token.
pub fn spawn_background(state: &Arc<AppState>) {
    state.capture.spawn_flusher(state.shutdown.clone());

    let sweeper = Arc::clone(state);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    sweeper.sessions.sweep();
                    sweeper.devices.sweep();
                }
                _ = sweeper.shutdown.cancelled() => break,
            }
        }
    });
}

/// Assemble the full router with the middleware chain:
/// CORS → rate limit → sanitation → dispatch, with request-id/audit wrapping
/// everything inside CORS.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/stats", get(crate::http::stats::stats_handler))
        .route("/devices/register", post(crate::http::devices::register_handler))
        .route("/devices", get(crate::http::devices::list_handler))
        .route("/sessions", post(crate::http::sessions::create_handler))
        .route("/sessions/{id}", get(crate::http::sessions::get_handler))
        .route("/sessions/{id}", delete(crate::http::sessions::end_handler))
        .route("/chat", post(crate::http::chat::chat_handler))
        .route("/chat/stream", post(crate::http::stream::chat_stream_handler))
        .route("/tools", post(crate::http::chat::tools_handler))
        .route("/providers", get(crate::http::providers::list_handler))
        .route(
            "/providers/{id}/models",
            get(crate::http::providers::models_handler),
        )
        .route(
            "/secrets/set-and-validate",
            post(crate::http::secrets::set_and_validate_handler),
        )
        .route("/secrets/list", get(crate::http::secrets::list_handler))
        .route("/secrets/{name}", delete(crate::http::secrets::delete_handler))
        .route(
            "/external/data/sessions/create",
            post(crate::http::capture::create_session_handler),
        )
        .route(
            "/external/data/upload",
            post(crate::http::capture::upload_handler),
        )
        .route(
            "/external/data/sessions/{id}/end",
            post(crate::http::capture::end_session_handler),
        )
        .route(
            "/external/data/sessions/{id}",
            get(crate::http::capture::get_session_handler),
        )
        .route("/realtime-capture", get(crate::ws::capture_ws_handler))
        .layer(axum::middleware::from_fn(crate::middleware::sanitize))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::request_meta,
        ))
        .layer(crate::middleware::cors_layer(&state.config))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
