use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Hard limits shared across the gateway.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024; // 10 MiB request body cap
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const HEALTH_PROBE_TIMEOUT_MS: u64 = 5_000;
pub const CAPTURE_FLUSH_THRESHOLD: usize = 100; // events buffered before a forced flush
pub const CAPTURE_FLUSH_INTERVAL_SECS: u64 = 10;
pub const HANDLER_DEADLINE_MS: u64 = 2_000; // capture handlers are skipped past this
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// Top-level config (ubridge.toml + UBRIDGE_* env overrides + the well-known
/// environment variables the deployment surface documents).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            providers: ProvidersConfig::default(),
            limits: LimitsConfig::default(),
            optimizer: OptimizerConfig::default(),
            storage: StorageConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnv {
    Development,
    Production,
}

impl RuntimeEnv {
    pub fn is_production(&self) -> bool {
        matches!(self, RuntimeEnv::Production)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_env")]
    pub env: RuntimeEnv,
    /// CORS origin allow-list. Defaults to localhost only.
    #[serde(default = "default_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub api_timeout_ms: u64,
    /// Enables HMAC signing of audit records when set.
    #[serde(default)]
    pub session_secret: Option<String>,
    /// Strict mode rejects unknown body fields; lenient mode ignores them.
    #[serde(default)]
    pub strict_body: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            env: default_env(),
            allowed_origins: default_origins(),
            api_timeout_ms: default_timeout_ms(),
            session_secret: None,
            strict_body: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub anthropic: Option<KeyedProviderConfig>,
    pub openai: Option<KeyedProviderConfig>,
    pub gemini: Option<KeyedProviderConfig>,
    pub ollama_local: Option<OllamaEndpointConfig>,
    pub ollama_cloud: Option<OllamaEndpointConfig>,
}

impl ProvidersConfig {
    /// True when at least one provider can be constructed. Startup refuses to
    /// run a bridge with nothing behind it.
    pub fn any_configured(&self) -> bool {
        self.anthropic.is_some()
            || self.openai.is_some()
            || self.gemini.is_some()
            || self.ollama_local.is_some()
            || self.ollama_cloud.is_some()
    }
}

/// A hosted provider reachable with an API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyedProviderConfig {
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// An Ollama endpoint; the cloud instance carries a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaEndpointConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_token_quota")]
    pub token_quota: u64,
    #[serde(default = "default_token_window_secs")]
    pub token_window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            token_quota: default_token_quota(),
            token_window_secs: default_token_window_secs(),
        }
    }
}

/// Response-cache and context-window knobs (the CHAT_OPTIMIZER_* surface).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_mb")]
    pub max_cache_mb: u64,
    #[serde(default = "default_cache_hours")]
    pub cache_expiration_hours: u64,
    #[serde(default = "default_context_messages")]
    pub max_context_messages: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_cache_mb: default_cache_mb(),
            cache_expiration_hours: default_cache_hours(),
            max_context_messages: default_context_messages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: String,
    #[serde(default = "default_capture_dir")]
    pub capture_dir: String,
    #[serde(default = "default_audit_path")]
    pub audit_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            secrets_dir: default_secrets_dir(),
            capture_dir: default_capture_dir(),
            audit_path: default_audit_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_tool_iterations")]
    pub max_tool_iterations: u32,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_device_ttl")]
    pub device_ttl_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_tool_iterations: default_tool_iterations(),
            session_ttl_secs: default_session_ttl(),
            device_ttl_secs: default_device_ttl(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_env() -> RuntimeEnv {
    RuntimeEnv::Development
}
fn default_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
}
fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}
fn default_max_requests() -> u32 {
    100
}
fn default_window_secs() -> u64 {
    60
}
fn default_token_quota() -> u64 {
    1_000_000
}
fn default_token_window_secs() -> u64 {
    3600
}
fn bool_true() -> bool {
    true
}
fn default_cache_mb() -> u64 {
    100
}
fn default_cache_hours() -> u64 {
    24
}
fn default_context_messages() -> usize {
    10
}
fn default_secrets_dir() -> String {
    "./.secrets".to_string()
}
fn default_capture_dir() -> String {
    "./capture-sessions".to_string()
}
fn default_audit_path() -> String {
    "./audit.jsonl".to_string()
}
fn default_tool_iterations() -> u32 {
    8
}
fn default_session_ttl() -> u64 {
    24 * 3600
}
fn default_device_ttl() -> u64 {
    7 * 24 * 3600
}

impl BridgeConfig {
    /// Load config from a TOML file with UBRIDGE_* overrides, then apply the
    /// well-known environment variables from the deployment surface.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        } else {
            figment = figment.merge(Toml::file("ubridge.toml"));
        }

        let mut config: BridgeConfig = figment
            .merge(Env::prefixed("UBRIDGE_").split("_"))
            .extract()
            .map_err(|e| crate::error::BridgeError::Internal(format!("config: {e}")))?;

        config.apply_well_known_env();
        Ok(config)
    }

    /// Overlay the documented flat environment variables (PORT, HOST,
    /// ANTHROPIC_API_KEY, ...). These are the knobs deployments actually set;
    /// figment's prefixed overrides remain available for everything else.
    pub fn apply_well_known_env(&mut self) {
        use std::env;

        if let Ok(port) = env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(host) = env::var("HOST") {
            self.server.host = host;
        }
        if let Some(env_name) = env::var("NODE_ENV").ok().or_else(|| env::var("ENV").ok()) {
            self.server.env = if env_name.eq_ignore_ascii_case("production") {
                RuntimeEnv::Production
            } else {
                RuntimeEnv::Development
            };
        }
        if let Ok(origins) = env::var("ALLOWED_ORIGINS") {
            let origins: Vec<String> = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            if !origins.is_empty() {
                self.server.allowed_origins = origins;
            }
        }
        if let Ok(secret) = env::var("SESSION_SECRET") {
            if !secret.is_empty() {
                self.server.session_secret = Some(secret);
            }
        }
        if let Ok(timeout) = env::var("API_TIMEOUT") {
            if let Ok(timeout) = timeout.parse() {
                self.server.api_timeout_ms = timeout;
            }
        }

        if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
            let slot = self.providers.anthropic.get_or_insert(KeyedProviderConfig {
                api_key: String::new(),
                base_url: None,
                model: None,
            });
            if slot.api_key.is_empty() {
                slot.api_key = key;
            }
        }
        if let Ok(model) = env::var("CLAUDE_MODEL") {
            if let Some(slot) = self.providers.anthropic.as_mut() {
                slot.model = Some(model);
            }
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            let slot = self.providers.openai.get_or_insert(KeyedProviderConfig {
                api_key: String::new(),
                base_url: None,
                model: None,
            });
            if slot.api_key.is_empty() {
                slot.api_key = key;
            }
        }
        if let Ok(model) = env::var("OPENAI_MODEL") {
            if let Some(slot) = self.providers.openai.as_mut() {
                slot.model = Some(model);
            }
        }
        if let Ok(key) = env::var("GOOGLE_API_KEY") {
            let slot = self.providers.gemini.get_or_insert(KeyedProviderConfig {
                api_key: String::new(),
                base_url: None,
                model: None,
            });
            if slot.api_key.is_empty() {
                slot.api_key = key;
            }
        }
        if let Ok(model) = env::var("GEMINI_MODEL") {
            if let Some(slot) = self.providers.gemini.as_mut() {
                slot.model = Some(model);
            }
        }
        if let Ok(url) = env::var("OLLAMA_LOCAL_URL") {
            let slot = self
                .providers
                .ollama_local
                .get_or_insert(OllamaEndpointConfig {
                    base_url: String::new(),
                    api_key: None,
                    model: None,
                });
            slot.base_url = url;
        }
        if let Ok(model) = env::var("OLLAMA_LOCAL_MODEL") {
            if let Some(slot) = self.providers.ollama_local.as_mut() {
                slot.model = Some(model);
            }
        }
        if let Ok(url) = env::var("OLLAMA_CLOUD_URL") {
            let slot = self
                .providers
                .ollama_cloud
                .get_or_insert(OllamaEndpointConfig {
                    base_url: String::new(),
                    api_key: None,
                    model: None,
                });
            slot.base_url = url;
        }
        if let Ok(key) = env::var("OLLAMA_CLOUD_API_KEY") {
            if let Some(slot) = self.providers.ollama_cloud.as_mut() {
                slot.api_key = Some(key);
            }
        }

        if let Ok(enabled) = env::var("CHAT_OPTIMIZER_ENABLED") {
            self.optimizer.enabled = matches!(enabled.as_str(), "1" | "true" | "yes");
        }
        if let Ok(mb) = env::var("OPTIMIZER_MAX_CACHE_MB") {
            if let Ok(mb) = mb.parse() {
                self.optimizer.max_cache_mb = mb;
            }
        }
        if let Ok(hours) = env::var("OPTIMIZER_CACHE_EXPIRATION_HOURS") {
            if let Ok(hours) = hours.parse() {
                self.optimizer.cache_expiration_hours = hours;
            }
        }
        if let Ok(n) = env::var("OPTIMIZER_MAX_CONTEXT_MESSAGES") {
            if let Ok(n) = n.parse() {
                self.optimizer.max_context_messages = n;
            }
        }
    }
}
