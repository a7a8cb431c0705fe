use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use ubridge_core::config::{BridgeConfig, ProvidersConfig, HEALTH_PROBE_TIMEOUT_MS};
use ubridge_core::types::ProviderId;

use crate::adapter::{Health, ProviderAdapter, ProviderError};
use crate::anthropic::AnthropicAdapter;
use crate::gemini::GeminiAdapter;
use crate::ollama::OllamaAdapter;
use crate::openai::OpenAiAdapter;

/// One row of `GET /providers`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub id: ProviderId,
    pub available: bool,
    pub model: String,
}

/// Process-wide registry of provider adapters. Built once from configuration;
/// the only post-init mutation is a credential reload after a vault change.
pub struct ProviderRegistry {
    adapters: RwLock<HashMap<ProviderId, Arc<dyn ProviderAdapter>>>,
    /// Providers whose credentials were rejected. A flagged provider reports
    /// unhealthy from `health_all` until the key is reloaded.
    auth_failures: DashMap<ProviderId, String>,
    config: ProvidersConfig,
    client: reqwest::Client,
    timeout_ms: u64,
}

impl ProviderRegistry {
    /// Build adapters for every configured provider slot.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, ProviderError> {
        let timeout_ms = config.server.api_timeout_ms;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(ProviderError::Http)?;

        let registry = Self {
            adapters: RwLock::new(HashMap::new()),
            auth_failures: DashMap::new(),
            config: config.providers.clone(),
            client,
            timeout_ms,
        };

        for id in ProviderId::ALL {
            if let Some(adapter) = registry.build_adapter(id, None) {
                info!(provider = %id, "provider registered");
                registry.insert(adapter);
            }
        }

        Ok(registry)
    }

    /// Empty registry for tests: populate with `insert`.
    pub fn empty() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            auth_failures: DashMap::new(),
            config: ProvidersConfig::default(),
            client: reqwest::Client::new(),
            timeout_ms: HEALTH_PROBE_TIMEOUT_MS,
        }
    }

    pub fn insert(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .write()
            .expect("registry lock poisoned")
            .insert(adapter.id(), adapter);
    }

    fn build_adapter(
        &self,
        id: ProviderId,
        key_override: Option<&str>,
    ) -> Option<Arc<dyn ProviderAdapter>> {
        let client = self.client.clone();
        let timeout = self.timeout_ms;
        match id {
            ProviderId::Claude => {
                let slot = self.config.anthropic.as_ref()?;
                let key = key_override.unwrap_or(&slot.api_key);
                if key.is_empty() {
                    return None;
                }
                Some(Arc::new(AnthropicAdapter::new(
                    client,
                    key.to_string(),
                    slot.base_url.clone(),
                    slot.model.clone(),
                    timeout,
                )))
            }
            ProviderId::Openai => {
                let slot = self.config.openai.as_ref()?;
                let key = key_override.unwrap_or(&slot.api_key);
                if key.is_empty() {
                    return None;
                }
                Some(Arc::new(OpenAiAdapter::new(
                    client,
                    key.to_string(),
                    slot.base_url.clone(),
                    slot.model.clone(),
                    timeout,
                )))
            }
            ProviderId::Gemini => {
                let slot = self.config.gemini.as_ref()?;
                let key = key_override.unwrap_or(&slot.api_key);
                if key.is_empty() {
                    return None;
                }
                Some(Arc::new(GeminiAdapter::new(
                    client,
                    key.to_string(),
                    slot.base_url.clone(),
                    slot.model.clone(),
                    timeout,
                )))
            }
            ProviderId::OllamaLocal => {
                let slot = self.config.ollama_local.as_ref()?;
                Some(Arc::new(OllamaAdapter::new(
                    client,
                    id,
                    slot.base_url.clone(),
                    slot.api_key.clone(),
                    slot.model.clone(),
                    timeout,
                )))
            }
            ProviderId::OllamaCloud => {
                let slot = self.config.ollama_cloud.as_ref()?;
                let bearer = key_override
                    .map(str::to_string)
                    .or_else(|| slot.api_key.clone());
                Some(Arc::new(OllamaAdapter::new(
                    client,
                    id,
                    slot.base_url.clone(),
                    bearer,
                    slot.model.clone(),
                    timeout,
                )))
            }
        }
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters
            .read()
            .expect("registry lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn list(&self) -> Vec<ProviderSummary> {
        let adapters = self.adapters.read().expect("registry lock poisoned");
        let mut summaries: Vec<ProviderSummary> = ProviderId::ALL
            .iter()
            .filter_map(|id| adapters.get(id))
            .map(|adapter| ProviderSummary {
                id: adapter.id(),
                available: !self.auth_failures.contains_key(&adapter.id()),
                model: adapter.default_model().to_string(),
            })
            .collect();
        summaries.sort_by_key(|s| s.id.as_str());
        summaries
    }

    /// Run health probes concurrently with a short deadline. Providers with a
    /// flagged credential failure report unhealthy without a probe.
    pub async fn health_all(&self) -> HashMap<ProviderId, Health> {
        let adapters: Vec<Arc<dyn ProviderAdapter>> = {
            let map = self.adapters.read().expect("registry lock poisoned");
            map.values().cloned().collect()
        };

        let probes = adapters.into_iter().map(|adapter| async move {
            let id = adapter.id();
            if let Some(failure) = self.auth_failures.get(&id) {
                return (
                    id,
                    Health::unhealthy(0, format!("credentials rejected: {}", failure.value())),
                );
            }
            let probe = tokio::time::timeout(
                Duration::from_millis(HEALTH_PROBE_TIMEOUT_MS),
                adapter.health(),
            );
            match probe.await {
                Ok(health) => (id, health),
                Err(_) => (
                    id,
                    Health::unhealthy(HEALTH_PROBE_TIMEOUT_MS, "health probe timed out"),
                ),
            }
        });

        futures_util::future::join_all(probes).await.into_iter().collect()
    }

    /// Record an upstream credential rejection. Cleared by `reload_key`.
    pub fn flag_auth_failure(&self, id: ProviderId, message: impl Into<String>) {
        let message = ubridge_core::redact::redact(&message.into());
        warn!(provider = %id, %message, "provider flagged unhealthy");
        self.auth_failures.insert(id, message);
    }

    pub fn clear_auth_failure(&self, id: ProviderId) {
        self.auth_failures.remove(&id);
    }

    /// Swap a provider's credential in place after a vault change. Rebuilds
    /// the adapter and clears any auth-failure flag.
    pub fn reload_key(&self, id: ProviderId, api_key: &str) -> bool {
        match self.build_adapter(id, Some(api_key)) {
            Some(adapter) => {
                info!(provider = %id, "provider credential reloaded");
                self.insert(adapter);
                self.clear_auth_failure(id);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ChatRequest, ChatResponse};
    use async_trait::async_trait;
    use ubridge_core::types::{FinishReason, Usage};

    struct StubAdapter {
        id: ProviderId,
        healthy: bool,
    }

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        fn id(&self) -> ProviderId {
            self.id
        }

        fn default_model(&self) -> &str {
            "stub-model"
        }

        async fn health(&self) -> Health {
            if self.healthy {
                Health::ok(1)
            } else {
                Health::unhealthy(1, "down")
            }
        }

        async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: "ok".into(),
                tool_calls: vec![],
                finish_reason: FinishReason::Stop,
                usage: Usage::new(1, 1, 0.0),
                model: "stub-model".into(),
                latency_ms: 0,
            })
        }

        async fn models(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec!["stub-model".into()])
        }
    }

    #[tokio::test]
    async fn auth_failure_overrides_probe() {
        let registry = ProviderRegistry::empty();
        registry.insert(Arc::new(StubAdapter {
            id: ProviderId::Claude,
            healthy: true,
        }));

        let health = registry.health_all().await;
        assert!(health[&ProviderId::Claude].healthy);

        registry.flag_auth_failure(ProviderId::Claude, "401 bad key");
        let health = registry.health_all().await;
        assert!(!health[&ProviderId::Claude].healthy);
        assert!(!registry.list()[0].available);
    }

    #[tokio::test]
    async fn health_all_probes_every_adapter() {
        let registry = ProviderRegistry::empty();
        registry.insert(Arc::new(StubAdapter {
            id: ProviderId::Claude,
            healthy: true,
        }));
        registry.insert(Arc::new(StubAdapter {
            id: ProviderId::OllamaLocal,
            healthy: false,
        }));

        let health = registry.health_all().await;
        assert_eq!(health.len(), 2);
        assert!(health[&ProviderId::Claude].healthy);
        assert!(!health[&ProviderId::OllamaLocal].healthy);
    }
}
