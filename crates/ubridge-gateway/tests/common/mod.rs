//! Shared fixtures: a scriptable mock provider and a runtime wired to
//! temp-dir storage.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ubridge_core::config::BridgeConfig;
use ubridge_core::types::{FinishReason, ProviderId, SessionConfig, ToolCall, Usage};
use ubridge_gateway::app::AppState;
use ubridge_providers::adapter::{
    ChatRequest, ChatResponse, Health, ProviderAdapter, ProviderError,
};
use ubridge_providers::stream::StreamEvent;

/// One scripted non-streaming reply.
#[derive(Clone)]
pub struct MockStep {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish: FinishReason,
    pub input: u32,
    pub output: u32,
}

impl MockStep {
    pub fn text(content: &str, input: u32, output: u32) -> Self {
        Self {
            content: content.to_string(),
            tool_calls: Vec::new(),
            finish: FinishReason::Stop,
            input,
            output,
        }
    }

    pub fn tool_call(id: &str, name: &str, args: serde_json::Value) -> Self {
        Self {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                args,
            }],
            finish: FinishReason::ToolCalls,
            input: 4,
            output: 1,
        }
    }
}

pub struct MockProvider {
    steps: Mutex<VecDeque<MockStep>>,
    pub calls: AtomicUsize,
    pub cancelled: AtomicBool,
    pub stream_deltas: Vec<String>,
    pub delta_gap: Duration,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            stream_deltas: vec!["he".to_string(), "llo".to_string()],
            delta_gap: Duration::from_millis(10),
        }
    }

    pub fn with_deltas(deltas: &[&str], gap: Duration) -> Self {
        let mut mock = Self::new();
        mock.stream_deltas = deltas.iter().map(|d| d.to_string()).collect();
        mock.delta_gap = gap;
        mock
    }

    pub fn script(&self, steps: Vec<MockStep>) {
        *self.steps.lock().unwrap() = steps.into();
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Claude
    }

    fn default_model(&self) -> &str {
        "mock-model"
    }

    async fn health(&self) -> Health {
        Health::ok(1)
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockStep::text("ok", 1, 1));
        Ok(ChatResponse {
            content: step.content,
            tool_calls: step.tool_calls,
            finish_reason: step.finish,
            usage: Usage::new(step.input, step.output, 0.0),
            model: req.model.clone(),
            latency_ms: 1,
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        // Flags cancellation whether the bridge drops the channel or aborts
        // the task outright: drop runs in both cases.
        struct CancelProbe<'a> {
            flag: &'a AtomicBool,
            completed: bool,
        }
        impl Drop for CancelProbe<'_> {
            fn drop(&mut self) {
                if !self.completed {
                    self.flag.store(true, Ordering::SeqCst);
                }
            }
        }
        let mut probe = CancelProbe {
            flag: &self.cancelled,
            completed: false,
        };

        for delta in &self.stream_deltas {
            tokio::time::sleep(self.delta_gap).await;
            if tx
                .send(StreamEvent::TextDelta {
                    text: delta.clone(),
                })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
        if tx
            .send(StreamEvent::Done {
                model: req.model.clone(),
                tokens_in: 3,
                tokens_out: 2,
                finish_reason: FinishReason::Stop,
            })
            .await
            .is_ok()
        {
            probe.completed = true;
        }
        Ok(())
    }

    async fn models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["mock-model".to_string()])
    }
}

pub struct TestCtx {
    pub state: Arc<AppState>,
    pub mock: Arc<MockProvider>,
    _tmp: tempfile::TempDir,
}

pub fn test_config(tmp: &tempfile::TempDir) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.storage.secrets_dir = tmp.path().join("secrets").display().to_string();
    config.storage.capture_dir = tmp.path().join("capture").display().to_string();
    config.storage.audit_path = tmp.path().join("audit.jsonl").display().to_string();
    // One configured slot so startup accepts the config; tests talk to the
    // mock installed at the claude slot.
    config.providers.ollama_local = Some(ubridge_core::config::OllamaEndpointConfig {
        base_url: "http://localhost:11434".to_string(),
        api_key: None,
        model: None,
    });
    config
}

pub fn ctx_with_mock(mock: MockProvider, mutate: impl FnOnce(&mut BridgeConfig)) -> TestCtx {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(&tmp);
    mutate(&mut config);
    let state = AppState::init(config).unwrap();
    let mock = Arc::new(mock);
    state.registry.insert(mock.clone());
    TestCtx {
        state,
        mock,
        _tmp: tmp,
    }
}

pub fn default_ctx() -> TestCtx {
    ctx_with_mock(MockProvider::new(), |_| {})
}

/// Session config pointed at the mock adapter.
pub fn mock_session_config(system_prompt: &str) -> SessionConfig {
    SessionConfig {
        provider: ProviderId::Claude,
        model: "mock-model".to_string(),
        temperature: 0.0,
        max_tokens: 128,
        system_prompt: system_prompt.to_string(),
        tools: Vec::new(),
    }
}
