//! The chat request state machine: cache probe, session turn lock, provider
//! call, tool loop, accounting, and the streaming variant.
//!
//! A turn holds its session's mutex from the user-message append through the
//! final assistant append, so message ordering within a session is total. A
//! rejected turn rolls the user message back before the lock is released;
//! rejections never mutate the log.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ubridge_cache::ResponseCache;
use ubridge_core::error::BridgeError;
use ubridge_core::types::{FinishReason, Message, ProviderId, Role, ToolCall, Usage};
use ubridge_providers::adapter::{ChatRequest, ChatResponse, ProviderAdapter, ProviderError};
use ubridge_providers::pricing;
use ubridge_providers::stream::StreamEvent;
use ubridge_sessions::Session;

use crate::app::AppState;
use crate::error::bridge_from_provider;

/// Prompt used to condense an overlong conversation prefix into one
/// synthetic system message.
const CONDENSE_PROMPT: &str = "Summarize the following conversation so it can replace the \
original messages as context. Keep decisions, facts, names and open questions; stay under \
300 words. Reply with the summary only.";

#[derive(Debug)]
pub struct ChatOutcome {
    pub response: ChatResponse,
    pub cached: bool,
}

/// One SSE frame of `POST /chat/stream`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    pub delta: String,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl StreamFrame {
    fn delta(text: String) -> Self {
        Self {
            delta: text,
            done: false,
            usage: None,
            finish_reason: None,
        }
    }

    fn done(finish_reason: FinishReason, usage: Option<Usage>) -> Self {
        Self {
            delta: String::new(),
            done: true,
            usage,
            finish_reason: Some(finish_reason),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct ToolResultInput {
    pub id: String,
    pub result: serde_json::Value,
}

/// Build the provider request from the session: system-role content is
/// lifted into the request's system field, everything else rides along in
/// canonical form.
fn build_chat_request(session: &Session) -> ChatRequest {
    let system = session
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    ChatRequest {
        model: session.config.model.clone(),
        system,
        messages: session.messages.clone(),
        temperature: session.config.temperature,
        max_tokens: session.config.max_tokens,
        tools: session.config.tools.clone(),
    }
}

fn rollback_user(session: &mut Session) {
    if session.messages.last().is_some_and(|m| m.role == Role::User) {
        session.messages.pop();
    }
}

/// Number of assistant tool-call rounds since the last user message.
fn tool_iterations_since_last_user(messages: &[Message]) -> u32 {
    messages
        .iter()
        .rev()
        .take_while(|m| m.role != Role::User)
        .filter(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
        .count() as u32
}

/// Run the provider call under the server's cancellation scope.
async fn call_adapter(
    state: &AppState,
    adapter: &dyn ProviderAdapter,
    req: &ChatRequest,
) -> Result<ChatResponse, ProviderError> {
    tokio::select! {
        result = adapter.chat(req) => result,
        _ = state.shutdown.cancelled() => Err(ProviderError::Cancelled),
    }
}

/// Translate an adapter fault, flagging the provider on credential failures
/// so the next health report shows it unhealthy.
fn map_and_flag(state: &AppState, provider: ProviderId, err: ProviderError) -> BridgeError {
    if let ProviderError::AuthInvalid { ref message, .. } = err {
        state.registry.flag_auth_failure(provider, message.clone());
    }
    bridge_from_provider(provider, err)
}

/// Summarize the conversation prefix once the log exceeds the configured
/// context window: the last `max_context_messages` stay verbatim, everything
/// before them becomes one synthetic system message.
async fn maybe_condense(
    state: &AppState,
    adapter: &dyn ProviderAdapter,
    session: &mut Session,
) -> Result<(), ProviderError> {
    let max = state.config.optimizer.max_context_messages;
    if max == 0 || session.messages.len() <= max {
        return Ok(());
    }

    let split = session.messages.len() - max;
    let transcript: String = session.messages[..split]
        .iter()
        .map(|m| {
            let role = serde_json::to_value(m.role)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            format!("{role}: {}\n", m.content)
        })
        .collect();

    let req = ChatRequest {
        model: session.config.model.clone(),
        system: String::new(),
        messages: vec![Message::user(format!("{CONDENSE_PROMPT}\n\n{transcript}"))],
        temperature: 0.2,
        max_tokens: 512,
        tools: Vec::new(),
    };
    let resp = call_adapter(state, adapter, &req).await?;

    info!(
        session = %session.id,
        condensed = split,
        "conversation prefix summarized"
    );
    state.stats.summarizations.fetch_add(1, Ordering::Relaxed);
    // The condensation call spends real provider tokens; they land in the
    // global counters but not in the session's usage.
    state.stats.record_turn(&resp.usage);

    let mut rebuilt = Vec::with_capacity(max + 1);
    rebuilt.push(Message::system(format!(
        "Summary of the earlier conversation: {}",
        resp.content
    )));
    rebuilt.extend_from_slice(&session.messages[split..]);
    session.messages = rebuilt;
    Ok(())
}

/// Append the assistant result, settle token accounting, and store the
/// response in the cache when eligible. Caller holds the session lock.
fn finish_turn(
    state: &AppState,
    session: &mut Session,
    resp: ChatResponse,
    identity: &str,
    cache_key: Option<String>,
) -> ChatOutcome {
    let provider = session.config.provider;
    let is_tool_turn = resp.finish_reason == FinishReason::ToolCalls
        && !session.config.tools.is_empty();

    // The turn's input count lands on the user message that opened it; the
    // lock has been held since the append, so no reader saw it without.
    if let Some(user) = session
        .messages
        .iter_mut()
        .rev()
        .find(|m| m.role == Role::User)
    {
        if user.tokens.is_none() {
            user.tokens = Some(resp.usage.input_tokens);
        }
    }

    let mut assistant = Message::assistant(resp.content.clone())
        .with_provider(provider)
        .with_tokens(resp.usage.output_tokens);
    if is_tool_turn {
        assistant.tool_calls = resp.tool_calls.clone();
    }
    session.messages.push(assistant);
    session.add_usage(&resp.usage);
    state.sessions.record_messages(2);

    state.limiter.charge_tokens(
        identity,
        resp.usage.total_tokens as u64,
        Utc::now().timestamp(),
    );
    state.stats.chats.fetch_add(1, Ordering::Relaxed);
    state.stats.record_turn(&resp.usage);

    if !is_tool_turn {
        if let Some(key) = cache_key {
            state.cache.store(key, resp.clone());
        }
    }

    ChatOutcome {
        response: resp,
        cached: false,
    }
}

/// Non-streaming chat: the full state machine of one turn.
pub async fn chat(
    state: &Arc<AppState>,
    session_id: &str,
    message: &str,
    identity: &str,
) -> Result<ChatOutcome, BridgeError> {
    if message.trim().is_empty() {
        return Err(BridgeError::invalid_argument("message", "message must not be empty"));
    }

    let slot = state
        .sessions
        .slot(session_id)
        .ok_or_else(|| BridgeError::SessionUnknown {
            id: session_id.to_string(),
        })?;
    let mut guard = slot.lock().await;
    if guard.is_ended() {
        return Err(BridgeError::SessionEnded {
            id: session_id.to_string(),
        });
    }

    let provider = guard.config.provider;
    let adapter = state
        .registry
        .get(provider)
        .ok_or_else(|| BridgeError::ProviderUnavailable {
            provider,
            message: "provider not configured".to_string(),
        })?;
    state.devices.touch(&guard.device_id);

    // Cache probe: tool-less sessions only; a hit answers without touching
    // the session log.
    let cache_key = if guard.config.tools.is_empty() {
        Some(ResponseCache::fingerprint(
            provider,
            &guard.config.model,
            &guard.config.system_prompt,
            &guard.messages,
            message,
            guard.config.temperature,
            guard.config.max_tokens,
            &guard.config.tools,
        ))
    } else {
        None
    };
    if let Some(key) = &cache_key {
        if let Some(hit) = state.cache.lookup(key) {
            debug!(session = session_id, "chat served from cache");
            state.stats.chats.fetch_add(1, Ordering::Relaxed);
            return Ok(ChatOutcome {
                response: hit,
                cached: true,
            });
        }
    }

    guard.push_message(Message::user(message));

    if let Err(e) = maybe_condense(state, adapter.as_ref(), &mut guard).await {
        rollback_user(&mut guard);
        return Err(map_and_flag(state, provider, e));
    }

    let req = build_chat_request(&guard);
    match call_adapter(state, adapter.as_ref(), &req).await {
        Ok(resp) => Ok(finish_turn(state, &mut guard, resp, identity, cache_key)),
        Err(e) => {
            rollback_user(&mut guard);
            Err(map_and_flag(state, provider, e))
        }
    }
}

/// `POST /tools`: append tool results and re-enter the provider call.
/// Fully resumable from the session log: the pending calls are read from
/// the tail, not from hidden state.
pub async fn submit_tool_results(
    state: &Arc<AppState>,
    session_id: &str,
    results: Vec<ToolResultInput>,
    identity: &str,
) -> Result<ChatOutcome, BridgeError> {
    if results.is_empty() {
        return Err(BridgeError::invalid_argument(
            "toolResults",
            "at least one tool result is required",
        ));
    }

    let slot = state
        .sessions
        .slot(session_id)
        .ok_or_else(|| BridgeError::SessionUnknown {
            id: session_id.to_string(),
        })?;
    let mut guard = slot.lock().await;
    if guard.is_ended() {
        return Err(BridgeError::SessionEnded {
            id: session_id.to_string(),
        });
    }

    let provider = guard.config.provider;
    let adapter = state
        .registry
        .get(provider)
        .ok_or_else(|| BridgeError::ProviderUnavailable {
            provider,
            message: "provider not configured".to_string(),
        })?;

    // Pending calls: the most recent assistant tool-call message, minus ids
    // already answered by tool messages behind it.
    let mut answered: Vec<String> = Vec::new();
    let mut pending: Option<Vec<ToolCall>> = None;
    for msg in guard.messages.iter().rev() {
        match msg.role {
            Role::Tool => {
                if let Some(id) = &msg.tool_call_id {
                    answered.push(id.clone());
                }
            }
            Role::Assistant if !msg.tool_calls.is_empty() => {
                pending = Some(
                    msg.tool_calls
                        .iter()
                        .filter(|c| !answered.contains(&c.id))
                        .cloned()
                        .collect(),
                );
                break;
            }
            Role::User => break,
            _ => {}
        }
    }
    let pending = pending.unwrap_or_default();
    if pending.is_empty() {
        return Err(BridgeError::invalid_argument(
            "toolResults",
            "session has no pending tool calls",
        ));
    }

    let limit = state.config.chat.max_tool_iterations;
    if tool_iterations_since_last_user(&guard.messages) >= limit {
        return Err(BridgeError::ToolLoopExceeded { limit });
    }

    // Validate before touching the log: every submitted id must be pending,
    // and every pending id must be answered. A partial submission would let
    // the next assistant message land with ids that can never be answered.
    for result in &results {
        if !pending.iter().any(|c| c.id == result.id) {
            return Err(BridgeError::invalid_argument(
                "toolResults",
                format!("no pending tool call with id '{}'", result.id),
            ));
        }
    }
    for call in &pending {
        if !results.iter().any(|r| r.id == call.id) {
            return Err(BridgeError::invalid_argument(
                "toolResults",
                format!("missing result for tool call '{}'", call.id),
            ));
        }
    }

    let pre_len = guard.messages.len();
    for result in results {
        let content = serde_json::to_string(&result.result).unwrap_or_default();
        guard.push_message(Message::tool_result(result.id, content));
    }
    state.sessions.record_messages((guard.messages.len() - pre_len) as u64);

    let req = build_chat_request(&guard);
    match call_adapter(state, adapter.as_ref(), &req).await {
        Ok(resp) => {
            state.stats.tool_rounds.fetch_add(1, Ordering::Relaxed);
            Ok(finish_turn(state, &mut guard, resp, identity, None))
        }
        Err(e) => {
            guard.messages.truncate(pre_len);
            Err(map_and_flag(state, provider, e))
        }
    }
}

/// Streaming chat: run the machine up to the provider call, then hand back a
/// frame channel. The session lock travels into the drive task and is held
/// until the final frame.
pub async fn chat_stream(
    state: &Arc<AppState>,
    session_id: &str,
    message: &str,
    identity: &str,
) -> Result<mpsc::Receiver<StreamFrame>, BridgeError> {
    if message.trim().is_empty() {
        return Err(BridgeError::invalid_argument("message", "message must not be empty"));
    }

    let slot = state
        .sessions
        .slot(session_id)
        .ok_or_else(|| BridgeError::SessionUnknown {
            id: session_id.to_string(),
        })?;
    let mut guard = slot.lock_owned().await;
    if guard.is_ended() {
        return Err(BridgeError::SessionEnded {
            id: session_id.to_string(),
        });
    }

    let provider = guard.config.provider;
    let adapter = state
        .registry
        .get(provider)
        .ok_or_else(|| BridgeError::ProviderUnavailable {
            provider,
            message: "provider not configured".to_string(),
        })?;
    state.devices.touch(&guard.device_id);

    guard.push_message(Message::user(message));

    if let Err(e) = maybe_condense(state, adapter.as_ref(), &mut guard).await {
        rollback_user(&mut guard);
        return Err(map_and_flag(state, provider, e));
    }

    let req = build_chat_request(&guard);
    let (out_tx, out_rx) = mpsc::channel::<StreamFrame>(64);
    state.stats.stream_chats.fetch_add(1, Ordering::Relaxed);

    let state = Arc::clone(state);
    let identity = identity.to_string();
    tokio::spawn(async move {
        drive_stream(state, guard, adapter, req, out_tx, identity).await;
    });

    Ok(out_rx)
}

/// Drain the provider stream into SSE frames. Client disconnect (the frame
/// receiver dropping) aborts the upstream call; nothing is appended unless
/// the stream completed.
async fn drive_stream(
    state: Arc<AppState>,
    mut guard: tokio::sync::OwnedMutexGuard<Session>,
    adapter: Arc<dyn ProviderAdapter>,
    req: ChatRequest,
    out_tx: mpsc::Sender<StreamFrame>,
    identity: String,
) {
    let (ev_tx, mut ev_rx) = mpsc::channel::<StreamEvent>(64);
    let upstream = {
        let adapter = Arc::clone(&adapter);
        let req = req.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.chat_stream(&req, ev_tx).await {
                warn!(error = %e, "provider stream failed");
            }
        })
    };

    let mut content = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            // Server shutdown: close the stream politely, append nothing.
            _ = shutdown.cancelled() => {
                rollback_user(&mut guard);
                upstream.abort();
                let _ = out_tx
                    .send(StreamFrame::done(FinishReason::Cancelled, None))
                    .await;
                break;
            }

            ev = ev_rx.recv() => match ev {
                None => {
                    // Upstream closed without a Done event.
                    rollback_user(&mut guard);
                    let _ = out_tx.send(StreamFrame::done(FinishReason::Error, None)).await;
                    break;
                }

                Some(StreamEvent::TextDelta { text }) => {
                    content.push_str(&text);
                    if out_tx.send(StreamFrame::delta(text)).await.is_err() {
                        // Client disconnected: abort upstream immediately.
                        debug!(session = %guard.id, "stream client disconnected");
                        upstream.abort();
                        break;
                    }
                }

                Some(StreamEvent::ToolUse { id, name, args }) => {
                    tool_calls.push(ToolCall { id, name, args });
                }

                Some(StreamEvent::Error { message }) => {
                    warn!(session = %guard.id, %message, "stream error from provider");
                    rollback_user(&mut guard);
                    upstream.abort();
                    let _ = out_tx.send(StreamFrame::done(FinishReason::Error, None)).await;
                    break;
                }

                Some(StreamEvent::Done { model, tokens_in, tokens_out, finish_reason }) => {
                    let model = if model.is_empty() { req.model.clone() } else { model };
                    let cost = pricing::cost(&model, tokens_in, tokens_out);
                    let resp = ChatResponse {
                        content: std::mem::take(&mut content),
                        tool_calls: std::mem::take(&mut tool_calls),
                        finish_reason,
                        usage: Usage::new(tokens_in, tokens_out, cost),
                        model,
                        latency_ms: 0,
                    };
                    let usage = resp.usage;
                    finish_turn(&state, &mut guard, resp, &identity, None);
                    let _ = out_tx
                        .send(StreamFrame {
                            delta: String::new(),
                            done: true,
                            usage: Some(usage),
                            finish_reason: Some(finish_reason),
                        })
                        .await;
                    break;
                }
            }
        }
    }
    // guard drops here: the session unlocks for the next turn.
}
