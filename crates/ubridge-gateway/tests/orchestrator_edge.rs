//! Orchestrator edge behavior: context summarization boundary and the tool
//! iteration ceiling.

mod common;

use common::{ctx_with_mock, mock_session_config, MockProvider, MockStep, TestCtx};
use ubridge_core::types::Role;
use ubridge_gateway::orchestrator::{self, ToolResultInput};
use ubridge_sessions::{Capabilities, DeviceType};

fn session_for(ctx: &TestCtx, config: ubridge_core::types::SessionConfig) -> String {
    let device = ctx
        .state
        .devices
        .register("T", DeviceType::Server, Capabilities::default());
    ctx.state
        .sessions
        .create(&ctx.state.devices, &device.id, config)
        .unwrap()
        .id
}

#[tokio::test]
async fn crossing_the_context_window_summarizes_exactly_once() {
    let ctx = ctx_with_mock(MockProvider::new(), |config| {
        config.optimizer.max_context_messages = 3;
    });
    ctx.mock.script(vec![
        MockStep::text("first", 2, 1),        // turn 1
        MockStep::text("summary text", 5, 3), // turn 2: condensation call
        MockStep::text("second", 2, 1),       // turn 2: main call
    ]);
    let session_id = session_for(&ctx, mock_session_config("SYS"));

    // Turn 1 stays at the window (3 messages after the turn): no condensing.
    orchestrator::chat(&ctx.state, &session_id, "one", "ip:test")
        .await
        .unwrap();
    assert_eq!(ctx.mock.call_count(), 1);

    // Turn 2 pushes the log to window+1: exactly one condensation call, then
    // the main call.
    orchestrator::chat(&ctx.state, &session_id, "two", "ip:test")
        .await
        .unwrap();
    assert_eq!(ctx.mock.call_count(), 3);

    let session = ctx.state.sessions.get(&session_id).await.unwrap();
    assert_eq!(session.messages.len(), 5);
    assert_eq!(session.messages[0].role, Role::System);
    assert!(session.messages[0].content.contains("summary text"));
    // The verbatim tail survived.
    assert_eq!(session.messages[1].content, "one");
    assert_eq!(session.messages[4].content, "second");

    // The condensation call's tokens count globally but not in the session:
    // global input 2+5+2, output 1+3+1; session sees only the main turns.
    use std::sync::atomic::Ordering;
    assert_eq!(ctx.state.stats.tokens_in.load(Ordering::Relaxed), 9);
    assert_eq!(ctx.state.stats.tokens_out.load(Ordering::Relaxed), 5);
    assert_eq!(session.usage.input_tokens, 4);
    assert_eq!(session.usage.output_tokens, 2);
}

#[tokio::test]
async fn tool_loop_ceiling_rejects_further_rounds() {
    let ctx = ctx_with_mock(MockProvider::new(), |config| {
        config.chat.max_tool_iterations = 2;
    });
    ctx.mock.script(vec![
        MockStep::tool_call("t1", "search", serde_json::json!({"q": "a"})),
        MockStep::tool_call("t2", "search", serde_json::json!({"q": "b"})),
    ]);

    let mut config = mock_session_config("");
    config.tools = vec![ubridge_core::types::ToolDefinition {
        name: "search".into(),
        description: "search".into(),
        input_schema: serde_json::json!({"type": "object"}),
    }];
    let session_id = session_for(&ctx, config);

    let outcome = orchestrator::chat(&ctx.state, &session_id, "go", "ip:test")
        .await
        .unwrap();
    assert_eq!(
        outcome.response.finish_reason,
        ubridge_core::types::FinishReason::ToolCalls
    );

    // Round two: still under the ceiling, the provider asks again.
    let outcome = orchestrator::submit_tool_results(
        &ctx.state,
        &session_id,
        vec![ToolResultInput {
            id: "t1".into(),
            result: serde_json::json!({"hits": []}),
        }],
        "ip:test",
    )
    .await
    .unwrap();
    assert_eq!(
        outcome.response.finish_reason,
        ubridge_core::types::FinishReason::ToolCalls
    );

    // Round three crosses max_tool_iterations.
    let err = orchestrator::submit_tool_results(
        &ctx.state,
        &session_id,
        vec![ToolResultInput {
            id: "t2".into(),
            result: serde_json::json!({"hits": []}),
        }],
        "ip:test",
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "ToolLoopExceeded");

    // The rejection left the log untouched: no tool message was appended.
    let session = ctx.state.sessions.get(&session_id).await.unwrap();
    assert_eq!(
        session
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .count(),
        1
    );
}

#[tokio::test]
async fn partial_tool_results_are_rejected_without_mutation() {
    let ctx = ctx_with_mock(MockProvider::new(), |_| {});
    // One assistant round asking for two tools at once.
    ctx.mock.script(vec![MockStep {
        content: String::new(),
        tool_calls: vec![
            ubridge_core::types::ToolCall {
                id: "t1".into(),
                name: "search".into(),
                args: serde_json::json!({"q": "a"}),
            },
            ubridge_core::types::ToolCall {
                id: "t2".into(),
                name: "search".into(),
                args: serde_json::json!({"q": "b"}),
            },
        ],
        finish: ubridge_core::types::FinishReason::ToolCalls,
        input: 4,
        output: 1,
    }]);

    let mut config = mock_session_config("");
    config.tools = vec![ubridge_core::types::ToolDefinition {
        name: "search".into(),
        description: "search".into(),
        input_schema: serde_json::json!({"type": "object"}),
    }];
    let session_id = session_for(&ctx, config);

    let outcome = orchestrator::chat(&ctx.state, &session_id, "go", "ip:test")
        .await
        .unwrap();
    assert_eq!(outcome.response.tool_calls.len(), 2);
    let before = ctx.state.sessions.get(&session_id).await.unwrap().messages.len();

    // Answering only t1 must be refused: t2 could never be answered once a
    // new assistant message lands.
    let err = orchestrator::submit_tool_results(
        &ctx.state,
        &session_id,
        vec![ToolResultInput {
            id: "t1".into(),
            result: serde_json::json!({"hits": []}),
        }],
        "ip:test",
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "InvalidArgument");
    assert!(err.to_string().contains("t2"));

    let after = ctx.state.sessions.get(&session_id).await.unwrap().messages.len();
    assert_eq!(before, after);
    assert_eq!(ctx.mock.call_count(), 1, "no provider call on a partial submission");

    // The full set is still accepted afterwards.
    let outcome = orchestrator::submit_tool_results(
        &ctx.state,
        &session_id,
        vec![
            ToolResultInput {
                id: "t1".into(),
                result: serde_json::json!({"hits": []}),
            },
            ToolResultInput {
                id: "t2".into(),
                result: serde_json::json!({"hits": []}),
            },
        ],
        "ip:test",
    )
    .await
    .unwrap();
    assert_eq!(outcome.response.content, "ok");
}

#[tokio::test]
async fn unmatched_tool_result_is_rejected_without_mutation() {
    let ctx = ctx_with_mock(MockProvider::new(), |_| {});
    ctx.mock.script(vec![MockStep::tool_call(
        "t1",
        "search",
        serde_json::json!({}),
    )]);

    let mut config = mock_session_config("");
    config.tools = vec![ubridge_core::types::ToolDefinition {
        name: "search".into(),
        description: "search".into(),
        input_schema: serde_json::json!({"type": "object"}),
    }];
    let session_id = session_for(&ctx, config);

    orchestrator::chat(&ctx.state, &session_id, "go", "ip:test")
        .await
        .unwrap();
    let before = ctx.state.sessions.get(&session_id).await.unwrap().messages.len();

    let err = orchestrator::submit_tool_results(
        &ctx.state,
        &session_id,
        vec![ToolResultInput {
            id: "nope".into(),
            result: serde_json::json!({}),
        }],
        "ip:test",
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "InvalidArgument");

    let after = ctx.state.sessions.get(&session_id).await.unwrap().messages.len();
    assert_eq!(before, after);
}
