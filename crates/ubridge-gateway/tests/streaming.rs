//! Streaming bridge behavior: delta ordering, completion accounting, and
//! client-disconnect cancellation.

mod common;

use std::time::Duration;

use common::{ctx_with_mock, mock_session_config, MockProvider, TestCtx};
use ubridge_core::types::Role;
use ubridge_gateway::orchestrator;
use ubridge_sessions::{Capabilities, DeviceType};

fn session_for(ctx: &TestCtx) -> String {
    let device = ctx
        .state
        .devices
        .register("T", DeviceType::Server, Capabilities::default());
    ctx.state
        .sessions
        .create(&ctx.state.devices, &device.id, mock_session_config("SYS"))
        .unwrap()
        .id
}

#[tokio::test]
async fn stream_completion_appends_and_accounts() {
    let ctx = ctx_with_mock(
        MockProvider::with_deltas(&["he", "llo"], Duration::from_millis(5)),
        |_| {},
    );
    let session_id = session_for(&ctx);

    let mut rx = orchestrator::chat_stream(&ctx.state, &session_id, "hi", "ip:test")
        .await
        .unwrap();

    let mut deltas = Vec::new();
    let mut last = None;
    while let Some(frame) = rx.recv().await {
        if frame.done {
            last = Some(frame);
            break;
        }
        deltas.push(frame.delta);
    }

    assert_eq!(deltas, ["he", "llo"], "deltas arrive in emission order");
    let last = last.expect("final frame");
    assert_eq!(last.finish_reason, Some(ubridge_core::types::FinishReason::Stop));
    let usage = last.usage.expect("usage on final frame");
    assert_eq!(usage.total_tokens, 5);

    let session = ctx.state.sessions.get(&session_id).await.unwrap();
    let assistant = session
        .messages
        .iter()
        .find(|m| m.role == Role::Assistant)
        .expect("assistant appended after completion");
    assert_eq!(assistant.content, "hello");
    assert_eq!(session.usage.total_tokens, 5);
}

#[tokio::test]
async fn client_disconnect_cancels_upstream_and_appends_nothing() {
    let ctx = ctx_with_mock(
        MockProvider::with_deltas(&["he", "llo"], Duration::from_millis(100)),
        |_| {},
    );
    let session_id = session_for(&ctx);

    let mut rx = orchestrator::chat_stream(&ctx.state, &session_id, "hi", "ip:test")
        .await
        .unwrap();

    // Exactly one frame, then the client goes away.
    let first = rx.recv().await.expect("first delta");
    assert_eq!(first.delta, "he");
    assert!(!first.done);
    drop(rx);

    // Let the bridge notice the disconnect and abort upstream.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(ctx.mock.was_cancelled(), "upstream cancel hook must fire");

    let session = ctx.state.sessions.get(&session_id).await.unwrap();
    assert!(
        !session.messages.iter().any(|m| m.role == Role::Assistant),
        "aborted stream must not append an assistant message"
    );
}

#[tokio::test]
async fn server_shutdown_closes_stream_with_cancelled() {
    let ctx = ctx_with_mock(
        MockProvider::with_deltas(&["slow"], Duration::from_millis(500)),
        |_| {},
    );
    let session_id = session_for(&ctx);

    let mut rx = orchestrator::chat_stream(&ctx.state, &session_id, "hi", "ip:test")
        .await
        .unwrap();

    // Shut the server down mid-stream.
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.state.shutdown.cancel();

    let mut saw_cancelled = false;
    while let Some(frame) = rx.recv().await {
        if frame.done {
            saw_cancelled =
                frame.finish_reason == Some(ubridge_core::types::FinishReason::Cancelled);
            break;
        }
    }
    assert!(saw_cancelled, "shutdown must close streams with finishReason cancelled");

    let session = ctx.state.sessions.get(&session_id).await.unwrap();
    assert!(!session.messages.iter().any(|m| m.role == Role::Assistant));
}

#[tokio::test]
async fn stream_turn_serializes_with_the_session_lock() {
    let ctx = ctx_with_mock(
        MockProvider::with_deltas(&["a"], Duration::from_millis(50)),
        |_| {},
    );
    let session_id = session_for(&ctx);

    let mut rx = orchestrator::chat_stream(&ctx.state, &session_id, "hi", "ip:test")
        .await
        .unwrap();

    // A snapshot taken mid-stream waits for the turn to finish, so the
    // prefix property holds: no observer sees a half-appended turn.
    let state = ctx.state.clone();
    let sid = session_id.clone();
    let snapshot = tokio::spawn(async move { state.sessions.get(&sid).await.unwrap() });

    while let Some(frame) = rx.recv().await {
        if frame.done {
            break;
        }
    }
    let session = snapshot.await.unwrap();
    // The observation happened either before the user append or after the
    // full turn: never between.
    let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
    assert!(
        roles == vec![Role::System]
            || roles == vec![Role::System, Role::User, Role::Assistant],
        "unexpected mid-turn observation: {roles:?}"
    );
}
