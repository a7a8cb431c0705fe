//! End-to-end scenarios through the router: happy path, cache hit, tool
//! loop, and rate limiting: all against the scriptable mock provider.

mod common;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use common::{ctx_with_mock, default_ctx, MockProvider, MockStep, TestCtx};
use ubridge_gateway::app::build_router;

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, headers, value)
}

async fn register_device(router: &Router) -> String {
    let (status, _, body) = send(
        router,
        "POST",
        "/devices/register",
        Some(serde_json::json!({ "name": "T", "type": "server" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["device"]["id"].as_str().unwrap().to_string()
}

async fn create_session(router: &Router, device_id: &str, config: serde_json::Value) -> String {
    let (status, _, body) = send(
        router,
        "POST",
        "/sessions",
        Some(serde_json::json!({ "deviceId": device_id, "config": config })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK, "session create failed: {body}");
    body["session"]["id"].as_str().unwrap().to_string()
}

fn mock_config() -> serde_json::Value {
    serde_json::json!({
        "provider": "claude",
        "model": "mock-model",
        "temperature": 0,
        "maxTokens": 128,
        "systemPrompt": "SYS",
    })
}

fn router_for(ctx: &TestCtx) -> Router {
    build_router(ctx.state.clone())
}

#[tokio::test]
async fn happy_path_non_streaming() {
    let ctx = default_ctx();
    ctx.mock.script(vec![MockStep::text("hello", 3, 2)]);
    let router = router_for(&ctx);

    let device_id = register_device(&router).await;
    let session_id = create_session(&router, &device_id, mock_config()).await;

    let (status, headers, body) = send(
        &router,
        "POST",
        "/chat",
        Some(serde_json::json!({ "sessionId": session_id, "message": "hi" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "hello");
    assert_eq!(body["finishReason"], "stop");
    assert_eq!(body["usage"]["totalTokens"], 5);
    assert_eq!(headers.get("X-Cache").unwrap(), "MISS");
    assert!(headers.contains_key("X-Request-ID"));

    let (status, _, body) = send(
        &router,
        "GET",
        &format!("/sessions/{session_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = body["session"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[0]["content"], "SYS");
    assert_eq!(messages[1]["role"], "user");
    assert_eq!(messages[1]["content"], "hi");
    assert_eq!(messages[2]["role"], "assistant");
    assert_eq!(messages[2]["content"], "hello");
    assert_eq!(body["session"]["usage"]["totalTokens"], 5);
}

#[tokio::test]
async fn identical_conversation_hits_the_cache() {
    let ctx = default_ctx();
    ctx.mock.script(vec![MockStep::text("hello", 3, 2)]);
    let router = router_for(&ctx);

    let device_id = register_device(&router).await;
    let first = create_session(&router, &device_id, mock_config()).await;
    let (_, headers, first_body) = send(
        &router,
        "POST",
        "/chat",
        Some(serde_json::json!({ "sessionId": first, "message": "hi" })),
        &[],
    )
    .await;
    assert_eq!(headers.get("X-Cache").unwrap(), "MISS");

    // Fresh session, same config and message sequence.
    let second = create_session(&router, &device_id, mock_config()).await;
    let (status, headers, second_body) = send(
        &router,
        "POST",
        "/chat",
        Some(serde_json::json!({ "sessionId": second, "message": "hi" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("X-Cache").unwrap(), "HIT");
    assert_eq!(second_body["response"], first_body["response"]);
    assert_eq!(second_body["usage"], first_body["usage"]);
    assert_eq!(ctx.mock.call_count(), 1, "cache hit must not call the provider");
}

#[tokio::test]
async fn tool_loop_round_trip() {
    let ctx = default_ctx();
    ctx.mock.script(vec![
        MockStep::tool_call("t1", "search", serde_json::json!({"q": "x"})),
        MockStep::text("done", 4, 2),
    ]);
    let router = router_for(&ctx);

    let device_id = register_device(&router).await;
    let mut config = mock_config();
    config["tools"] = serde_json::json!([{
        "name": "search",
        "description": "Search the corpus",
        "inputSchema": { "type": "object", "properties": { "q": { "type": "string" } } },
    }]);
    let session_id = create_session(&router, &device_id, config).await;

    let (status, _, body) = send(
        &router,
        "POST",
        "/chat",
        Some(serde_json::json!({ "sessionId": session_id, "message": "find x" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["finishReason"], "tool_calls");
    assert_eq!(body["toolCalls"][0]["id"], "t1");
    assert_eq!(body["toolCalls"][0]["name"], "search");

    let (status, _, body) = send(
        &router,
        "POST",
        "/tools",
        Some(serde_json::json!({
            "sessionId": session_id,
            "toolResults": [{ "id": "t1", "result": { "hits": ["a"] } }],
        })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "done");
    assert_eq!(body["finishReason"], "stop");

    let (_, _, body) = send(
        &router,
        "GET",
        &format!("/sessions/{session_id}"),
        None,
        &[],
    )
    .await;
    let messages = body["session"]["messages"].as_array().unwrap();
    let roles: Vec<&str> = messages
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, ["system", "user", "assistant", "tool", "assistant"]);
    assert_eq!(messages[2]["toolCalls"][0]["id"], "t1");
    assert_eq!(messages[3]["toolCallId"], "t1");
    assert_eq!(messages[4]["content"], "done");
}

#[tokio::test]
async fn rate_limit_rejects_third_request() {
    let ctx = ctx_with_mock(MockProvider::new(), |config| {
        config.limits.max_requests = 2;
    });
    let router = router_for(&ctx);

    // Setup traffic runs under the anonymous identity; the chats under an
    // API-key identity with its own window.
    let device_id = register_device(&router).await;
    let session_id = create_session(&router, &device_id, mock_config()).await;
    let key_header = [("x-api-key", "test-key")];

    for message in ["one", "two"] {
        let (status, _, _) = send(
            &router,
            "POST",
            "/chat",
            Some(serde_json::json!({ "sessionId": session_id, "message": message })),
            &key_header,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(ctx.mock.call_count(), 2);

    let (status, headers, body) = send(
        &router,
        "POST",
        "/chat",
        Some(serde_json::json!({ "sessionId": session_id, "message": "three" })),
        &key_header,
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "RateLimited");
    assert!(headers.contains_key("Retry-After"));
    assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
    assert_eq!(
        ctx.mock.call_count(),
        2,
        "rejected request must not reach the provider"
    );
}

#[tokio::test]
async fn invalid_temperature_is_rejected() {
    let ctx = default_ctx();
    let router = router_for(&ctx);
    let device_id = register_device(&router).await;

    let mut config = mock_config();
    config["temperature"] = serde_json::json!(2.0000001);
    let (status, _, body) = send(
        &router,
        "POST",
        "/sessions",
        Some(serde_json::json!({ "deviceId": device_id, "config": config })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "InvalidArgument");
    assert!(body["requestId"].as_str().is_some());
}

#[tokio::test]
async fn unknown_session_and_device_are_not_found() {
    let ctx = default_ctx();
    let router = router_for(&ctx);

    let (status, _, body) = send(
        &router,
        "POST",
        "/sessions",
        Some(serde_json::json!({ "deviceId": "dev_missing", "config": mock_config() })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "DeviceUnknown");

    let (status, _, body) = send(
        &router,
        "POST",
        "/chat",
        Some(serde_json::json!({ "sessionId": "ses_missing", "message": "hi" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "SessionUnknown");
}

#[tokio::test]
async fn ended_session_rejects_further_chat() {
    let ctx = default_ctx();
    let router = router_for(&ctx);
    let device_id = register_device(&router).await;
    let session_id = create_session(&router, &device_id, mock_config()).await;

    let (status, _, body) = send(
        &router,
        "DELETE",
        &format!("/sessions/{session_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["status"], "ended");

    // Idempotent: a second end returns the same shape.
    let (status, _, body) = send(
        &router,
        "DELETE",
        &format!("/sessions/{session_id}"),
        None,
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["status"], "ended");

    let (status, _, body) = send(
        &router,
        "POST",
        "/chat",
        Some(serde_json::json!({ "sessionId": session_id, "message": "hi" })),
        &[],
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "SessionEnded");
    assert_eq!(ctx.mock.call_count(), 0);
}

#[tokio::test]
async fn provider_list_includes_the_mock_slot() {
    let ctx = default_ctx();
    let router = router_for(&ctx);
    let (status, _, body) = send(&router, "GET", "/providers", None, &[]).await;
    assert_eq!(status, StatusCode::OK);
    let providers = body["providers"].as_array().unwrap();
    assert!(providers
        .iter()
        .any(|p| p["id"] == "claude" && p["available"] == true));
}
