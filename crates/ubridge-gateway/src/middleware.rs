use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tracing::warn;

use ubridge_core::config::{BridgeConfig, MAX_BODY_BYTES};
use ubridge_core::error::BridgeError;

use crate::app::AppState;
use crate::audit::{AuditInfo, AuditMetadata, AuditRecord};
use crate::error::{ApiError, RequestContext, REQUEST_CONTEXT};

/// Rate-limit identity, resolved once per request. API-key hash when the
/// caller authenticates, forwarded-for hop or peer address otherwise.
#[derive(Debug, Clone)]
pub struct Identity(pub String);

/// CORS restricted to the configured origin list, credentials allowed.
pub fn cors_layer(config: &BridgeConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .server
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true)
}

fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn resolve_identity(req: &Request) -> Identity {
    if let Some(key) = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !key.is_empty() {
            return Identity(ubridge_limiter::api_key_identity(key));
        }
    }
    Identity(ubridge_limiter::ip_identity(&client_ip(req)))
}

/// Outermost app middleware: request id, per-request task-local context, and
/// the audit record written once the response exists.
pub async fn request_meta(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let action = format!("{} {}", req.method(), req.uri().path());
    let ip = client_ip(&req);
    let started = Instant::now();
    state.stats.requests.fetch_add(1, Ordering::Relaxed);

    let ctx = RequestContext {
        request_id: request_id.clone(),
        production: state.config.server.env.is_production(),
    };
    let mut response = REQUEST_CONTEXT.scope(ctx, next.run(req)).await;

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("X-Request-ID", value);
    }

    let info = response
        .extensions()
        .get::<AuditInfo>()
        .cloned()
        .unwrap_or_default();
    state.audit.record(&AuditRecord {
        timestamp: Utc::now(),
        request_id,
        event: "request",
        action,
        device_id: info.device_id,
        session_id: info.session_id,
        provider: info.provider,
        ip,
        metadata: AuditMetadata {
            tokens: info.tokens,
            cost: info.cost,
            duration_ms: started.elapsed().as_millis() as u64,
            status: response.status().as_u16(),
        },
    });

    response
}

/// Admission control. Runs before any other work; a rejection never reaches
/// a provider. Successful responses gain the X-RateLimit-* headers.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let identity = resolve_identity(&req);
    let decision = state
        .limiter
        .allow_request(&identity.0, Utc::now().timestamp());

    if !decision.ok {
        state.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
        let mut response = ApiError(BridgeError::RateLimited {
            retry_after_secs: decision.retry_after_secs.unwrap_or(1),
        })
        .into_response();
        apply_rate_headers(&mut response, decision);
        return response;
    }

    req.extensions_mut().insert(identity);
    let mut response = next.run(req).await;
    apply_rate_headers(&mut response, decision);
    response
}

fn apply_rate_headers(response: &mut Response, decision: ubridge_limiter::Decision) {
    let headers = response.headers_mut();
    if let Ok(v) = decision.limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = decision.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = decision.reset_unix.to_string().parse() {
        headers.insert("X-RateLimit-Reset", v);
    }
}

/// Input sanitation: body-size cap, control-byte stripping, and collapsing
/// `..` segments in any field named `path`. The sanitized JSON value replaces
/// the request body so handlers decode an already-clean document.
pub async fn sanitize(req: Request, next: Next) -> Response {
    // Only requests that carry a body need the treatment.
    if !matches!(req.method(), &Method::POST | &Method::PUT | &Method::PATCH) {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError(BridgeError::PayloadTooLarge {
                size: parts
                    .headers
                    .get("content-length")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(MAX_BODY_BYTES + 1),
                max: MAX_BODY_BYTES,
            })
            .into_response();
        }
    };

    let cleaned: Vec<u8> = bytes
        .iter()
        .copied()
        .filter(|b| *b >= 0x20 || matches!(*b, b'\t' | b'\n' | b'\r'))
        .collect();

    let is_json = parts
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);

    let body = if is_json && !cleaned.is_empty() {
        match serde_json::from_slice::<serde_json::Value>(&cleaned) {
            Ok(mut value) => {
                sanitize_paths(&mut value);
                Body::from(serde_json::to_vec(&value).unwrap_or(cleaned))
            }
            Err(e) => {
                warn!(error = %e, "malformed JSON body");
                return ApiError(BridgeError::invalid_argument("body", e.to_string()))
                    .into_response();
            }
        }
    } else {
        Body::from(cleaned)
    };

    // The sanitized body may differ in length from the original.
    parts.headers.remove(axum::http::header::CONTENT_LENGTH);
    next.run(Request::from_parts(parts, body)).await
}

/// Collapse `..` segments in every string field named `path`, recursively.
fn sanitize_paths(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if key == "path" {
                    if let serde_json::Value::String(s) = entry {
                        *s = s
                            .split('/')
                            .filter(|segment| *segment != "..")
                            .collect::<Vec<_>>()
                            .join("/");
                    }
                }
                sanitize_paths(entry);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                sanitize_paths(item);
            }
        }
        _ => {}
    }
}
