use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use tracing::warn;

use ubridge_core::error::BridgeError;
use ubridge_core::redact::redact;
use ubridge_core::types::ProviderId;
use ubridge_providers::adapter::ProviderError;
use ubridge_sessions::SessionError;

tokio::task_local! {
    /// Per-request context set by the request-meta middleware; read here so
    /// error bodies can carry the request id without threading it everywhere.
    pub static REQUEST_CONTEXT: RequestContext;
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub production: bool,
}

/// The single place that knows how error kinds map to HTTP status codes.
pub fn status_for(kind: &str) -> StatusCode {
    match kind {
        "InvalidArgument" => StatusCode::BAD_REQUEST,
        "DeviceUnknown" | "SessionUnknown" => StatusCode::NOT_FOUND,
        "SessionEnded" | "ToolLoopExceeded" => StatusCode::CONFLICT,
        "AuthInvalid" => StatusCode::UNAUTHORIZED,
        "RateLimited" | "ProviderRateLimited" => StatusCode::TOO_MANY_REQUESTS,
        "ProviderUnavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "ProviderError" => StatusCode::BAD_GATEWAY,
        "Timeout" => StatusCode::GATEWAY_TIMEOUT,
        "PayloadTooLarge" => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// HTTP-facing error wrapper. Conversion into a response applies the
/// kind→status map, redaction, and production masking.
#[derive(Debug)]
pub struct ApiError(pub BridgeError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let kind = err.kind();
        let status = status_for(kind);

        let ctx = REQUEST_CONTEXT.try_with(|c| c.clone()).ok();
        let request_id = ctx.as_ref().map(|c| c.request_id.clone()).unwrap_or_default();
        let production = ctx.map(|c| c.production).unwrap_or(false);

        // Internal faults keep their detail in logs, not in production bodies.
        let message = if production && kind == "Internal" {
            "internal error".to_string()
        } else {
            redact(&err.to_string())
        };
        if status.is_server_error() {
            warn!(kind, %request_id, error = %err, "request failed");
        }

        let mut body = serde_json::json!({
            "error": kind,
            "message": message,
            "requestId": request_id,
        });
        if let Some(details) = err.details() {
            body["details"] = details;
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = err.retry_after_secs() {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        ApiError(err)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError(bridge_from_session(err))
    }
}

pub fn bridge_from_session(err: SessionError) -> BridgeError {
    match err {
        SessionError::DeviceUnknown(id) => BridgeError::DeviceUnknown { id },
        SessionError::NotFound(id) => BridgeError::SessionUnknown { id },
        SessionError::Ended(id) => BridgeError::SessionEnded { id },
        SessionError::InvalidConfig { field, message } => {
            BridgeError::InvalidArgument { field, message }
        }
    }
}

/// Map adapter faults to the taxonomy without losing the upstream code.
pub fn bridge_from_provider(provider: ProviderId, err: ProviderError) -> BridgeError {
    match err {
        ProviderError::AuthInvalid { message, .. } => BridgeError::AuthInvalid {
            provider,
            message: redact(&message),
        },
        ProviderError::RateLimited { retry_after_ms } => BridgeError::ProviderRateLimited {
            provider,
            retry_after_ms,
        },
        ProviderError::Timeout { ms } => BridgeError::Timeout { ms },
        ProviderError::Unavailable(message) => BridgeError::ProviderUnavailable {
            provider,
            message: redact(&message),
        },
        ProviderError::Api { status, message } => BridgeError::ProviderError {
            provider,
            status,
            message: redact(&message),
        },
        ProviderError::Http(e) => BridgeError::ProviderUnavailable {
            provider,
            message: redact(&e.to_string()),
        },
        ProviderError::Parse(message) => BridgeError::Internal(format!(
            "{provider} returned an unparseable response: {message}"
        )),
        ProviderError::Cancelled => BridgeError::Internal("request cancelled".to_string()),
    }
}

/// Decode a sanitized JSON body into its typed shape. Lenient mode ignores
/// unknown fields; strict mode rejects any top-level field outside `known`.
/// Failures carry the offending field in the error body.
pub fn parse_body<T: DeserializeOwned>(
    value: serde_json::Value,
    strict: bool,
    known: &[&str],
) -> Result<T, ApiError> {
    if strict {
        if let Some(map) = value.as_object() {
            if let Some(unknown) = map.keys().find(|k| !known.contains(&k.as_str())) {
                return Err(ApiError(BridgeError::InvalidArgument {
                    field: unknown.clone(),
                    message: "unknown field".to_string(),
                }));
            }
        }
    }
    serde_json::from_value(value).map_err(|e| {
        ApiError(BridgeError::InvalidArgument {
            field: "body".to_string(),
            // serde_json embeds the failing path in the message.
            message: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_status_table_matches_spec() {
        assert_eq!(status_for("InvalidArgument"), StatusCode::BAD_REQUEST);
        assert_eq!(status_for("DeviceUnknown"), StatusCode::NOT_FOUND);
        assert_eq!(status_for("SessionEnded"), StatusCode::CONFLICT);
        assert_eq!(status_for("AuthInvalid"), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for("RateLimited"), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for("ProviderRateLimited"), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for("ProviderUnavailable"), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for("ProviderError"), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for("Timeout"), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(status_for("ToolLoopExceeded"), StatusCode::CONFLICT);
        assert_eq!(status_for("PayloadTooLarge"), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(status_for("Internal"), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn provider_mapping_keeps_upstream_status() {
        let mapped = bridge_from_provider(
            ProviderId::Openai,
            ProviderError::Api {
                status: 503,
                message: "overloaded".into(),
            },
        );
        assert_eq!(mapped.kind(), "ProviderError");
        assert_eq!(mapped.details().unwrap()["providerCode"], 503);
    }

    #[test]
    fn auth_mapping_redacts() {
        let mapped = bridge_from_provider(
            ProviderId::Claude,
            ProviderError::AuthInvalid {
                status: 401,
                message: "bad key sk-ant-api03-topsecret99".into(),
            },
        );
        assert!(!mapped.to_string().contains("topsecret99"));
    }
}
