use thiserror::Error;

use crate::types::ProviderId;

/// The bridge-wide error taxonomy. The `kind()` discriminants are part of the
/// wire contract and must stay stable across releases; the HTTP layer is the
/// only place that maps kinds to status codes.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid argument at {field}: {message}")]
    InvalidArgument { field: String, message: String },

    #[error("unknown device: {id}")]
    DeviceUnknown { id: String },

    #[error("unknown session: {id}")]
    SessionUnknown { id: String },

    #[error("session {id} has ended")]
    SessionEnded { id: String },

    #[error("{provider} rejected credentials: {message}")]
    AuthInvalid {
        provider: ProviderId,
        message: String,
    },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("{provider} rate limited, retry after {retry_after_ms}ms")]
    ProviderRateLimited {
        provider: ProviderId,
        retry_after_ms: u64,
    },

    #[error("{provider} unavailable: {message}")]
    ProviderUnavailable {
        provider: ProviderId,
        message: String,
    },

    #[error("{provider} error ({status}): {message}")]
    ProviderError {
        provider: ProviderId,
        status: u16,
        message: String,
    },

    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("tool loop exceeded {limit} iterations")]
    ToolLoopExceeded { limit: u32 },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable string discriminant used as the `error` field in responses.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidArgument { .. } => "InvalidArgument",
            BridgeError::DeviceUnknown { .. } => "DeviceUnknown",
            BridgeError::SessionUnknown { .. } => "SessionUnknown",
            BridgeError::SessionEnded { .. } => "SessionEnded",
            BridgeError::AuthInvalid { .. } => "AuthInvalid",
            BridgeError::RateLimited { .. } => "RateLimited",
            BridgeError::ProviderRateLimited { .. } => "ProviderRateLimited",
            BridgeError::ProviderUnavailable { .. } => "ProviderUnavailable",
            BridgeError::ProviderError { .. } => "ProviderError",
            BridgeError::Timeout { .. } => "Timeout",
            BridgeError::ToolLoopExceeded { .. } => "ToolLoopExceeded",
            BridgeError::PayloadTooLarge { .. } => "PayloadTooLarge",
            BridgeError::Internal(_) => "Internal",
        }
    }

    /// Structured details exposed alongside the message. Provider faults keep
    /// the upstream status code here so translation never loses it.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            BridgeError::InvalidArgument { field, .. } => {
                Some(serde_json::json!({ "field": field }))
            }
            BridgeError::ProviderError {
                provider, status, ..
            } => Some(serde_json::json!({
                "provider": provider.as_str(),
                "providerCode": status,
            })),
            BridgeError::ProviderRateLimited {
                provider,
                retry_after_ms,
            } => Some(serde_json::json!({
                "provider": provider.as_str(),
                "retryAfterMs": retry_after_ms,
            })),
            BridgeError::PayloadTooLarge { size, max } => {
                Some(serde_json::json!({ "size": size, "max": max }))
            }
            _ => None,
        }
    }

    /// Retry-After value in seconds for the two rate-limit kinds.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            BridgeError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            BridgeError::ProviderRateLimited { retry_after_ms, .. } => {
                Some(retry_after_ms.div_ceil(1000))
            }
            _ => None,
        }
    }

    pub fn invalid_argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::invalid_argument("body", e.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
