//! Provider key validation probes. Read-only calls: nothing here persists
//! or mutates upstream state.

use serde::Serialize;
use tracing::debug;

use ubridge_core::redact::redact;

#[derive(Debug, Clone, Serialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Validation {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(redact(&message.into())),
        }
    }
}

/// Probe the provider with the candidate credential.
pub async fn validate(client: &reqwest::Client, provider: &str, value: &str) -> Validation {
    debug!(provider, "validating credential");
    match provider {
        "anthropic" | "claude" => validate_anthropic(client, value).await,
        "openai" => validate_bearer_list(client, "https://api.openai.com/v1/models", value).await,
        "google" | "gemini" => validate_google(client, value).await,
        "github" => validate_github(client, value).await,
        other => Validation::rejected(format!("unknown provider '{other}'")),
    }
}

/// Minimal messages call: the cheapest request that exercises the key.
async fn validate_anthropic(client: &reqwest::Client, value: &str) -> Validation {
    let body = serde_json::json!({
        "model": "claude-3-5-haiku-latest",
        "max_tokens": 1,
        "messages": [{ "role": "user", "content": "ping" }],
    });
    let result = client
        .post("https://api.anthropic.com/v1/messages")
        .header("x-api-key", value)
        .header("anthropic-version", "2023-06-01")
        .json(&body)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => Validation::ok(),
        Ok(resp) if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 => {
            Validation::rejected("credentials rejected")
        }
        // Model-name or quota errors still prove the key authenticates.
        Ok(resp) if resp.status().as_u16() == 400 || resp.status().as_u16() == 429 => {
            Validation::ok()
        }
        Ok(resp) => Validation::rejected(format!("probe status {}", resp.status())),
        Err(e) => Validation::rejected(e.to_string()),
    }
}

async fn validate_bearer_list(client: &reqwest::Client, url: &str, value: &str) -> Validation {
    match client.get(url).bearer_auth(value).send().await {
        Ok(resp) if resp.status().is_success() => Validation::ok(),
        Ok(resp) => Validation::rejected(format!("probe status {}", resp.status())),
        Err(e) => Validation::rejected(e.to_string()),
    }
}

async fn validate_google(client: &reqwest::Client, value: &str) -> Validation {
    let url = format!(
        "https://generativelanguage.googleapis.com/v1beta/models?pageSize=1&key={value}"
    );
    match client.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => Validation::ok(),
        Ok(resp) => Validation::rejected(format!("probe status {}", resp.status())),
        Err(e) => Validation::rejected(e.to_string()),
    }
}

async fn validate_github(client: &reqwest::Client, value: &str) -> Validation {
    let result = client
        .get("https://api.github.com/user")
        .bearer_auth(value)
        .header("user-agent", "ubridge")
        .send()
        .await;
    match result {
        Ok(resp) if resp.status().is_success() => Validation::ok(),
        Ok(resp) => Validation::rejected(format!("probe status {}", resp.status())),
        Err(e) => Validation::rejected(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let client = reqwest::Client::new();
        let v = validate(&client, "bedrock", "whatever").await;
        assert!(!v.valid);
        assert!(v.error.unwrap().contains("bedrock"));
    }

    #[test]
    fn rejection_redacts_keys() {
        let v = Validation::rejected("bad key sk-ant-api03-aaaabbbbcccc");
        assert!(!v.error.unwrap().contains("aaaabbbbcccc"));
    }
}
