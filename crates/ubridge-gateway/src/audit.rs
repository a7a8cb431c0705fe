use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing::warn;

use ubridge_core::types::ProviderId;

type HmacSha256 = Hmac<Sha256>;

/// Values handlers attach to the response so the audit record can carry
/// token and cost figures that only exist after the orchestrator ran.
#[derive(Debug, Clone, Default)]
pub struct AuditInfo {
    pub device_id: Option<String>,
    pub session_id: Option<String>,
    pub provider: Option<ProviderId>,
    pub tokens: Option<u64>,
    pub cost: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub event: &'static str,
    /// "METHOD path"
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    pub ip: String,
    pub metadata: AuditMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    pub duration_ms: u64,
    pub status: u16,
}

/// One JSONL record per request. Lines are optionally HMAC-signed with the
/// session secret so the trail is tamper-evident.
pub struct AuditLog {
    file: Mutex<File>,
    secret: Option<Vec<u8>>,
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>, secret: Option<&str>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
            secret: secret.map(|s| s.as_bytes().to_vec()),
        })
    }

    pub fn record(&self, record: &AuditRecord) {
        let Ok(mut line) = serde_json::to_string(record) else {
            return;
        };
        if let Some(secret) = &self.secret {
            if let Ok(mut mac) = HmacSha256::new_from_slice(secret) {
                mac.update(line.as_bytes());
                let sig = hex::encode(mac.finalize().into_bytes());
                // Splice the signature into the object tail.
                line.truncate(line.len() - 1);
                line.push_str(&format!(",\"sig\":\"{sig}\"}}"));
            }
        }

        let mut file = self.file.lock().expect("audit log poisoned");
        if let Err(e) = writeln!(file, "{line}") {
            warn!(error = %e, "audit write failed");
        }
    }
}
