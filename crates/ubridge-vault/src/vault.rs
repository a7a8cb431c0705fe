use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, VaultError};
use crate::validate::{self, Validation};

const KEY_FILE: &str = "key";
const STORE_FILE: &str = "store.json";
const TAG_LEN: usize = 16;
const IV_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretType {
    ApiKey,
    Token,
    Password,
    Certificate,
}

/// Persisted envelope: ciphertext, IV and auth tag hex-encoded, tag held
/// apart from the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretRecord {
    ciphertext: String,
    iv: String,
    auth_tag: String,
    #[serde(rename = "type")]
    secret_type: SecretType,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

/// What `list` exposes: everything except the ciphertext envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub secret_type: SecretType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub secret_type: Option<SecretType>,
    pub provider: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Environment variables imported at startup when not already stored.
const ENV_IMPORTS: &[(&str, &str)] = &[
    ("ANTHROPIC_API_KEY", "anthropic"),
    ("OPENAI_API_KEY", "openai"),
    ("GOOGLE_API_KEY", "google"),
    ("OLLAMA_CLOUD_API_KEY", "ollama-cloud"),
    ("GITHUB_TOKEN", "github"),
];

/// Authenticated-encryption envelope for provider credentials.
///
/// Two files under an owner-only directory: `key` (32 random bytes) and
/// `store.json` (the encrypted map). Plaintext never leaves this type except
/// through `get`.
pub struct SecretsVault {
    dir: PathBuf,
    cipher: Aes256Gcm,
    index: RwLock<HashMap<String, SecretRecord>>,
}

impl SecretsVault {
    /// Open (or initialise) the vault at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        restrict_dir(&dir)?;

        let key = load_or_create_key(&dir)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let store_path = dir.join(STORE_FILE);
        let index = if store_path.exists() {
            let raw = fs::read_to_string(&store_path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };

        info!(dir = %dir.display(), secrets = index.len(), "vault opened");
        Ok(Self {
            dir,
            cipher,
            index: RwLock::new(index),
        })
    }

    /// Encrypt and persist one secret, replacing any existing record.
    pub fn set(&self, name: &str, value: &str, opts: SetOptions) -> Result<()> {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), value.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;
        // aes-gcm appends the 16-byte tag; the envelope stores it separately.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let now = Utc::now();
        let mut index = self.index.write().expect("vault index poisoned");
        let created_at = index.get(name).map(|r| r.created_at).unwrap_or(now);
        index.insert(
            name.to_string(),
            SecretRecord {
                ciphertext: hex::encode(ciphertext),
                iv: hex::encode(iv),
                auth_tag: hex::encode(tag),
                secret_type: opts.secret_type.unwrap_or(SecretType::ApiKey),
                provider: opts.provider,
                created_at,
                updated_at: now,
                expires_at: opts.expires_at,
            },
        );
        self.persist(&index)?;
        debug!(name, "secret stored");
        Ok(())
    }

    /// Decrypt one secret. Absent and expired names both return `None`.
    pub fn get(&self, name: &str) -> Result<Option<String>> {
        let index = self.index.read().expect("vault index poisoned");
        let Some(record) = index.get(name) else {
            return Ok(None);
        };

        if let Some(expires_at) = record.expires_at {
            if expires_at < Utc::now() {
                warn!(name, "secret expired");
                return Ok(None);
            }
        }

        let iv = hex::decode(&record.iv)
            .map_err(|e| VaultError::BadRecord(name.to_string(), e.to_string()))?;
        let mut sealed = hex::decode(&record.ciphertext)
            .map_err(|e| VaultError::BadRecord(name.to_string(), e.to_string()))?;
        let tag = hex::decode(&record.auth_tag)
            .map_err(|e| VaultError::BadRecord(name.to_string(), e.to_string()))?;
        sealed.extend_from_slice(&tag);

        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| VaultError::Decrypt(name.to_string()))?;
        let value = String::from_utf8(plain)
            .map_err(|e| VaultError::BadRecord(name.to_string(), e.to_string()))?;
        Ok(Some(value))
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        let mut index = self.index.write().expect("vault index poisoned");
        let removed = index.remove(name).is_some();
        if removed {
            self.persist(&index)?;
            debug!(name, "secret deleted");
        }
        Ok(removed)
    }

    /// Metadata for every stored secret. Never includes plaintext.
    pub fn list(&self) -> Vec<SecretMeta> {
        let index = self.index.read().expect("vault index poisoned");
        let mut metas: Vec<SecretMeta> = index
            .iter()
            .map(|(name, r)| SecretMeta {
                name: name.clone(),
                secret_type: r.secret_type,
                provider: r.provider.clone(),
                created_at: r.created_at,
                updated_at: r.updated_at,
                expires_at: r.expires_at,
            })
            .collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        metas
    }

    /// Probe the provider with the candidate value, then persist only when
    /// the probe accepts it.
    pub async fn set_and_validate(
        &self,
        client: &reqwest::Client,
        name: &str,
        value: &str,
        provider: &str,
    ) -> Result<Validation> {
        let validation = validate::validate(client, provider, value).await;
        if validation.valid {
            self.set(
                name,
                value,
                SetOptions {
                    secret_type: Some(SecretType::ApiKey),
                    provider: Some(provider.to_string()),
                    expires_at: None,
                },
            )?;
        }
        Ok(validation)
    }

    /// Import well-known environment variables that aren't stored yet.
    /// Returns the names imported.
    pub fn import_env(&self) -> Result<Vec<String>> {
        let mut imported = Vec::new();
        for (env_name, provider) in ENV_IMPORTS {
            let Ok(value) = std::env::var(env_name) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            let exists = {
                let index = self.index.read().expect("vault index poisoned");
                index.contains_key(*env_name)
            };
            if exists {
                continue;
            }
            self.set(
                env_name,
                &value,
                SetOptions {
                    secret_type: Some(SecretType::ApiKey),
                    provider: Some((*provider).to_string()),
                    expires_at: None,
                },
            )?;
            info!(name = env_name, "secret imported from environment");
            imported.push((*env_name).to_string());
        }
        Ok(imported)
    }

    /// Write-to-temp + fsync + rename, owner-only permissions.
    fn persist(&self, index: &HashMap<String, SecretRecord>) -> Result<()> {
        let tmp = self.dir.join(format!("{STORE_FILE}.tmp"));
        let final_path = self.dir.join(STORE_FILE);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(index)?.as_bytes())?;
            file.sync_all()?;
        }
        restrict_file(&tmp)?;
        fs::rename(&tmp, &final_path)?;
        Ok(())
    }
}

/// Ensure `.secrets/` is listed in the repo ignore file.
pub fn ensure_gitignored(repo_root: &Path) -> std::io::Result<()> {
    let gitignore = repo_root.join(".gitignore");
    let existing = fs::read_to_string(&gitignore).unwrap_or_default();
    let listed = existing
        .lines()
        .any(|l| matches!(l.trim(), ".secrets" | ".secrets/"));
    if !listed {
        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(".secrets/\n");
        fs::write(&gitignore, content)?;
    }
    Ok(())
}

fn load_or_create_key(dir: &Path) -> Result<[u8; 32]> {
    let key_path = dir.join(KEY_FILE);
    if key_path.exists() {
        let raw = fs::read(&key_path)?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::BadKeyFile(raw.len()))?;
        return Ok(bytes);
    }

    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    let mut file = fs::File::create(&key_path)?;
    file.write_all(&key)?;
    file.sync_all()?;
    drop(file);
    restrict_file(&key_path)?;
    info!("vault key generated");
    Ok(key)
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretsVault::open(dir.path()).unwrap();
        vault
            .set("ANTHROPIC_API_KEY", "sk-ant-test-12345", SetOptions::default())
            .unwrap();
        assert_eq!(
            vault.get("ANTHROPIC_API_KEY").unwrap().as_deref(),
            Some("sk-ant-test-12345")
        );
    }

    #[test]
    fn get_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let vault = SecretsVault::open(dir.path()).unwrap();
            vault.set("token", "value-1", SetOptions::default()).unwrap();
        }
        let vault = SecretsVault::open(dir.path()).unwrap();
        assert_eq!(vault.get("token").unwrap().as_deref(), Some("value-1"));
    }

    #[test]
    fn expired_secret_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretsVault::open(dir.path()).unwrap();
        vault
            .set(
                "short-lived",
                "v",
                SetOptions {
                    expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(vault.get("short-lived").unwrap(), None);
    }

    #[test]
    fn list_never_contains_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretsVault::open(dir.path()).unwrap();
        vault
            .set("secret-name", "super-plain-value", SetOptions::default())
            .unwrap();
        let listed = serde_json::to_string(&vault.list()).unwrap();
        assert!(!listed.contains("super-plain-value"));
        assert!(listed.contains("secret-name"));
    }

    #[test]
    fn delete_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretsVault::open(dir.path()).unwrap();
        vault.set("gone", "v", SetOptions::default()).unwrap();
        assert!(vault.delete("gone").unwrap());
        assert!(!vault.delete("gone").unwrap());
        assert_eq!(vault.get("gone").unwrap(), None);
    }

    #[test]
    fn iv_is_fresh_per_set() {
        let dir = tempfile::tempdir().unwrap();
        let vault = SecretsVault::open(dir.path()).unwrap();
        vault.set("a", "same-value", SetOptions::default()).unwrap();
        let first = vault.index.read().unwrap().get("a").unwrap().iv.clone();
        vault.set("a", "same-value", SetOptions::default()).unwrap();
        let second = vault.index.read().unwrap().get("a").unwrap().iv.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn gitignore_gains_secrets_entry_once() {
        let dir = tempfile::tempdir().unwrap();
        ensure_gitignored(dir.path()).unwrap();
        ensure_gitignored(dir.path()).unwrap();
        let content = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content.matches(".secrets/").count(), 1);
    }
}
