use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed for '{0}'")]
    Decrypt(String),

    #[error("malformed key file: expected 32 bytes, found {0}")]
    BadKeyFile(usize),

    #[error("malformed record '{0}': {1}")]
    BadRecord(String, String),
}

pub type Result<T> = std::result::Result<T, VaultError>;
