use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture session already exists: {0}")]
    AlreadyExists(String),

    #[error("unknown capture session: {0}")]
    NotFound(String),

    #[error("capture session {0} has ended")]
    Ended(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
