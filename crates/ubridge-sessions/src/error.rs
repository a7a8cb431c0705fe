use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown device: {0}")]
    DeviceUnknown(String),

    #[error("unknown session: {0}")]
    NotFound(String),

    #[error("session {0} has ended")]
    Ended(String),

    #[error("invalid {field}: {message}")]
    InvalidConfig { field: String, message: String },
}

pub type Result<T> = std::result::Result<T, SessionError>;
