//! Client error types for the Apollo SDK

/// Error type for Apollo client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("response decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("no config server available")]
    NoConfigServerAvailable,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected server status: {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
