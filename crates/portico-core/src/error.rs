use thiserror::Error;

/// Errors produced by the portico tunnel layer.
#[derive(Debug, Error)]
pub enum PorticoError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection not available")]
    NotAvailable,

    #[error("message expired before delivery")]
    Expired,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for PorticoError {
    fn from(e: serde_json::Error) -> Self {
        PorticoError::Codec(e.to_string())
    }
}

pub type PorticoResult<T> = Result<T, PorticoError>;
