use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    ConnectFailure(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("sample buffer saturated: {requested} bytes offered, {free} bytes free")]
    BufferSaturated { requested: usize, free: usize },

    #[error("WebSocket error: {0}")]
    Ws(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Message(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
