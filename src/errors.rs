use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FeedError>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Watchlist must contain at least one symbol")]
    EmptyWatchlist,

    #[error("Parse int error: {0}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Transport failed to open: {0}")]
    TransportOpen(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Ping failed: {0}")]
    Ping(String),

    #[error("No pong within {0:?}")]
    PingTimeout(Duration),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Server requested disconnect: {0}")]
    ServerDisconnect(String),

    #[error("Session already closed")]
    SessionClosed,

    #[error("Gave up after {0} reconnect attempts")]
    MaxAttemptsExceeded(u32),

    #[error("Socket closed with code {code} (reason: {reason:?})")]
    NonRecoverableClose { code: u16, reason: Option<String> },
}
