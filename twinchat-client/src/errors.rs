use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Chat error: {0}")]
    Chat(#[from] twinchat_core::ChatError),

    #[error("No access token available")]
    MissingAuthToken,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("History fetch failed: {0}")]
    HistoryFetch(String),
}
