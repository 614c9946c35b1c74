use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Missing field in frame: {0}")]
    MissingField(&'static str),

    #[error("Unsupported frame type: {0}")]
    UnsupportedFrame(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::SerializationError(err.to_string())
    }
}
