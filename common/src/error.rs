use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding failure: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("unknown persisted valve state code {0}")]
    UnknownStateCode(u8),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("database failure: {0}")]
    Database(String),
    #[error("persisted timestamp {0} is out of range")]
    InvalidTimestamp(f64),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("command payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("transport rejected publish: {0}")]
    Transport(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("malformed topic {0}")]
    MalformedTopic(String),
    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),
    #[error("payload is not utf-8")]
    NotUtf8,
    #[error("payload is not a json object with numeric `{field}`: {reason}")]
    InvalidPayload { field: &'static str, reason: String },
    #[error("`{field}` is not a finite number")]
    NotFinite { field: &'static str },
}
