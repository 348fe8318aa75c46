use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{backend} unavailable: {message}")]
    Unavailable { backend: &'static str, message: String },
    #[error("{backend} {operation} timed out after {timeout_ms}ms")]
    Timeout { backend: &'static str, operation: &'static str, timeout_ms: u64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("document `{id}` not found in `{collection}`")]
    NotFound { collection: String, id: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        Self::Unavailable { backend: "redis", message: error.to_string() }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Decode(error.to_string())
    }
}
