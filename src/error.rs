use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("storage error: {0}")]
    Storage(#[from] fjall::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other: {0}")]
    Other(String),
}

impl AggregatorError {
    /// Errors a caller should log and continue past rather than tear down the process for.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AggregatorError::Storage(_) | AggregatorError::WebSocket(_) | AggregatorError::Json(_)
        )
    }
}
