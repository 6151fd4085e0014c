use thiserror::Error;

pub type Result<T> = std::result::Result<T, BalanceProcessorError>;

#[derive(Debug, Error)]
pub enum BalanceProcessorError {
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Transaction not found: {0}")]
    TxNotFound(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Balance index error: {0}")]
    BalanceIndex(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

impl From<async_nats::PublishError> for BalanceProcessorError {
    fn from(err: async_nats::PublishError) -> Self {
        BalanceProcessorError::Broker(format!("NATS publish error: {}", err))
    }
}

impl From<reqwest::Error> for BalanceProcessorError {
    fn from(err: reqwest::Error) -> Self {
        BalanceProcessorError::BalanceIndex(err.to_string())
    }
}
