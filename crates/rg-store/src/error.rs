use rg_common::{GatewayError, MessageId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Message not found: {id}")]
    NotFound { id: MessageId },

    #[error("Rejected: {message}")]
    Rejected { message: String },

    #[error("Invalid stored data: {message}")]
    InvalidData { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "sql")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "mongo")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[cfg(feature = "mongo")]
    #[error("BSON error: {0}")]
    Bson(#[from] bson::ser::Error),
}

impl StoreError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected { message: message.into() }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData { message: message.into() }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => GatewayError::not_found("Message", id.to_string()),
            StoreError::Rejected { message } => GatewayError::rejected(message),
            other => GatewayError::store("message store failure", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
