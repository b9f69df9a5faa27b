use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Adapter bridge error: {0}")]
    Bridge(String),

    #[error("Action delivery failed: {0}")]
    ActionDelivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Alert delivery failed: {0}")]
    Alert(String),
}

pub type Result<T> = std::result::Result<T, WatchError>;
