use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("QUIC connection error: {0}")]
    QuicError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid model configuration: {0}")]
    InvalidModelConfig(String),

    #[error("Model already exists: {0}")]
    ModelExists(String),

    #[error("Producer spawn failure: {0}")]
    ProducerSpawnFailure(String),

    #[error("Call timed out after {0:?}")]
    CallTimeout(Duration),

    #[error("Client not found: {0}")]
    ClientNotFound(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Bincode error: {0}")]
    BincodeError(String),
}

impl From<bincode::Error> for RelayError {
    fn from(err: bincode::Error) -> Self {
        RelayError::BincodeError(err.to_string())
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::StoreError(err.to_string())
    }
}

impl From<toml::ser::Error> for RelayError {
    fn from(err: toml::ser::Error) -> Self {
        RelayError::StoreError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
