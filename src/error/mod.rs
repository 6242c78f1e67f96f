use thiserror::Error;

use crate::protocol::ProtocolError;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Engine channel closed")]
    ChannelClosed,
}

impl From<toml::de::Error> for TransferError {
    fn from(err: toml::de::Error) -> Self {
        TransferError::Config(format!("Failed to parse config: {}", err))
    }
}

impl From<toml::ser::Error> for TransferError {
    fn from(err: toml::ser::Error) -> Self {
        TransferError::Config(format!("Failed to serialize config: {}", err))
    }
}
