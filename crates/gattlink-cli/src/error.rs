//! Error handling for the gattlink CLI

use thiserror::Error;

/// CLI-specific error types
#[derive(Error, Debug)]
pub enum CliError {
    #[error("BLE link error: {0}")]
    Link(#[from] gattlink_core::LinkError),

    #[error("Settings error: {0}")]
    Store(#[from] gattlink_core::StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No service UUID given; pass --service or set cli.default_service")]
    MissingService,

    #[error("Timed out after {secs}s waiting for {what}")]
    Timeout { what: &'static str, secs: u64 },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("Hex decoding error: {0}")]
    HexDecoding(#[from] hex::FromHexError),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::Config(err.to_string())
    }
}
