//! Error types for pairlink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Text is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Channel not open: {0}")]
    ChannelClosed(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Assembly failed: {0}")]
    Assembly(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;
