//! Error types for Mixframe

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum MfError {
    #[error("Audio error: {0}")]
    Audio(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Buffer overrun")]
    BufferOverrun,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias
pub type MfResult<T> = Result<T, MfError>;
