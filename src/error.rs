use std::io;
use thiserror::Error;

/// Unified error type for the forwarding proxy
#[derive(Error, Debug)]
pub enum ForwardError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol parse error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Feature present on the wire but not handled
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Outbound connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Worker pool lifecycle error
    #[error("Pool error: {0}")]
    Pool(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ForwardError>;
