//! Error definitions for the transaction engine

use thiserror::Error;

/// Why a transaction or raw read did not succeed
#[derive(Debug, Error)]
pub enum AtError {
    /// The expected token (and OK, when required) did not arrive before the deadline
    #[error("Timeout waiting for {expected:?} after {command:?}")]
    Timeout { command: String, expected: String },

    /// The modem answered with an ERROR line
    #[error("Modem error for {command:?}: {line}")]
    Modem { command: String, line: String },

    /// A disconnect indication arrived while the transaction asked to abort on it
    #[error("Disconnect indication during {command:?}: {line}")]
    Disconnected { command: String, line: String },

    /// A raw block announced more bytes than the caller's buffer holds
    #[error("Block of {announced} bytes exceeds buffer of {capacity}")]
    BlockTooLarge { announced: usize, capacity: usize },

    /// Serial transport failure
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),
}
