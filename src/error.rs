//! Error types shared by every instrument driver.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to an instrument or interpreting its replies.
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// I/O error on the underlying link.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial port could not be opened or configured.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A read did not complete in time.
    #[error("Timed out after {waited:?} waiting for the instrument")]
    Timeout { waited: Duration },

    /// A resource string could not be understood.
    #[error("Invalid resource '{0}'")]
    InvalidResource(String),

    /// The instrument answered something that does not parse.
    #[error("Invalid reply to '{command}': {reply:?}")]
    InvalidReply { command: String, reply: String },

    /// A binary block has the wrong size.
    #[error("Binary block of {actual} bytes, expected {expected}")]
    BlockLength { expected: usize, actual: usize },

    /// A binary block header is malformed.
    #[error("Invalid binary block header: {0}")]
    BlockHeader(String),

    /// The controller kept answering with error markers.
    #[error("'{command}' still rejected after {attempts} attempts")]
    RetriesExhausted { command: String, attempts: u32 },

    /// A parameter cannot be sent to the instrument.
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: f64 },

    /// The temperature never settled before the timeout.
    #[error("Temperature did not settle at {target} mK within {waited:?}")]
    NotStable { target: f64, waited: Duration },

    /// The operation is not available on this link or instrument.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl InstrumentError {
    /// Create an invalid reply error.
    pub fn invalid_reply(command: impl Into<String>, reply: impl Into<String>) -> Self {
        Self::InvalidReply {
            command: command.into(),
            reply: reply.into(),
        }
    }

    /// True for errors caused by a link timing out.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, InstrumentError>;
