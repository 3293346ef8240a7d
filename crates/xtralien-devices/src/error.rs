/*!
 * Error types for instrument communication.
 */
use std::io::ErrorKind;
use std::num::{ParseFloatError, ParseIntError};

use thiserror::Error;

use xtralien_core::error::Error as CoreError;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The device has no active transport to send through
    #[error("No transport available")]
    NoTransport,

    /// The transport was already closed
    #[error("Transport closed")]
    TransportClosed,

    /// The peer went away mid-conversation
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// I/O error from the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// A response did not match the requested format
    #[error("Parse error: {0}")]
    Parse(String),

    /// Protocol-level error (bad encoding, unexpected reply)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Unknown response format name
    #[error("Unknown response format: {0}")]
    UnknownFormat(String),

    /// An asynchronous command was cancelled before it ran
    #[error("Command cancelled")]
    Cancelled,

    /// An asynchronous command panicked or was aborted while running
    #[error("Command task failed: {0}")]
    TaskFailed(String),

    /// Nothing found (no serial port, no instrument answering discovery)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Core error
    #[error("Core error: {0}")]
    CoreError(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new parse error
    pub fn parse<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Parse(msg.as_ref().to_string())
    }

    /// Create a new connection lost error
    pub fn connection_lost<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::ConnectionLost(msg.as_ref().to_string())
    }

    /// Create a new protocol error
    pub fn protocol<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::ProtocolError(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Timeout(msg.as_ref().to_string())
    }

    /// Whether this error means the transport it came from is unusable.
    ///
    /// The dispatch pipeline closes and discards a transport that fails with
    /// one of these.
    pub fn is_connection_error(&self) -> bool {
        match self {
            DeviceError::ConnectionLost(_) | DeviceError::TransportClosed => true,
            DeviceError::Io(e) => is_connection_kind(e.kind()),
            _ => false,
        }
    }
}

pub(crate) fn is_connection_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

impl From<ParseFloatError> for DeviceError {
    fn from(err: ParseFloatError) -> Self {
        DeviceError::Parse(err.to_string())
    }
}

impl From<ParseIntError> for DeviceError {
    fn from(err: ParseIntError) -> Self {
        DeviceError::Parse(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for DeviceError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        DeviceError::ProtocolError(format!("response is not valid UTF-8: {}", err))
    }
}

impl From<tokio::task::JoinError> for DeviceError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            DeviceError::Cancelled
        } else {
            DeviceError::TaskFailed(err.to_string())
        }
    }
}

#[cfg(feature = "serial")]
impl From<tokio_serial::Error> for DeviceError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind() {
            tokio_serial::ErrorKind::Io(kind) => {
                DeviceError::Io(std::io::Error::new(kind, err.description))
            }
            tokio_serial::ErrorKind::NoDevice => DeviceError::NotFound(err.description),
            _ => DeviceError::Serial(err.description),
        }
    }
}
