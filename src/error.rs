//! Error types for the fraction collector.
//!
//! The crate splits its failures along the same seams as its modules:
//!
//! - **`UnitError`**: raised eagerly when a [`UnitNumber`](crate::units::UnitNumber)
//!   is constructed or converted. These are always returned to the caller
//!   synchronously and never coerced into a default value.
//! - **`TransportError`**: raised by a [`LineAdapter`](crate::adapters::LineAdapter)
//!   when the serial link itself misbehaves (port cannot be opened, write
//!   fails, reader closed).
//! - **`SessionError`**: everything the device session can report, from
//!   protocol violations (`HandshakeFailed`, `UnexpectedResponse`) to misuse
//!   of the state machine (`InvalidState`). Transport errors convert into it
//!   via `#[from]`, so adapter calls compose with `?`.
//!
//! `TransportError` and `SessionError` are `Clone`: a failure inside the run
//! loop is both recorded on the session and delivered on the event stream.

use thiserror::Error;

/// Convenience alias for results using the session error type.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Convenience alias for results using the unit error type.
pub type UnitResult<T> = std::result::Result<T, UnitError>;

/// Failures constructing or converting a physical quantity.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UnitError {
    #[error("Value must be a finite number, but got {0}")]
    InvalidQuantity(String),

    #[error("Unit must be one of [{allowed}], but got {unit}")]
    InvalidUnit { unit: String, allowed: String },

    #[error("Unit {unit} is not supported by {family}")]
    UnsupportedUnit { unit: String, family: String },

    #[error("Missing required conversion factor {from}->{to}")]
    IncompleteConversionTable { from: String, to: String },

    #[error("Cannot convert {from} to {to}: units are not interchangeable")]
    IncompatibleUnits { from: String, to: String },
}

/// Failures of the underlying serial link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Serial port is not open")]
    NotOpen,

    #[error("Failed to open serial port '{port}': {reason}")]
    Open { port: String, reason: String },

    #[error("Serial I/O error: {0}")]
    Io(String),

    #[error("Serial reader closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Failures reported by [`DeviceSession`](crate::session::DeviceSession).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("No device connected")]
    NotConnected,

    #[error("Unexpected handshake {received:?}. Expected {expected:?}. Is the Arduino flashed with the correct firmware?")]
    HandshakeFailed { expected: String, received: String },

    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Unexpected response {received:?}. Expected {expected:?}")]
    UnexpectedResponse { expected: String, received: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid command {command:?}: {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        SessionError::InvalidState(message.into())
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        SessionError::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}
