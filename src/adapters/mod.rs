//! Line-oriented hardware adapters
//!
//! The device session talks to the fraction collector through a
//! [`LineAdapter`]: a duplex channel that writes whole lines and yields
//! received lines one at a time. Implementations:
//!
//! - [`SerialAdapter`]: the real USB serial link (feature `tokio_serial`)
//! - [`MockAdapter`]: an in-memory scripted device for tests and demos
//!
//! An adapter is owned by exactly one session; nothing in this module is
//! shared process-wide.

pub mod mock_adapter;
#[cfg(feature = "instrument_serial")]
pub mod serial_adapter;

pub use mock_adapter::{MockAdapter, MockHandle};
#[cfg(feature = "tokio_serial")]
pub use serial_adapter::SerialAdapter;

use crate::error::TransportError;
use async_trait::async_trait;

/// Duplex line channel to one device.
///
/// `next_line` must be cancel-safe: the session races it against a timeout
/// and drops it on expiry, and a line that arrives afterwards must still be
/// returned by a later call rather than lost or split.
#[async_trait]
pub trait LineAdapter: Send {
    /// Adapter name for logging.
    fn name(&self) -> &str;

    /// Open the link. Resolves once the port is open.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the link.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Write one line; the adapter appends its line terminator.
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Wait for the next complete received line, without its terminator.
    async fn next_line(&mut self) -> Result<String, TransportError>;

    /// Return a line that is already buffered, without waiting.
    fn try_next_line(&mut self) -> Option<String>;
}
