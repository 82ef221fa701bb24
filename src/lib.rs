//! Core library for the Colosseum fraction collector.
//!
//! This library contains the device session that drives the collector over
//! its serial line protocol, the transport adapters it runs on, and the unit
//! arithmetic used to turn flow rate and volume into run parameters. It is
//! used by the `colosseum` command-line binary.

pub mod adapters;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod units;

pub use config::Config;
pub use error::{SessionError, SessionResult, TransportError, UnitError, UnitResult};
pub use protocol::{AngleTable, Command};
pub use session::{DeviceSession, SessionEvent, SessionEvents, SessionSettings, SessionSnapshot};
pub use units::{Quantity, UnitNumber};
