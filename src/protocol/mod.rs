//! Logical command framing for the sensor protocol.
//!
//! - [`ids`]: command ids, signal ids and the numeric enumerations the device
//!   firmware and the native library agree on.
//! - [`command`]: building commands from ids or console text, typed arguments
//!   and their wire encoding.
//! - [`response`]: response headers, result-code severity and argument decoding.
//!
//! The physical wire encoding below these types belongs to the driver behind
//! [`crate::driver::DriverHandle`].

pub mod command;
pub mod ids;
pub mod response;

pub use command::{Arg, Command, CommandId, WireArg};
pub use response::{
    ParamType, RawParam, RawResponse, Response, ResponseArg, ResponseFlags, ResultCode, Severity,
};

/// Correlation id the library assigns to a command issued in non-blocking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub u32);

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
