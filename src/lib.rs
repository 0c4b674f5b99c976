//! Data acquisition for chromatic confocal distance sensors.
//!
//! The crate talks to the sensor through a [`driver::DeviceLibrary`], decodes
//! the binary sample stream against the device's current output signal
//! catalog, and runs the workers an operator application needs on top of it:
//! a paced acquisition loop, plot consumers, an encoder-triggered raster scan
//! and a trigger-loss verifier. [`session::Session`] ties them together for
//! one connection. [`sim::SimulatedSensor`] stands in for hardware.

pub mod acquisition;
pub mod config;
pub mod consumer;
pub mod decoder;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod link;
pub mod pacing;
pub mod protocol;
pub mod scan;
pub mod session;
pub mod signal;
pub mod sim;
pub mod trigger_loss;

pub use error::{AppResult, DaqError};
