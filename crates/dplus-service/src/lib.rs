//! # dplus-service
//!
//! tokio runtime for the D+ simulator.
//!
//! [`SimulatorService`] owns the control core and drives it from a single
//! event loop; clients talk to it through a [`ServiceHandle`]. The crate also
//! carries the Linux sysfs GPIO driver and the debug waveform generator.

pub mod debug;
pub mod error;
pub mod gpio;
pub mod service;

pub use debug::{spawn_waveform, DebugGate, Waveform, DEVELOPMENT_ENV};
pub use error::ServiceError;
pub use gpio::SysfsGpio;
pub use service::{ServiceConfig, ServiceEvent, ServiceHandle, SimulatorService};
