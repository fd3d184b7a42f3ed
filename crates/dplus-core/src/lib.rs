//! # dplus-core
//!
//! Control core of the D+ alternator-signal simulator.
//!
//! This crate provides:
//! - Bus value model and the [`BusClient`] seam with an in-memory bus
//! - Settings definitions, typed configuration and settings storage
//! - Threshold engine with hysteresis and on/off debounce
//! - Output arbitration between the GPIO line and relay channels
//! - Starter voltage source discovery and validation
//! - Status snapshots for publication
//!
//! This crate is intentionally runtime-agnostic and contains no async code.
//! The service crate drives [`ControlContext`] from its own event loop.

pub mod arbiter;
pub mod config;
pub mod controller;
pub mod engine;
pub mod gpio;
pub mod model;
pub mod path;
pub mod resolver;
pub mod status;
pub mod store;

pub use arbiter::{ApplyOutcome, FunctionClassifier, OutputArbiter, PatternClassifier};
pub use config::{
    BusConfigStorage, ConfigError, ConfigStorage, MemoryConfigStorage, PlatformConfig, SimulatorConfig,
};
pub use controller::{ControlContext, ControlError, SettingOutcome, TickReport};
pub use engine::{Decision, DebounceState, PendingDirection, ThresholdEngine, Thresholds};
pub use gpio::{GpioDriver, GpioError, SimulatedGpio};
pub use model::*;
pub use resolver::{ResolveError, VoltageSourceResolver};
pub use status::SimulatorStatus;
pub use store::{BusClient, BusError, MemoryBus};
