//! GPIO driver abstraction.
//!
//! The arbitrator drives the D+ line and the controller samples the ignition
//! input through [`GpioDriver`]. [`SimulatedGpio`] keeps pin levels in memory
//! and is used for dry runs and tests.

use crate::model::IgnitionPull;
use std::collections::HashMap;
use std::sync::RwLock;

/// Errors returned by GPIO drivers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GpioError {
    #[error("gpio {pin}: {message}")]
    Io { pin: u32, message: String },

    #[error("gpio {0} is not configured")]
    NotConfigured(u32),
}

/// Direction a pin was configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Output,
    Input(IgnitionPull),
}

/// Minimal GPIO driver.
pub trait GpioDriver: Send + Sync {
    fn configure_output(&self, pin: u32) -> Result<(), GpioError>;

    fn configure_input(&self, pin: u32, pull: IgnitionPull) -> Result<(), GpioError>;

    fn write(&self, pin: u32, level: bool) -> Result<(), GpioError>;

    fn read(&self, pin: u32) -> Result<bool, GpioError>;

    /// Give the pin back to the system.
    fn release(&self, pin: u32) -> Result<(), GpioError>;
}

#[derive(Debug, Clone, Copy)]
struct SimulatedPin {
    mode: PinMode,
    level: bool,
}

/// In-memory GPIO.
///
/// Inputs read their externally driven level if one was set with
/// [`SimulatedGpio::drive_input`], otherwise the level implied by the pull.
#[derive(Debug, Default)]
pub struct SimulatedGpio {
    pins: RwLock<HashMap<u32, SimulatedPin>>,
    driven: RwLock<HashMap<u32, bool>>,
    writes: RwLock<Vec<(u32, bool)>>,
}

impl SimulatedGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive an input pin from outside, as the wiring would.
    pub fn drive_input(&self, pin: u32, level: bool) {
        self.driven
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pin, level);
    }

    /// Current level of a pin, `None` if it is not configured.
    pub fn level(&self, pin: u32) -> Option<bool> {
        self.pins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pin)
            .map(|p| p.level)
    }

    pub fn mode(&self, pin: u32) -> Option<PinMode> {
        self.pins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pin)
            .map(|p| p.mode)
    }

    /// Every output write, oldest first.
    pub fn writes(&self) -> Vec<(u32, bool)> {
        self.writes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Pins currently configured as outputs and driven high.
    pub fn asserted_outputs(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self
            .pins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, p)| p.mode == PinMode::Output && p.level)
            .map(|(pin, _)| *pin)
            .collect();
        pins.sort_unstable();
        pins
    }
}

impl GpioDriver for SimulatedGpio {
    fn configure_output(&self, pin: u32) -> Result<(), GpioError> {
        let mut pins = self.pins.write().unwrap_or_else(|e| e.into_inner());
        let level = pins.get(&pin).map(|p| p.level).unwrap_or(false);
        pins.insert(
            pin,
            SimulatedPin {
                mode: PinMode::Output,
                level,
            },
        );
        Ok(())
    }

    fn configure_input(&self, pin: u32, pull: IgnitionPull) -> Result<(), GpioError> {
        self.pins.write().unwrap_or_else(|e| e.into_inner()).insert(
            pin,
            SimulatedPin {
                mode: PinMode::Input(pull),
                level: pull == IgnitionPull::PullUp,
            },
        );
        Ok(())
    }

    fn write(&self, pin: u32, level: bool) -> Result<(), GpioError> {
        let mut pins = self.pins.write().unwrap_or_else(|e| e.into_inner());
        match pins.get_mut(&pin) {
            Some(p) if p.mode == PinMode::Output => p.level = level,
            _ => return Err(GpioError::NotConfigured(pin)),
        }
        self.writes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((pin, level));
        Ok(())
    }

    fn read(&self, pin: u32) -> Result<bool, GpioError> {
        let pins = self.pins.read().unwrap_or_else(|e| e.into_inner());
        let p = pins.get(&pin).ok_or(GpioError::NotConfigured(pin))?;
        if let PinMode::Input(_) = p.mode {
            if let Some(level) = self.driven.read().unwrap_or_else(|e| e.into_inner()).get(&pin) {
                return Ok(*level);
            }
        }
        Ok(p.level)
    }

    fn release(&self, pin: u32) -> Result<(), GpioError> {
        self.pins.write().unwrap_or_else(|e| e.into_inner()).remove(&pin);
        Ok(())
    }
}
