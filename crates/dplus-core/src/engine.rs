//! Threshold, hysteresis and delay engine.
//!
//! Turns a starter voltage sample into a debounced on/off decision:
//! - A Schmitt trigger on the voltage alone (on at or above the effective
//!   on-threshold, off at or below the off-threshold, unchanged between)
//! - Source and ignition gates applied on top of the trigger
//! - Force overrides that bypass the delays
//! - A four-state debounce with separate on and off delays
//!
//! Time is passed in by the caller; the engine never reads a clock.

use crate::config::{clamp_interval, SimulatorConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Effective activation and deactivation thresholds, in volts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub on_voltage: f64,
    pub off_voltage: f64,
}

impl Thresholds {
    /// Explicit thresholds win when both are set and ordered; otherwise the
    /// legacy symmetric band around the target voltage is used.
    pub fn from_config(config: &SimulatorConfig) -> Self {
        match (config.on_voltage, config.off_voltage) {
            (Some(on), Some(off)) if on >= off => Self {
                on_voltage: on,
                off_voltage: off,
            },
            _ => {
                let half = config.hysteresis.max(0.0) / 2.0;
                Self {
                    on_voltage: config.target_voltage + half,
                    off_voltage: config.target_voltage - half,
                }
            }
        }
    }
}

/// Debounce state of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    StableOff,
    PendingOn { since: Instant },
    StableOn,
    PendingOff { since: Instant },
}

impl DebounceState {
    pub fn output(&self) -> bool {
        matches!(self, DebounceState::StableOn | DebounceState::PendingOff { .. })
    }

    pub fn pending_since(&self) -> Option<Instant> {
        match self {
            DebounceState::PendingOn { since } | DebounceState::PendingOff { since } => Some(*since),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DebounceState::StableOff => "stable-off",
            DebounceState::PendingOn { .. } => "pending-on",
            DebounceState::StableOn => "stable-on",
            DebounceState::PendingOff { .. } => "pending-off",
        }
    }
}

/// Direction of a pending transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingDirection {
    #[default]
    None,
    On,
    Off,
}

/// Result of one engine evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Debounced output
    pub output: bool,
    /// Output flipped during this evaluation
    pub changed: bool,
    pub thresholds: Thresholds,
    /// Gated activation condition before debouncing
    pub raw_condition: bool,
    pub state: DebounceState,
    pub pending_direction: PendingDirection,
    /// Remaining delay of a pending transition, zero otherwise
    pub on_delay_remaining: Duration,
    pub off_delay_remaining: Duration,
    pub conditions_on: BTreeMap<String, bool>,
    pub conditions_off: BTreeMap<String, bool>,
    pub allow_on: bool,
    pub off_required: bool,
    pub force_on_active: bool,
    pub force_off_active: bool,
}

/// The debouncing state machine plus its Schmitt trigger memory.
#[derive(Debug, Clone)]
pub struct ThresholdEngine {
    voltage_high: bool,
    state: DebounceState,
}

impl Default for ThresholdEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn delay(seconds: f64) -> Duration {
    Duration::from_secs_f64(clamp_interval(seconds))
}

impl ThresholdEngine {
    pub fn new() -> Self {
        Self {
            voltage_high: false,
            state: DebounceState::StableOff,
        }
    }

    pub fn output(&self) -> bool {
        self.state.output()
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    /// Back to stable off, forgetting the trigger memory.
    pub fn reset(&mut self) {
        self.voltage_high = false;
        self.state = DebounceState::StableOff;
    }

    /// Evaluate one sample.
    ///
    /// `voltage` is `None` when no live sample is available; that forces the
    /// raw condition off and disables a configured force-on.
    pub fn evaluate(
        &mut self,
        voltage: Option<f64>,
        ignition_active: bool,
        config: &SimulatorConfig,
        now: Instant,
    ) -> Decision {
        let thresholds = Thresholds::from_config(config);
        let source_live = voltage.is_some();

        match voltage {
            Some(v) if v >= thresholds.on_voltage => self.voltage_high = true,
            Some(v) if v <= thresholds.off_voltage => self.voltage_high = false,
            Some(_) => {}
            None => self.voltage_high = false,
        }

        let mut conditions_on = BTreeMap::new();
        let mut conditions_off = BTreeMap::new();
        conditions_on.insert("voltage".to_string(), self.voltage_high);
        conditions_off.insert("voltage".to_string(), !self.voltage_high);
        conditions_on.insert("voltageSource".to_string(), source_live);
        conditions_off.insert("voltageSource".to_string(), !source_live);
        if config.use_ignition {
            conditions_on.insert("ignition".to_string(), ignition_active);
            conditions_off.insert("ignition".to_string(), !ignition_active);
        }

        let allow_on = conditions_on.values().all(|c| *c);
        let off_required = conditions_off.values().any(|c| *c);
        let raw_condition = allow_on;

        let force_off_active = config.force_off;
        let force_on_active = config.force_on && !force_off_active && source_live;

        let was_on = self.state.output();
        let on_delay = delay(config.on_delay_seconds);
        let off_delay = delay(config.off_delay_seconds);

        self.state = if force_off_active {
            DebounceState::StableOff
        } else if force_on_active {
            DebounceState::StableOn
        } else {
            match self.state {
                DebounceState::StableOff if raw_condition => DebounceState::PendingOn { since: now },
                DebounceState::StableOff => DebounceState::StableOff,
                DebounceState::PendingOn { .. } if !raw_condition => DebounceState::StableOff,
                DebounceState::PendingOn { since } if now.saturating_duration_since(since) >= on_delay => {
                    DebounceState::StableOn
                }
                pending @ DebounceState::PendingOn { .. } => pending,
                DebounceState::StableOn if !raw_condition => DebounceState::PendingOff { since: now },
                DebounceState::StableOn => DebounceState::StableOn,
                DebounceState::PendingOff { .. } if raw_condition => DebounceState::StableOn,
                DebounceState::PendingOff { since } if now.saturating_duration_since(since) >= off_delay => {
                    DebounceState::StableOff
                }
                pending @ DebounceState::PendingOff { .. } => pending,
            }
        };

        let output = self.state.output();
        let changed = output != was_on;
        if changed {
            info!(
                "D+ output switches {} (voltage {:?}, force on/off {}/{})",
                if output { "on" } else { "off" },
                voltage,
                force_on_active,
                force_off_active
            );
        }

        let (pending_direction, on_delay_remaining, off_delay_remaining) = match self.state {
            DebounceState::PendingOn { since } => (
                PendingDirection::On,
                on_delay.saturating_sub(now.saturating_duration_since(since)),
                Duration::ZERO,
            ),
            DebounceState::PendingOff { since } => (
                PendingDirection::Off,
                Duration::ZERO,
                off_delay.saturating_sub(now.saturating_duration_since(since)),
            ),
            _ => (PendingDirection::None, Duration::ZERO, Duration::ZERO),
        };

        debug!(
            "Engine: voltage={:?} raw={} state={} allow_on={} off_required={}",
            voltage,
            raw_condition,
            self.state.name(),
            allow_on,
            off_required
        );

        Decision {
            output,
            changed,
            thresholds,
            raw_condition,
            state: self.state,
            pending_direction,
            on_delay_remaining,
            off_delay_remaining,
            conditions_on,
            conditions_off,
            allow_on,
            off_required,
            force_on_active,
            force_off_active,
        }
    }
}
