//! The control loop context.
//!
//! [`ControlContext`] owns every piece of mutable control state: the
//! configuration snapshot, the threshold engine, the output arbitrator and the
//! voltage source resolver. The runtime calls [`ControlContext::tick`]
//! periodically and the discovery methods on topology changes; each call
//! borrows the bus and GPIO driver for its duration only.

use crate::arbiter::{ApplyOutcome, FunctionClassifier, OutputArbiter, PatternClassifier};
use crate::config::{ConfigError, ConfigStorage, PlatformConfig, SimulatorConfig};
use crate::engine::{Decision, PendingDirection, ThresholdEngine, Thresholds};
use crate::gpio::GpioDriver;
use crate::model::{BusValue, IgnitionPull, OutputTarget, ResolvedVoltageSource, SourceState};
use crate::resolver::{ResolveError, VoltageSourceResolver};
use crate::status::{
    DelayStatus, ForceModeStatus, IgnitionStatus, RelayStatus, SimulatorStatus, VoltageSourceStatus,
};
use crate::store::{BusClient, BusError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Errors raised while building a [`ControlContext`].
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("invalid MOSFET name pattern: {0}")]
    Classifier(#[from] regex::Error),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// What happened to an externally changed setting.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingOutcome {
    /// Staged for the next tick; `changed` is false when the value was already current
    Staged { changed: bool },
    /// A resolver-owned key; the resolved value was written back
    Reasserted,
    Rejected(ConfigError),
}

/// Summary of one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub voltage: Option<f64>,
    pub output: bool,
    pub changed: bool,
    pub target: OutputTarget,
    pub asserted: Option<bool>,
    pub failures: usize,
}

pub struct ControlContext {
    platform: PlatformConfig,
    config: SimulatorConfig,
    staged: Option<SimulatorConfig>,
    engine: ThresholdEngine,
    arbiter: OutputArbiter,
    resolver: VoltageSourceResolver,
    running: bool,
    manual_voltage: Option<f64>,
    last_voltage: Option<f64>,
    ignition_input: Option<(u32, IgnitionPull)>,
    ignition_state: bool,
    last_decision: Option<Decision>,
    last_outcome: ApplyOutcome,
    last_relay_count: Option<usize>,
}

impl ControlContext {
    pub fn new(platform: PlatformConfig, config: SimulatorConfig) -> Result<Self, ControlError> {
        let classifier = PatternClassifier::from_platform(&platform)?;
        Self::with_classifier(platform, config, Box::new(classifier))
    }

    /// Build with a custom MOSFET classifier.
    pub fn with_classifier(
        platform: PlatformConfig,
        config: SimulatorConfig,
        classifier: Box<dyn FunctionClassifier>,
    ) -> Result<Self, ControlError> {
        let config = config.clamped();
        let mut arbiter = OutputArbiter::new(&platform, classifier);
        arbiter.on_config_changed(&config);
        let resolver = VoltageSourceResolver::new(&platform)?;

        Ok(Self {
            platform,
            config,
            staged: None,
            engine: ThresholdEngine::new(),
            arbiter,
            resolver,
            running: true,
            manual_voltage: None,
            last_voltage: None,
            ignition_input: None,
            ignition_state: false,
            last_decision: None,
            last_outcome: ApplyOutcome::default(),
            last_relay_count: None,
        })
    }

    pub fn platform(&self) -> &PlatformConfig {
        &self.platform
    }

    /// The configuration in effect. Staged changes are not visible yet.
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Staged configuration if any, otherwise the one in effect.
    pub fn pending_config(&self) -> &SimulatorConfig {
        self.staged.as_ref().unwrap_or(&self.config)
    }

    pub fn arbiter(&self) -> &OutputArbiter {
        &self.arbiter
    }

    pub fn resolver(&self) -> &VoltageSourceResolver {
        &self.resolver
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        if !self.running {
            info!("Simulation started");
        }
        self.running = true;
    }

    /// Stop simulating. The output is driven off on the next tick.
    pub fn stop(&mut self) {
        if self.running {
            info!("Simulation stopped");
        }
        self.running = false;
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Stage a full snapshot; it takes effect at the start of the next tick.
    pub fn stage_config(&mut self, config: SimulatorConfig) {
        self.staged = Some(config.clamped());
    }

    /// Handle a setting changed in the settings store.
    ///
    /// Resolver-owned keys are never taken over: once a source is resolved,
    /// its value is written back to the store.
    pub fn on_setting_changed(
        &mut self,
        key: &str,
        value: &BusValue,
        storage: &dyn ConfigStorage,
    ) -> SettingOutcome {
        if SimulatorConfig::is_resolved_key(key) {
            if let Some(resolved) = self.resolved_setting(key) {
                if &resolved != value {
                    info!("Re-asserting resolved {} = {}", key, resolved);
                    if let Err(e) = storage.save_value(key, &resolved) {
                        warn!("Re-asserting {} failed: {}", key, e);
                    }
                }
            }
            return SettingOutcome::Reasserted;
        }

        let mut next = self.pending_config().clone();
        match next.apply_setting(key, value) {
            Ok(changed) => {
                if changed {
                    debug!("Setting {} changed to {}", key, value);
                    self.staged = Some(next);
                }
                SettingOutcome::Staged { changed }
            }
            Err(e) => {
                warn!("Rejected setting {}: {}", key, e);
                SettingOutcome::Rejected(e)
            }
        }
    }

    /// Apply a batch of operator edits, persist them and stage the result.
    ///
    /// Returns the per-key errors; valid keys are applied regardless.
    pub fn update_settings(
        &mut self,
        settings: &BTreeMap<String, BusValue>,
        storage: &dyn ConfigStorage,
    ) -> Vec<ConfigError> {
        let mut next = self.pending_config().clone();
        let mut errors = Vec::new();

        for (key, value) in settings {
            if SimulatorConfig::is_resolved_key(key) {
                debug!("Ignoring edit of resolver-owned {}", key);
                continue;
            }
            match next.apply_setting(key, value) {
                Ok(false) => {}
                Ok(true) => {
                    if let Some(stored) = next.setting_value(key) {
                        if let Err(e) = storage.save_value(key, &stored) {
                            warn!("Persisting {} failed: {}", key, e);
                            errors.push(e);
                        }
                    }
                }
                Err(e) => errors.push(e),
            }
        }

        self.staged = Some(next);
        errors
    }

    fn resolved_setting(&self, key: &str) -> Option<BusValue> {
        let source = self.resolver.source();
        let bus = source.bus?;
        if source.is_empty() {
            return None;
        }
        match key {
            "busName" => Some(BusValue::from(bus.as_str())),
            "servicePath" => Some(BusValue::from(source.service.as_str())),
            "voltagePath" => Some(BusValue::from(source.object_path.as_str())),
            _ => None,
        }
    }

    fn sync_resolved_fields(config: &mut SimulatorConfig, source: &ResolvedVoltageSource) {
        if let Some(bus) = source.bus.filter(|_| !source.is_empty()) {
            config.bus_name = bus;
            config.service_path = source.service.clone();
            config.voltage_path = source.object_path.clone();
        }
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    pub fn refresh_relay_catalog(&mut self, bus: &dyn BusClient) -> Result<usize, BusError> {
        let result = self.arbiter.refresh_catalog(bus);
        if let Ok(count) = result {
            self.last_relay_count = Some(count);
        }
        result
    }

    /// Compare the relay count with the last refresh. Returns `true` when
    /// the topology changed and the catalog was refreshed.
    pub fn poll_relay_topology(&mut self, bus: &dyn BusClient) -> bool {
        let count = match self.arbiter.read_relay_count(bus) {
            Ok(count) => Some(count),
            Err(BusError::ServiceUnknown { .. }) | Err(BusError::PathUnknown { .. }) => Some(0),
            Err(e) => {
                debug!("Relay count unavailable: {}", e);
                return false;
            }
        };
        if count == self.last_relay_count {
            return false;
        }
        info!("Relay topology changed: {:?} -> {:?}", self.last_relay_count, count);
        self.last_relay_count = count;
        let _ = self.refresh_relay_catalog(bus);
        true
    }

    /// Discover the starter voltage source and persist the result.
    pub fn resolve_voltage_source(
        &mut self,
        bus: &dyn BusClient,
        storage: &dyn ConfigStorage,
    ) -> Result<ResolvedVoltageSource, ResolveError> {
        let source = self.resolver.resolve_and_persist(bus, storage)?;
        Self::sync_resolved_fields(&mut self.config, &source);
        if let Some(staged) = self.staged.as_mut() {
            Self::sync_resolved_fields(staged, &source);
        }
        Ok(source)
    }

    /// Use an injected voltage instead of the resolved source. `None` clears it.
    pub fn set_manual_voltage(&mut self, voltage: Option<f64>) {
        match voltage {
            Some(v) => debug!("Manual voltage sample {:.3} V", v),
            None if self.manual_voltage.is_some() => info!("Manual voltage cleared"),
            None => {}
        }
        self.manual_voltage = voltage.filter(|v| v.is_finite());
    }

    pub fn manual_voltage(&self) -> Option<f64> {
        self.manual_voltage
    }

    // ========================================================================
    // Tick
    // ========================================================================

    fn read_ignition(&mut self, gpio: &dyn GpioDriver) -> bool {
        if !self.config.use_ignition {
            return false;
        }
        let wanted = (self.config.ignition_gpio, self.config.ignition_pull);
        if self.ignition_input != Some(wanted) {
            if let Some((old_pin, _)) = self.ignition_input.take() {
                if old_pin != wanted.0 {
                    if let Err(e) = gpio.release(old_pin) {
                        warn!("Releasing ignition input {} failed: {}", old_pin, e);
                    }
                }
            }
            if let Err(e) = gpio.configure_input(wanted.0, wanted.1) {
                warn!("Configuring ignition input {} failed: {}", wanted.0, e);
                return false;
            }
            self.ignition_input = Some(wanted);
        }
        match gpio.read(wanted.0) {
            Ok(level) => level,
            Err(e) => {
                warn!("Reading ignition input {} failed: {}", wanted.0, e);
                false
            }
        }
    }

    /// One control cycle: sample, decide, arbitrate, write.
    pub fn tick(&mut self, bus: &dyn BusClient, gpio: &dyn GpioDriver, now: Instant) -> TickReport {
        if let Some(mut staged) = self.staged.take() {
            Self::sync_resolved_fields(&mut staged, self.resolver.source());
            if staged != self.config {
                debug!("Applying staged configuration");
            }
            self.config = staged;
            self.arbiter.on_config_changed(&self.config);
        }

        let voltage = match self.manual_voltage {
            Some(v) => Some(v),
            None => self.resolver.sample(bus),
        };
        self.last_voltage = voltage;
        self.ignition_state = self.read_ignition(gpio);

        let desired = if self.running {
            let decision = self.engine.evaluate(voltage, self.ignition_state, &self.config, now);
            let output = decision.output;
            self.last_decision = Some(decision);
            output
        } else {
            self.engine.reset();
            self.last_decision = None;
            false
        };

        let previous = self.last_outcome.asserted;
        let outcome = self.arbiter.apply_decision(desired, bus, gpio);
        let report = TickReport {
            voltage,
            output: desired,
            changed: outcome.asserted != previous,
            target: outcome.target.clone(),
            asserted: outcome.asserted,
            failures: outcome.failures.len(),
        };
        self.last_outcome = outcome;
        report
    }

    /// Drive the output off and hand back every claimed relay.
    pub fn shutdown(&mut self, bus: &dyn BusClient, gpio: &dyn GpioDriver) -> Vec<String> {
        self.running = false;
        self.engine.reset();
        self.last_decision = None;
        if let Some((pin, _)) = self.ignition_input.take() {
            if let Err(e) = gpio.release(pin) {
                warn!("Releasing ignition input {} failed: {}", pin, e);
            }
        }
        let failures = self.arbiter.shutdown(bus, gpio);
        self.last_outcome = ApplyOutcome::default();
        failures
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn status(&self) -> SimulatorStatus {
        let config = &self.config;
        let thresholds = self
            .last_decision
            .as_ref()
            .map(|d| d.thresholds)
            .unwrap_or_else(|| Thresholds::from_config(config));
        let now = Utc::now();

        let delays = match &self.last_decision {
            Some(d) => {
                let remaining = match d.pending_direction {
                    PendingDirection::On => Some(d.on_delay_remaining),
                    PendingDirection::Off => Some(d.off_delay_remaining),
                    PendingDirection::None => None,
                };
                DelayStatus {
                    state: d.state.name().to_string(),
                    pending_direction: d.pending_direction,
                    on_remaining_seconds: d.on_delay_remaining.as_secs_f64(),
                    off_remaining_seconds: d.off_delay_remaining.as_secs_f64(),
                    deadline: remaining
                        .and_then(|r| chrono::Duration::from_std(r).ok())
                        .map(|r| now + r),
                }
            }
            None => DelayStatus {
                state: self.engine.state().name().to_string(),
                ..Default::default()
            },
        };

        let source = self.resolver.source();
        let voltage_source = if self.manual_voltage.is_some() {
            VoltageSourceStatus {
                state: SourceState::Manual,
                message: String::new(),
                description: "manual".to_string(),
                bus: None,
                service: String::new(),
                path: String::new(),
                available: true,
                failures: 0,
                last_error: None,
                last_update: Some(now),
            }
        } else {
            VoltageSourceStatus {
                state: self.resolver.state(),
                message: self.resolver.message().to_string(),
                description: self.resolver.description().to_string(),
                bus: source.bus,
                service: source.service.clone(),
                path: source.object_path.clone(),
                available: source.is_live,
                failures: self.resolver.failures(),
                last_error: self.resolver.last_error().map(String::from),
                last_update: self.resolver.last_update(),
            }
        };

        let decision = self.last_decision.as_ref();
        SimulatorStatus {
            running: self.running,
            voltage: self.last_voltage,
            output: decision.map(|d| d.output).unwrap_or(false),
            output_asserted: self.arbiter.asserted(),
            output_mode: config.output_mode,
            output_target: self.arbiter.target().clone(),
            relay_channel: config.relay_channel.clone(),
            gpio_pin: config.gpio_pin,
            effective_on_voltage: thresholds.on_voltage,
            effective_off_voltage: thresholds.off_voltage,
            target_voltage: config.target_voltage,
            hysteresis: config.hysteresis,
            on_delay_seconds: config.on_delay_seconds,
            off_delay_seconds: config.off_delay_seconds,
            ignition: IgnitionStatus {
                enabled: config.use_ignition,
                state: self.ignition_state,
                gpio: config.ignition_gpio,
                pull_mode: config.ignition_pull.as_str().to_string(),
            },
            allow_on: decision.map(|d| d.allow_on).unwrap_or(false),
            off_required: decision.map(|d| d.off_required).unwrap_or(true),
            conditions_on: decision.map(|d| d.conditions_on.clone()).unwrap_or_default(),
            conditions_off: decision.map(|d| d.conditions_off.clone()).unwrap_or_default(),
            force_mode: ForceModeStatus {
                configured_on: config.force_on,
                configured_off: config.force_off,
                active_on: decision.map(|d| d.force_on_active).unwrap_or(false),
                active_off: decision.map(|d| d.force_off_active).unwrap_or(false),
            },
            delays,
            voltage_source,
            relays: RelayStatus {
                catalog_ready: self.arbiter.catalog_ready(),
                selector_ready: self.arbiter.selector_ready(),
                channels: self.arbiter.catalog().to_vec(),
                reservations: self.arbiter.reservations(),
                failed_restores: self.arbiter.failed_restores(),
                mosfet_channel: self.arbiter.mosfet_entry().map(|e| e.channel.clone()),
            },
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStorage;
    use crate::gpio::{GpioError, PinMode, SimulatedGpio};
    use crate::model::{BusKind, OutputMode};
    use crate::store::MemoryBus;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const SYSTEM: &str = "com.victronenergy.system";

    fn context(config: SimulatorConfig) -> ControlContext {
        ControlContext::new(PlatformConfig::default(), config).unwrap()
    }

    fn starter_bus(voltage: f64) -> MemoryBus {
        let bus = MemoryBus::new();
        bus.set_property(BusKind::System, SYSTEM, "/Dc/1/Voltage", voltage);
        bus.set_property(BusKind::System, SYSTEM, "/Relays/Count", 0i64);
        bus
    }

    fn thresholds_config() -> SimulatorConfig {
        SimulatorConfig {
            on_voltage: Some(12.6),
            off_voltage: Some(12.2),
            on_delay_seconds: 2.0,
            off_delay_seconds: 5.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_tick_drives_gpio_after_delay() {
        let bus = starter_bus(12.7);
        let gpio = SimulatedGpio::new();
        let storage = MemoryConfigStorage::new();
        let mut ctx = context(thresholds_config());
        ctx.refresh_relay_catalog(&bus).unwrap();
        ctx.resolve_voltage_source(&bus, &storage).unwrap();

        let t0 = Instant::now();
        let report = ctx.tick(&bus, &gpio, t0);
        assert_eq!(report.voltage, Some(12.7));
        assert!(!report.output);
        assert_eq!(gpio.level(17), Some(false));

        let report = ctx.tick(&bus, &gpio, t0 + Duration::from_millis(2100));
        assert!(report.output);
        assert_eq!(report.asserted, Some(true));
        assert_eq!(gpio.level(17), Some(true));
    }

    #[test]
    fn test_no_source_keeps_output_off_with_force_on() {
        let bus = MemoryBus::new();
        bus.add_service(BusKind::System, "com.victronenergy.settings");
        let gpio = SimulatedGpio::new();
        let storage = MemoryConfigStorage::new();
        let mut ctx = context(SimulatorConfig {
            force_on: true,
            ..Default::default()
        });
        let _ = ctx.refresh_relay_catalog(&bus);
        assert!(ctx.resolve_voltage_source(&bus, &storage).is_err());

        let t0 = Instant::now();
        for step in 0..10 {
            let report = ctx.tick(&bus, &gpio, t0 + Duration::from_secs(step));
            assert!(!report.output);
        }
        let status = ctx.status();
        assert_eq!(status.voltage_source.state, SourceState::ScanFailed);
        assert!(status.force_mode.configured_on);
        assert!(!status.force_mode.active_on);
        assert_eq!(gpio.level(17), Some(false));
    }

    #[test]
    fn test_staged_config_applies_on_next_tick() {
        let bus = starter_bus(12.0);
        let gpio = SimulatedGpio::new();
        let storage = MemoryConfigStorage::new();
        let mut ctx = context(thresholds_config());
        ctx.refresh_relay_catalog(&bus).unwrap();
        ctx.resolve_voltage_source(&bus, &storage).unwrap();

        let outcome = ctx.on_setting_changed("forceOn", &BusValue::Bool(true), &storage);
        assert_eq!(outcome, SettingOutcome::Staged { changed: true });
        assert!(!ctx.config().force_on);

        let report = ctx.tick(&bus, &gpio, Instant::now());
        assert!(ctx.config().force_on);
        assert!(report.output);
    }

    #[test]
    fn test_resolved_fields_are_reasserted() {
        let bus = starter_bus(12.5);
        let storage = MemoryConfigStorage::new();
        let mut ctx = context(SimulatorConfig::default());
        ctx.resolve_voltage_source(&bus, &storage).unwrap();
        assert_eq!(ctx.config().service_path, SYSTEM);

        storage.save_value("servicePath", &"com.example.other".into()).unwrap();
        let outcome = ctx.on_setting_changed("servicePath", &"com.example.other".into(), &storage);
        assert_eq!(outcome, SettingOutcome::Reasserted);
        assert_eq!(storage.load_value("servicePath").unwrap(), BusValue::from(SYSTEM));
        assert_eq!(ctx.config().service_path, SYSTEM);
    }

    #[test]
    fn test_update_settings_persists_and_reports_errors() {
        let storage = MemoryConfigStorage::new();
        let mut ctx = context(SimulatorConfig::default());
        let settings = BTreeMap::from([
            ("gpioPin".to_string(), BusValue::Int(22)),
            ("forceOn".to_string(), BusValue::from("sometimes")),
            ("voltagePath".to_string(), BusValue::from("/Dc/9/Voltage")),
        ]);

        let errors = ctx.update_settings(&settings, &storage);
        assert_eq!(errors.len(), 1);
        assert_eq!(storage.load_value("gpioPin").unwrap(), BusValue::Int(22));
        assert!(!storage.has_key("voltagePath"));
        assert_eq!(ctx.pending_config().gpio_pin, 22);
    }

    #[test]
    fn test_huge_delay_setting_ticks_without_panic() {
        let bus = starter_bus(12.7);
        let gpio = SimulatedGpio::new();
        let storage = MemoryConfigStorage::new();
        let mut ctx = context(thresholds_config());
        ctx.refresh_relay_catalog(&bus).unwrap();
        ctx.resolve_voltage_source(&bus, &storage).unwrap();

        let settings = BTreeMap::from([
            ("onDelaySeconds".to_string(), BusValue::Double(1e20)),
            ("statusPublishIntervalSeconds".to_string(), BusValue::Double(1e20)),
        ]);
        assert!(ctx.update_settings(&settings, &storage).is_empty());

        let t0 = Instant::now();
        let report = ctx.tick(&bus, &gpio, t0);
        assert!(!report.output);
        let report = ctx.tick(&bus, &gpio, t0 + Duration::from_secs(3600));
        assert!(!report.output);
        assert_eq!(ctx.config().on_delay_seconds, crate::config::MAX_INTERVAL_SECONDS);
        assert_eq!(ctx.status().delays.state, "pending-on");
    }

    #[test]
    fn test_manual_voltage_overrides_source() {
        let bus = MemoryBus::new();
        let gpio = SimulatedGpio::new();
        let mut ctx = context(SimulatorConfig {
            force_on: true,
            ..Default::default()
        });
        let _ = ctx.refresh_relay_catalog(&bus);

        let t0 = Instant::now();
        ctx.set_manual_voltage(Some(13.1));
        let report = ctx.tick(&bus, &gpio, t0);
        assert!(report.output);
        let status = ctx.status();
        assert_eq!(status.voltage_source.state, SourceState::Manual);
        assert_eq!(status.voltage, Some(13.1));

        // Losing the sample releases force-on through the off delay
        ctx.set_manual_voltage(None);
        assert!(ctx.tick(&bus, &gpio, t0 + Duration::from_secs(1)).output);
        assert!(!ctx.tick(&bus, &gpio, t0 + Duration::from_secs(7)).output);
    }

    #[test]
    fn test_stop_drives_output_off() {
        let bus = starter_bus(13.0);
        let gpio = SimulatedGpio::new();
        let mut ctx = context(SimulatorConfig {
            force_on: true,
            ..Default::default()
        });
        ctx.refresh_relay_catalog(&bus).unwrap();
        ctx.resolve_voltage_source(&bus, &MemoryConfigStorage::new()).unwrap();
        assert!(ctx.tick(&bus, &gpio, Instant::now()).output);

        ctx.stop();
        let report = ctx.tick(&bus, &gpio, Instant::now());
        assert!(!report.output);
        assert_eq!(gpio.level(17), Some(false));
        assert!(!ctx.status().running);
    }

    #[test]
    fn test_ignition_input_gates_activation() {
        let bus = starter_bus(13.0);
        let gpio = SimulatedGpio::new();
        let mut config = thresholds_config();
        config.use_ignition = true;
        config.on_delay_seconds = 0.2;
        let mut ctx = context(config);
        ctx.refresh_relay_catalog(&bus).unwrap();
        ctx.resolve_voltage_source(&bus, &MemoryConfigStorage::new()).unwrap();

        let t0 = Instant::now();
        ctx.tick(&bus, &gpio, t0);
        assert!(!ctx.tick(&bus, &gpio, t0 + Duration::from_secs(1)).output);
        assert!(!ctx.status().ignition.state);

        gpio.drive_input(4, true);
        ctx.tick(&bus, &gpio, t0 + Duration::from_secs(2));
        assert!(ctx.tick(&bus, &gpio, t0 + Duration::from_secs(3)).output);
        assert!(ctx.status().ignition.state);
    }

    /// Simulated pins whose release always fails.
    struct StickyGpio(SimulatedGpio);

    impl GpioDriver for StickyGpio {
        fn configure_output(&self, pin: u32) -> Result<(), GpioError> {
            self.0.configure_output(pin)
        }

        fn configure_input(&self, pin: u32, pull: IgnitionPull) -> Result<(), GpioError> {
            self.0.configure_input(pin, pull)
        }

        fn write(&self, pin: u32, level: bool) -> Result<(), GpioError> {
            self.0.write(pin, level)
        }

        fn read(&self, pin: u32) -> Result<bool, GpioError> {
            self.0.read(pin)
        }

        fn release(&self, pin: u32) -> Result<(), GpioError> {
            Err(GpioError::Io {
                pin,
                message: "unexport refused".to_string(),
            })
        }
    }

    #[test]
    fn test_ignition_release_failure_is_not_fatal() {
        let bus = starter_bus(13.0);
        let gpio = StickyGpio(SimulatedGpio::new());
        let mut config = thresholds_config();
        config.use_ignition = true;
        let mut ctx = context(config.clone());
        ctx.refresh_relay_catalog(&bus).unwrap();
        ctx.resolve_voltage_source(&bus, &MemoryConfigStorage::new()).unwrap();

        let t0 = Instant::now();
        ctx.tick(&bus, &gpio, t0);
        assert!(matches!(gpio.0.mode(4), Some(PinMode::Input(_))));

        config.ignition_gpio = 5;
        ctx.stage_config(config);
        ctx.tick(&bus, &gpio, t0 + Duration::from_secs(1));
        assert!(matches!(gpio.0.mode(5), Some(PinMode::Input(_))));

        let failures = ctx.shutdown(&bus, &gpio);
        assert!(failures.is_empty());
        assert_eq!(gpio.0.level(17), Some(false));
    }

    #[test]
    fn test_topology_poll_refreshes_catalog() {
        let bus = starter_bus(12.5);
        let mut ctx = context(SimulatorConfig {
            output_mode: OutputMode::Relay,
            relay_channel: "0".to_string(),
            ..Default::default()
        });
        assert!(ctx.poll_relay_topology(&bus));
        assert!(!ctx.poll_relay_topology(&bus));

        bus.set_property(BusKind::System, SYSTEM, "/Relays/Count", 1i64);
        bus.set_property(BusKind::System, SYSTEM, "/Relays/0/Function", "alarm");
        bus.set_property(BusKind::System, SYSTEM, "/Relays/0/State", 0i64);
        assert!(ctx.poll_relay_topology(&bus));
        assert_eq!(ctx.arbiter().catalog().len(), 1);
    }

    #[test]
    fn test_status_reports_pending_delay() {
        let bus = starter_bus(12.7);
        let gpio = SimulatedGpio::new();
        let mut ctx = context(thresholds_config());
        ctx.refresh_relay_catalog(&bus).unwrap();
        ctx.resolve_voltage_source(&bus, &MemoryConfigStorage::new()).unwrap();

        ctx.tick(&bus, &gpio, Instant::now());
        let status = ctx.status();
        assert_eq!(status.delays.state, "pending-on");
        assert_eq!(status.delays.pending_direction, PendingDirection::On);
        assert!(status.delays.deadline.is_some());
        assert!(status.allow_on);
        assert_eq!(status.effective_on_voltage, 12.6);
        assert_eq!(status.output_target, OutputTarget::Gpio);
    }
}
