//! Output arbitration between the GPIO line and shared relay channels.
//!
//! The arbitrator owns the single logical D+ output. It decides whether the
//! signal is realized on the GPIO pin or on a relay channel, keeps at most one
//! physical path asserted, and marks the relay it uses with the simulator's
//! function tag so other relay consumers leave it alone.
//!
//! Tagging is restore-based: the tag a channel carried before the simulator
//! claimed it is remembered in the reservation table and written back when the
//! channel is released.

use crate::config::{PlatformConfig, SimulatorConfig};
use crate::gpio::GpioDriver;
use crate::model::{BusKind, BusValue, OutputMode, OutputTarget, RelayCatalogEntry};
use crate::path::{join_object_path, normalize_relay_channel};
use crate::store::{BusClient, BusError};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, error, info, warn};

/// Decides which catalog entry is the GPIO driver (MOSFET) function.
pub trait FunctionClassifier: Send + Sync {
    fn is_gpio_driver(&self, entry: &RelayCatalogEntry) -> bool;
}

/// Default classifier.
///
/// An explicit function path wins; otherwise the label, channel and function
/// path are matched against a name pattern.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    pattern: Regex,
    function_path: Option<String>,
}

impl PatternClassifier {
    pub fn new(pattern: &str, function_path: Option<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            function_path: function_path.filter(|p| !p.is_empty()),
        })
    }

    pub fn from_platform(platform: &PlatformConfig) -> Result<Self, regex::Error> {
        Self::new(
            &platform.mosfet_name_pattern,
            platform.mosfet_function_path.clone(),
        )
    }
}

impl FunctionClassifier for PatternClassifier {
    fn is_gpio_driver(&self, entry: &RelayCatalogEntry) -> bool {
        match &self.function_path {
            Some(path) => entry.function_path == *path,
            None => {
                self.pattern.is_match(&entry.display_label)
                    || self.pattern.is_match(&entry.channel)
                    || self.pattern.is_match(&entry.function_path)
            }
        }
    }
}

/// A physical output that still has to be driven low.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PhysicalOutput {
    Gpio(u32),
    Relay { channel: String, state_path: String },
}

/// What the arbitrator wants to drive, derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Selection {
    mode: OutputMode,
    relay_channel: String,
    gpio_pin: u32,
}

/// Outcome of one [`OutputArbiter::apply_decision`] call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplyOutcome {
    pub target: OutputTarget,
    /// Level known to be on the target, `None` if writes were deferred or failed
    pub asserted: Option<bool>,
    pub failures: Vec<String>,
}

/// Owner of the physical D+ output and the relay reservation table.
pub struct OutputArbiter {
    relay_bus: BusKind,
    relay_service: String,
    relay_root: String,
    own_tag: String,
    neutral_tag: String,
    classifier: Box<dyn FunctionClassifier>,

    catalog: Vec<RelayCatalogEntry>,
    catalog_ready: bool,
    selector_ready: bool,
    selection: Selection,

    target: OutputTarget,
    target_pin: Option<u32>,
    configured_pin: Option<u32>,
    stale_outputs: Vec<PhysicalOutput>,
    asserted: Option<bool>,

    /// channel -> tag observed before the simulator claimed it
    reservations: HashMap<String, String>,
    failed_restores: BTreeSet<String>,
    tags_dirty: bool,
    missing_channel_warned: Option<String>,
}

impl OutputArbiter {
    pub fn new(platform: &PlatformConfig, classifier: Box<dyn FunctionClassifier>) -> Self {
        Self {
            relay_bus: platform.relay_bus,
            relay_service: platform.relay_service.clone(),
            relay_root: platform.relay_root.clone(),
            own_tag: platform.own_function_tag.clone(),
            neutral_tag: platform.neutral_function_tag.clone(),
            classifier,
            catalog: Vec::new(),
            catalog_ready: false,
            selector_ready: false,
            selection: Selection::default(),
            target: OutputTarget::None,
            target_pin: None,
            configured_pin: None,
            stale_outputs: Vec::new(),
            asserted: None,
            reservations: HashMap::new(),
            failed_restores: BTreeSet::new(),
            tags_dirty: false,
            missing_channel_warned: None,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn target(&self) -> &OutputTarget {
        &self.target
    }

    pub fn catalog(&self) -> &[RelayCatalogEntry] {
        &self.catalog
    }

    pub fn catalog_ready(&self) -> bool {
        self.catalog_ready
    }

    pub fn selector_ready(&self) -> bool {
        self.selector_ready
    }

    /// Level last written successfully to the current target.
    pub fn asserted(&self) -> Option<bool> {
        self.asserted
    }

    /// Reservation table snapshot, ordered by channel.
    pub fn reservations(&self) -> BTreeMap<String, String> {
        self.reservations
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Channels whose restore failed and is being retried.
    pub fn failed_restores(&self) -> Vec<String> {
        self.failed_restores.iter().cloned().collect()
    }

    /// Catalog entry detected as the GPIO driver function.
    pub fn mosfet_entry(&self) -> Option<&RelayCatalogEntry> {
        self.catalog.iter().find(|e| self.classifier.is_gpio_driver(e))
    }

    fn entry(&self, channel: &str) -> Option<&RelayCatalogEntry> {
        self.catalog.iter().find(|e| e.channel == channel)
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Number of relays the relay service reports.
    pub fn read_relay_count(&self, bus: &dyn BusClient) -> Result<usize, BusError> {
        let path = join_object_path(&self.relay_root, "Count");
        let value = bus.get_value(self.relay_bus, &self.relay_service, &path)?;
        Ok(value.as_i64().unwrap_or(0).max(0) as usize)
    }

    fn read_text(&self, bus: &dyn BusClient, path: &str) -> Result<Option<String>, BusError> {
        match bus.get_value(self.relay_bus, &self.relay_service, path) {
            Ok(BusValue::Text(s)) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
            Ok(BusValue::Int(i)) => Ok(Some(i.to_string())),
            Ok(_) | Err(BusError::PathUnknown { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn enumerate(&self, bus: &dyn BusClient) -> Result<Vec<RelayCatalogEntry>, BusError> {
        let count = self.read_relay_count(bus)?;
        let mut entries: Vec<RelayCatalogEntry> = Vec::with_capacity(count);

        for index in 0..count {
            let base = join_object_path(&self.relay_root, &index.to_string());
            let channel = self
                .read_text(bus, &join_object_path(&base, "Channel"))?
                .map(|c| normalize_relay_channel(&c))
                .unwrap_or_else(|| index.to_string());
            if entries.iter().any(|e| e.channel == channel) {
                warn!("Duplicate relay channel {} at index {}, ignored", channel, index);
                continue;
            }
            let display_label = self
                .read_text(bus, &join_object_path(&base, "Name"))?
                .unwrap_or_else(|| format!("Relay {}", channel));
            let function_path = self
                .read_text(bus, &join_object_path(&base, "FunctionPath"))?
                .unwrap_or_else(|| join_object_path(&base, "Function"));
            let state_path = self
                .read_text(bus, &join_object_path(&base, "StatePath"))?
                .unwrap_or_else(|| join_object_path(&base, "State"));

            entries.push(RelayCatalogEntry {
                channel,
                display_label,
                function_path,
                state_path,
            });
        }

        Ok(entries)
    }

    /// Re-enumerate the relay catalog.
    ///
    /// A failed refresh keeps the previous catalog. Either way the catalog
    /// counts as ready afterwards.
    pub fn refresh_catalog(&mut self, bus: &dyn BusClient) -> Result<usize, BusError> {
        let result = self.enumerate(bus);
        self.catalog_ready = true;

        let entries = match result {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Relay catalog refresh failed, keeping {} known channels: {}", self.catalog.len(), e);
                return Err(e);
            }
        };

        let known: BTreeSet<&str> = entries.iter().map(|e| e.channel.as_str()).collect();
        let stale: Vec<String> = self
            .reservations
            .keys()
            .filter(|c| !known.contains(c.as_str()))
            .cloned()
            .collect();
        for channel in stale {
            warn!("Relay channel {} disappeared, dropping its reservation", channel);
            self.reservations.remove(&channel);
            self.failed_restores.remove(&channel);
        }
        self.failed_restores.retain(|c| known.contains(c.as_str()));

        if let Some(channel) = self.target.relay_channel() {
            if !known.contains(channel) {
                warn!("Active relay channel {} disappeared from the catalog", channel);
            }
        }

        let count = entries.len();
        if entries != self.catalog {
            info!("Relay catalog refreshed: {} channels", count);
            self.tags_dirty = true;
        }
        self.catalog = entries;
        Ok(count)
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Take over output-related settings. The first call marks the relay
    /// selector as ready.
    pub fn on_config_changed(&mut self, config: &SimulatorConfig) {
        let selection = Selection {
            mode: config.output_mode,
            relay_channel: config.relay_channel.clone(),
            gpio_pin: config.gpio_pin,
        };
        if selection != self.selection || !self.selector_ready {
            debug!(
                "Output selection: mode={} relay={:?} gpio={}",
                selection.mode.as_str(),
                selection.relay_channel,
                selection.gpio_pin
            );
        }
        self.selection = selection;
        self.selector_ready = true;
    }

    fn select_target(&mut self) -> OutputTarget {
        let channel = &self.selection.relay_channel;
        if self.selection.mode == OutputMode::Relay {
            if !channel.is_empty() && self.entry(channel).is_some() {
                self.missing_channel_warned = None;
                return OutputTarget::Relay(channel.clone());
            }
            if self.missing_channel_warned.as_deref() != Some(channel.as_str()) {
                warn!(
                    "Relay channel {:?} not available, falling back to GPIO {}",
                    channel, self.selection.gpio_pin
                );
                self.missing_channel_warned = Some(channel.clone());
            }
        }
        OutputTarget::Gpio
    }

    fn physical(&self, target: &OutputTarget, pin: Option<u32>) -> Option<PhysicalOutput> {
        match target {
            OutputTarget::None => None,
            OutputTarget::Gpio => pin.map(PhysicalOutput::Gpio),
            OutputTarget::Relay(channel) => self.entry(channel).map(|e| PhysicalOutput::Relay {
                channel: channel.clone(),
                state_path: e.state_path.clone(),
            }),
        }
    }

    fn write_physical(
        &mut self,
        output: &PhysicalOutput,
        level: bool,
        bus: &dyn BusClient,
        gpio: &dyn GpioDriver,
    ) -> Result<(), String> {
        match output {
            PhysicalOutput::Gpio(pin) => {
                if self.configured_pin != Some(*pin) {
                    gpio.configure_output(*pin).map_err(|e| e.to_string())?;
                    self.configured_pin = Some(*pin);
                }
                gpio.write(*pin, level).map_err(|e| e.to_string())
            }
            PhysicalOutput::Relay { state_path, .. } => bus
                .set_value(
                    self.relay_bus,
                    &self.relay_service,
                    state_path,
                    BusValue::Int(i64::from(level)),
                )
                .map_err(|e| e.to_string()),
        }
    }

    fn release_pin(&mut self, pin: u32, gpio: &dyn GpioDriver) {
        if self.configured_pin == Some(pin) {
            if let Err(e) = gpio.release(pin) {
                warn!("Releasing GPIO {} failed: {}", pin, e);
            }
            self.configured_pin = None;
        }
    }

    // ========================================================================
    // Decision application
    // ========================================================================

    /// Realize the desired output level.
    ///
    /// Nothing is written until both the catalog and the relay selector are
    /// ready. A new target is only asserted once every previous target is
    /// confirmed low.
    pub fn apply_decision(
        &mut self,
        desired: bool,
        bus: &dyn BusClient,
        gpio: &dyn GpioDriver,
    ) -> ApplyOutcome {
        let mut failures = Vec::new();

        if !(self.catalog_ready && self.selector_ready) {
            debug!(
                "Output writes deferred (catalog ready: {}, selector ready: {})",
                self.catalog_ready, self.selector_ready
            );
            return ApplyOutcome {
                target: self.target.clone(),
                asserted: None,
                failures,
            };
        }

        let target = self.select_target();
        let pin = match target {
            OutputTarget::Gpio => Some(self.selection.gpio_pin),
            _ => None,
        };
        if target != self.target || pin != self.target_pin {
            info!("Output target {} -> {}", self.target, target);
            if let Some(old) = self.physical(&self.target, self.target_pin) {
                self.stale_outputs.push(old);
            }
            self.target = target;
            self.target_pin = pin;
            self.asserted = None;
            self.tags_dirty = true;
        }

        self.drive_stale_low(bus, gpio, &mut failures);

        if self.tags_dirty || !self.failed_restores.is_empty() {
            let before = failures.len();
            let complete = self.reconcile_tags(bus, &mut failures);
            self.tags_dirty = !complete || failures.len() != before;
        }

        if !self.stale_outputs.is_empty() {
            error!(
                "{} previous output(s) not confirmed low, holding {} unasserted",
                self.stale_outputs.len(),
                self.target
            );
        } else if self.asserted != Some(desired) {
            match self.physical(&self.target, self.target_pin) {
                Some(output) => match self.write_physical(&output, desired, bus, gpio) {
                    Ok(()) => {
                        debug!("Output {} driven {}", self.target, desired);
                        self.asserted = Some(desired);
                    }
                    Err(e) => {
                        warn!("Writing output {} failed, retrying next tick: {}", self.target, e);
                        self.asserted = None;
                        failures.push(e);
                    }
                },
                None => self.asserted = None,
            }
        }

        ApplyOutcome {
            target: self.target.clone(),
            asserted: self.asserted,
            failures,
        }
    }

    fn drive_stale_low(&mut self, bus: &dyn BusClient, gpio: &dyn GpioDriver, failures: &mut Vec<String>) {
        let stale = std::mem::take(&mut self.stale_outputs);
        for output in stale {
            match self.write_physical(&output, false, bus, gpio) {
                Ok(()) => {
                    if let PhysicalOutput::Gpio(pin) = output {
                        self.release_pin(pin, gpio);
                    }
                }
                Err(e) => {
                    warn!("De-asserting previous output {:?} failed: {}", output, e);
                    failures.push(e);
                    self.stale_outputs.push(output);
                }
            }
        }
    }

    /// Relay channels still waiting to be confirmed low.
    fn energized_channels(&self) -> BTreeSet<String> {
        self.stale_outputs
            .iter()
            .filter_map(|output| match output {
                PhysicalOutput::Relay { channel, .. } => Some(channel.clone()),
                PhysicalOutput::Gpio(_) => None,
            })
            .collect()
    }

    // ========================================================================
    // Function tags
    // ========================================================================

    /// Channels that should carry the simulator's tag for the current target.
    fn wanted_tags(&self) -> BTreeSet<String> {
        let mut wanted = BTreeSet::new();
        match &self.target {
            OutputTarget::Relay(channel) => {
                wanted.insert(channel.clone());
            }
            OutputTarget::Gpio => {
                if let Some(mosfet) = self.mosfet_entry() {
                    wanted.insert(mosfet.channel.clone());
                }
            }
            OutputTarget::None => {}
        }
        wanted
    }

    fn read_tag(&self, bus: &dyn BusClient, entry: &RelayCatalogEntry) -> Result<String, BusError> {
        let value = bus.get_value(self.relay_bus, &self.relay_service, &entry.function_path)?;
        Ok(match value {
            BusValue::Text(s) => s.trim().to_string(),
            BusValue::Absent => String::new(),
            other => other.to_string(),
        })
    }

    /// Write the remembered tag back onto a channel and drop its reservation.
    fn restore(&mut self, bus: &dyn BusClient, channel: &str) -> Result<(), String> {
        let Some(entry) = self.entry(channel).cloned() else {
            self.reservations.remove(channel);
            self.failed_restores.remove(channel);
            return Ok(());
        };
        let tag = self
            .reservations
            .get(channel)
            .cloned()
            .unwrap_or_else(|| self.neutral_tag.clone());

        match bus.set_value(
            self.relay_bus,
            &self.relay_service,
            &entry.function_path,
            BusValue::Text(tag.clone()),
        ) {
            Ok(()) => {
                info!("Relay {} released, function restored to {:?}", channel, tag);
                self.reservations.remove(channel);
                self.failed_restores.remove(channel);
                Ok(())
            }
            Err(e) => {
                error!("Restoring function of relay {} to {:?} failed: {}", channel, tag, e);
                self.failed_restores.insert(channel.to_string());
                Err(e.to_string())
            }
        }
    }

    fn claim(&mut self, bus: &dyn BusClient, channel: &str) -> Result<(), String> {
        let Some(entry) = self.entry(channel).cloned() else {
            return Ok(());
        };

        if !self.reservations.contains_key(channel) {
            let current = self.read_tag(bus, &entry).map_err(|e| {
                warn!("Reading function of relay {} failed: {}", channel, e);
                e.to_string()
            })?;
            let prior = if current.is_empty() || current == self.own_tag {
                self.neutral_tag.clone()
            } else {
                current
            };
            debug!("Relay {} reserved, prior function {:?}", channel, prior);
            self.reservations.insert(channel.to_string(), prior);
        }

        bus.set_value(
            self.relay_bus,
            &self.relay_service,
            &entry.function_path,
            BusValue::Text(self.own_tag.clone()),
        )
        .map_err(|e| {
            warn!("Tagging relay {} failed: {}", channel, e);
            e.to_string()
        })?;
        Ok(())
    }

    /// Move the simulator's tag onto the wanted channels.
    ///
    /// A channel whose relay is not yet confirmed low keeps the tag. Returns
    /// false while any such channel is held back.
    fn reconcile_tags(&mut self, bus: &dyn BusClient, failures: &mut Vec<String>) -> bool {
        let wanted = self.wanted_tags();
        let energized = self.energized_channels();
        for channel in energized.iter().filter(|c| !wanted.contains(*c)) {
            warn!("Relay {} still energized, keeping its function until it is low", channel);
        }

        // Previously reserved channels first, then anything else still tagged.
        let mut released: BTreeSet<String> = energized.clone();
        let mut reserved: Vec<String> = self.reservations.keys().cloned().collect();
        reserved.extend(self.failed_restores.iter().cloned());
        reserved.sort();
        reserved.dedup();
        for channel in reserved
            .into_iter()
            .filter(|c| !wanted.contains(c) && !energized.contains(c))
        {
            if let Err(e) = self.restore(bus, &channel) {
                failures.push(e);
            }
            released.insert(channel);
        }

        let others: Vec<RelayCatalogEntry> = self
            .catalog
            .iter()
            .filter(|e| !wanted.contains(&e.channel) && !released.contains(&e.channel))
            .cloned()
            .collect();
        for entry in others {
            match self.read_tag(bus, &entry) {
                Ok(tag) if tag == self.own_tag => {
                    if let Err(e) = self.restore(bus, &entry.channel) {
                        failures.push(e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Reading function of relay {} failed: {}", entry.channel, e);
                    failures.push(e.to_string());
                }
            }
        }

        for channel in &wanted {
            if let Err(e) = self.claim(bus, channel) {
                failures.push(e);
            }
        }
        energized.iter().all(|c| wanted.contains(c))
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Drive everything low and hand every claimed relay back.
    ///
    /// Returns the failures; the arbitrator ends with no target either way.
    pub fn shutdown(&mut self, bus: &dyn BusClient, gpio: &dyn GpioDriver) -> Vec<String> {
        let mut failures = Vec::new();

        if let Some(current) = self.physical(&self.target, self.target_pin) {
            self.stale_outputs.push(current);
        }
        self.drive_stale_low(bus, gpio, &mut failures);
        let energized = self.energized_channels();

        let mut channels: Vec<String> = self.reservations.keys().cloned().collect();
        channels.sort();
        for channel in channels {
            if energized.contains(&channel) {
                error!("Relay {} still energized, leaving it tagged", channel);
                continue;
            }
            if let Err(e) = self.restore(bus, &channel) {
                failures.push(e);
            }
        }

        if let Some(pin) = self.configured_pin {
            self.release_pin(pin, gpio);
        }
        self.target = OutputTarget::None;
        self.target_pin = None;
        self.asserted = None;
        self.tags_dirty = false;

        if failures.is_empty() {
            info!("Outputs released");
        } else {
            error!("Shutdown left {} output(s) unrestored", failures.len());
        }
        failures
    }
}
