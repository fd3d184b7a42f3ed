//! Simulator configuration and settings storage.
//!
//! Configuration lives in a flat key/value settings store under
//! `/Settings/Devices/DPlusSim/`. This module provides:
//! - The settings definition table (key, store path, type code, default)
//! - [`SimulatorConfig`], the typed snapshot the control core works on
//! - Coercion of loosely typed store values and clamping at write time
//! - The [`ConfigStorage`] trait with in-memory and bus-backed implementations
//! - [`PlatformConfig`], static platform wiring loaded once at startup

use crate::model::{BusKind, BusValue, IgnitionPull, OutputMode};
use crate::path::normalize_relay_channel;
use crate::store::{BusClient, BusError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Settings group registered with the settings service.
pub const SETTINGS_GROUP: &str = "Devices/DPlusSim";

/// Smallest accepted delay or publish interval, in seconds.
pub const MIN_INTERVAL_SECONDS: f64 = 0.2;

/// Upper bound for delays and the status interval (one day).
pub const MAX_INTERVAL_SECONDS: f64 = 86_400.0;

/// Keys that only the voltage source resolver may change.
pub const RESOLVED_KEYS: [&str; 3] = ["busName", "servicePath", "voltagePath"];

pub const DEFAULT_GPIO_PIN: u32 = 17;
pub const DEFAULT_IGNITION_GPIO: u32 = 4;
pub const DEFAULT_TARGET_VOLTAGE: f64 = 3.3;
pub const DEFAULT_HYSTERESIS: f64 = 0.1;
pub const DEFAULT_ON_DELAY_SECONDS: f64 = 2.0;
pub const DEFAULT_OFF_DELAY_SECONDS: f64 = 5.0;
pub const DEFAULT_STATUS_INTERVAL_SECONDS: f64 = 2.0;
pub const DEFAULT_SERVICE_PATH: &str = "com.victronenergy.battery";
pub const DEFAULT_VOLTAGE_PATH: &str = "/Dc/0/Voltage";

/// Errors that can occur during configuration operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown setting: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("setting not found: {0}")]
    NotFound(String),

    #[error("invalid configuration data: {0}")]
    InvalidData(String),

    #[error("settings store: {0}")]
    Bus(#[from] BusError),
}

// ============================================================================
// Settings definitions
// ============================================================================

/// Store type code of a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    Int,
    Double,
    Bool,
    Text,
}

impl SettingType {
    /// Single-letter code used by the settings service.
    pub fn code(&self) -> &'static str {
        match self {
            SettingType::Int => "i",
            SettingType::Double => "d",
            SettingType::Bool => "b",
            SettingType::Text => "s",
        }
    }
}

/// Default value of a setting, usable in a `const` table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingDefault {
    Int(i64),
    Double(f64),
    Bool(bool),
    Text(&'static str),
}

impl SettingDefault {
    pub fn to_bus_value(&self) -> BusValue {
        match self {
            SettingDefault::Int(v) => BusValue::Int(*v),
            SettingDefault::Double(v) => BusValue::Double(*v),
            SettingDefault::Bool(v) => BusValue::Bool(*v),
            SettingDefault::Text(v) => BusValue::Text((*v).to_string()),
        }
    }
}

/// One entry of the settings definition table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettingDefinition {
    /// Configuration key (camelCase field name of [`SimulatorConfig`])
    pub key: &'static str,
    /// Setting name below [`SETTINGS_GROUP`]
    pub name: &'static str,
    pub kind: SettingType,
    pub default: SettingDefault,
    pub min: f64,
    pub max: f64,
}

impl SettingDefinition {
    /// Full object path in the settings store.
    pub fn path(&self) -> String {
        format!("/Settings/{}/{}", SETTINGS_GROUP, self.name)
    }

    pub fn find(key: &str) -> Option<&'static SettingDefinition> {
        SETTING_DEFINITIONS.iter().find(|d| d.key == key)
    }

    /// Reverse lookup from a store object path.
    pub fn find_by_path(path: &str) -> Option<&'static SettingDefinition> {
        SETTING_DEFINITIONS.iter().find(|d| d.path() == path)
    }
}

const fn def(
    key: &'static str,
    name: &'static str,
    kind: SettingType,
    default: SettingDefault,
    min: f64,
    max: f64,
) -> SettingDefinition {
    SettingDefinition {
        key,
        name,
        kind,
        default,
        min,
        max,
    }
}

/// Every setting the simulator registers.
pub const SETTING_DEFINITIONS: &[SettingDefinition] = &[
    def("outputMode", "OutputMode", SettingType::Int, SettingDefault::Int(0), 0.0, 1.0),
    def("gpioPin", "GpioPin", SettingType::Int, SettingDefault::Int(DEFAULT_GPIO_PIN as i64), 0.0, 0.0),
    def("targetVoltage", "TargetVoltage", SettingType::Double, SettingDefault::Double(DEFAULT_TARGET_VOLTAGE), 0.0, 0.0),
    def("hysteresis", "Hysteresis", SettingType::Double, SettingDefault::Double(DEFAULT_HYSTERESIS), 0.0, 0.0),
    def(
        "onVoltage",
        "OnVoltage",
        SettingType::Double,
        SettingDefault::Double(DEFAULT_TARGET_VOLTAGE + DEFAULT_HYSTERESIS / 2.0),
        0.0,
        0.0,
    ),
    def(
        "offVoltage",
        "OffVoltage",
        SettingType::Double,
        SettingDefault::Double(DEFAULT_TARGET_VOLTAGE - DEFAULT_HYSTERESIS / 2.0),
        0.0,
        0.0,
    ),
    def("onDelaySeconds", "OnDelaySec", SettingType::Double, SettingDefault::Double(DEFAULT_ON_DELAY_SECONDS), MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS),
    def("offDelaySeconds", "OffDelaySec", SettingType::Double, SettingDefault::Double(DEFAULT_OFF_DELAY_SECONDS), MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS),
    def("useIgnition", "UseIgnition", SettingType::Bool, SettingDefault::Bool(false), 0.0, 1.0),
    def("ignitionGpio", "IgnitionGpio", SettingType::Int, SettingDefault::Int(DEFAULT_IGNITION_GPIO as i64), 0.0, 0.0),
    def("ignitionPull", "IgnitionPull", SettingType::Text, SettingDefault::Text("down"), 0.0, 0.0),
    def("relayChannel", "RelayChannel", SettingType::Text, SettingDefault::Text(""), 0.0, 0.0),
    def("forceOn", "ForceOn", SettingType::Bool, SettingDefault::Bool(false), 0.0, 1.0),
    def("forceOff", "ForceOff", SettingType::Bool, SettingDefault::Bool(false), 0.0, 1.0),
    def(
        "statusPublishIntervalSeconds",
        "StatusPublishInterval",
        SettingType::Double,
        SettingDefault::Double(DEFAULT_STATUS_INTERVAL_SECONDS),
        MIN_INTERVAL_SECONDS,
        MAX_INTERVAL_SECONDS,
    ),
    def("busName", "DbusBus", SettingType::Text, SettingDefault::Text("system"), 0.0, 0.0),
    def("servicePath", "ServicePath", SettingType::Text, SettingDefault::Text(DEFAULT_SERVICE_PATH), 0.0, 0.0),
    def("voltagePath", "VoltagePath", SettingType::Text, SettingDefault::Text(DEFAULT_VOLTAGE_PATH), 0.0, 0.0),
];

// ============================================================================
// Typed configuration snapshot
// ============================================================================

/// Typed configuration snapshot.
///
/// Values are always clamped; a snapshot obtained from [`SimulatorConfig::apply_setting`]
/// never carries a delay outside [`MIN_INTERVAL_SECONDS`]..=[`MAX_INTERVAL_SECONDS`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatorConfig {
    pub output_mode: OutputMode,
    pub gpio_pin: u32,
    pub ignition_gpio: u32,
    pub ignition_pull: IgnitionPull,
    pub use_ignition: bool,
    pub target_voltage: f64,
    pub hysteresis: f64,
    /// Explicit activation threshold. `None` falls back to the legacy form.
    pub on_voltage: Option<f64>,
    /// Explicit deactivation threshold. `None` falls back to the legacy form.
    pub off_voltage: Option<f64>,
    pub on_delay_seconds: f64,
    pub off_delay_seconds: f64,
    /// Normalized relay channel, empty when no relay is assigned.
    pub relay_channel: String,
    pub force_on: bool,
    pub force_off: bool,
    pub status_publish_interval_seconds: f64,
    pub bus_name: BusKind,
    pub service_path: String,
    pub voltage_path: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            output_mode: OutputMode::Gpio,
            gpio_pin: DEFAULT_GPIO_PIN,
            ignition_gpio: DEFAULT_IGNITION_GPIO,
            ignition_pull: IgnitionPull::PullDown,
            use_ignition: false,
            target_voltage: DEFAULT_TARGET_VOLTAGE,
            hysteresis: DEFAULT_HYSTERESIS,
            on_voltage: Some(DEFAULT_TARGET_VOLTAGE + DEFAULT_HYSTERESIS / 2.0),
            off_voltage: Some(DEFAULT_TARGET_VOLTAGE - DEFAULT_HYSTERESIS / 2.0),
            on_delay_seconds: DEFAULT_ON_DELAY_SECONDS,
            off_delay_seconds: DEFAULT_OFF_DELAY_SECONDS,
            relay_channel: String::new(),
            force_on: false,
            force_off: false,
            status_publish_interval_seconds: DEFAULT_STATUS_INTERVAL_SECONDS,
            bus_name: BusKind::System,
            service_path: DEFAULT_SERVICE_PATH.to_string(),
            voltage_path: DEFAULT_VOLTAGE_PATH.to_string(),
        }
    }
}

fn invalid(key: &str, value: &BusValue) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn coerce_i64(key: &str, value: &BusValue) -> Result<i64, ConfigError> {
    value.as_i64().ok_or_else(|| invalid(key, value))
}

fn coerce_f64(key: &str, value: &BusValue) -> Result<f64, ConfigError> {
    let parsed = match value {
        BusValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        BusValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        other => other.as_f64(),
    };
    parsed.ok_or_else(|| invalid(key, value))
}

fn coerce_bool(key: &str, value: &BusValue) -> Result<bool, ConfigError> {
    value.as_bool().ok_or_else(|| invalid(key, value))
}

fn coerce_text(value: &BusValue) -> String {
    match value {
        BusValue::Text(s) => s.trim().to_string(),
        BusValue::Absent => String::new(),
        other => other.to_string(),
    }
}

fn coerce_threshold(key: &str, value: &BusValue) -> Result<Option<f64>, ConfigError> {
    if value.is_defined() {
        coerce_f64(key, value).map(Some)
    } else {
        Ok(None)
    }
}

fn clamp_pin(value: i64) -> u32 {
    value.clamp(0, i64::from(u32::MAX)) as u32
}

/// Clamp a delay or interval into `[MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS]`.
pub fn clamp_interval(value: f64) -> f64 {
    if value.is_nan() {
        return MIN_INTERVAL_SECONDS;
    }
    value.clamp(MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS)
}

impl SimulatorConfig {
    /// Coerce, clamp and store one setting. Returns whether the snapshot changed.
    ///
    /// `Absent` resets the key to its default (or unsets an explicit threshold).
    pub fn apply_setting(&mut self, key: &str, raw: &BusValue) -> Result<bool, ConfigError> {
        let definition = SettingDefinition::find(key).ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let default = definition.default.to_bus_value();
        let value = if raw.is_defined() { raw } else { &default };
        let before = self.clone();

        match key {
            "outputMode" => {
                self.output_mode = OutputMode::from_value(value).ok_or_else(|| invalid(key, value))?;
            }
            "gpioPin" => self.gpio_pin = clamp_pin(coerce_i64(key, value)?),
            "ignitionGpio" => self.ignition_gpio = clamp_pin(coerce_i64(key, value)?),
            "ignitionPull" => self.ignition_pull = IgnitionPull::parse(&coerce_text(value)),
            "useIgnition" => self.use_ignition = coerce_bool(key, value)?,
            "forceOn" => self.force_on = coerce_bool(key, value)?,
            "forceOff" => self.force_off = coerce_bool(key, value)?,
            "targetVoltage" => self.target_voltage = coerce_f64(key, value)?,
            "hysteresis" => self.hysteresis = coerce_f64(key, value)?.max(0.0),
            "onVoltage" => self.on_voltage = coerce_threshold(key, raw)?,
            "offVoltage" => self.off_voltage = coerce_threshold(key, raw)?,
            "onDelaySeconds" => self.on_delay_seconds = clamp_interval(coerce_f64(key, value)?),
            "offDelaySeconds" => self.off_delay_seconds = clamp_interval(coerce_f64(key, value)?),
            "statusPublishIntervalSeconds" => {
                self.status_publish_interval_seconds = clamp_interval(coerce_f64(key, value)?)
            }
            "relayChannel" => self.relay_channel = normalize_relay_channel(&coerce_text(value)),
            "busName" => {
                let text = coerce_text(value);
                self.bus_name = BusKind::parse(&text).unwrap_or_else(|| {
                    warn!("Unknown bus {:?}, falling back to system", text);
                    BusKind::System
                });
            }
            "servicePath" => self.service_path = coerce_text(value),
            "voltagePath" => self.voltage_path = coerce_text(value),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }

        Ok(*self != before)
    }

    /// Store representation of one setting.
    pub fn setting_value(&self, key: &str) -> Option<BusValue> {
        let value = match key {
            "outputMode" => BusValue::Int(match self.output_mode {
                OutputMode::Gpio => 0,
                OutputMode::Relay => 1,
            }),
            "gpioPin" => BusValue::from(self.gpio_pin),
            "ignitionGpio" => BusValue::from(self.ignition_gpio),
            "ignitionPull" => BusValue::from(self.ignition_pull.as_str()),
            "useIgnition" => BusValue::Bool(self.use_ignition),
            "forceOn" => BusValue::Bool(self.force_on),
            "forceOff" => BusValue::Bool(self.force_off),
            "targetVoltage" => BusValue::Double(self.target_voltage),
            "hysteresis" => BusValue::Double(self.hysteresis),
            "onVoltage" => self.on_voltage.map(BusValue::Double).unwrap_or_default(),
            "offVoltage" => self.off_voltage.map(BusValue::Double).unwrap_or_default(),
            "onDelaySeconds" => BusValue::Double(self.on_delay_seconds),
            "offDelaySeconds" => BusValue::Double(self.off_delay_seconds),
            "statusPublishIntervalSeconds" => BusValue::Double(self.status_publish_interval_seconds),
            "relayChannel" => BusValue::from(self.relay_channel.as_str()),
            "busName" => BusValue::from(self.bus_name.as_str()),
            "servicePath" => BusValue::from(self.service_path.as_str()),
            "voltagePath" => BusValue::from(self.voltage_path.as_str()),
            _ => return None,
        };
        Some(value)
    }

    /// All settings keyed by configuration key.
    pub fn to_settings_map(&self) -> BTreeMap<String, BusValue> {
        SETTING_DEFINITIONS
            .iter()
            .filter_map(|d| self.setting_value(d.key).map(|v| (d.key.to_string(), v)))
            .collect()
    }

    /// Apply a batch of settings. Unknown keys and invalid values are
    /// reported but do not stop the batch.
    pub fn apply_settings<'a, I>(&mut self, settings: I) -> Vec<ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a BusValue)>,
    {
        settings
            .into_iter()
            .filter_map(|(key, value)| self.apply_setting(key, value).err())
            .collect()
    }

    /// Clamp every field into its valid range.
    pub fn clamped(mut self) -> Self {
        self.hysteresis = self.hysteresis.max(0.0);
        self.on_delay_seconds = clamp_interval(self.on_delay_seconds);
        self.off_delay_seconds = clamp_interval(self.off_delay_seconds);
        self.status_publish_interval_seconds = clamp_interval(self.status_publish_interval_seconds);
        self.relay_channel = normalize_relay_channel(&self.relay_channel);
        self
    }

    /// Whether a key is owned by the voltage source resolver.
    pub fn is_resolved_key(key: &str) -> bool {
        RESOLVED_KEYS.contains(&key)
    }
}

// ============================================================================
// Settings storage
// ============================================================================

/// Abstract settings storage.
///
/// All methods are synchronous; keys are configuration keys from
/// [`SETTING_DEFINITIONS`].
pub trait ConfigStorage: Send + Sync {
    /// Load a value by key.
    fn load_value(&self, key: &str) -> Result<BusValue, ConfigError>;

    /// Save a value by key.
    fn save_value(&self, key: &str, value: &BusValue) -> Result<(), ConfigError>;

    /// Check if a key exists.
    fn has_key(&self, key: &str) -> bool;

    /// Create every missing setting with its default. Returns the number created.
    fn register_defaults(&self) -> Result<usize, ConfigError> {
        let mut created = 0;
        for definition in SETTING_DEFINITIONS {
            if !self.has_key(definition.key) {
                self.save_value(definition.key, &definition.default.to_bus_value())?;
                created += 1;
            }
        }
        Ok(created)
    }

    /// Load a full snapshot. Missing keys keep their defaults and invalid
    /// values are logged and skipped; store failures propagate.
    fn load_config(&self) -> Result<SimulatorConfig, ConfigError> {
        let mut config = SimulatorConfig::default();
        for definition in SETTING_DEFINITIONS {
            match self.load_value(definition.key) {
                Ok(value) => {
                    if let Err(e) = config.apply_setting(definition.key, &value) {
                        warn!("Ignoring stored setting {}: {}", definition.key, e);
                    }
                }
                Err(ConfigError::NotFound(_)) => {
                    debug!("Setting {} not stored, using default", definition.key);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(config)
    }

    /// Persist every setting of a snapshot.
    fn save_config(&self, config: &SimulatorConfig) -> Result<(), ConfigError> {
        for (key, value) in config.to_settings_map() {
            self.save_value(&key, &value)?;
        }
        Ok(())
    }
}

/// In-memory settings storage.
#[derive(Debug, Default)]
pub struct MemoryConfigStorage {
    data: RwLock<HashMap<String, BusValue>>,
}

impl MemoryConfigStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStorage for MemoryConfigStorage {
    fn load_value(&self, key: &str) -> Result<BusValue, ConfigError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(key)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(key.to_string()))
    }

    fn save_value(&self, key: &str, value: &BusValue) -> Result<(), ConfigError> {
        SettingDefinition::find(key).ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        self.data
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn has_key(&self, key: &str) -> bool {
        self.data
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }
}

/// Settings storage backed by the platform settings service.
pub struct BusConfigStorage {
    bus: Arc<dyn BusClient>,
    bus_kind: BusKind,
    service: String,
}

impl BusConfigStorage {
    pub fn new(bus: Arc<dyn BusClient>, bus_kind: BusKind, service: &str) -> Self {
        Self {
            bus,
            bus_kind,
            service: service.to_string(),
        }
    }

    fn definition(key: &str) -> Result<&'static SettingDefinition, ConfigError> {
        SettingDefinition::find(key).ok_or_else(|| ConfigError::UnknownKey(key.to_string()))
    }
}

impl ConfigStorage for BusConfigStorage {
    fn load_value(&self, key: &str) -> Result<BusValue, ConfigError> {
        let definition = Self::definition(key)?;
        match self.bus.get_value(self.bus_kind, &self.service, &definition.path()) {
            Ok(value) => Ok(value),
            Err(BusError::PathUnknown { .. }) => Err(ConfigError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn save_value(&self, key: &str, value: &BusValue) -> Result<(), ConfigError> {
        let definition = Self::definition(key)?;
        self.bus
            .set_value(self.bus_kind, &self.service, &definition.path(), value.clone())?;
        Ok(())
    }

    fn has_key(&self, key: &str) -> bool {
        self.load_value(key).is_ok()
    }

    /// Registers through `AddSetting`, which leaves existing values alone.
    fn register_defaults(&self) -> Result<usize, ConfigError> {
        let mut created = 0;
        for definition in SETTING_DEFINITIONS {
            if self.has_key(definition.key) {
                continue;
            }
            self.bus.call_method(
                self.bus_kind,
                &self.service,
                "/Settings",
                "AddSetting",
                &[
                    BusValue::from(SETTINGS_GROUP),
                    BusValue::from(definition.name),
                    definition.default.to_bus_value(),
                    BusValue::from(definition.kind.code()),
                    BusValue::Double(definition.min),
                    BusValue::Double(definition.max),
                ],
            )?;
            created += 1;
        }
        Ok(created)
    }
}

// ============================================================================
// Platform wiring
// ============================================================================

/// Static platform wiring, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformConfig {
    /// Settings service holding `/Settings/Devices/DPlusSim/*`
    pub settings_service: String,
    pub settings_bus: BusKind,

    /// Service exposing the relay catalog under `relay_root`
    pub relay_service: String,
    pub relay_bus: BusKind,
    pub relay_root: String,

    /// System aggregator, preferred by discovery
    pub system_service: String,
    /// Battery services considered by discovery
    pub battery_service_pattern: String,
    pub starter_voltage_path: String,
    pub product_name_path: String,

    /// Name under which the simulator publishes its own state
    pub own_service: String,
    pub own_function_tag: String,
    pub neutral_function_tag: String,

    /// Explicit function path of the GPIO driver entry, overrides name matching
    pub mosfet_function_path: Option<String>,
    pub mosfet_name_pattern: String,

    pub bus_timeout_ms: u64,
    pub discovery_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub topology_poll_interval_ms: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            settings_service: "com.victronenergy.settings".to_string(),
            settings_bus: BusKind::System,
            relay_service: "com.victronenergy.system".to_string(),
            relay_bus: BusKind::System,
            relay_root: "/Relays".to_string(),
            system_service: "com.victronenergy.system".to_string(),
            battery_service_pattern: "com.victronenergy.battery.*".to_string(),
            starter_voltage_path: "/Dc/1/Voltage".to_string(),
            product_name_path: "/ProductName".to_string(),
            own_service: "com.coyodude.dplussim".to_string(),
            own_function_tag: "dplus".to_string(),
            neutral_function_tag: "none".to_string(),
            mosfet_function_path: None,
            mosfet_name_pattern: "(?i)mosfet|digitaloutput".to_string(),
            bus_timeout_ms: 1000,
            discovery_timeout_ms: 5000,
            tick_interval_ms: 250,
            topology_poll_interval_ms: 5000,
        }
    }
}

impl PlatformConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: PlatformConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidData(e.to_string()))?;
        if config.own_function_tag.is_empty() || config.own_function_tag == config.neutral_function_tag {
            return Err(ConfigError::InvalidData(
                "own function tag must be non-empty and differ from the neutral tag".to_string(),
            ));
        }
        Ok(config)
    }
}
