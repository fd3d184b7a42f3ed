//! D+ simulator data model types.
//!
//! These types describe what travels over the platform bus and what the
//! control core keeps between ticks:
//! - Bus values with explicit defined/absent semantics
//! - Bus, output mode and pull selectors
//! - Relay catalog entries and output targets
//! - Resolved voltage source and discovery candidates

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which message bus a service lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl BusKind {
    /// Both buses, system first. Discovery walks them in this order.
    pub const ALL: [BusKind; 2] = [BusKind::System, BusKind::Session];

    pub fn as_str(&self) -> &'static str {
        match self {
            BusKind::System => "system",
            BusKind::Session => "session",
        }
    }

    /// Parse a bus name, returning `None` for anything but `system`/`session`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Some(BusKind::System),
            "session" => Some(BusKind::Session),
            _ => None,
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value read from or written to a bus property.
///
/// Remote properties may be unset, in which case the bus replies with an
/// empty value. That case is `Absent` and is never confused with a real zero.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusValue {
    #[default]
    Absent,
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
}

impl BusValue {
    /// True for anything but `Absent`.
    pub fn is_defined(&self) -> bool {
        !matches!(self, BusValue::Absent)
    }

    /// Numeric view of the value. Only finite numbers count.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BusValue::Int(v) => Some(*v as f64),
            BusValue::Double(v) if v.is_finite() => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BusValue::Int(v) => Some(*v),
            BusValue::Double(v) if v.is_finite() => Some(v.trunc() as i64),
            BusValue::Double(_) => None,
            BusValue::Bool(v) => Some(i64::from(*v)),
            BusValue::Text(s) => s.trim().parse().ok(),
            BusValue::Absent => None,
        }
    }

    /// Lenient boolean view: accepts `0/1`, `true/false` and `on/off`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            BusValue::Bool(v) => Some(*v),
            BusValue::Int(v) => Some(*v != 0),
            BusValue::Double(v) => Some(*v != 0.0),
            BusValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Some(true),
                "0" | "false" | "off" | "no" | "" => Some(false),
                _ => None,
            },
            BusValue::Absent => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            BusValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON value. Arrays and objects have no bus representation
    /// and map to `Absent`.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => BusValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => BusValue::Int(i),
                None => n.as_f64().map(BusValue::Double).unwrap_or(BusValue::Absent),
            },
            serde_json::Value::String(s) => BusValue::Text(s.clone()),
            _ => BusValue::Absent,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            BusValue::Absent => serde_json::Value::Null,
            BusValue::Bool(b) => serde_json::json!(b),
            BusValue::Int(i) => serde_json::json!(i),
            BusValue::Double(d) => serde_json::json!(d),
            BusValue::Text(s) => serde_json::json!(s),
        }
    }
}

impl From<bool> for BusValue {
    fn from(value: bool) -> Self {
        BusValue::Bool(value)
    }
}

impl From<i64> for BusValue {
    fn from(value: i64) -> Self {
        BusValue::Int(value)
    }
}

impl From<u32> for BusValue {
    fn from(value: u32) -> Self {
        BusValue::Int(i64::from(value))
    }
}

impl From<f64> for BusValue {
    fn from(value: f64) -> Self {
        BusValue::Double(value)
    }
}

impl From<&str> for BusValue {
    fn from(value: &str) -> Self {
        BusValue::Text(value.to_string())
    }
}

impl From<String> for BusValue {
    fn from(value: String) -> Self {
        BusValue::Text(value)
    }
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Absent => f.write_str("<absent>"),
            BusValue::Bool(v) => write!(f, "{}", v),
            BusValue::Int(v) => write!(f, "{}", v),
            BusValue::Double(v) => write!(f, "{}", v),
            BusValue::Text(v) => write!(f, "{:?}", v),
        }
    }
}

/// How the logical D+ output is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Gpio,
    Relay,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Gpio => "gpio",
            OutputMode::Relay => "relay",
        }
    }

    /// Settings store encoding: `0` is GPIO, `1` is relay. Strings are accepted too.
    pub fn from_value(value: &BusValue) -> Option<Self> {
        if let Some(text) = value.as_text() {
            return match text.trim().to_ascii_lowercase().as_str() {
                "gpio" | "mosfet" | "0" => Some(OutputMode::Gpio),
                "relay" | "1" => Some(OutputMode::Relay),
                _ => None,
            };
        }
        match value.as_i64()? {
            0 => Some(OutputMode::Gpio),
            1 => Some(OutputMode::Relay),
            _ => None,
        }
    }
}

/// Pull configuration of the ignition input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IgnitionPull {
    None,
    #[default]
    PullDown,
    PullUp,
}

impl IgnitionPull {
    /// Lenient parse. Anything unrecognized is pull-down.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "up" | "pullup" | "pull-up" | "pull_up" | "pud_up" => IgnitionPull::PullUp,
            "none" | "off" | "floating" => IgnitionPull::None,
            _ => IgnitionPull::PullDown,
        }
    }

    /// Short form stored in the settings store.
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnitionPull::None => "none",
            IgnitionPull::PullDown => "down",
            IgnitionPull::PullUp => "up",
        }
    }
}

/// The physical path currently realizing the D+ signal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "channel", rename_all = "lowercase")]
pub enum OutputTarget {
    #[default]
    None,
    Gpio,
    Relay(String),
}

impl OutputTarget {
    pub fn relay_channel(&self) -> Option<&str> {
        match self {
            OutputTarget::Relay(channel) => Some(channel),
            _ => None,
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::None => f.write_str("none"),
            OutputTarget::Gpio => f.write_str("gpio"),
            OutputTarget::Relay(channel) => write!(f, "relay:{}", channel),
        }
    }
}

/// One relay channel as enumerated from the relay service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCatalogEntry {
    /// Normalized channel identifier (e.g., "4brelays/0")
    pub channel: String,

    /// Human-readable label
    pub display_label: String,

    /// Object path of the relay's function setting
    pub function_path: String,

    /// Object path of the relay's on/off state
    pub state_path: String,
}

/// The starter voltage source the resolver settled on.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVoltageSource {
    pub bus: Option<BusKind>,
    pub service: String,
    pub object_path: String,
    pub last_voltage: Option<f64>,
    pub is_live: bool,
}

impl ResolvedVoltageSource {
    pub fn new(bus: BusKind, service: &str, object_path: &str) -> Self {
        Self {
            bus: Some(bus),
            service: service.to_string(),
            object_path: object_path.to_string(),
            last_voltage: None,
            is_live: false,
        }
    }

    /// True when no service is resolved.
    pub fn is_empty(&self) -> bool {
        self.bus.is_none() || self.service.is_empty() || self.object_path.is_empty()
    }

    /// Same bus, service and path as another source.
    pub fn same_address(&self, other: &ResolvedVoltageSource) -> bool {
        self.bus == other.bus && self.service == other.service && self.object_path == other.object_path
    }

    pub fn description(&self) -> String {
        match self.bus {
            Some(bus) if !self.is_empty() => {
                format!("{}:{}{}", bus, self.service, self.object_path)
            }
            _ => String::new(),
        }
    }
}

/// A service that answered the starter voltage probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoltageCandidate {
    pub bus: BusKind,
    pub service: String,
    pub object_path: String,
    pub voltage: f64,
    pub description: String,
}

/// Resolver state as shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceState {
    /// No discovery pass has completed yet.
    #[default]
    Unresolved,
    Resolved,
    /// Discovery found nothing and nothing was resolved before.
    ScanFailed,
    /// Discovery found nothing but a source had been resolved before.
    SourceLost,
    /// Samples come from an injected voltage.
    Manual,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Unresolved => "unresolved",
            SourceState::Resolved => "resolved",
            SourceState::ScanFailed => "scan-failed",
            SourceState::SourceLost => "source-lost",
            SourceState::Manual => "manual",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_value_absent_is_not_zero() {
        assert!(!BusValue::Absent.is_defined());
        assert_eq!(BusValue::Absent.as_f64(), None);
        assert_eq!(BusValue::Int(0).as_f64(), Some(0.0));
        assert_eq!(BusValue::Double(f64::NAN).as_f64(), None);
    }

    #[test]
    fn test_integer_view_of_doubles() {
        assert_eq!(BusValue::Double(17.9).as_i64(), Some(17));
        assert_eq!(BusValue::Double(f64::NAN).as_i64(), None);
        assert_eq!(BusValue::Double(f64::INFINITY).as_i64(), None);
        assert_eq!(BusValue::from(" 4 ").as_i64(), Some(4));
    }

    #[test]
    fn test_bus_value_json_mapping() {
        assert_eq!(BusValue::from_json(&serde_json::json!(null)), BusValue::Absent);
        assert_eq!(BusValue::from_json(&serde_json::json!(12)), BusValue::Int(12));
        assert_eq!(BusValue::from_json(&serde_json::json!(12.5)), BusValue::Double(12.5));
        assert_eq!(BusValue::from_json(&serde_json::json!([1, 2])), BusValue::Absent);

        let parsed: BusValue = serde_json::from_str("null").unwrap();
        assert_eq!(parsed, BusValue::Absent);
        let parsed: BusValue = serde_json::from_str("\"dplus\"").unwrap();
        assert_eq!(parsed, BusValue::Text("dplus".to_string()));
    }

    #[test]
    fn test_bool_coercion() {
        for (input, expected) in [
            ("0", false),
            ("1", true),
            ("false", false),
            ("true", true),
            ("off", false),
            ("on", true),
            (" 0 ", false),
            ("FALSE", false),
        ] {
            assert_eq!(BusValue::from(input).as_bool(), Some(expected), "{input:?}");
        }
        assert_eq!(BusValue::Int(0).as_bool(), Some(false));
        assert_eq!(BusValue::Int(1).as_bool(), Some(true));
        assert_eq!(BusValue::from("maybe").as_bool(), None);
    }

    #[test]
    fn test_ignition_pull_parse() {
        assert_eq!(IgnitionPull::parse("PUD_UP"), IgnitionPull::PullUp);
        assert_eq!(IgnitionPull::parse("floating"), IgnitionPull::None);
        assert_eq!(IgnitionPull::parse("whatever"), IgnitionPull::PullDown);
    }

    #[test]
    fn test_output_mode_from_value() {
        assert_eq!(OutputMode::from_value(&BusValue::Int(1)), Some(OutputMode::Relay));
        assert_eq!(OutputMode::from_value(&BusValue::from("gpio")), Some(OutputMode::Gpio));
        assert_eq!(OutputMode::from_value(&BusValue::Int(7)), None);
    }

    #[test]
    fn test_output_target_serialize() {
        let json = serde_json::to_value(OutputTarget::Relay("4brelays/0".to_string())).unwrap();
        assert_eq!(json["kind"], "relay");
        assert_eq!(json["channel"], "4brelays/0");
    }

    #[test]
    fn test_resolved_source_description() {
        let source = ResolvedVoltageSource::new(BusKind::System, "com.victronenergy.system", "/Dc/1/Voltage");
        assert_eq!(source.description(), "system:com.victronenergy.system/Dc/1/Voltage");
        assert!(ResolvedVoltageSource::default().is_empty());
    }
}
