//! Status snapshot of the control core.
//!
//! The snapshot is what operators see: it serializes to JSON for the service
//! interface and flattens into `/Status/...` object paths for publication on
//! the bus.

use crate::engine::PendingDirection;
use crate::model::{BusKind, BusValue, OutputMode, OutputTarget, RelayCatalogEntry, SourceState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Ignition input sub-state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IgnitionStatus {
    pub enabled: bool,
    pub state: bool,
    pub gpio: u32,
    pub pull_mode: String,
}

/// Configured and effective force overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceModeStatus {
    pub configured_on: bool,
    pub configured_off: bool,
    pub active_on: bool,
    pub active_off: bool,
}

/// Pending transition details.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayStatus {
    /// Debounce state name ("stable-off", "pending-on", ...)
    pub state: String,
    pub pending_direction: PendingDirection,
    pub on_remaining_seconds: f64,
    pub off_remaining_seconds: f64,
    /// Wall-clock time the pending transition completes
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoltageSourceStatus {
    pub state: SourceState,
    pub message: String,
    pub description: String,
    pub bus: Option<BusKind>,
    pub service: String,
    pub path: String,
    pub available: bool,
    pub failures: u32,
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub catalog_ready: bool,
    pub selector_ready: bool,
    pub channels: Vec<RelayCatalogEntry>,
    pub reservations: BTreeMap<String, String>,
    pub failed_restores: Vec<String>,
    pub mosfet_channel: Option<String>,
}

/// Full status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatorStatus {
    pub running: bool,
    /// Last live sample, `None` when the source is not live
    pub voltage: Option<f64>,
    /// Debounced decision
    pub output: bool,
    /// Level confirmed on the physical target
    pub output_asserted: Option<bool>,
    pub output_mode: OutputMode,
    pub output_target: OutputTarget,
    pub relay_channel: String,
    pub gpio_pin: u32,
    pub effective_on_voltage: f64,
    pub effective_off_voltage: f64,
    pub target_voltage: f64,
    pub hysteresis: f64,
    pub on_delay_seconds: f64,
    pub off_delay_seconds: f64,
    pub ignition: IgnitionStatus,
    pub allow_on: bool,
    pub off_required: bool,
    pub conditions_on: BTreeMap<String, bool>,
    pub conditions_off: BTreeMap<String, bool>,
    pub force_mode: ForceModeStatus,
    pub delays: DelayStatus,
    pub voltage_source: VoltageSourceStatus,
    pub relays: RelayStatus,
    pub timestamp: DateTime<Utc>,
}

impl SimulatorStatus {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Flatten into object paths below `root`, e.g. `/Status/Ignition/Enabled`.
    ///
    /// Object keys become PascalCase segments, array elements are indexed and
    /// nulls map to absent values.
    pub fn flatten(&self, root: &str) -> Vec<(String, BusValue)> {
        let mut out = Vec::new();
        flatten_value(root.trim_end_matches('/'), &self.to_json(), &mut out);
        out
    }
}

fn segment(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn flatten_value(prefix: &str, value: &Value, out: &mut Vec<(String, BusValue)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_value(&format!("{}/{}", prefix, segment(key)), child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_value(&format!("{}/{}", prefix, index), child, out);
            }
        }
        other => out.push((prefix.to_string(), BusValue::from_json(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> SimulatorStatus {
        SimulatorStatus {
            running: true,
            voltage: Some(12.7),
            output: true,
            output_asserted: Some(true),
            output_mode: OutputMode::Relay,
            output_target: OutputTarget::Relay("4brelays/0".to_string()),
            relay_channel: "4brelays/0".to_string(),
            gpio_pin: 17,
            effective_on_voltage: 12.6,
            effective_off_voltage: 12.2,
            target_voltage: 12.4,
            hysteresis: 0.4,
            on_delay_seconds: 2.0,
            off_delay_seconds: 5.0,
            ignition: IgnitionStatus::default(),
            allow_on: true,
            off_required: false,
            conditions_on: BTreeMap::from([("voltage".to_string(), true)]),
            conditions_off: BTreeMap::from([("voltage".to_string(), false)]),
            force_mode: ForceModeStatus::default(),
            delays: DelayStatus::default(),
            voltage_source: VoltageSourceStatus::default(),
            relays: RelayStatus {
                channels: vec![RelayCatalogEntry {
                    channel: "4brelays/0".to_string(),
                    display_label: "Pump".to_string(),
                    function_path: "/Relays/0/Function".to_string(),
                    state_path: "/Relays/0/State".to_string(),
                }],
                ..Default::default()
            },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_json_shape() {
        let json = status().to_json();
        assert_eq!(json["effectiveOnVoltage"], 12.6);
        assert_eq!(json["outputTarget"]["kind"], "relay");
        assert_eq!(json["voltageSource"]["state"], "unresolved");
        assert_eq!(json["delays"]["pendingDirection"], "none");
    }

    #[test]
    fn test_flatten_paths() {
        let flat: BTreeMap<String, BusValue> = status().flatten("/Status/").into_iter().collect();
        assert_eq!(flat.get("/Status/Voltage"), Some(&BusValue::Double(12.7)));
        assert_eq!(flat.get("/Status/Ignition/Enabled"), Some(&BusValue::Bool(false)));
        assert_eq!(flat.get("/Status/ConditionsOn/Voltage"), Some(&BusValue::Bool(true)));
        assert_eq!(
            flat.get("/Status/Relays/Channels/0/DisplayLabel"),
            Some(&BusValue::from("Pump"))
        );
        assert_eq!(flat.get("/Status/VoltageSource/LastError"), Some(&BusValue::Absent));
    }
}
