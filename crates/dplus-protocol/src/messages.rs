//! Service message types.
//!
//! This module defines the messages exchanged with the simulator service:
//! - Client → Service: `ServiceCall` wrapping a `ServiceRequest`
//! - Service → Client: `ServiceResponse`, `Notification`
//!
//! Messages are JSON objects; requests and notifications carry a type tag.

use dplus_core::{BusValue, SimulatorStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Settings keyed by their configuration key (`gpioPin`, `forceOn`, ...).
pub type SettingsMap = BTreeMap<String, Value>;

// ============================================================================
// Requests (Client → Service)
// ============================================================================

/// Operation requested from the service.
///
/// # Example
/// ```json
/// { "request": "updateSettings", "settings": { "forceOn": true } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "camelCase")]
pub enum ServiceRequest {
    /// Resume simulation after a stop.
    Start,

    /// Stop simulating; the output is driven off.
    Stop,

    /// Release every output and terminate the service loop.
    Shutdown,

    /// Apply and persist operator edits.
    UpdateSettings { settings: SettingsMap },

    /// Inject a manual voltage sample. `null` clears the override.
    InjectVoltageSample { voltage: Option<f64> },

    GetSettings,

    GetStatus,
}

impl ServiceRequest {
    /// Wire name of the request type.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceRequest::Start => "start",
            ServiceRequest::Stop => "stop",
            ServiceRequest::Shutdown => "shutdown",
            ServiceRequest::UpdateSettings { .. } => "updateSettings",
            ServiceRequest::InjectVoltageSample { .. } => "injectVoltageSample",
            ServiceRequest::GetSettings => "getSettings",
            ServiceRequest::GetStatus => "getStatus",
        }
    }

    /// Requests that are only honoured when debug features are enabled.
    pub fn requires_debug(&self) -> bool {
        matches!(self, ServiceRequest::InjectVoltageSample { .. })
    }
}

/// A request with an optional correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub request: ServiceRequest,
}

impl ServiceCall {
    pub fn new(request: ServiceRequest) -> Self {
        Self {
            request_id: None,
            request,
        }
    }

    pub fn with_id(request_id: impl Into<String>, request: ServiceRequest) -> Self {
        Self {
            request_id: Some(request_id.into()),
            request,
        }
    }
}

// ============================================================================
// Responses (Service → Client)
// ============================================================================

/// Request outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseState {
    Completed,
    Failed,
}

/// Reply to a [`ServiceCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceResponse {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub state: ResponseState,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SimulatorStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsMap>,
    /// Per-key problems of a partially applied settings update.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ServiceResponse {
    pub fn completed() -> Self {
        Self {
            request_id: None,
            state: ResponseState::Completed,
            status_code: 200,
            message: None,
            status: None,
            settings: None,
            errors: Vec::new(),
        }
    }

    pub fn failed(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            state: ResponseState::Failed,
            status_code,
            message: Some(message.into()),
            ..Self::completed()
        }
    }

    pub fn with_status(mut self, status: SimulatorStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_settings(mut self, settings: SettingsMap) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.state == ResponseState::Completed
    }
}

// ============================================================================
// Notifications (Service → Client)
// ============================================================================

/// Unsolicited events pushed by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Notification {
    /// Published on every status tick.
    StatusChanged { status: SimulatorStatus },

    /// The service loop terminated.
    Stopped,
}

// ============================================================================
// Settings conversion
// ============================================================================

/// Convert bus-typed settings to their JSON form.
pub fn settings_to_json(settings: &BTreeMap<String, BusValue>) -> SettingsMap {
    settings
        .iter()
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect()
}

/// Convert JSON settings to bus values. Arrays, objects and nulls become absent.
pub fn settings_from_json(settings: &SettingsMap) -> BTreeMap<String, BusValue> {
    settings
        .iter()
        .map(|(key, value)| (key.clone(), BusValue::from_json(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_tagging() {
        let request = ServiceRequest::UpdateSettings {
            settings: SettingsMap::from([("forceOn".to_string(), json!(true))]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({"request": "updateSettings", "settings": {"forceOn": true}}));

        let stop: ServiceRequest = serde_json::from_value(json!({"request": "stop"})).unwrap();
        assert_eq!(stop, ServiceRequest::Stop);
    }

    #[test]
    fn test_call_flattens_request() {
        let call = ServiceCall::with_id("7", ServiceRequest::InjectVoltageSample { voltage: Some(13.4) });
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["requestId"], "7");
        assert_eq!(value["request"], "injectVoltageSample");
        assert_eq!(value["voltage"], 13.4);
        assert!(call.request.requires_debug());
    }

    #[test]
    fn test_inject_null_clears() {
        let request: ServiceRequest =
            serde_json::from_value(json!({"request": "injectVoltageSample", "voltage": null})).unwrap();
        assert_eq!(request, ServiceRequest::InjectVoltageSample { voltage: None });
    }

    #[test]
    fn test_failed_response_shape() {
        let response = ServiceResponse::failed(403, "debug features disabled");
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"state\":\"FAILED\""));
        assert!(json.contains("\"statusCode\":403"));
        assert!(!json.contains("\"status\":"));
        assert!(!json.contains("\"errors\""));
    }

    #[test]
    fn test_settings_conversion() {
        let settings = BTreeMap::from([
            ("gpioPin".to_string(), BusValue::Int(17)),
            ("relayChannel".to_string(), BusValue::from("4brelays/0")),
        ]);
        let json = settings_to_json(&settings);
        assert_eq!(json["gpioPin"], json!(17));
        assert_eq!(settings_from_json(&json), settings);
    }
}
