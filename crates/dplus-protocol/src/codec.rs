//! JSON codec for service messages.
//!
//! Requests arrive as JSON text (HTTP bodies, line-oriented clients); responses
//! and notifications leave the same way.

use crate::messages::{Notification, ServiceCall, ServiceResponse};
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message is not a JSON object")]
    NotAnObject,

    /// The `request` tag is missing.
    #[error("Missing request type")]
    MissingRequestType,

    #[error("Unknown request type: {0}")]
    UnknownRequest(String),
}

const REQUEST_TYPES: [&str; 7] = [
    "start",
    "stop",
    "shutdown",
    "updateSettings",
    "injectVoltageSample",
    "getSettings",
    "getStatus",
];

/// Decode a service call from JSON text.
///
/// The request tag is checked first so an unknown type is reported as such
/// instead of as a generic deserialization error.
pub fn decode_call(text: &str) -> Result<ServiceCall, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let object = value.as_object().ok_or(CodecError::NotAnObject)?;
    let kind = object
        .get("request")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingRequestType)?;
    if !REQUEST_TYPES.contains(&kind) {
        return Err(CodecError::UnknownRequest(kind.to_string()));
    }
    serde_json::from_value(value).map_err(CodecError::from)
}

pub fn encode_call(call: &ServiceCall) -> Result<String, CodecError> {
    serde_json::to_string(call).map_err(CodecError::from)
}

pub fn encode_response(response: &ServiceResponse) -> Result<String, CodecError> {
    serde_json::to_string(response).map_err(CodecError::from)
}

pub fn decode_response(text: &str) -> Result<ServiceResponse, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}

pub fn encode_notification(notification: &Notification) -> Result<String, CodecError> {
    serde_json::to_string(notification).map_err(CodecError::from)
}

/// Check if a JSON message appears to be a status notification.
///
/// This is useful for quick filtering without full parsing.
pub fn is_status_notification(text: &str) -> bool {
    text.contains("\"statusChanged\"")
}
