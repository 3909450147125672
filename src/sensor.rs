use crate::connection::ConnectionState;
use crate::error::TelemetryError;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Events fanned out to `BleService` subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
    StateChanged(ConnectionState),
    Telemetry(Telemetry),
}

/// One notification from the sensor characteristic.
///
/// The schema is device-specific, so fields are kept as decoded JSON and
/// forwarded untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub device_id: String,
    pub received_at: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

pub fn decode_telemetry(device_id: &str, payload: &[u8]) -> Result<Telemetry, TelemetryError> {
    let text = std::str::from_utf8(payload)?;
    match serde_json::from_str::<Value>(text)? {
        Value::Object(fields) => Ok(Telemetry {
            device_id: device_id.to_string(),
            received_at: Utc::now(),
            fields,
        }),
        _ => Err(TelemetryError::NotAnObject),
    }
}
