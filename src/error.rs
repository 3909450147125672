//! # Error Types Module
//!
//! Centralized error handling for the AirScale sync service.
//! One error enum per concern, chained through `#[from]` where one layer
//! wraps another.
//!
//! ## Error Types
//! - `BleError`: failures surfaced by the BLE adapter to its callers
//! - `TransportError`: failures raised by the native BLE stack
//! - `RecordStoreError`: local connection-record persistence failures
//! - `TelemetryError`: undecodable sensor notifications (logged and dropped)
//! - `CalibrationError`: degenerate calibration input
//! - `StoreError`: device/channel/calibration persistence failures
//! - `RegistryError`: channel registry failures, including init races
//! - `MigrationError`: batch procedures that failed at commit time
//! - `ConfigError`: configuration file I/O and parsing errors
//!
//! ## Recovery
//! - `Unavailable` is terminal for the session and never retried.
//! - `Cancelled` is safe to retry.
//! - `NotConnected` means the caller must reconnect first.
//! - `Conflict` means the caller should re-read and skip.
//! - `InsufficientData` means more calibration points are needed.

use crate::migration::MigrationReport;
use thiserror::Error;

/// Errors returned by `BleService` operations
#[derive(Debug, Error)]
pub enum BleError {
    /// Host has no usable BLE stack
    #[error("Bluetooth not available")]
    Unavailable,
    /// User dismissed or abandoned the device chooser
    #[error("No device selected")]
    Cancelled,
    /// Operation needs an active link
    #[error("Not connected to a device")]
    NotConnected,
    /// Native connect call did not complete in time
    #[error("Timed out connecting to {device_id} after {secs}s")]
    Timeout { device_id: String, secs: u64 },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Persistence(#[from] RecordStoreError),
    /// Selected device does not advertise an AirScale MAC
    #[error("Device {0} is not an AirScale sensor")]
    UnrecognizedDevice(String),
    #[error("Failed to encode coefficients: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors raised by a `BleTransport` implementation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth not supported on this host")]
    Unavailable,
    #[error("No Bluetooth adapter found. Please ensure Bluetooth is enabled.")]
    NoAdapter,
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error("Characteristic {0} not found on device")]
    CharacteristicNotFound(String),
    #[error("Bluetooth operation failed: {0}")]
    Btle(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        TransportError::Btle(e.to_string())
    }
}

/// Errors that can occur while reading or writing the connection record
#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("Failed to read connection record: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("Failed to write connection record: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("Failed to parse connection record: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("Failed to serialize connection record: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
}

/// Sensor notification payloads that could not be decoded
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("telemetry payload is not JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("telemetry payload is not a JSON object")]
    NotAnObject,
}

/// Calibration fit failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("insufficient calibration data ({usable} usable points): {reason}")]
    InsufficientData { usable: usize, reason: &'static str },
    #[error("invalid calibration point '{0}', expected pressure,weight[,ambient[,temp]]")]
    InvalidPoint(String),
}

/// Persistence failures from a `DeviceStore`
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device {device_id} already has channel {number}")]
    Conflict { device_id: u64, number: u8 },
    #[error("device {0} already exists")]
    DuplicateDevice(u64),
    #[error("{0} not found")]
    NotFound(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("store file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Channel registry failures
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another writer initialized channels for this device first
    #[error("concurrent channel initialization for device {device_id}")]
    Conflict { device_id: u64 },
    #[error("device {0} not found")]
    DeviceNotFound(u64),
    #[error("device {device_id} has no channel {number}")]
    ChannelNotFound { device_id: u64, number: u8 },
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { device_id, .. } => RegistryError::Conflict { device_id },
            other => RegistryError::Store(other),
        }
    }
}

/// A batch procedure whose staged changes could not be committed
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration commit failed, all staged changes rolled back ({report}): {source}")]
    CommitFailed {
        report: MigrationReport,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("Failed to write config file: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_message_is_user_facing() {
        assert_eq!(BleError::Unavailable.to_string(), "Bluetooth not available");
    }

    #[test]
    fn test_config_error_chain() {
        use std::error::Error;
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ConfigError::ReadFailed(io_err);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_store_conflict_maps_to_registry_conflict() {
        let err: RegistryError = StoreError::Conflict { device_id: 7, number: 1 }.into();
        assert!(matches!(err, RegistryError::Conflict { device_id: 7 }));
    }

    #[test]
    fn test_transport_error_wraps_into_ble_error() {
        let err: BleError = TransportError::NoAdapter.into();
        assert!(err.to_string().contains("Bluetooth"));
    }
}
