//! Discovery of AirScale sensors over BLE.
//!
//! Sensors advertise as `AirScale-XX:XX:XX:XX:XX:XX`; the MAC in the name is
//! the sensor's WiFi identity and is what coefficient sets are targeted at.

use crate::error::TransportError;
use btleplug::api::{Central, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use std::time::Duration;

pub const DEVICE_NAME_PREFIX: &str = "AirScale-";

/// Length of `XX:XX:XX:XX:XX:XX`
const MAC_LEN: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothDevice {
    pub id: String,
    pub name: String,
}

impl BluetoothDevice {
    pub fn new(id: String, name: String) -> Self {
        Self { id, name }
    }
}

/// Extracts the WiFi MAC from an advertised name using the default prefix.
pub fn extract_mac_from_name(name: &str) -> Option<String> {
    extract_mac_with_prefix(name, DEVICE_NAME_PREFIX)
}

/// Returns the MAC, uppercased, when `name` is exactly `prefix` followed by a
/// colon-delimited MAC address.
pub fn extract_mac_with_prefix(name: &str, prefix: &str) -> Option<String> {
    let mac = name.trim().strip_prefix(prefix)?;
    if mac.len() != MAC_LEN {
        return None;
    }
    let well_formed = mac.split(':').count() == 6
        && mac
            .split(':')
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
    well_formed.then(|| mac.to_ascii_uppercase())
}

pub fn matches_naming_convention(name: &str, prefix: &str) -> bool {
    name.trim().starts_with(prefix)
}

/// Stable string key for a peripheral, used as the device id everywhere above
/// the transport.
pub fn peripheral_key(peripheral: &Peripheral) -> String {
    format!("{:?}", peripheral.id())
}

/// Scans for `duration` and returns every peripheral whose advertised name
/// carries `prefix`, strongest signal first.
pub async fn scan_with_btleplug(
    central: &Adapter,
    prefix: &str,
    duration: Duration,
) -> Result<Vec<(Peripheral, BluetoothDevice)>, TransportError> {
    central.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;
    central.stop_scan().await?;

    let peripherals = central.peripherals().await?;

    let mut found = Vec::new();
    for peripheral in peripherals {
        let Ok(Some(props)) = peripheral.properties().await else {
            continue;
        };
        let Some(local_name) = props.local_name else {
            continue;
        };
        if !matches_naming_convention(&local_name, prefix) {
            continue;
        }
        log::debug!("Found {} (rssi {:?})", local_name, props.rssi);
        let device = BluetoothDevice::new(peripheral_key(&peripheral), local_name);
        found.push((props.rssi.unwrap_or(i16::MIN), peripheral, device));
    }

    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found.into_iter().map(|(_, p, d)| (p, d)).collect())
}
