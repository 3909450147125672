//! Native BLE capability behind a trait, so the adapter above it can run
//! against real hardware (`BtleplugTransport`) or a scripted mock in tests.

use crate::device_scanner::{peripheral_key, scan_with_btleplug, BluetoothDevice};
use crate::error::TransportError;
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);
/// Notify-only, UTF-8 JSON telemetry
pub const SENSOR_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);
/// Write-only, UTF-8 JSON coefficient set
pub const COEFFICIENTS_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x1c95d5e3_d8f7_413a_bf3d_7a2e5d7be87e);

pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Whether the host exposes a BLE stack at all
    async fn is_available(&self) -> bool;
    async fn initialize(&self) -> Result<(), TransportError>;
    /// Discovers devices advertising `name_prefix` and returns the chosen one,
    /// or `None` when nothing was selected.
    async fn request_device(&self, name_prefix: &str) -> Result<Option<BluetoothDevice>, TransportError>;
    async fn connect(&self, device_id: &str, on_disconnect: DisconnectHandler) -> Result<(), TransportError>;
    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError>;
    async fn start_notifications(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        on_data: NotificationHandler,
    ) -> Result<(), TransportError>;
    /// Write with link-layer acknowledgment
    async fn write(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError>;
}

/// `BleTransport` on top of btleplug's platform backend
pub struct BtleplugTransport {
    scan_duration: Duration,
    central: RwLock<Option<Adapter>>,
    peripherals: RwLock<HashMap<String, Peripheral>>,
    tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl BtleplugTransport {
    pub fn new(scan_duration: Duration) -> Self {
        Self {
            scan_duration,
            central: RwLock::new(None),
            peripherals: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    async fn first_adapter() -> Result<Adapter, TransportError> {
        let manager = Manager::new().await?;
        manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)
    }

    async fn central(&self) -> Result<Adapter, TransportError> {
        self.central.read().await.clone().ok_or(TransportError::Unavailable)
    }

    /// Looks in the scan cache first, then asks the adapter for peripherals it
    /// already knows about (bonded devices survive restarts on most platforms).
    async fn peripheral(&self, device_id: &str) -> Result<Peripheral, TransportError> {
        if let Some(p) = self.peripherals.read().await.get(device_id) {
            return Ok(p.clone());
        }
        let central = self.central().await?;
        let known = central.peripherals().await?;
        let peripheral = known
            .into_iter()
            .find(|p| peripheral_key(p) == device_id)
            .ok_or_else(|| TransportError::DeviceNotFound(device_id.to_string()))?;
        self.peripherals
            .write()
            .await
            .insert(device_id.to_string(), peripheral.clone());
        Ok(peripheral)
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| TransportError::CharacteristicNotFound(characteristic.to_string()))
    }

    fn track(&self, device_id: &str, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.entry(device_id.to_string()).or_default().push(handle);
    }

    fn abort_tasks(&self, device_id: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handles) = tasks.remove(device_id) {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn is_available(&self) -> bool {
        if self.central.read().await.is_some() {
            return true;
        }
        Self::first_adapter().await.is_ok()
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let adapter = Self::first_adapter().await?;
        if let Ok(info) = adapter.adapter_info().await {
            log::info!("Using Bluetooth adapter {}", info);
        }
        *self.central.write().await = Some(adapter);
        Ok(())
    }

    async fn request_device(&self, name_prefix: &str) -> Result<Option<BluetoothDevice>, TransportError> {
        let central = self.central().await?;
        log::info!("Scanning {}s for {}* devices", self.scan_duration.as_secs(), name_prefix);
        let found = scan_with_btleplug(&central, name_prefix, self.scan_duration).await?;

        let mut peripherals = self.peripherals.write().await;
        let mut chosen = None;
        for (peripheral, device) in found {
            if chosen.is_none() {
                chosen = Some(device.clone());
            }
            peripherals.insert(device.id, peripheral);
        }
        Ok(chosen)
    }

    async fn connect(&self, device_id: &str, on_disconnect: DisconnectHandler) -> Result<(), TransportError> {
        let central = self.central().await?;
        let peripheral = self.peripheral(device_id).await?;

        // Subscribe before connecting so a drop during service discovery is seen
        let mut events = central.events().await?;
        let watched = device_id.to_string();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if format!("{:?}", id) == watched {
                        log::info!("Device {} reported disconnect", watched);
                        on_disconnect();
                        break;
                    }
                }
            }
        });

        let connected = async {
            peripheral.connect().await?;
            peripheral.discover_services().await?;
            Ok::<(), TransportError>(())
        }
        .await;
        if let Err(e) = connected {
            watcher.abort();
            return Err(e);
        }
        self.track(device_id, watcher);
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError> {
        self.abort_tasks(device_id);
        let peripheral = self.peripherals.read().await.get(device_id).cloned();
        if let Some(peripheral) = peripheral {
            if peripheral.is_connected().await.unwrap_or(false) {
                peripheral.disconnect().await?;
            }
        }
        Ok(())
    }

    async fn start_notifications(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        on_data: NotificationHandler,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;
        peripheral.subscribe(&target).await?;

        let mut stream = peripheral.notifications().await?;
        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == characteristic {
                    on_data(&notification.value);
                }
            }
        });
        self.track(device_id, handle);
        Ok(())
    }

    async fn write(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        let target = Self::characteristic(&peripheral, service, characteristic)?;
        peripheral.write(&target, payload, WriteType::WithResponse).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids_are_distinct() {
        assert_ne!(SENSOR_CHARACTERISTIC_UUID, COEFFICIENTS_CHARACTERISTIC_UUID);
        assert_ne!(SERVICE_UUID, SENSOR_CHARACTERISTIC_UUID);
        assert_eq!(
            SERVICE_UUID.to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
    }

    #[tokio::test]
    async fn test_operations_before_initialize_are_unavailable() {
        let transport = BtleplugTransport::new(Duration::from_millis(10));
        assert_eq!(
            transport.request_device("AirScale-").await,
            Err(TransportError::Unavailable)
        );
        assert!(transport.disconnect("nothing").await.is_ok());
    }
}
