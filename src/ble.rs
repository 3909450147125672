//! # BLE Service Module
//!
//! Bridges an AirScale sensor's GATT protocol and the application's
//! telemetry and coefficient data model. One `BleService` is built by the
//! composition root and cloned into whatever needs connectivity; clones
//! share the same connection.
//!
//! ## Guarantees
//! - At most one device connection at a time. Connecting tears down the
//!   current link before the new attempt starts.
//! - The connection record is written only after the telemetry
//!   subscription succeeds, and a failed manual connect leaves none behind.
//! - Every native connect call is bounded by the configured timeout.
//! - Malformed telemetry is logged and dropped. A panicking listener is
//!   isolated from the others.
//!
//! ## Availability
//! On hosts without a usable BLE stack `initialize` returns `Ok(false)` and
//! every other operation fails with `BleError::Unavailable`.

use crate::calibration::CoefficientSet;
use crate::config::Config;
use crate::connection::{ConnectMode, ConnectionMachine, ConnectionRecord, ConnectionState, RecordStore, Transition};
use crate::device_scanner::extract_mac_with_prefix;
use crate::error::{BleError, RecordStoreError, TransportError};
use crate::listeners::{ListenerRegistry, Subscription};
use crate::sensor::{decode_telemetry, BleEvent};
use crate::transport::{
    BleTransport, DisconnectHandler, NotificationHandler, COEFFICIENTS_CHARACTERISTIC_UUID, SENSOR_CHARACTERISTIC_UUID,
    SERVICE_UUID,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BleSettings {
    pub name_prefix: String,
    pub connect_timeout: Duration,
    /// Reconnect to the persisted device during `initialize`
    pub auto_reconnect: bool,
}

impl From<&Config> for BleSettings {
    fn from(config: &Config) -> Self {
        Self {
            name_prefix: config.device_name_prefix.clone(),
            connect_timeout: config.connect_timeout(),
            auto_reconnect: config.enable_autoconnect,
        }
    }
}

#[derive(Clone)]
pub struct BleService {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn BleTransport>,
    machine: Mutex<ConnectionMachine>,
    listeners: ListenerRegistry,
    settings: BleSettings,
    ready: AtomicBool,
    // Serializes connect/disconnect sequences
    op_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn machine(&self) -> MutexGuard<'_, ConnectionMachine> {
        self.machine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `transition` and notifies listeners if the state moved, even
    /// when persisting the record failed.
    /// Applies `transition` and returns the new state if it changed.
    fn apply(&self, transition: Transition) -> Result<Option<ConnectionState>, RecordStoreError> {
        let (result, changed) = {
            let mut machine = self.machine();
            let before = machine.state().clone();
            let result = machine.apply(transition);
            let after = machine.state().clone();
            (result, (before != after).then_some(after))
        };
        if let Some(state) = &changed {
            self.listeners.emit(&BleEvent::StateChanged(state.clone()));
        }
        result.map(|_| changed)
    }
}

impl BleService {
    pub fn new(transport: Arc<dyn BleTransport>, records: Arc<dyn RecordStore>, settings: BleSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                machine: Mutex::new(ConnectionMachine::new(records)),
                listeners: ListenerRegistry::new(),
                settings,
                ready: AtomicBool::new(false),
                op_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Registers a listener for state changes and telemetry
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&BleEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(listener)
    }

    pub fn unsubscribe(&self, token: Subscription) -> bool {
        self.inner.listeners.unsubscribe(token)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine().state().clone()
    }

    pub fn connected_device_id(&self) -> Option<String> {
        match self.state() {
            ConnectionState::Connected(record) => Some(record.device_id),
            _ => None,
        }
    }

    /// Brings up the BLE stack and, if a device was paired before and no
    /// link is up, tries to reconnect to it.
    ///
    /// The stack is brought up once; later calls only retry the reconnect.
    /// Returns `Ok(false)` when the host has no BLE support. A failed
    /// reconnect is logged and does not fail initialization.
    pub async fn initialize(&self) -> Result<bool, BleError> {
        if !self.inner.ready.load(Ordering::SeqCst) {
            if !self.inner.transport.is_available().await {
                log::warn!("Bluetooth not available on this host");
                return Ok(false);
            }
            match self.inner.transport.initialize().await {
                Ok(()) => {}
                Err(TransportError::Unavailable) | Err(TransportError::NoAdapter) => {
                    log::warn!("Bluetooth not available on this host");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
            self.inner.ready.store(true, Ordering::SeqCst);
        }

        if self.inner.settings.auto_reconnect && self.state() == ConnectionState::Disconnected {
            self.auto_reconnect().await;
        }
        Ok(true)
    }

    async fn auto_reconnect(&self) {
        let loaded = { self.inner.machine().load_record() };
        let record = match loaded {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                log::warn!("Could not read last connected device: {}", e);
                return;
            }
        };

        log::info!("Reconnecting to {} ({})", record.device_name, record.device_id);
        let result = self
            .connect_with_mode(
                &record.device_id,
                &record.device_name,
                &record.wifi_mac,
                ConnectMode::AutoReconnect,
            )
            .await;
        if let Err(e) = result {
            log::warn!("Auto-reconnect to {} failed: {}", record.device_name, e);
        }
    }

    /// Discovers AirScale sensors, connects to the selected one and returns
    /// its persisted record.
    pub async fn scan_and_connect(&self) -> Result<ConnectionRecord, BleError> {
        self.ensure_ready()?;
        let prefix = &self.inner.settings.name_prefix;
        let device = self
            .inner
            .transport
            .request_device(prefix)
            .await?
            .ok_or(BleError::Cancelled)?;

        let wifi_mac =
            extract_mac_with_prefix(&device.name, prefix).ok_or_else(|| BleError::UnrecognizedDevice(device.name.clone()))?;
        log::info!("Selected {} (MAC {})", device.name, wifi_mac);
        self.connect_to_device(&device.id, &device.name, &wifi_mac).await
    }

    pub async fn connect_to_device(
        &self,
        device_id: &str,
        device_name: &str,
        wifi_mac: &str,
    ) -> Result<ConnectionRecord, BleError> {
        self.connect_with_mode(device_id, device_name, wifi_mac, ConnectMode::Manual)
            .await
    }

    async fn connect_with_mode(
        &self,
        device_id: &str,
        device_name: &str,
        wifi_mac: &str,
        mode: ConnectMode,
    ) -> Result<ConnectionRecord, BleError> {
        self.ensure_ready()?;
        let _op = self.inner.op_lock.lock().await;

        self.teardown_link(Transition::Disconnect).await?;
        self.inner.apply(Transition::BeginConnect {
            device_id: device_id.to_string(),
            mode,
        })?;

        if let Err(e) = self.establish(device_id).await {
            self.abandon(device_id, mode).await;
            return Err(e);
        }

        let record = ConnectionRecord {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            wifi_mac: wifi_mac.to_string(),
        };
        match self.inner.apply(Transition::Established(record.clone())) {
            Ok(Some(_)) => Ok(record),
            // The link dropped during setup
            Ok(None) => {
                self.abandon(device_id, mode).await;
                Err(BleError::NotConnected)
            }
            Err(e) => {
                self.abandon(device_id, mode).await;
                Err(e.into())
            }
        }
    }

    async fn establish(&self, device_id: &str) -> Result<(), BleError> {
        let transport = &self.inner.transport;
        let timeout = self.inner.settings.connect_timeout;

        let connect = transport.connect(device_id, self.disconnect_handler(device_id));
        match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BleError::Timeout {
                    device_id: device_id.to_string(),
                    secs: timeout.as_secs(),
                })
            }
        }

        transport
            .start_notifications(
                device_id,
                SERVICE_UUID,
                SENSOR_CHARACTERISTIC_UUID,
                self.notification_handler(device_id),
            )
            .await?;
        Ok(())
    }

    /// Best-effort cleanup after a failed connect sequence
    async fn abandon(&self, device_id: &str, mode: ConnectMode) {
        if let Err(e) = self.inner.transport.disconnect(device_id).await {
            log::warn!("Failed to release {} after connect failure: {}", device_id, e);
        }
        if let Err(e) = self.inner.apply(Transition::ConnectFailed { mode }) {
            log::error!("Failed to clear connection record: {}", e);
        }
    }

    fn disconnect_handler(&self, device_id: &str) -> DisconnectHandler {
        let inner = Arc::downgrade(&self.inner);
        let device_id = device_id.to_string();
        Arc::new(move || {
            let Some(inner) = Weak::upgrade(&inner) else {
                return;
            };
            if let Err(e) = inner.apply(Transition::LinkLost {
                device_id: device_id.clone(),
            }) {
                log::warn!("Error handling disconnect of {}: {}", device_id, e);
            }
        })
    }

    fn notification_handler(&self, device_id: &str) -> NotificationHandler {
        let inner = Arc::downgrade(&self.inner);
        let device_id = device_id.to_string();
        Arc::new(move |payload: &[u8]| {
            let Some(inner) = Weak::upgrade(&inner) else {
                return;
            };
            match decode_telemetry(&device_id, payload) {
                Ok(telemetry) => {
                    inner.listeners.emit(&BleEvent::Telemetry(telemetry));
                }
                Err(e) => log::warn!("Dropping malformed telemetry from {}: {}", device_id, e),
            }
        })
    }

    /// Writes `coefficients` to the connected sensor. Delivery is confirmed
    /// by the link-layer write acknowledgment only.
    pub async fn send_coefficients(&self, coefficients: &CoefficientSet) -> Result<(), BleError> {
        self.ensure_ready()?;
        let device_id = self.connected_device_id().ok_or(BleError::NotConnected)?;
        let payload = coefficients.to_wire()?;

        self.inner
            .transport
            .write(&device_id, SERVICE_UUID, COEFFICIENTS_CHARACTERISTIC_UUID, &payload)
            .await?;
        log::info!(
            "Sent coefficients for target '{}' to {}",
            coefficients.target_mac,
            device_id
        );
        Ok(())
    }

    /// Drops the radio link. The record is kept for the next `initialize`.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        self.ensure_ready()?;
        let _op = self.inner.op_lock.lock().await;
        self.teardown_link(Transition::Disconnect).await
    }

    /// Drops the radio link and erases the persisted record
    pub async fn forget_device(&self) -> Result<(), BleError> {
        self.ensure_ready()?;
        let _op = self.inner.op_lock.lock().await;
        self.teardown_link(Transition::Forget).await
    }

    /// Releases the current link, if any, and applies `transition`.
    /// The in-memory state is updated even if the radio call fails.
    async fn teardown_link(&self, transition: Transition) -> Result<(), BleError> {
        let current = self.state().device_id().map(str::to_string);
        let released = match &current {
            Some(device_id) => self.inner.transport.disconnect(device_id).await,
            None => Ok(()),
        };
        self.inner.apply(transition)?;
        released?;
        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), BleError> {
        if self.inner.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BleError::Unavailable)
        }
    }
}
