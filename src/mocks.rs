//! Scripted `BleTransport` for unit tests.

use crate::device_scanner::BluetoothDevice;
use crate::error::TransportError;
use crate::transport::{BleTransport, DisconnectHandler, NotificationHandler};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct MockState {
    log: Vec<String>,
    connected: Vec<String>,
    disconnect_handlers: HashMap<String, DisconnectHandler>,
    notification_handlers: HashMap<String, NotificationHandler>,
    writes: Vec<(String, Uuid, Vec<u8>)>,
    selection: Option<BluetoothDevice>,
    fail_connect: bool,
    fail_notifications: bool,
    drop_during_notifications: bool,
    hang_connect: bool,
}

pub struct MockTransport {
    available: bool,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            available: true,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn select(&self, device: Option<BluetoothDevice>) {
        self.state().selection = device;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn fail_notifications(&self, fail: bool) {
        self.state().fail_notifications = fail;
    }

    /// Reports the link as lost while the subscription is being set up
    pub fn drop_during_notifications(&self, drop: bool) {
        self.state().drop_during_notifications = drop;
    }

    pub fn hang_connect(&self, hang: bool) {
        self.state().hang_connect = hang;
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn connected(&self) -> Vec<String> {
        self.state().connected.clone()
    }

    pub fn writes(&self) -> Vec<(String, Uuid, Vec<u8>)> {
        self.state().writes.clone()
    }

    /// Delivers a notification as if it came from the sensor characteristic.
    pub fn notify(&self, device_id: &str, payload: &[u8]) {
        let handler = self.state().notification_handlers.get(device_id).cloned();
        if let Some(handler) = handler {
            handler(payload);
        }
    }

    /// Simulates the device going out of range.
    pub fn drop_link(&self, device_id: &str) {
        let handler = {
            let mut state = self.state();
            state.connected.retain(|id| id != device_id);
            state.notification_handlers.remove(device_id);
            state.disconnect_handlers.remove(device_id)
        };
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        if !self.available {
            return Err(TransportError::Unavailable);
        }
        self.state().log.push("initialize".into());
        Ok(())
    }

    async fn request_device(&self, name_prefix: &str) -> Result<Option<BluetoothDevice>, TransportError> {
        let mut state = self.state();
        state.log.push(format!("request {}", name_prefix));
        Ok(state.selection.clone())
    }

    async fn connect(&self, device_id: &str, on_disconnect: DisconnectHandler) -> Result<(), TransportError> {
        let hang = {
            let mut state = self.state();
            state.log.push(format!("connect {}", device_id));
            if state.fail_connect {
                return Err(TransportError::DeviceNotFound(device_id.to_string()));
            }
            state.hang_connect
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let mut state = self.state();
        state.connected.push(device_id.to_string());
        state.disconnect_handlers.insert(device_id.to_string(), on_disconnect);
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        state.log.push(format!("disconnect {}", device_id));
        state.connected.retain(|id| id != device_id);
        state.disconnect_handlers.remove(device_id);
        state.notification_handlers.remove(device_id);
        Ok(())
    }

    async fn start_notifications(
        &self,
        device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
        on_data: NotificationHandler,
    ) -> Result<(), TransportError> {
        let dropped = {
            let mut state = self.state();
            state.log.push(format!("notify {}", device_id));
            if state.fail_notifications {
                return Err(TransportError::CharacteristicNotFound(characteristic.to_string()));
            }
            state.notification_handlers.insert(device_id.to_string(), on_data);
            state.drop_during_notifications
        };
        if dropped {
            self.drop_link(device_id);
        }
        Ok(())
    }

    async fn write(
        &self,
        device_id: &str,
        _service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        state.log.push(format!("write {}", device_id));
        state
            .writes
            .push((device_id.to_string(), characteristic, payload.to_vec()));
        Ok(())
    }
}
