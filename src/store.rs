//! # Device Store
//!
//! Repository seam between the channel/calibration core and whatever
//! relational store holds Device, Channel and Calibration rows.
//!
//! `MemoryStore` keeps everything in memory behind a mutex and can load and
//! save a JSON snapshot, which is what the CLI migrates against.
//!
//! ## Guarantees a store must give
//! - `insert_channels` is all-or-nothing and rejects a `(device, number)`
//!   pair that already exists with `StoreError::Conflict`. This is the only
//!   concurrency control the registry relies on.
//! - `save_calibration` only stages. Staged rows become visible on `flush`,
//!   which commits all of them or none.

use crate::error::StoreError;
use crate::models::{Calibration, CalibrationId, Channel, ChannelId, ChannelNumber, Device, DeviceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub trait DeviceStore: Send + Sync {
    fn device(&self, id: DeviceId) -> Result<Option<Device>, StoreError>;
    fn count_devices(&self) -> Result<usize, StoreError>;
    /// Inserts the device together with its channels `numbers`, all or
    /// nothing. Fails with `StoreError::DuplicateDevice` if the id is taken.
    fn create_device(&self, device: Device, numbers: &[ChannelNumber]) -> Result<Vec<Channel>, StoreError>;
    fn update_device(&self, device: &Device) -> Result<(), StoreError>;

    fn channels_for(&self, device_id: DeviceId) -> Result<Vec<Channel>, StoreError>;
    fn insert_channels(
        &self,
        device_id: DeviceId,
        numbers: &[ChannelNumber],
    ) -> Result<Vec<Channel>, StoreError>;
    fn update_channel(&self, channel: &Channel) -> Result<(), StoreError>;

    /// Inserts immediately and returns the row with its assigned id.
    fn insert_calibration(&self, calibration: Calibration) -> Result<Calibration, StoreError>;
    fn calibrations_for_channel(&self, channel_id: ChannelId) -> Result<Vec<Calibration>, StoreError>;

    fn find_devices_without_channels(&self) -> Result<Vec<Device>, StoreError>;
    fn find_calibrations_without_channel(&self) -> Result<Vec<Calibration>, StoreError>;

    /// Stages an update to an existing calibration.
    fn save_calibration(&self, calibration: Calibration) -> Result<(), StoreError>;
    /// Commits every staged update. Returns how many rows were written.
    fn flush(&self) -> Result<usize, StoreError>;
    /// Discards staged updates.
    fn rollback(&self);
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    devices: Vec<Device>,
    channels: Vec<Channel>,
    calibrations: Vec<Calibration>,
}

#[derive(Debug, Default)]
struct State {
    devices: BTreeMap<DeviceId, Device>,
    channels: BTreeMap<ChannelId, Channel>,
    calibrations: BTreeMap<CalibrationId, Calibration>,
    next_channel_id: ChannelId,
    next_calibration_id: CalibrationId,
    pending: Vec<Calibration>,
    #[cfg(test)]
    faults: Faults,
}

#[cfg(test)]
#[derive(Debug, Default)]
struct Faults {
    fail_next_flush: bool,
    concurrent_init: Option<DeviceId>,
    fail_channels_for: Option<DeviceId>,
}

impl State {
    fn has_channel(&self, device_id: DeviceId, number: ChannelNumber) -> bool {
        self.channels
            .values()
            .any(|c| c.device_id == device_id && c.number == number)
    }

    fn push_channel(&mut self, device_id: DeviceId, number: ChannelNumber) -> Channel {
        let channel = Channel {
            id: self.next_channel_id,
            device_id,
            number,
            label: None,
        };
        self.next_channel_id += 1;
        self.channels.insert(channel.id, channel.clone());
        channel
    }
}

/// In-memory `DeviceStore` with optional JSON snapshot persistence
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_channel_id: 1,
                next_calibration_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Loads a snapshot written by `save`, or an empty store if the file is missing.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let snapshot: Snapshot = match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e.into()),
        };

        let store = Self::new();
        {
            let mut state = store.state();
            state.next_channel_id = snapshot.channels.iter().map(|c| c.id + 1).max().unwrap_or(1);
            state.next_calibration_id = snapshot
                .calibrations
                .iter()
                .map(|c| c.id + 1)
                .max()
                .unwrap_or(1);
            state.devices = snapshot.devices.into_iter().map(|d| (d.id, d)).collect();
            state.channels = snapshot.channels.into_iter().map(|c| (c.id, c)).collect();
            state.calibrations = snapshot.calibrations.into_iter().map(|c| (c.id, c)).collect();
        }
        Ok(store)
    }

    /// Writes committed rows only. Staged updates are not included.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = {
            let state = self.state();
            let snapshot = Snapshot {
                devices: state.devices.values().cloned().collect(),
                channels: state.channels.values().cloned().collect(),
                calibrations: state.calibrations.values().cloned().collect(),
            };
            serde_json::to_string_pretty(&snapshot)?
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn insert_device(&self, device: Device) {
        self.state().devices.insert(device.id, device);
    }

    #[cfg(test)]
    pub fn calibration(&self, id: CalibrationId) -> Option<Calibration> {
        self.state().calibrations.get(&id).cloned()
    }

    /// Inserts a calibration exactly as given, keeping its id. Used to seed
    /// legacy rows that predate channels.
    #[cfg(test)]
    pub fn insert_legacy_calibration(&self, calibration: Calibration) {
        let mut state = self.state();
        state.next_calibration_id = state.next_calibration_id.max(calibration.id + 1);
        state.calibrations.insert(calibration.id, calibration);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub fn fail_next_flush(&self) {
        self.state().faults.fail_next_flush = true;
    }

    /// The next `insert_channels` for `device_id` finds that another writer
    /// has already created channels 1 and 2.
    #[cfg(test)]
    pub fn inject_concurrent_init(&self, device_id: DeviceId) {
        self.state().faults.concurrent_init = Some(device_id);
    }

    /// Every `insert_channels` for `device_id` fails to commit.
    #[cfg(test)]
    pub fn fail_channels_for(&self, device_id: DeviceId) {
        self.state().faults.fail_channels_for = Some(device_id);
    }
}

impl DeviceStore for MemoryStore {
    fn device(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        Ok(self.state().devices.get(&id).cloned())
    }

    fn count_devices(&self) -> Result<usize, StoreError> {
        Ok(self.state().devices.len())
    }

    fn create_device(&self, device: Device, numbers: &[ChannelNumber]) -> Result<Vec<Channel>, StoreError> {
        let mut state = self.state();
        let device_id = device.id;
        if state.devices.contains_key(&device_id) {
            return Err(StoreError::DuplicateDevice(device_id));
        }
        // Orphaned channel rows from a hand-edited snapshot
        if let Some(&number) = numbers.iter().find(|&&n| state.has_channel(device_id, n)) {
            return Err(StoreError::Conflict {
                device_id,
                number: number.as_u8(),
            });
        }
        state.devices.insert(device_id, device);
        Ok(numbers
            .iter()
            .map(|&number| state.push_channel(device_id, number))
            .collect())
    }

    fn update_device(&self, device: &Device) -> Result<(), StoreError> {
        let mut state = self.state();
        match state.devices.get_mut(&device.id) {
            Some(row) => {
                *row = device.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("device {}", device.id))),
        }
    }

    fn channels_for(&self, device_id: DeviceId) -> Result<Vec<Channel>, StoreError> {
        let mut channels: Vec<Channel> = self
            .state()
            .channels
            .values()
            .filter(|c| c.device_id == device_id)
            .cloned()
            .collect();
        channels.sort_by_key(|c| c.number);
        Ok(channels)
    }

    fn insert_channels(
        &self,
        device_id: DeviceId,
        numbers: &[ChannelNumber],
    ) -> Result<Vec<Channel>, StoreError> {
        let mut state = self.state();
        if !state.devices.contains_key(&device_id) {
            return Err(StoreError::NotFound(format!("device {}", device_id)));
        }

        #[cfg(test)]
        if state.faults.fail_channels_for == Some(device_id) {
            return Err(StoreError::CommitFailed(format!("channels for device {}", device_id)));
        }
        #[cfg(test)]
        if state.faults.concurrent_init == Some(device_id) {
            state.faults.concurrent_init = None;
            for number in ChannelNumber::all() {
                state.push_channel(device_id, number);
            }
        }

        // Unique (device_id, number): check everything before writing anything
        if let Some(&number) = numbers.iter().find(|&&n| state.has_channel(device_id, n)) {
            return Err(StoreError::Conflict {
                device_id,
                number: number.as_u8(),
            });
        }
        Ok(numbers
            .iter()
            .map(|&number| state.push_channel(device_id, number))
            .collect())
    }

    fn update_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        let mut state = self.state();
        match state.channels.get_mut(&channel.id) {
            Some(row) => {
                *row = channel.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("channel {}", channel.id))),
        }
    }

    fn insert_calibration(&self, mut calibration: Calibration) -> Result<Calibration, StoreError> {
        let mut state = self.state();
        calibration.id = state.next_calibration_id;
        state.next_calibration_id += 1;
        state.calibrations.insert(calibration.id, calibration.clone());
        Ok(calibration)
    }

    fn calibrations_for_channel(&self, channel_id: ChannelId) -> Result<Vec<Calibration>, StoreError> {
        Ok(self
            .state()
            .calibrations
            .values()
            .filter(|c| c.channel_id == Some(channel_id))
            .cloned()
            .collect())
    }

    fn find_devices_without_channels(&self) -> Result<Vec<Device>, StoreError> {
        let state = self.state();
        Ok(state
            .devices
            .values()
            .filter(|d| !state.channels.values().any(|c| c.device_id == d.id))
            .cloned()
            .collect())
    }

    fn find_calibrations_without_channel(&self) -> Result<Vec<Calibration>, StoreError> {
        Ok(self
            .state()
            .calibrations
            .values()
            .filter(|c| c.channel_id.is_none())
            .cloned()
            .collect())
    }

    fn save_calibration(&self, calibration: Calibration) -> Result<(), StoreError> {
        self.state().pending.push(calibration);
        Ok(())
    }

    fn flush(&self) -> Result<usize, StoreError> {
        let mut state = self.state();

        #[cfg(test)]
        if std::mem::take(&mut state.faults.fail_next_flush) {
            state.pending.clear();
            return Err(StoreError::CommitFailed("injected flush failure".into()));
        }

        let missing = state
            .pending
            .iter()
            .find(|c| !state.calibrations.contains_key(&c.id))
            .map(|c| c.id);
        if let Some(id) = missing {
            state.pending.clear();
            return Err(StoreError::CommitFailed(format!("calibration {} does not exist", id)));
        }

        let pending = std::mem::take(&mut state.pending);
        let written = pending.len();
        for calibration in pending {
            state.calibrations.insert(calibration.id, calibration);
        }
        Ok(written)
    }

    fn rollback(&self) {
        self.state().pending.clear();
    }
}
