//! # Channel Registry
//!
//! Maps a physical device to its logical channels. A device is initialized
//! once with channels 1 and 2, after which its channel set never changes.
//! Lookups never create channels as a side effect.

use crate::calibration::CalibrationPoint;
use crate::error::RegistryError;
use crate::models::{Calibration, Channel, ChannelNumber, Device, DeviceId};
use crate::store::DeviceStore;

#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    Created(Vec<Channel>),
    /// The device already had at least one channel; nothing was written
    AlreadyInitialized,
}

pub struct ChannelRegistry<'a> {
    store: &'a dyn DeviceStore,
}

impl<'a> ChannelRegistry<'a> {
    pub fn new(store: &'a dyn DeviceStore) -> Self {
        Self { store }
    }

    /// Creates channels 1 and 2 for a device that has none.
    ///
    /// Returns `RegistryError::Conflict` when another writer initialized the
    /// device between our read and our insert. The caller should re-read and skip.
    pub fn initialize_default_channels(&self, device_id: DeviceId) -> Result<InitOutcome, RegistryError> {
        self.require_device(device_id)?;

        if !self.store.channels_for(device_id)?.is_empty() {
            return Ok(InitOutcome::AlreadyInitialized);
        }

        let created = self.store.insert_channels(device_id, &ChannelNumber::all())?;
        log::debug!("initialized {} channels for device {}", created.len(), device_id);
        Ok(InitOutcome::Created(created))
    }

    /// Adds a new device and gives it its default channels in one store write.
    pub fn register_device(&self, device: Device) -> Result<Vec<Channel>, RegistryError> {
        let device_id = device.id;
        let channels = self.store.create_device(device, &ChannelNumber::all())?;
        log::info!("registered device {} with {} channels", device_id, channels.len());
        Ok(channels)
    }

    pub fn get_channel(
        &self,
        device_id: DeviceId,
        number: ChannelNumber,
    ) -> Result<Option<Channel>, RegistryError> {
        Ok(self
            .store
            .channels_for(device_id)?
            .into_iter()
            .find(|c| c.number == number))
    }

    pub fn set_label(
        &self,
        device_id: DeviceId,
        number: ChannelNumber,
        label: Option<String>,
    ) -> Result<Channel, RegistryError> {
        let mut channel = self.require_channel(device_id, number)?;
        channel.label = label;
        self.store.update_channel(&channel)?;
        Ok(channel)
    }

    /// Moves a device to a new owner. Existing calibrations no longer describe
    /// the new owner's vehicle, so the device is flagged for recalibration.
    pub fn transfer_ownership(&self, device_id: DeviceId, new_owner: u64) -> Result<Device, RegistryError> {
        let mut device = self.require_device(device_id)?;
        if device.owner_id == new_owner {
            return Ok(device);
        }
        log::info!(
            "transferring device {} from owner {} to {}",
            device_id,
            device.owner_id,
            new_owner
        );
        device.owner_id = new_owner;
        device.needs_recalibration = true;
        self.store.update_device(&device)?;
        Ok(device)
    }

    /// Stores the BLE peripheral id and hub MAC learned when pairing.
    pub fn record_pairing(
        &self,
        device_id: DeviceId,
        ble_device_id: &str,
        wifi_mac: &str,
    ) -> Result<Device, RegistryError> {
        let mut device = self.require_device(device_id)?;
        if let Some(known) = device.wifi_mac.as_deref() {
            if !known.eq_ignore_ascii_case(wifi_mac) {
                log::warn!(
                    "device {} was registered with MAC {} but paired sensor reports {}",
                    device_id,
                    known,
                    wifi_mac
                );
            }
        }
        device.ble_device_id = Some(ble_device_id.to_string());
        device.wifi_mac = Some(wifi_mac.to_string());
        self.store.update_device(&device)?;
        Ok(device)
    }

    /// Fits `points` and stores the calibration against the channel.
    pub fn record_calibration(
        &self,
        device_id: DeviceId,
        number: ChannelNumber,
        points: Vec<CalibrationPoint>,
    ) -> Result<Calibration, RegistryError> {
        if number == ChannelNumber::Two {
            // Channel 2 is only meaningful once channel 1 exists
            self.require_channel(device_id, ChannelNumber::One)?;
        }
        let channel = self.require_channel(device_id, number)?;
        let calibration = Calibration::from_points(device_id, channel.id, points)?;
        let stored = self.store.insert_calibration(calibration)?;

        let mut device = self.require_device(device_id)?;
        if device.needs_recalibration {
            device.needs_recalibration = false;
            self.store.update_device(&device)?;
        }
        Ok(stored)
    }

    pub fn latest_calibration(
        &self,
        device_id: DeviceId,
        number: ChannelNumber,
    ) -> Result<Option<Calibration>, RegistryError> {
        let Some(channel) = self.get_channel(device_id, number)? else {
            return Ok(None);
        };
        Ok(self
            .store
            .calibrations_for_channel(channel.id)?
            .into_iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))))
    }

    fn require_device(&self, device_id: DeviceId) -> Result<Device, RegistryError> {
        self.store
            .device(device_id)?
            .ok_or(RegistryError::DeviceNotFound(device_id))
    }

    fn require_channel(&self, device_id: DeviceId, number: ChannelNumber) -> Result<Channel, RegistryError> {
        self.get_channel(device_id, number)?
            .ok_or(RegistryError::ChannelNotFound {
                device_id,
                number: number.as_u8(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryStore;

    fn store_with_device(id: DeviceId) -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_device(Device::new(id, "Trailer", 10));
        store
    }

    fn two_points() -> Vec<CalibrationPoint> {
        vec![CalibrationPoint::new(10.0, 0.0), CalibrationPoint::new(50.0, 1000.0)]
    }

    #[test]
    fn test_initialize_creates_channels_one_and_two() {
        let store = store_with_device(1);
        let registry = ChannelRegistry::new(&store);

        let outcome = registry.initialize_default_channels(1).unwrap();
        let InitOutcome::Created(channels) = outcome else {
            panic!("expected channels to be created");
        };
        let numbers: Vec<ChannelNumber> = channels.iter().map(|c| c.number).collect();
        assert_eq!(numbers, vec![ChannelNumber::One, ChannelNumber::Two]);
    }

    #[test]
    fn test_register_device_creates_channels() {
        let store = MemoryStore::new();
        let registry = ChannelRegistry::new(&store);

        let channels = registry.register_device(Device::new(3, "Tractor", 10)).unwrap();
        assert_eq!(channels.len(), 2);
        assert!(registry.get_channel(3, ChannelNumber::Two).unwrap().is_some());

        let again = registry.register_device(Device::new(3, "Tractor", 11));
        assert!(matches!(
            again,
            Err(RegistryError::Store(StoreError::DuplicateDevice(3)))
        ));
        assert_eq!(store.device(3).unwrap().unwrap().owner_id, 10);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let store = store_with_device(1);
        let registry = ChannelRegistry::new(&store);

        registry.initialize_default_channels(1).unwrap();
        assert_eq!(
            registry.initialize_default_channels(1).unwrap(),
            InitOutcome::AlreadyInitialized
        );
        assert_eq!(store.channels_for(1).unwrap().len(), 2);
    }

    #[test]
    fn test_concurrent_initialize_reports_conflict_without_duplicates() {
        let store = store_with_device(1);
        store.inject_concurrent_init(1);
        let registry = ChannelRegistry::new(&store);

        let err = registry.initialize_default_channels(1).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { device_id: 1 }));
        assert_eq!(store.channels_for(1).unwrap().len(), 2);
    }

    #[test]
    fn test_initialize_unknown_device() {
        let store = MemoryStore::new();
        let registry = ChannelRegistry::new(&store);
        assert!(matches!(
            registry.initialize_default_channels(42),
            Err(RegistryError::DeviceNotFound(42))
        ));
    }

    #[test]
    fn test_get_channel_never_creates() {
        let store = store_with_device(1);
        let registry = ChannelRegistry::new(&store);

        assert_eq!(registry.get_channel(1, ChannelNumber::One).unwrap(), None);
        assert!(store.channels_for(1).unwrap().is_empty());
    }

    #[test]
    fn test_set_label() {
        let store = store_with_device(1);
        let registry = ChannelRegistry::new(&store);
        registry.initialize_default_channels(1).unwrap();

        registry
            .set_label(1, ChannelNumber::Two, Some("Drive axle".into()))
            .unwrap();
        let channel = registry.get_channel(1, ChannelNumber::Two).unwrap().unwrap();
        assert_eq!(channel.label.as_deref(), Some("Drive axle"));
    }

    #[test]
    fn test_transfer_flags_recalibration_until_next_calibration() {
        let store = store_with_device(1);
        let registry = ChannelRegistry::new(&store);
        registry.initialize_default_channels(1).unwrap();

        let device = registry.transfer_ownership(1, 20).unwrap();
        assert_eq!(device.owner_id, 20);
        assert!(device.needs_recalibration);

        registry
            .record_calibration(1, ChannelNumber::One, two_points())
            .unwrap();
        assert!(!store.device(1).unwrap().unwrap().needs_recalibration);
    }

    #[test]
    fn test_record_pairing_stores_ble_id_and_mac() {
        let store = store_with_device(1);
        let registry = ChannelRegistry::new(&store);

        let device = registry
            .record_pairing(1, "hci0/dev_9C_13", "9C:13:9E:BA:DC:90")
            .unwrap();
        assert_eq!(device.ble_device_id.as_deref(), Some("hci0/dev_9C_13"));
        assert_eq!(store.device(1).unwrap().unwrap(), device);

        assert!(matches!(
            registry.record_pairing(9, "x", "9C:13:9E:BA:DC:90"),
            Err(RegistryError::DeviceNotFound(9))
        ));
    }

    #[test]
    fn test_record_calibration_requires_channel() {
        let store = store_with_device(1);
        let registry = ChannelRegistry::new(&store);
        assert!(matches!(
            registry.record_calibration(1, ChannelNumber::Two, two_points()),
            Err(RegistryError::ChannelNotFound { number: 1, .. })
        ));
    }

    #[test]
    fn test_latest_calibration_per_channel() {
        let store = store_with_device(1);
        let registry = ChannelRegistry::new(&store);
        registry.initialize_default_channels(1).unwrap();

        registry
            .record_calibration(1, ChannelNumber::One, two_points())
            .unwrap();
        let second = registry
            .record_calibration(
                1,
                ChannelNumber::One,
                vec![CalibrationPoint::new(0.0, 0.0), CalibrationPoint::new(40.0, 800.0)],
            )
            .unwrap();

        let latest = registry.latest_calibration(1, ChannelNumber::One).unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert!(registry.latest_calibration(1, ChannelNumber::Two).unwrap().is_none());
    }
}
