//! # Migration / Backfill Engine
//!
//! Retrofits the channel model onto data created before channels existed.
//! Both procedures are idempotent: once a run completes, running again
//! changes nothing.
//!
//! 1. Channel backfill: every device with no channels gets channels 1 and 2.
//! 2. Calibration reassignment: every calibration with no channel is moved
//!    onto its device's channel 1. Depends on (1) having run.
//!
//! Per-row failures are tallied and the run continues. Reassignment stages
//! every update and commits them with a single flush at the end; a failed
//! flush rolls the whole batch back.
//!
//! The whole pending set is processed in one pass and one transaction. Very
//! large backlogs would need chunked commits.

use crate::channels::{ChannelRegistry, InitOutcome};
use crate::error::{MigrationError, RegistryError};
use crate::models::{CalibrationId, ChannelNumber, DeviceId};
use crate::store::DeviceStore;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRef {
    Device(DeviceId),
    Calibration(CalibrationId),
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowRef::Device(id) => write!(f, "device {}", id),
            RowRef::Calibration(id) => write!(f, "calibration {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub row: RowRef,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub total: usize,
    pub changed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub errors: Vec<RowError>,
}

impl MigrationReport {
    fn record_error(&mut self, row: RowRef, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}: {}", row, message);
        self.errored += 1;
        self.errors.push(RowError { row, message });
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} changed={} skipped={} errored={}",
            self.total, self.changed, self.skipped, self.errored
        )
    }
}

pub struct MigrationEngine<'a> {
    store: &'a dyn DeviceStore,
    registry: ChannelRegistry<'a>,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(store: &'a dyn DeviceStore) -> Self {
        Self {
            store,
            registry: ChannelRegistry::new(store),
        }
    }

    /// Creates default channels for every device that has none.
    ///
    /// `total` counts every device; devices that already had channels, or
    /// were initialized concurrently by another writer, count as skipped.
    pub fn backfill_channels(&self) -> Result<MigrationReport, MigrationError> {
        let mut report = MigrationReport {
            total: self.store.count_devices()?,
            ..Default::default()
        };
        let pending = self.store.find_devices_without_channels()?;
        report.skipped = report.total.saturating_sub(pending.len());
        log::info!(
            "channel backfill: {} of {} devices have no channels",
            pending.len(),
            report.total
        );

        for device in pending {
            match self.registry.initialize_default_channels(device.id) {
                Ok(InitOutcome::Created(_)) => report.changed += 1,
                Ok(InitOutcome::AlreadyInitialized) => report.skipped += 1,
                Err(RegistryError::Conflict { .. }) => {
                    log::debug!("device {} initialized concurrently, skipping", device.id);
                    report.skipped += 1;
                }
                Err(e) => report.record_error(RowRef::Device(device.id), e.to_string()),
            }
        }

        log::info!("channel backfill finished: {}", report);
        Ok(report)
    }

    /// Assigns every channel-less calibration to its device's channel 1.
    pub fn reassign_calibrations(&self) -> Result<MigrationReport, MigrationError> {
        let pending = self.store.find_calibrations_without_channel()?;
        let mut report = MigrationReport {
            total: pending.len(),
            ..Default::default()
        };
        log::info!("calibration reassignment: {} calibrations without a channel", pending.len());

        let mut staged = 0usize;
        for mut calibration in pending {
            let row = RowRef::Calibration(calibration.id);
            match self.registry.get_channel(calibration.device_id, ChannelNumber::One) {
                Ok(Some(channel)) => {
                    calibration.channel_id = Some(channel.id);
                    match self.store.save_calibration(calibration) {
                        Ok(()) => staged += 1,
                        Err(e) => report.record_error(row, e.to_string()),
                    }
                }
                Ok(None) => report.record_error(
                    row,
                    format!(
                        "device {} has no channel 1; run the channel backfill first",
                        calibration.device_id
                    ),
                ),
                Err(e) => report.record_error(row, e.to_string()),
            }
        }

        if staged > 0 {
            match self.store.flush() {
                Ok(written) => report.changed = written,
                Err(source) => {
                    self.store.rollback();
                    log::error!("calibration reassignment commit failed, rolled back {} rows", staged);
                    return Err(MigrationError::CommitFailed { report, source });
                }
            }
        }

        log::info!("calibration reassignment finished: {}", report);
        Ok(report)
    }

    /// Runs both procedures in dependency order.
    pub fn run_all(&self) -> Result<(MigrationReport, MigrationReport), MigrationError> {
        let channels = self.backfill_channels()?;
        let calibrations = self.reassign_calibrations()?;
        Ok((channels, calibrations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationPoint, LinearModel};
    use crate::models::{Calibration, Device};
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn legacy_calibration(id: CalibrationId, device_id: DeviceId) -> Calibration {
        Calibration {
            id,
            device_id,
            channel_id: None,
            points: vec![CalibrationPoint::new(10.0, 0.0), CalibrationPoint::new(50.0, 1000.0)],
            model: LinearModel::default(),
            created_at: Utc::now(),
        }
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        for id in 1..=3 {
            store.insert_device(Device::new(id, format!("Unit {}", id), 10));
        }
        store
    }

    #[test]
    fn test_backfill_creates_both_channels_then_is_idempotent() {
        let store = seeded_store();
        let engine = MigrationEngine::new(&store);

        let first = engine.backfill_channels().unwrap();
        assert_eq!((first.total, first.changed, first.skipped, first.errored), (3, 3, 0, 0));
        for id in 1..=3 {
            let numbers: Vec<ChannelNumber> =
                store.channels_for(id).unwrap().iter().map(|c| c.number).collect();
            assert_eq!(numbers, vec![ChannelNumber::One, ChannelNumber::Two]);
        }

        let second = engine.backfill_channels().unwrap();
        assert_eq!((second.total, second.changed, second.skipped), (3, 0, 3));
    }

    #[test]
    fn test_backfill_skips_initialized_devices() {
        let store = seeded_store();
        ChannelRegistry::new(&store).initialize_default_channels(2).unwrap();

        let report = MigrationEngine::new(&store).backfill_channels().unwrap();
        assert_eq!((report.changed, report.skipped), (2, 1));
    }

    #[test]
    fn test_backfill_counts_concurrent_init_as_skipped() {
        let store = seeded_store();
        store.inject_concurrent_init(1);

        let report = MigrationEngine::new(&store).backfill_channels().unwrap();
        assert_eq!((report.changed, report.skipped, report.errored), (2, 1, 0));
        assert_eq!(store.channels_for(1).unwrap().len(), 2);
    }

    #[test]
    fn test_backfill_failure_on_one_device_continues_with_the_rest() {
        let store = seeded_store();
        store.fail_channels_for(2);

        let report = MigrationEngine::new(&store).backfill_channels().unwrap();
        assert_eq!(
            (report.total, report.changed, report.skipped, report.errored),
            (3, 2, 0, 1)
        );
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].row, RowRef::Device(2));
        assert!(store.channels_for(2).unwrap().is_empty());
        assert_eq!(store.channels_for(1).unwrap().len(), 2);
        assert_eq!(store.channels_for(3).unwrap().len(), 2);
    }

    #[test]
    fn test_reassignment_moves_calibrations_to_channel_one() {
        let store = seeded_store();
        store.insert_legacy_calibration(legacy_calibration(10, 1));
        store.insert_legacy_calibration(legacy_calibration(11, 2));
        let engine = MigrationEngine::new(&store);
        engine.backfill_channels().unwrap();

        let report = engine.reassign_calibrations().unwrap();
        assert_eq!((report.total, report.changed, report.errored), (2, 2, 0));

        let channel_one = ChannelRegistry::new(&store)
            .get_channel(1, ChannelNumber::One)
            .unwrap()
            .unwrap();
        assert_eq!(store.calibration(10).unwrap().channel_id, Some(channel_one.id));

        let again = engine.reassign_calibrations().unwrap();
        assert_eq!((again.total, again.changed), (0, 0));
    }

    #[test]
    fn test_reassignment_errors_when_channel_one_missing() {
        let store = seeded_store();
        store.insert_legacy_calibration(legacy_calibration(10, 1));
        store.insert_legacy_calibration(legacy_calibration(11, 2));
        ChannelRegistry::new(&store).initialize_default_channels(2).unwrap();

        let report = MigrationEngine::new(&store).reassign_calibrations().unwrap();
        assert_eq!((report.changed, report.errored), (1, 1));
        assert_eq!(report.errors[0].row, RowRef::Calibration(10));
        assert_eq!(store.calibration(10).unwrap().channel_id, None);
    }

    #[test]
    fn test_failed_commit_rolls_back_and_rerun_succeeds() {
        let store = seeded_store();
        store.insert_legacy_calibration(legacy_calibration(10, 1));
        store.insert_legacy_calibration(legacy_calibration(11, 2));
        let engine = MigrationEngine::new(&store);
        engine.backfill_channels().unwrap();

        store.fail_next_flush();
        let err = engine.reassign_calibrations().unwrap_err();
        assert!(matches!(err, MigrationError::CommitFailed { .. }));
        assert_eq!(store.find_calibrations_without_channel().unwrap().len(), 2);

        let report = engine.reassign_calibrations().unwrap();
        assert_eq!(report.changed, 2);
        assert!(store.find_calibrations_without_channel().unwrap().is_empty());
    }

    #[test]
    fn test_run_all_on_empty_store() {
        let store = MemoryStore::new();
        let (channels, calibrations) = MigrationEngine::new(&store).run_all().unwrap();
        assert_eq!(channels, MigrationReport::default());
        assert_eq!(calibrations, MigrationReport::default());
    }
}
