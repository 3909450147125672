//! # Connection Management Module
//!
//! Client-side connection lifecycle for an AirScale sensor, and the locally
//! persisted record of the last paired device used for auto-reconnect.
//!
//! ## States
//! - `Disconnected`
//! - `Connecting` (manual, or auto-reconnect started by `initialize`)
//! - `Connected` (link up and telemetry streaming)
//!
//! ## Why one transition function
//! The in-memory connection and the persisted `ConnectionRecord` only change
//! together, inside `ConnectionMachine::apply`. A connect that fails part way
//! can never leave a record on disk for a device that is not connected, or
//! the other way round.
//!
//! ## Persistence rules
//! | Transition | Record |
//! |---|---|
//! | link established | written (all three keys) |
//! | manual connect failed | cleared |
//! | auto-reconnect failed | kept, retried on next `initialize` |
//! | hardware disconnect / explicit disconnect | kept |
//! | forget | cleared |

use crate::error::RecordStoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const KEY_DEVICE_ID: &str = "last_device_id";
pub const KEY_DEVICE_NAME: &str = "last_device_name";
pub const KEY_WIFI_MAC: &str = "last_wifi_mac";

const RECORD_KEYS: [&str; 3] = [KEY_DEVICE_ID, KEY_DEVICE_NAME, KEY_WIFI_MAC];

/// Last successfully paired device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub device_id: String,
    pub device_name: String,
    pub wifi_mac: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Manual,
    AutoReconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { device_id: String, mode: ConnectMode },
    Connected(ConnectionRecord),
}

impl ConnectionState {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Disconnected => None,
            ConnectionState::Connecting { device_id, .. } => Some(device_id),
            ConnectionState::Connected(record) => Some(&record.device_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    BeginConnect { device_id: String, mode: ConnectMode },
    /// Link is up and the notification subscription succeeded
    Established(ConnectionRecord),
    /// Carries the mode of the failed attempt, which may no longer be
    /// visible in the state if the link was lost first
    ConnectFailed { mode: ConnectMode },
    /// Hardware reported the link dropped
    LinkLost { device_id: String },
    Disconnect,
    Forget,
}

/// String key/value storage for the connection record.
///
/// `set_all` must write its entries as one group.
pub trait RecordStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, RecordStoreError>;
    fn set_all(&self, entries: &[(&str, &str)]) -> Result<(), RecordStoreError>;
    fn remove(&self, key: &str) -> Result<(), RecordStoreError>;
}

/// TOML-backed `RecordStore`, one flat table per file
pub struct FileRecordStore {
    path: PathBuf,
}

impl FileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Platform data directory, e.g. ~/.local/share/airscale/connection.toml
    pub fn default_location() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(data_dir.join("airscale").join("connection.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, String>, RecordStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(RecordStoreError::ReadFailed(e)),
        }
    }

    /// Writes to a sibling temp file and renames it over the target, so a
    /// reader sees either the old table or the new one.
    fn write(&self, entries: &BTreeMap<String, String>) -> Result<(), RecordStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(RecordStoreError::WriteFailed)?;
        }
        let toml_string = toml::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, toml_string).map_err(RecordStoreError::WriteFailed)?;
        fs::rename(&tmp, &self.path).map_err(RecordStoreError::WriteFailed)?;
        Ok(())
    }
}

impl RecordStore for FileRecordStore {
    fn get(&self, key: &str) -> Result<Option<String>, RecordStoreError> {
        Ok(self.read()?.remove(key))
    }

    fn set_all(&self, entries: &[(&str, &str)]) -> Result<(), RecordStoreError> {
        let mut table = self.read()?;
        for (key, value) in entries {
            table.insert(key.to_string(), value.to_string());
        }
        self.write(&table)
    }

    fn remove(&self, key: &str) -> Result<(), RecordStoreError> {
        let mut table = self.read()?;
        if table.remove(key).is_some() {
            self.write(&table)?;
        }
        Ok(())
    }
}

/// Owns the current connection state and keeps the persisted record in step
/// with it.
pub struct ConnectionMachine {
    state: ConnectionState,
    records: Arc<dyn RecordStore>,
}

impl ConnectionMachine {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            records,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Reads the persisted record. A partially written record counts as none.
    pub fn load_record(&self) -> Result<Option<ConnectionRecord>, RecordStoreError> {
        let device_id = self.records.get(KEY_DEVICE_ID)?;
        let device_name = self.records.get(KEY_DEVICE_NAME)?;
        let wifi_mac = self.records.get(KEY_WIFI_MAC)?;
        Ok(match (device_id, device_name, wifi_mac) {
            (Some(device_id), Some(device_name), Some(wifi_mac)) => Some(ConnectionRecord {
                device_id,
                device_name,
                wifi_mac,
            }),
            _ => None,
        })
    }

    /// Applies `transition`, returning the new state when it changed.
    ///
    /// `Established` is accepted only while connecting to that same device;
    /// otherwise nothing is written and `Ok(None)` is returned. It persists
    /// first and leaves the state untouched if that fails. Teardown transitions always reach `Disconnected` in memory; a
    /// failure to clear the record is still reported.
    pub fn apply(&mut self, transition: Transition) -> Result<Option<ConnectionState>, RecordStoreError> {
        let next = match transition {
            Transition::BeginConnect { device_id, mode } => ConnectionState::Connecting { device_id, mode },
            Transition::Established(record) => {
                let pending = matches!(
                    &self.state,
                    ConnectionState::Connecting { device_id, .. } if *device_id == record.device_id
                );
                if !pending {
                    log::warn!("ignoring link established for {} while {:?}", record.device_id, self.state);
                    return Ok(None);
                }
                self.records.set_all(&[
                    (KEY_DEVICE_ID, record.device_id.as_str()),
                    (KEY_DEVICE_NAME, record.device_name.as_str()),
                    (KEY_WIFI_MAC, record.wifi_mac.as_str()),
                ])?;
                ConnectionState::Connected(record)
            }
            Transition::ConnectFailed { mode } => return self.teardown(mode == ConnectMode::Manual),
            Transition::LinkLost { device_id } => {
                if self.state.device_id() != Some(device_id.as_str()) {
                    log::debug!("ignoring disconnect from stale link {}", device_id);
                    return Ok(None);
                }
                return self.teardown(false);
            }
            Transition::Disconnect => return self.teardown(false),
            Transition::Forget => return self.teardown(true),
        };
        Ok(self.enter(next))
    }

    fn teardown(&mut self, clear_record: bool) -> Result<Option<ConnectionState>, RecordStoreError> {
        let changed = self.enter(ConnectionState::Disconnected);
        if clear_record {
            self.clear_record()?;
        }
        Ok(changed)
    }

    fn clear_record(&self) -> Result<(), RecordStoreError> {
        // Attempt every key even if one fails
        let mut first_err = None;
        for key in RECORD_KEYS {
            if let Err(e) = self.records.remove(key) {
                log::warn!("failed to clear {}: {}", key, e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn enter(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        if self.state == next {
            return None;
        }
        log::info!("connection: {:?} -> {:?}", self.state, next);
        self.state = next.clone();
        Some(next)
    }
}
