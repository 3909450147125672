//! Server-side data model: devices, their logical channels and the
//! calibrations fitted against each channel.

use crate::calibration::{CalibrationPoint, LinearModel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type DeviceId = u64;
pub type ChannelId = u64;
pub type CalibrationId = u64;

/// Logical sensor slot on a device. Only 1 and 2 exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChannelNumber {
    One,
    Two,
}

impl ChannelNumber {
    pub fn all() -> [ChannelNumber; 2] {
        [ChannelNumber::One, ChannelNumber::Two]
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ChannelNumber::One => 1,
            ChannelNumber::Two => 2,
        }
    }
}

impl TryFrom<u8> for ChannelNumber {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            1 => Ok(ChannelNumber::One),
            2 => Ok(ChannelNumber::Two),
            other => Err(format!("channel number must be 1 or 2, got {}", other)),
        }
    }
}

impl From<ChannelNumber> for u8 {
    fn from(n: ChannelNumber) -> Self {
        n.as_u8()
    }
}

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Physical hardware unit owned by an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub owner_id: u64,
    #[serde(default)]
    pub wifi_mac: Option<String>,
    /// Discovered at pairing time
    #[serde(default)]
    pub ble_device_id: Option<String>,
    /// Set on ownership transfer, cleared by the next calibration
    #[serde(default)]
    pub needs_recalibration: bool,
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, owner_id: u64) -> Self {
        Self {
            id,
            name: name.into(),
            owner_id,
            wifi_mac: None,
            ble_device_id: None,
            needs_recalibration: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub device_id: DeviceId,
    pub number: ChannelNumber,
    /// Axle-group name shown to the user
    #[serde(default)]
    pub label: Option<String>,
}

/// One linear-model fit for a channel.
///
/// `channel_id` is `None` only for rows created before channels existed;
/// the calibration reassignment procedure fills it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub id: CalibrationId,
    pub device_id: DeviceId,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    pub points: Vec<CalibrationPoint>,
    pub model: LinearModel,
    pub created_at: DateTime<Utc>,
}

impl Calibration {
    /// Fits `points` and stamps the result with the current time.
    /// The id is assigned by the store on insert.
    pub fn from_points(
        device_id: DeviceId,
        channel_id: ChannelId,
        points: Vec<CalibrationPoint>,
    ) -> Result<Self, crate::error::CalibrationError> {
        let model = crate::calibration::fit(&points)?;
        Ok(Self {
            id: 0,
            device_id,
            channel_id: Some(channel_id),
            points,
            model,
            created_at: Utc::now(),
        })
    }
}
