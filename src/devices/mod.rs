pub mod supply;

pub use supply::{PointSpec, SupplyDevice, Observation};

use crate::error::{DcsError, DcsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const LV_BOARDS: core::ops::RangeInclusive<u8> = 0..=4;
pub const LV_CHANNELS: core::ops::RangeInclusive<u8> = 0..=7;
pub const HV_BOARDS: core::ops::RangeInclusive<u8> = 12..=15;
pub const HV_CHANNELS: core::ops::RangeInclusive<u8> = 0..=11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Lv,
    Hv,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Lv => "lv",
            Stage::Hv => "hv",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "lv" => Some(Stage::Lv),
            "hv" => Some(Stage::Hv),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Board and sub-channel of one supply stage inside the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub board: u8,
    pub chan: u8,
}

impl DeviceAddress {
    pub fn new(board: u8, chan: u8) -> Self {
        Self { board, chan }
    }

    pub fn validate(&self, stage: Stage) -> DcsResult<()> {
        let (boards, chans) = match stage {
            Stage::Lv => (LV_BOARDS, LV_CHANNELS),
            Stage::Hv => (HV_BOARDS, HV_CHANNELS),
        };
        if !boards.contains(&self.board) || !chans.contains(&self.chan) {
            return Err(DcsError::config(format!(
                "{} address board={} chan={} outside boards {:?} / channels {:?}",
                stage, self.board, self.chan, boards, chans
            )));
        }
        Ok(())
    }

    /// Point-name prefix shared by every point of this device, e.g. `cleanroom:00:003:`.
    pub fn point_prefix(&self, crate_prefix: &str) -> String {
        format!("{}:{:02}:{:03}:", crate_prefix, self.board, self.chan)
    }
}

/// A raw process-variable value as delivered by, or written to, the hardware layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointValue {
    Number(f64),
    Text(String),
}

impl PointValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PointValue::Number(v) => Some(*v),
            PointValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Status words are small integers; anything fractional is not a status code.
    pub fn as_code(&self) -> Option<i64> {
        let v = self.as_f64()?;
        if v.is_finite() && v.fract() == 0.0 {
            Some(v as i64)
        } else {
            None
        }
    }

    pub fn text(s: &str) -> Self {
        PointValue::Text(s.to_string())
    }
}

impl From<f64> for PointValue {
    fn from(v: f64) -> Self {
        PointValue::Number(v)
    }
}

impl fmt::Display for PointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointValue::Number(v) => write!(f, "{}", v),
            PointValue::Text(s) => f.write_str(s),
        }
    }
}

/// Push notification from the monitoring layer, keyed by full point name.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Update { point: String, value: PointValue },
    Connection { point: String, connected: bool },
}

impl Notification {
    pub fn point(&self) -> &str {
        match self {
            Notification::Update { point, .. } | Notification::Connection { point, .. } => point,
        }
    }
}

/// Boundary to the power-supply I/O client.
///
/// The core never polls these points; after `attach` the implementation pushes
/// [`Notification`]s for them. Calls must not block indefinitely and must not deliver
/// notifications synchronously from inside `put`, since callers hold the channel lock.
pub trait PointIo: Send + Sync {
    fn attach(&self, device_prefix: &str, points: &[&'static str]) -> DcsResult<()>;
    fn reattach(&self, device_prefix: &str) -> DcsResult<()>;
    fn put(&self, point: &str, value: PointValue) -> DcsResult<()>;
}
