//! Recirculating chiller behind a line-oriented serial link.

use crate::error::{DcsError, DcsResult};
use crate::protocol::{ChillerCommand, CHILLER_SETPOINTS};
use crate::telemetry::Publishable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, error, info, warn, Span};

/// Chiller remote-control primitives. Errors are communication failures.
pub trait ChillerLink: Send {
    fn open(&mut self) -> DcsResult<()>;
    /// Numeric status code and the device's message.
    fn status(&mut self) -> DcsResult<(i32, String)>;
    fn internal_temperature(&mut self) -> DcsResult<f64>;
    fn external_temperature(&mut self) -> DcsResult<f64>;
    fn power(&mut self) -> DcsResult<f64>;
    fn setpoint(&mut self, index: u8) -> DcsResult<f64>;
    fn active_setpoint(&mut self) -> DcsResult<u8>;
    fn external_sensor_used(&mut self) -> DcsResult<bool>;
    fn set_working_temperature(&mut self, index: u8, temp: f64) -> DcsResult<()>;
    fn select_setpoint(&mut self, index: u8) -> DcsResult<()>;
    fn use_external_sensor(&mut self, external: bool) -> DcsResult<()>;
    fn set_pressure_stage(&mut self, stage: u8) -> DcsResult<()>;
    fn set_running(&mut self, on: bool) -> DcsResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChillerState {
    Disconnected,
    Connected,
    Off,
    On,
    Error,
}

impl ChillerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChillerState::Disconnected => "DISCONNECTED",
            ChillerState::Connected => "CONNECTED",
            ChillerState::Off => "OFF",
            ChillerState::On => "ON",
            ChillerState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ChillerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negative codes are faults, 0 and 1 mean the unit is under manual control.
pub fn state_from_status(code: i32) -> Option<ChillerState> {
    match code {
        c if c < 2 => Some(ChillerState::Error),
        2 => Some(ChillerState::Off),
        3 => Some(ChillerState::On),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChillerReadings {
    pub status_code: Option<i32>,
    pub status_message: Option<String>,
    pub internal_temp: Option<f64>,
    pub external_temp: Option<f64>,
    pub setpoint_1: Option<f64>,
    pub setpoint_2: Option<f64>,
    pub setpoint_3: Option<f64>,
    pub used_setpoint: Option<u8>,
    pub power: Option<f64>,
    pub ext_is_used: Option<bool>,
}

pub struct Chiller {
    name: String,
    state: ChillerState,
    link: Box<dyn ChillerLink>,
    readings: ChillerReadings,
    changed: bool,
    span: Span,
}

impl fmt::Debug for Chiller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chiller")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("readings", &self.readings)
            .finish_non_exhaustive()
    }
}

impl Chiller {
    pub fn new(name: impl Into<String>, link: Box<dyn ChillerLink>, parent: &Span) -> Self {
        let name = name.into();
        let span = tracing::info_span!(parent: parent, "chiller", name = %name);
        Self {
            name,
            state: ChillerState::Disconnected,
            link,
            readings: ChillerReadings::default(),
            changed: true,
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChillerState {
        self.state
    }

    pub fn readings(&self) -> &ChillerReadings {
        &self.readings
    }

    fn enter(&mut self, next: ChillerState) {
        if next != self.state {
            info!(parent: &self.span, from = %self.state, to = %next, "FSM state change");
            self.state = next;
            self.changed = true;
        }
    }

    fn checked<T>(&mut self, result: DcsResult<T>) -> DcsResult<T> {
        if let Err(e) = &result {
            if e.is_communication_failure() {
                error!(parent: &self.span, error = %e, "serial link failure");
                self.enter(ChillerState::Disconnected);
            }
        }
        result
    }

    fn require_connected(&self, action: &str) -> DcsResult<()> {
        if self.state == ChillerState::Disconnected {
            warn!(parent: &self.span, "rejected {}", action);
            return Err(DcsError::rejected(format!("{} not allowed in state {}", action, self.state)));
        }
        Ok(())
    }

    pub fn connect(&mut self) -> DcsResult<()> {
        if self.state != ChillerState::Disconnected {
            return Err(DcsError::rejected(format!("connect not allowed in state {}", self.state)));
        }
        let result = self.link.open();
        self.checked(result)?;
        self.enter(ChillerState::Connected);
        self.update_status().map(|_| ())
    }

    pub fn start(&mut self) -> DcsResult<()> {
        if self.state != ChillerState::Off {
            return Err(DcsError::rejected(format!("start not allowed in state {}", self.state)));
        }
        let result = self.link.set_running(true);
        self.checked(result)
    }

    pub fn stop(&mut self) -> DcsResult<()> {
        if !matches!(self.state, ChillerState::On | ChillerState::Error) {
            return Err(DcsError::rejected(format!("stop not allowed in state {}", self.state)));
        }
        let result = self.link.set_running(false);
        self.checked(result)
    }

    pub fn execute(&mut self, command: &ChillerCommand) -> DcsResult<()> {
        let result = match command {
            ChillerCommand::Start => return self.start(),
            ChillerCommand::Stop => return self.stop(),
            ChillerCommand::Reconnect => return self.connect(),
            ChillerCommand::Refresh => return Ok(()),
            ChillerCommand::UseExternal => {
                self.require_connected("use_external")?;
                self.link.use_external_sensor(true)
            }
            ChillerCommand::UseInternal => {
                self.require_connected("use_internal")?;
                self.link.use_external_sensor(false)
            }
            ChillerCommand::SetWorkingTemp { setpoint, temp } => {
                self.require_connected("set_working_temp")?;
                debug!(parent: &self.span, setpoint, temp, "setting working temperature");
                self.link.set_working_temperature(*setpoint, *temp)
            }
            ChillerCommand::UseSetpoint { setpoint } => {
                self.require_connected("use_setpoint")?;
                self.link.select_setpoint(*setpoint)
            }
            ChillerCommand::SetPressureStage { stage } => {
                self.require_connected("set_pressure_stage")?;
                self.link.set_pressure_stage(*stage)
            }
        };
        self.checked(result)
    }

    /// Read the status code and move to the state it implies. `None` while disconnected.
    pub fn update_status(&mut self) -> DcsResult<Option<i32>> {
        if self.state == ChillerState::Disconnected {
            return Ok(None);
        }
        let result = self.link.status();
        let (code, message) = self.checked(result)?;
        debug!(parent: &self.span, code, %message, "chiller status");

        match state_from_status(code) {
            Some(next) => self.enter(next),
            None => {
                error!(parent: &self.span, fatal = true, code, %message, "could not interpret chiller status");
            }
        }
        if self.readings.status_code != Some(code) {
            self.readings.status_code = Some(code);
            self.readings.status_message = Some(message);
            self.changed = true;
        }
        Ok(Some(code))
    }

    /// Status evaluation plus a full read-back of the monitored values.
    pub fn poll(&mut self) -> DcsResult<()> {
        if self.update_status()?.is_none() {
            return Ok(());
        }
        let result = self.read_all();
        let mut readings = self.checked(result)?;
        readings.status_code = self.readings.status_code;
        readings.status_message = self.readings.status_message.clone();
        if readings != self.readings {
            self.readings = readings;
            self.changed = true;
        }
        Ok(())
    }

    fn read_all(&mut self) -> DcsResult<ChillerReadings> {
        let mut setpoints = [None; 3];
        for (slot, index) in setpoints.iter_mut().zip(CHILLER_SETPOINTS) {
            *slot = Some(self.link.setpoint(index)?);
        }
        Ok(ChillerReadings {
            internal_temp: Some(self.link.internal_temperature()?),
            // An unplugged external sensor reads as garbage rather than failing the link
            external_temp: self.link.external_temperature().ok(),
            setpoint_1: setpoints[0],
            setpoint_2: setpoints[1],
            setpoint_3: setpoints[2],
            used_setpoint: Some(self.link.active_setpoint()?),
            power: Some(self.link.power()?),
            ext_is_used: Some(self.link.external_sensor_used()?),
            ..ChillerReadings::default()
        })
    }
}

impl Publishable for Chiller {
    fn topic(&self) -> String {
        format!("{}/status", self.name)
    }

    fn snapshot(&self) -> Value {
        let mut snapshot = serde_json::to_value(&self.readings).unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        if let Value::Object(map) = &mut snapshot {
            map.insert("state".into(), Value::from(self.state.as_str()));
        }
        snapshot
    }

    fn is_changed(&self) -> bool {
        self.changed
    }

    fn clear_changed(&mut self) {
        self.changed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(state_from_status(-7), Some(ChillerState::Error));
        assert_eq!(state_from_status(0), Some(ChillerState::Error));
        assert_eq!(state_from_status(1), Some(ChillerState::Error));
        assert_eq!(state_from_status(2), Some(ChillerState::Off));
        assert_eq!(state_from_status(3), Some(ChillerState::On));
        assert_eq!(state_from_status(4), None);
    }
}
