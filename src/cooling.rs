//! CO2 cooling plant driven over holding registers.

use crate::config::CoolingConfig;
use crate::error::{DcsError, DcsResult};
use crate::protocol::CoolingCommand;
use crate::registers::{FieldBus, RegisterManager, RegisterValue};
use crate::telemetry::Publishable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, error, info, warn, Span};

pub const STATUS_REGISTER: &str = "status";
pub const START_CHILLER_REGISTER: &str = "set_start_chiller";
pub const START_CO2_REGISTER: &str = "set_start_co2";
pub const ALARM_RESET_REGISTER: &str = "set_alarm_reset";
pub const FLOW_ACTIVE_REGISTER: &str = "set_flow_active";
pub const TEMPERATURE_SETPOINT_REGISTER: &str = "set_temperature_setpoint";
pub const SPEED_SETPOINT_REGISTER: &str = "set_speed_setpoint";
pub const FLOW_SETPOINT_REGISTER: &str = "set_flow_setpoint";

const STATUS_READY: u16 = 1;
const STATUS_RUNNING: u16 = 2;
const STATUS_ALARM: u16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoolingState {
    Init,
    Disconnected,
    Connected,
    ChillerRunning,
    Co2Running,
    Alarm,
}

impl CoolingState {
    pub fn as_str(self) -> &'static str {
        match self {
            CoolingState::Init => "INIT",
            CoolingState::Disconnected => "DISCONNECTED",
            CoolingState::Connected => "CONNECTED",
            CoolingState::ChillerRunning => "CHILLER_RUNNING",
            CoolingState::Co2Running => "CO2_RUNNING",
            CoolingState::Alarm => "ALARM",
        }
    }

    pub fn is_connected(self) -> bool {
        !matches!(self, CoolingState::Init | CoolingState::Disconnected)
    }
}

impl fmt::Display for CoolingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plant state implied by the status word and the two start bits.
///
/// `Ok(None)` when the combination maps to no state (e.g. a transient status word).
pub fn derive_state(status: u16, chiller: bool, co2: bool) -> DcsResult<Option<CoolingState>> {
    if co2 && !chiller {
        return Err(DcsError::InternalInconsistency(
            "CO2 start bit set while chiller start bit is clear".into(),
        ));
    }
    let state = match status {
        STATUS_READY if !chiller => Some(CoolingState::Connected),
        STATUS_READY if !co2 => Some(CoolingState::ChillerRunning),
        STATUS_READY | STATUS_RUNNING if co2 => Some(CoolingState::Co2Running),
        STATUS_ALARM => Some(CoolingState::Alarm),
        _ => None,
    };
    Ok(state)
}

pub struct CoolingUnit {
    name: String,
    state: CoolingState,
    registers: RegisterManager,
    alarm_codes: Vec<(String, String)>,
    changed: bool,
    span: Span,
}

impl fmt::Debug for CoolingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoolingUnit")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("registers", &self.registers)
            .finish_non_exhaustive()
    }
}

impl CoolingUnit {
    pub fn new(config: &CoolingConfig, bus: Box<dyn FieldBus>, parent: &Span) -> DcsResult<Self> {
        config.validate()?;
        let span = tracing::info_span!(parent: parent, "cooling", name = %config.name);

        let mut registers = RegisterManager::new(bus, config.max_chunk_len);
        for (name, register) in &config.registers {
            registers.add_register(name, register.address, register.register_kind(name)?, register.input)?;
        }
        info!(parent: &span, registers = config.registers.len(), chunks = registers.chunks().len(), "cooling unit initialised");

        Ok(Self {
            name: config.name.clone(),
            state: CoolingState::Init,
            registers,
            alarm_codes: config.alarm_codes.iter().map(|(r, m)| (r.clone(), m.clone())).collect(),
            changed: true,
            span,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CoolingState {
        self.state
    }

    pub fn registers(&self) -> &RegisterManager {
        &self.registers
    }

    fn enter(&mut self, next: CoolingState) {
        if next != self.state {
            info!(parent: &self.span, from = %self.state, to = %next, "FSM state change");
            self.state = next;
            self.changed = true;
        }
    }

    fn gate(&self, action: &str, allowed: &[CoolingState]) -> DcsResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            warn!(parent: &self.span, state = %self.state, "rejected {}", action);
            Err(DcsError::rejected(format!("{} not allowed in state {}", action, self.state)))
        }
    }

    /// Communication failures disconnect the unit before being handed back.
    fn checked<T>(&mut self, result: DcsResult<T>) -> DcsResult<T> {
        if let Err(e) = &result {
            if e.is_communication_failure() {
                error!(parent: &self.span, error = %e, "field bus failure");
                self.enter(CoolingState::Disconnected);
            }
        }
        result
    }

    fn open(&mut self) -> DcsResult<()> {
        let result = self.registers.connect().and_then(|()| self.registers.refresh().map(|_| ()));
        self.checked(result)?;
        self.enter(CoolingState::Connected);
        self.update_status()
    }

    pub fn connect(&mut self) -> DcsResult<()> {
        self.gate("connect", &[CoolingState::Init])?;
        self.open()
    }

    pub fn reconnect(&mut self) -> DcsResult<()> {
        self.gate("reconnect", &[CoolingState::Disconnected])?;
        self.open()
    }

    fn write(&mut self, register: &str, value: f64) -> DcsResult<()> {
        debug!(parent: &self.span, register, value, "writing register");
        let result = self.registers.write(register, value);
        self.checked(result)
    }

    pub fn start_chiller(&mut self) -> DcsResult<()> {
        self.gate("start_chiller", &[CoolingState::Connected])?;
        self.write(START_CHILLER_REGISTER, 1.0)
    }

    pub fn stop_chiller(&mut self) -> DcsResult<()> {
        self.gate("stop_chiller", &[CoolingState::ChillerRunning])?;
        self.write(START_CHILLER_REGISTER, 0.0)
    }

    pub fn start_co2(&mut self) -> DcsResult<()> {
        self.gate("start_co2", &[CoolingState::ChillerRunning])?;
        self.write(START_CO2_REGISTER, 1.0)
    }

    pub fn stop_co2(&mut self) -> DcsResult<()> {
        self.gate("stop_co2", &[CoolingState::Co2Running])?;
        self.write(START_CO2_REGISTER, 0.0)
    }

    /// Drop both start bits first so the plant does not restart the moment the alarm clears.
    pub fn clear_alarms(&mut self) -> DcsResult<()> {
        self.gate("clear_alarms", &[CoolingState::Alarm])?;
        self.write(START_CO2_REGISTER, 0.0)?;
        self.write(START_CHILLER_REGISTER, 0.0)?;
        self.write(ALARM_RESET_REGISTER, 1.0)?;
        self.write(ALARM_RESET_REGISTER, 0.0)
    }

    /// Setpoint registers are writable in every connected state.
    pub fn set_parameter(&mut self, register: &str, value: f64) -> DcsResult<()> {
        if !self.state.is_connected() {
            return Err(DcsError::rejected(format!("cannot write {} in state {}", register, self.state)));
        }
        self.write(register, value)
    }

    pub fn execute(&mut self, command: &CoolingCommand) -> DcsResult<()> {
        match command {
            CoolingCommand::StartChiller => self.start_chiller(),
            CoolingCommand::StopChiller => self.stop_chiller(),
            CoolingCommand::StartCo2 => self.start_co2(),
            CoolingCommand::StopCo2 => self.stop_co2(),
            CoolingCommand::ClearAlarms => self.clear_alarms(),
            CoolingCommand::Reconnect => self.reconnect(),
            CoolingCommand::Refresh => Ok(()),
            CoolingCommand::SetFlowActive(on) => self.set_parameter(FLOW_ACTIVE_REGISTER, f64::from(u8::from(*on))),
            CoolingCommand::SetTemperatureSetpoint(v) => self.set_parameter(TEMPERATURE_SETPOINT_REGISTER, *v),
            CoolingCommand::SetSpeedSetpoint(v) => self.set_parameter(SPEED_SETPOINT_REGISTER, *v),
            CoolingCommand::SetFlowSetpoint(v) => self.set_parameter(FLOW_SETPOINT_REGISTER, *v),
        }
    }

    fn read_flag(&self, register: &str) -> bool {
        matches!(self.registers.read(register), Ok(Some(v)) if v.as_bool())
    }

    /// Refresh every register and move to the state the plant reports.
    pub fn update_status(&mut self) -> DcsResult<()> {
        if !self.state.is_connected() {
            return Ok(());
        }

        let refreshed = self.registers.refresh();
        if self.checked(refreshed)? {
            self.changed = true;
        }

        let status = match self.registers.read(STATUS_REGISTER)? {
            Some(value) => value.as_int().unwrap_or_default(),
            None => return Ok(()),
        };
        let chiller = self.read_flag(START_CHILLER_REGISTER);
        let co2 = self.read_flag(START_CO2_REGISTER);

        match derive_state(status, chiller, co2) {
            Ok(Some(next)) => self.enter(next),
            Ok(None) => debug!(parent: &self.span, status, "status word maps to no state"),
            Err(e) => {
                error!(parent: &self.span, fatal = true, error = %e, "cannot derive cooling state");
                return Err(e);
            }
        }
        Ok(())
    }

    /// One `<message> (<register>)` line per raised alarm bit.
    pub fn alarm_message(&self) -> String {
        self.alarm_codes
            .iter()
            .filter(|(register, _)| self.read_flag(register))
            .map(|(register, message)| format!("{} ({})\n", message, register))
            .collect()
    }

    pub fn alarm_topic(&self) -> String {
        format!("{}/alarms", self.name)
    }

    pub fn read(&self, register: &str) -> DcsResult<Option<RegisterValue>> {
        self.registers.read(register)
    }
}

impl Publishable for CoolingUnit {
    fn topic(&self) -> String {
        format!("{}/status", self.name)
    }

    /// Cached register values are only reported while the bus is up.
    fn snapshot(&self) -> Value {
        let mut map = if self.state.is_connected() {
            self.registers.values()
        } else {
            serde_json::Map::new()
        };
        map.insert("state".into(), Value::from(self.state.as_str()));
        Value::Object(map)
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
    fn test_derive_state_table() {
        assert_eq!(derive_state(1, false, false).unwrap(), Some(CoolingState::Connected));
        assert_eq!(derive_state(1, true, false).unwrap(), Some(CoolingState::ChillerRunning));
        assert_eq!(derive_state(1, true, true).unwrap(), Some(CoolingState::Co2Running));
        assert_eq!(derive_state(2, true, true).unwrap(), Some(CoolingState::Co2Running));
        assert_eq!(derive_state(3, true, false).unwrap(), Some(CoolingState::Alarm));
        assert_eq!(derive_state(2, true, false).unwrap(), None);
        assert_eq!(derive_state(0, false, false).unwrap(), None);
    }

    #[test]
    fn test_co2_without_chiller_is_inconsistent() {
        assert!(matches!(
            derive_state(1, false, true),
            Err(DcsError::InternalInconsistency(_))
        ));
    }
}
