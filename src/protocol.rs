use crate::devices::Stage;
use crate::error::{DcsError, DcsResult};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub const CMD_SEGMENT: &str = "cmd";
pub const MAX_TOPIC_SEGMENTS: usize = 5; // entity/cmd/verb/sub/channel

pub const COOLING_TEMPERATURE_RANGE: RangeInclusive<f64> = -35.0..=25.0;
pub const COOLING_SPEED_RANGE: RangeInclusive<f64> = 0.0..=6000.0;
pub const COOLING_FLOW_RANGE: RangeInclusive<f64> = 0.0..=5.0;
pub const CHILLER_SETPOINTS: RangeInclusive<u8> = 1..=3;
pub const CHILLER_PRESSURE_STAGES: RangeInclusive<u8> = 1..=4;
pub const CHILLER_MIN_TEMP: f64 = -50.0;
pub const CHILLER_MAX_TEMP: f64 = 50.0; // exclusive

/// Parsed `<entity>/cmd/<verb>[/<sub>[/<channel>]]`, borrowing from the topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAddress<'a> {
    pub entity: &'a str,
    pub verb: &'a str,
    pub sub: Option<&'a str>,
    pub channel: Option<&'a str>,
}

impl<'a> CommandAddress<'a> {
    pub fn parse(topic: &'a str) -> DcsResult<Self> {
        let mut segments: Vec<&'a str, MAX_TOPIC_SEGMENTS> = Vec::new();
        for segment in topic.split('/') {
            if segment.is_empty() {
                return Err(DcsError::malformed(format!("empty segment in '{}'", topic)));
            }
            segments
                .push(segment)
                .map_err(|_| DcsError::malformed(format!("too many segments in '{}'", topic)))?;
        }

        match segments.as_slice() {
            &[entity, CMD_SEGMENT, verb, ref rest @ ..] => Ok(Self {
                entity,
                verb,
                sub: rest.first().copied(),
                channel: rest.get(1).copied(),
            }),
            _ => Err(DcsError::malformed(format!("'{}' is not a command address", topic))),
        }
    }

    fn depth(&self) -> usize {
        3 + usize::from(self.sub.is_some()) + usize::from(self.channel.is_some())
    }

    fn expect_depth(&self, depth: usize) -> DcsResult<()> {
        if self.depth() == depth {
            Ok(())
        } else {
            Err(DcsError::malformed(format!(
                "'{}' takes {} topic segments, got {}",
                self.verb,
                depth,
                self.depth()
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetpointLimits {
    pub lv_setpoint: [f64; 2],
    pub hv_setpoint: [f64; 2],
}

impl Default for SetpointLimits {
    fn default() -> Self {
        Self {
            lv_setpoint: [0.0, 15.0],
            hv_setpoint: [0.0, 1000.0],
        }
    }
}

impl SetpointLimits {
    pub fn range(&self, stage: Stage) -> RangeInclusive<f64> {
        let [lo, hi] = match stage {
            Stage::Lv => self.lv_setpoint,
            Stage::Hv => self.hv_setpoint,
        };
        lo..=hi
    }

    pub fn validate(&self) -> DcsResult<()> {
        for stage in [Stage::Lv, Stage::Hv] {
            let range = self.range(stage);
            if !(range.start() < range.end()) {
                return Err(DcsError::config(format!("{} setpoint limits {:?} are empty", stage, range)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FleetCommand {
    Switch { stage: Stage, on: bool },
    SetVoltage { stage: Stage, channel: String, volts: f64 },
    ClearAlarms,
    Refresh,
    Reload,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoolingCommand {
    StartChiller,
    StopChiller,
    StartCo2,
    StopCo2,
    ClearAlarms,
    Reconnect,
    Refresh,
    SetFlowActive(bool),
    SetTemperatureSetpoint(f64),
    SetSpeedSetpoint(f64),
    SetFlowSetpoint(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChillerCommand {
    Start,
    Stop,
    Refresh,
    Reconnect,
    UseExternal,
    UseInternal,
    SetWorkingTemp { setpoint: u8, temp: f64 },
    UseSetpoint { setpoint: u8 },
    SetPressureStage { stage: u8 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Fleet(FleetCommand),
    Cooling(CoolingCommand),
    Chiller(ChillerCommand),
}

#[derive(Deserialize)]
struct WorkingTempPayload {
    setpoint: u8,
    temp: f64,
}

#[derive(Deserialize)]
struct SetpointPayload {
    setpoint: u8,
}

#[derive(Deserialize)]
struct PressurePayload {
    stage: u8,
}

/// The command tables of every entity the process serves.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTable {
    pub fleet: String,
    pub cooling: Option<String>,
    pub chiller: Option<String>,
    pub limits: SetpointLimits,
}

impl CommandTable {
    pub fn new(fleet: impl Into<String>, limits: SetpointLimits) -> Self {
        Self {
            fleet: fleet.into(),
            cooling: None,
            chiller: None,
            limits,
        }
    }

    pub fn with_cooling(mut self, name: impl Into<String>) -> Self {
        self.cooling = Some(name.into());
        self
    }

    pub fn with_chiller(mut self, name: impl Into<String>) -> Self {
        self.chiller = Some(name.into());
        self
    }

    /// Topic filters a bus client subscribes to.
    pub fn subscriptions(&self) -> std::vec::Vec<String> {
        std::iter::once(&self.fleet)
            .chain(self.cooling.iter())
            .chain(self.chiller.iter())
            .map(|entity| format!("{}/{}/#", entity, CMD_SEGMENT))
            .collect()
    }

    /// Validate a command fully before anything is dispatched.
    pub fn parse(&self, topic: &str, payload: &[u8]) -> DcsResult<Command> {
        let address = CommandAddress::parse(topic)?;
        let payload = std::str::from_utf8(payload)
            .map_err(|_| DcsError::malformed("payload is not UTF-8"))?
            .trim();

        if address.entity == self.fleet {
            self.parse_fleet(&address, payload).map(Command::Fleet)
        } else if self.cooling.as_deref() == Some(address.entity) {
            address.expect_depth(3)?;
            parse_cooling(address.verb, payload).map(Command::Cooling)
        } else if self.chiller.as_deref() == Some(address.entity) {
            address.expect_depth(3)?;
            parse_chiller(address.verb, payload).map(Command::Chiller)
        } else {
            Err(DcsError::malformed(format!("unknown entity '{}'", address.entity)))
        }
    }

    fn parse_fleet(&self, address: &CommandAddress<'_>, payload: &str) -> DcsResult<FleetCommand> {
        let stage = || {
            let sub = address
                .sub
                .ok_or_else(|| DcsError::malformed(format!("'{}' needs an lv/hv sub-entity", address.verb)))?;
            Stage::parse(sub).ok_or_else(|| DcsError::malformed(format!("unknown sub-entity '{}'", sub)))
        };

        let command = match address.verb {
            "switch" => {
                address.expect_depth(4)?;
                let on = match payload {
                    "on" => true,
                    "off" => false,
                    other => return Err(DcsError::malformed(format!("switch expects on/off, got '{}'", other))),
                };
                FleetCommand::Switch { stage: stage()?, on }
            }
            "setv" => {
                address.expect_depth(5)?;
                let stage = stage()?;
                let volts = parse_number(payload)?;
                let range = self.limits.range(stage);
                if !range.contains(&volts) {
                    return Err(DcsError::rejected(format!(
                        "{} setpoint {} outside {:?}",
                        stage, volts, range
                    )));
                }
                FleetCommand::SetVoltage {
                    stage,
                    channel: address.channel.unwrap_or_default().to_string(),
                    volts,
                }
            }
            "clear" => no_args(address, FleetCommand::ClearAlarms)?,
            "refresh" => no_args(address, FleetCommand::Refresh)?,
            "reload" => no_args(address, FleetCommand::Reload)?,
            "reconnect" => no_args(address, FleetCommand::Reconnect)?,
            verb => return Err(DcsError::malformed(format!("unknown fleet verb '{}'", verb))),
        };
        Ok(command)
    }
}

fn no_args<T>(address: &CommandAddress<'_>, command: T) -> DcsResult<T> {
    address.expect_depth(3)?;
    Ok(command)
}

fn parse_number(payload: &str) -> DcsResult<f64> {
    payload
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DcsError::malformed(format!("expected a number, got '{}'", payload)))
}

fn parse_in_range(payload: &str, range: RangeInclusive<f64>) -> DcsResult<f64> {
    let value = parse_number(payload)?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(DcsError::rejected(format!("{} outside {:?}", value, range)))
    }
}

fn parse_json<'a, T: Deserialize<'a>>(payload: &'a str) -> DcsResult<T> {
    serde_json::from_str(payload).map_err(|e| DcsError::malformed(format!("invalid payload '{}': {}", payload, e)))
}

fn check_setpoint(setpoint: u8) -> DcsResult<u8> {
    if CHILLER_SETPOINTS.contains(&setpoint) {
        Ok(setpoint)
    } else {
        Err(DcsError::rejected(format!("setpoint {} outside {:?}", setpoint, CHILLER_SETPOINTS)))
    }
}

fn parse_cooling(verb: &str, payload: &str) -> DcsResult<CoolingCommand> {
    let command = match verb {
        "start_chiller" => CoolingCommand::StartChiller,
        "stop_chiller" => CoolingCommand::StopChiller,
        "start_co2" => CoolingCommand::StartCo2,
        "stop_co2" => CoolingCommand::StopCo2,
        "clear_alarms" => CoolingCommand::ClearAlarms,
        "reconnect" => CoolingCommand::Reconnect,
        "refresh" => CoolingCommand::Refresh,
        "set_flow_active" => match payload {
            "0" => CoolingCommand::SetFlowActive(false),
            "1" => CoolingCommand::SetFlowActive(true),
            other => return Err(DcsError::malformed(format!("set_flow_active expects 0/1, got '{}'", other))),
        },
        "set_temperature_setpoint" => {
            CoolingCommand::SetTemperatureSetpoint(parse_in_range(payload, COOLING_TEMPERATURE_RANGE)?)
        }
        "set_speed_setpoint" => CoolingCommand::SetSpeedSetpoint(parse_in_range(payload, COOLING_SPEED_RANGE)?),
        "set_flow_setpoint" => CoolingCommand::SetFlowSetpoint(parse_in_range(payload, COOLING_FLOW_RANGE)?),
        verb => return Err(DcsError::malformed(format!("unknown cooling verb '{}'", verb))),
    };
    Ok(command)
}

fn parse_chiller(verb: &str, payload: &str) -> DcsResult<ChillerCommand> {
    let command = match verb {
        "start" => ChillerCommand::Start,
        "stop" => ChillerCommand::Stop,
        "refresh" => ChillerCommand::Refresh,
        "reconnect" => ChillerCommand::Reconnect,
        "use_external" => ChillerCommand::UseExternal,
        "use_internal" => ChillerCommand::UseInternal,
        "set_working_temp" => {
            let p: WorkingTempPayload = parse_json(payload)?;
            if !(CHILLER_MIN_TEMP..CHILLER_MAX_TEMP).contains(&p.temp) {
                return Err(DcsError::rejected(format!(
                    "working temperature {} outside [{}, {})",
                    p.temp, CHILLER_MIN_TEMP, CHILLER_MAX_TEMP
                )));
            }
            ChillerCommand::SetWorkingTemp {
                setpoint: check_setpoint(p.setpoint)?,
                temp: p.temp,
            }
        }
        "use_setpoint" => {
            let p: SetpointPayload = parse_json(payload)?;
            ChillerCommand::UseSetpoint {
                setpoint: check_setpoint(p.setpoint)?,
            }
        }
        "set_pressure_stage" => {
            let p: PressurePayload = parse_json(payload)?;
            if !CHILLER_PRESSURE_STAGES.contains(&p.stage) {
                return Err(DcsError::rejected(format!(
                    "pressure stage {} outside {:?}",
                    p.stage, CHILLER_PRESSURE_STAGES
                )));
            }
            ChillerCommand::SetPressureStage { stage: p.stage }
        }
        verb => return Err(DcsError::malformed(format!("unknown chiller verb '{}'", verb))),
    };
    Ok(command)
}
