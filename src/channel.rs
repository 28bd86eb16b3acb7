//! Per-channel state machine.
//!
//! Transition legality lives in the pure [`ChannelState::on_event`]; [`Channel`] owns the
//! two supply stages, executes the resulting [`Effect`]s against the I/O boundary and
//! keeps the changed-since-last-publish flag.

use crate::devices::supply::SET_VOLTAGE;
use crate::devices::{DeviceAddress, Observation, PointIo, PointValue, Stage, SupplyDevice};
use crate::error::{DcsError, DcsResult};
use crate::telemetry::Publishable;
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn, Span};

/// One lock per channel, shared by the fleet, the notification router and the driver loop.
pub type SharedChannel = Arc<Mutex<Channel>>;

/// A panic while holding a channel lock leaves the channel usable; recover the guard.
pub fn lock_channel(channel: &Mutex<Channel>) -> MutexGuard<'_, Channel> {
    channel.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    Init,
    Disconnected,
    Connected,
    LvOff,
    LvOn,
    HvRamp,
    HvOn,
    Error,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Init => "INIT",
            ChannelState::Disconnected => "DISCONNECTED",
            ChannelState::Connected => "CONNECTED",
            ChannelState::LvOff => "LV_OFF",
            ChannelState::LvOn => "LV_ON",
            ChannelState::HvRamp => "HV_RAMP",
            ChannelState::HvOn => "HV_ON",
            ChannelState::Error => "ERROR",
        }
    }

    /// Talking to both stages: everything except INIT and DISCONNECTED.
    pub fn is_connected(self) -> bool {
        !matches!(self, ChannelState::Init | ChannelState::Disconnected)
    }

    /// States a status evaluation may produce.
    pub fn is_status_derived(self) -> bool {
        matches!(
            self,
            ChannelState::LvOff | ChannelState::LvOn | ChannelState::HvRamp | ChannelState::HvOn | ChannelState::Error
        )
    }

    /// Pure transition function.
    ///
    /// `Transition::next` is the state after the effects ran. Commands that only poke
    /// the hardware keep the current state; the following status notification moves it.
    pub fn on_event(self, event: &ChannelEvent) -> DcsResult<Transition> {
        use ChannelState as S;

        let transition = match (self, event) {
            (S::Init, ChannelEvent::Connect) => {
                Transition::to(S::Connected, [Effect::AttachDevices, Effect::EvaluateStatus])
            }
            (S::Disconnected, ChannelEvent::Reconnect) => {
                Transition::to(S::Connected, [Effect::ReattachDevices, Effect::EvaluateStatus])
            }
            (_, ChannelEvent::ConnectionLost) => Transition::to(S::Disconnected, []),

            // Evaluation is not run before the stages are attached
            (S::Init | S::Disconnected, ChannelEvent::StatusDerived(_)) => Transition::stay(self, []),
            (_, ChannelEvent::StatusDerived(next)) if next.is_status_derived() => Transition::to(*next, []),
            (_, ChannelEvent::StatusDerived(next)) => {
                return Err(DcsError::InternalInconsistency(format!(
                    "status evaluation produced non-operating state {}",
                    next
                )));
            }

            (S::LvOff, ChannelEvent::SwitchLvOn) => Transition::stay(self, [Effect::Switch(Stage::Lv, true)]),
            (S::LvOn, ChannelEvent::SwitchLvOff) => Transition::stay(self, [Effect::Switch(Stage::Lv, false)]),
            (S::LvOn, ChannelEvent::SwitchHvOn) => Transition::stay(self, [Effect::Switch(Stage::Hv, true)]),
            (S::HvOn | S::HvRamp, ChannelEvent::SwitchHvOff) => {
                Transition::stay(self, [Effect::Switch(Stage::Hv, false)])
            }
            (S::Error, ChannelEvent::ClearAlarm) => Transition::stay(self, [Effect::ClearAlarms]),
            (state, ChannelEvent::SetSetpoint(stage, volts)) if state.is_connected() => {
                Transition::stay(self, [Effect::WriteSetpoint(*stage, *volts)])
            }

            (state, event) => {
                return Err(DcsError::rejected(format!("{} not allowed in state {}", event, state)));
            }
        };
        Ok(transition)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connect,
    Reconnect,
    ConnectionLost,
    StatusDerived(ChannelState),
    SwitchLvOn,
    SwitchLvOff,
    SwitchHvOn,
    SwitchHvOff,
    ClearAlarm,
    SetSetpoint(Stage, f64),
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEvent::Connect => f.write_str("connect"),
            ChannelEvent::Reconnect => f.write_str("reconnect"),
            ChannelEvent::ConnectionLost => f.write_str("connection_lost"),
            ChannelEvent::StatusDerived(s) => write!(f, "status({})", s),
            ChannelEvent::SwitchLvOn => f.write_str("switch_lv_on"),
            ChannelEvent::SwitchLvOff => f.write_str("switch_lv_off"),
            ChannelEvent::SwitchHvOn => f.write_str("switch_hv_on"),
            ChannelEvent::SwitchHvOff => f.write_str("switch_hv_off"),
            ChannelEvent::ClearAlarm => f.write_str("clear_alarm"),
            ChannelEvent::SetSetpoint(stage, v) => write!(f, "set_{}_setpoint({})", stage, v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    AttachDevices,
    ReattachDevices,
    Switch(Stage, bool),
    WriteSetpoint(Stage, f64),
    ClearAlarms,
    /// Run the status evaluator once the state change has been applied.
    EvaluateStatus,
}

pub type Effects = ArrayVec<Effect, 2>;

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: ChannelState,
    pub effects: Effects,
}

impl Transition {
    fn to<const N: usize>(next: ChannelState, effects: [Effect; N]) -> Self {
        Self {
            next,
            effects: effects.into_iter().collect(),
        }
    }

    fn stay<const N: usize>(current: ChannelState, effects: [Effect; N]) -> Self {
        Self::to(current, effects)
    }
}

/// Status-code interpretation of the supply firmware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusCodes {
    pub hv_max_normal: i64,
    pub lv_max_normal: i64,
    pub lv_on: i64,
    pub hv_on: i64,
    pub hv_ramping: Vec<i64>,
}

impl Default for StatusCodes {
    fn default() -> Self {
        Self {
            hv_max_normal: 5,
            lv_max_normal: 1,
            lv_on: 1,
            hv_on: 1,
            hv_ramping: vec![3, 5],
        }
    }
}

/// Derive the operating state from the latest stage status codes.
///
/// HV faults win over LV state and LV-off wins over any HV reading. `None` means the
/// code was never reported: it cannot raise an error, and a decision that depends on it
/// is deferred (`None` result).
pub fn evaluate_status(hv: Option<i64>, lv: Option<i64>, codes: &StatusCodes) -> Option<ChannelState> {
    if hv.map_or(false, |hv| hv > codes.hv_max_normal) {
        return Some(ChannelState::Error);
    }
    if lv.map_or(false, |lv| lv > codes.lv_max_normal) {
        return Some(ChannelState::Error);
    }

    let lv = lv?;
    if lv != codes.lv_on {
        return Some(ChannelState::LvOff);
    }

    let hv = hv?;
    if codes.hv_ramping.contains(&hv) {
        Some(ChannelState::HvRamp)
    } else if hv == codes.hv_on {
        Some(ChannelState::HvOn)
    } else {
        Some(ChannelState::LvOn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelIdentity {
    pub id: String,
    pub module: Option<String>,
    pub lv: DeviceAddress,
    pub hv: DeviceAddress,
}

impl ChannelIdentity {
    pub fn is_active(&self) -> bool {
        self.module.is_some()
    }
}

pub struct Channel {
    identity: ChannelIdentity,
    state: ChannelState,
    lv: SupplyDevice,
    hv: SupplyDevice,
    io: Arc<dyn PointIo>,
    codes: StatusCodes,
    clear_alarm_point: String,
    topic: String,
    changed: bool,
    span: Span,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("changed", &self.changed)
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(
        identity: ChannelIdentity,
        io: Arc<dyn PointIo>,
        codes: StatusCodes,
        crate_prefix: &str,
        topic: String,
        parent: &Span,
    ) -> Self {
        let span = tracing::info_span!(parent: parent, "channel", id = %identity.id);
        info!(parent: &span, module = ?identity.module, "creating channel");

        Self {
            lv: SupplyDevice::new(Stage::Lv, identity.lv, crate_prefix),
            hv: SupplyDevice::new(Stage::Hv, identity.hv, crate_prefix),
            identity,
            state: ChannelState::Init,
            io,
            codes,
            clear_alarm_point: format!("{}:ClearAlarm", crate_prefix),
            topic,
            changed: false,
            span,
        }
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    pub fn is_active(&self) -> bool {
        self.identity.is_active()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn device(&self, stage: Stage) -> &SupplyDevice {
        match stage {
            Stage::Lv => &self.lv,
            Stage::Hv => &self.hv,
        }
    }

    fn device_mut(&mut self, stage: Stage) -> &mut SupplyDevice {
        match stage {
            Stage::Lv => &mut self.lv,
            Stage::Hv => &mut self.hv,
        }
    }

    /// Apply one event: run the effects, then commit the next state.
    ///
    /// A communication failure while running an effect moves the channel to
    /// DISCONNECTED and is returned to the caller.
    pub fn fire(&mut self, event: ChannelEvent) -> DcsResult<ChannelState> {
        let transition = self.state.on_event(&event).map_err(|e| {
            warn!(parent: &self.span, error = %e, "rejected {}", event);
            e
        })?;

        let mut evaluate = false;
        for effect in &transition.effects {
            if *effect == Effect::EvaluateStatus {
                evaluate = true;
                continue;
            }
            if let Err(e) = self.execute(effect) {
                warn!(parent: &self.span, error = %e, "{} failed", event);
                if e.is_communication_failure() {
                    self.enter(ChannelState::Disconnected);
                }
                return Err(e);
            }
        }

        self.enter(transition.next);
        if evaluate {
            self.update_status();
        }
        Ok(self.state)
    }

    fn execute(&mut self, effect: &Effect) -> DcsResult<()> {
        let io = Arc::clone(&self.io);
        match effect {
            Effect::AttachDevices => {
                io.attach(self.lv.prefix(), &self.lv.point_names())?;
                io.attach(self.hv.prefix(), &self.hv.point_names())
            }
            Effect::ReattachDevices => {
                self.lv.reset_filters();
                self.hv.reset_filters();
                io.reattach(self.lv.prefix())?;
                io.reattach(self.hv.prefix())
            }
            Effect::Switch(stage, on) => self.device(*stage).switch(io.as_ref(), *on),
            Effect::WriteSetpoint(stage, volts) => {
                self.device_mut(*stage)
                    .write_attribute(io.as_ref(), SET_VOLTAGE, PointValue::Number(*volts))
            }
            Effect::ClearAlarms => io.put(&self.clear_alarm_point, PointValue::text("Yes")),
            Effect::EvaluateStatus => Ok(()),
        }
    }

    /// Re-entering the current state is a no-op and does not mark the channel changed.
    fn enter(&mut self, next: ChannelState) {
        if next != self.state {
            info!(parent: &self.span, from = %self.state, to = %next, "FSM state change");
            self.state = next;
            self.changed = true;
        }
    }

    pub fn connect(&mut self) -> DcsResult<ChannelState> {
        self.fire(ChannelEvent::Connect)
    }

    pub fn reconnect(&mut self) -> DcsResult<ChannelState> {
        self.fire(ChannelEvent::Reconnect)
    }

    pub fn switch_lv_on(&mut self) -> DcsResult<ChannelState> {
        self.fire(ChannelEvent::SwitchLvOn)
    }

    pub fn switch_lv_off(&mut self) -> DcsResult<ChannelState> {
        self.fire(ChannelEvent::SwitchLvOff)
    }

    pub fn switch_hv_on(&mut self) -> DcsResult<ChannelState> {
        self.fire(ChannelEvent::SwitchHvOn)
    }

    pub fn switch_hv_off(&mut self) -> DcsResult<ChannelState> {
        self.fire(ChannelEvent::SwitchHvOff)
    }

    pub fn clear_alarm(&mut self) -> DcsResult<ChannelState> {
        self.fire(ChannelEvent::ClearAlarm)
    }

    pub fn set_setpoint(&mut self, stage: Stage, volts: f64) -> DcsResult<ChannelState> {
        self.fire(ChannelEvent::SetSetpoint(stage, volts))
    }

    pub fn set_low_voltage_setpoint(&mut self, volts: f64) -> DcsResult<ChannelState> {
        self.set_setpoint(Stage::Lv, volts)
    }

    pub fn set_high_voltage_setpoint(&mut self, volts: f64) -> DcsResult<ChannelState> {
        self.set_setpoint(Stage::Hv, volts)
    }

    /// Write any writable attribute of a stage (configuration defaults).
    pub fn write_attribute(&mut self, stage: Stage, attribute: &str, value: PointValue) -> DcsResult<()> {
        if !self.state.is_connected() {
            return Err(DcsError::rejected(format!(
                "cannot write {}.{} in state {}",
                stage, attribute, self.state
            )));
        }
        debug!(parent: &self.span, %stage, attribute, %value, "writing attribute");
        let io = Arc::clone(&self.io);
        let result = self.device_mut(stage).write_attribute(io.as_ref(), attribute, value);
        if let Err(e) = &result {
            if e.is_communication_failure() {
                self.enter(ChannelState::Disconnected);
            }
        }
        result
    }

    /// Point-update callback. Returns whether the value made it past the deadband.
    pub fn on_point_update(&mut self, stage: Stage, point: &str, value: PointValue) -> bool {
        debug!(parent: &self.span, %stage, point, %value, "update");
        match self.device_mut(stage).observe(point, value) {
            Observation::Delivered { status } => {
                self.changed = true;
                if status {
                    self.update_status();
                }
                true
            }
            Observation::Filtered => false,
            Observation::Unknown => {
                warn!(parent: &self.span, %stage, point, "update for unknown point");
                false
            }
        }
    }

    /// Connectivity callback. Loss of any single point forces DISCONNECTED.
    pub fn on_connection_change(&mut self, stage: Stage, point: &str, connected: bool) {
        debug!(parent: &self.span, %stage, point, connected, "connection");
        self.device_mut(stage).set_online(point, connected);
        if !connected {
            warn!(parent: &self.span, %stage, point, "lost connection");
            // ConnectionLost is legal from every state
            let _ = self.fire(ChannelEvent::ConnectionLost);
        }
    }

    /// Status-derived transition; a no-op before connect and while disconnected.
    pub fn update_status(&mut self) {
        if !self.state.is_connected() {
            return;
        }
        let derived = evaluate_status(self.hv.status(), self.lv.status(), &self.codes);
        if let Some(next) = derived {
            if let Err(e) = self.fire(ChannelEvent::StatusDerived(next)) {
                tracing::error!(parent: &self.span, error = %e, "status evaluation failed");
            }
        }
    }
}

impl Publishable for Channel {
    fn topic(&self) -> String {
        self.topic.clone()
    }

    fn snapshot(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), Value::from(self.identity.id.clone()));
        map.insert(
            "module".into(),
            self.identity.module.clone().map_or(Value::Null, Value::from),
        );
        let stale = self.state == ChannelState::Disconnected;
        self.lv.fill_snapshot(&mut map, stale);
        self.hv.fill_snapshot(&mut map, stale);
        map.insert("state".into(), Value::from(self.state.as_str()));
        Value::Object(map)
    }

    fn is_changed(&self) -> bool {
        self.changed
    }

    fn clear_changed(&mut self) {
        self.changed = false;
    }

    /// Nothing is known before the first connect; a lost channel still reports.
    fn is_publishable(&self) -> bool {
        self.state != ChannelState::Init
    }
}
