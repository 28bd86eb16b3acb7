//! In-process stand-ins for the hardware behind each I/O seam.
//!
//! Every simulator keeps its state behind a shared handle so a test can hold one clone
//! for failure injection and inspection while the driver owns another.

use crate::chiller::ChillerLink;
use crate::devices::supply::{POWER_POINT, STATUS_POINT};
use crate::devices::{Notification, PointIo, PointValue};
use crate::error::{DcsError, DcsResult};
use crate::registers::{BusError, FieldBus};
use crate::telemetry::StatusSink;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

// Status words reported by the simulated supplies
const STATUS_OFF: f64 = 0.0;
const STATUS_ON: f64 = 1.0;
const STATUS_RAMP_UP: f64 = 3.0;
const STATUS_RAMP_DOWN: f64 = 5.0;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct SimDevice {
    points: BTreeMap<&'static str, PointValue>,
    high_voltage: bool,
}

impl SimDevice {
    fn new(points: &[&'static str]) -> Self {
        let high_voltage = points.contains(&"ImRange");
        let points = points
            .iter()
            .map(|&p| {
                let initial = match p {
                    POWER_POINT => PointValue::text("Off"),
                    "ImRange" => PointValue::text("High"),
                    "PDwn" => PointValue::text("Kill"),
                    _ => PointValue::Number(0.0),
                };
                (p, initial)
            })
            .collect();
        Self { points, high_voltage }
    }

    fn number(&self, point: &str) -> f64 {
        self.points.get(point).and_then(PointValue::as_f64).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct CrateState {
    devices: HashMap<String, SimDevice>,
    offline: bool,
    puts: Vec<(String, PointValue)>,
}

/// A power-supply crate: LV and HV boards whose points live under `<prefix>:BB:CCC:`.
///
/// Switching HV on goes through a ramp (status 3) that settles on [`advance`](Self::advance);
/// switching it off ramps down (status 5) to 0.
#[derive(Debug)]
pub struct SimulatedCrate {
    prefix: String,
    state: Mutex<CrateState>,
    tx: UnboundedSender<Notification>,
}

impl SimulatedCrate {
    pub fn new(prefix: impl Into<String>) -> (Self, UnboundedReceiver<Notification>) {
        let (tx, rx) = unbounded_channel();
        let sim = Self {
            prefix: prefix.into(),
            state: Mutex::new(CrateState::default()),
            tx,
        };
        (sim, rx)
    }

    fn send(&self, notification: Notification) {
        // The receiver is gone once the daemon shuts down
        let _ = self.tx.send(notification);
    }

    fn update(&self, device_prefix: &str, point: &str, value: PointValue) {
        self.send(Notification::Update {
            point: format!("{}{}", device_prefix, point),
            value,
        });
    }

    fn announce(&self, device_prefix: &str, device: &SimDevice) {
        for (point, value) in &device.points {
            self.send(Notification::Connection {
                point: format!("{}{}", device_prefix, point),
                connected: true,
            });
            self.update(device_prefix, point, value.clone());
        }
    }

    /// Drop connectivity of one device, as a cable pull would.
    pub fn disconnect(&self, device_prefix: &str) {
        self.send(Notification::Connection {
            point: format!("{}{}", device_prefix, STATUS_POINT),
            connected: false,
        });
    }

    /// All subsequent calls fail with a communication error.
    pub fn set_offline(&self, offline: bool) {
        guard(&self.state).offline = offline;
    }

    /// Force a status word, e.g. an over-current trip.
    pub fn trip(&self, device_prefix: &str, code: f64) {
        self.set_value(device_prefix, STATUS_POINT, PointValue::Number(code));
    }

    /// Set a point and notify, as if the hardware changed it.
    pub fn set_value(&self, device_prefix: &str, point: &'static str, value: PointValue) {
        let mut state = guard(&self.state);
        if let Some(device) = state.devices.get_mut(device_prefix) {
            device.points.insert(point, value.clone());
            self.update(device_prefix, point, value);
        }
    }

    pub fn value(&self, device_prefix: &str, point: &str) -> Option<PointValue> {
        guard(&self.state).devices.get(device_prefix)?.points.get(point).cloned()
    }

    /// Every successful `put`, in order.
    pub fn puts(&self) -> Vec<(String, PointValue)> {
        guard(&self.state).puts.clone()
    }

    /// Settle ramps and let monitored voltages follow their setpoints.
    pub fn advance(&self) {
        let mut state = guard(&self.state);
        for (prefix, device) in &mut state.devices {
            let status = device.number(STATUS_POINT);
            let next = if status == STATUS_RAMP_UP {
                Some(STATUS_ON)
            } else if status == STATUS_RAMP_DOWN {
                Some(STATUS_OFF)
            } else {
                None
            };
            if let Some(next) = next {
                device.points.insert(STATUS_POINT, PointValue::Number(next));
                self.update(prefix, STATUS_POINT, PointValue::Number(next));
            }

            let on = device.number(STATUS_POINT) == STATUS_ON;
            let v_mon = if on { device.number("V0Set") } else { 0.0 };
            if device.number("VMon") != v_mon {
                device.points.insert("VMon", PointValue::Number(v_mon));
                self.update(prefix, "VMon", PointValue::Number(v_mon));
            }
        }
    }

    fn check_online(state: &CrateState) -> DcsResult<()> {
        if state.offline {
            Err(DcsError::comm("crate not reachable"))
        } else {
            Ok(())
        }
    }

    fn clear_alarms(&self, state: &mut CrateState) {
        for (prefix, device) in &mut state.devices {
            let status = device.number(STATUS_POINT);
            if status > STATUS_RAMP_DOWN || (!device.high_voltage && status > STATUS_ON) {
                device.points.insert(STATUS_POINT, PointValue::Number(STATUS_OFF));
                device.points.insert(POWER_POINT, PointValue::text("Off"));
                self.update(prefix, STATUS_POINT, PointValue::Number(STATUS_OFF));
            }
        }
    }
}

impl PointIo for SimulatedCrate {
    fn attach(&self, device_prefix: &str, points: &[&'static str]) -> DcsResult<()> {
        let mut state = guard(&self.state);
        Self::check_online(&state)?;
        let device = state
            .devices
            .entry(device_prefix.to_string())
            .or_insert_with(|| SimDevice::new(points));
        debug!(device = device_prefix, points = points.len(), "attach");
        self.announce(device_prefix, device);
        Ok(())
    }

    fn reattach(&self, device_prefix: &str) -> DcsResult<()> {
        let state = guard(&self.state);
        Self::check_online(&state)?;
        let device = state
            .devices
            .get(device_prefix)
            .ok_or_else(|| DcsError::comm(format!("no device at {}", device_prefix)))?;
        self.announce(device_prefix, device);
        Ok(())
    }

    fn put(&self, point: &str, value: PointValue) -> DcsResult<()> {
        let mut state = guard(&self.state);
        Self::check_online(&state)?;
        state.puts.push((point.to_string(), value.clone()));

        if point == format!("{}:ClearAlarm", self.prefix) {
            self.clear_alarms(&mut state);
            return Ok(());
        }

        let split = point.rfind(':').ok_or_else(|| DcsError::comm(format!("bad point {}", point)))?;
        let (prefix, name) = (&point[..=split], &point[split + 1..]);
        let device = state
            .devices
            .get_mut(prefix)
            .ok_or_else(|| DcsError::comm(format!("no device at {}", prefix)))?;
        let (&key, _) = device
            .points
            .get_key_value(name)
            .ok_or_else(|| DcsError::comm(format!("no point {}", point)))?;

        if key == POWER_POINT {
            let on = is_token(&value, "On");
            let status = match (on, device.high_voltage) {
                (true, true) => STATUS_RAMP_UP,
                (true, false) => STATUS_ON,
                (false, true) if device.number(STATUS_POINT) == STATUS_OFF => STATUS_OFF,
                (false, true) => STATUS_RAMP_DOWN,
                (false, false) => STATUS_OFF,
            };
            device.points.insert(STATUS_POINT, PointValue::Number(status));
            self.update(prefix, STATUS_POINT, PointValue::Number(status));
        }
        device.points.insert(key, value.clone());
        self.update(prefix, key, value);
        Ok(())
    }
}

fn is_token(value: &PointValue, token: &str) -> bool {
    matches!(value, PointValue::Text(t) if t == token)
}

#[derive(Debug, Default)]
struct BusState {
    words: HashMap<u16, u16>,
    failing: bool,
    reads: Vec<(u16, u16)>,
    writes: Vec<(u16, Vec<u16>)>,
}

/// Holding registers in memory. Unset addresses read as zero.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_word(&self, address: u16, word: u16) {
        guard(&self.state).words.insert(address, word);
    }

    pub fn word(&self, address: u16) -> u16 {
        guard(&self.state).words.get(&address).copied().unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        guard(&self.state).failing = failing;
    }

    /// `(start, count)` of every read transaction.
    pub fn reads(&self) -> Vec<(u16, u16)> {
        guard(&self.state).reads.clone()
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        guard(&self.state).writes.clone()
    }
}

impl FieldBus for SimulatedBus {
    fn connect(&mut self) -> Result<(), BusError> {
        if guard(&self.state).failing {
            return Err(BusError::read(0, 0, "connection refused"));
        }
        Ok(())
    }

    fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, BusError> {
        let mut state = guard(&self.state);
        if state.failing {
            return Err(BusError::read(start, count, "timeout"));
        }
        state.reads.push((start, count));
        Ok((0..count)
            .map(|offset| state.words.get(&(start + offset)).copied().unwrap_or_default())
            .collect())
    }

    fn write_registers(&mut self, start: u16, words: &[u16]) -> Result<(), BusError> {
        let mut state = guard(&self.state);
        if state.failing {
            return Err(BusError::write(start, words.len() as u16, "timeout"));
        }
        state.writes.push((start, words.to_vec()));
        for (offset, word) in (0u16..).zip(words) {
            state.words.insert(start + offset, *word);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ChillerSimState {
    status: i32,
    failing: bool,
    setpoints: [f64; 3],
    active_setpoint: u8,
    external: bool,
    pressure_stage: u8,
    internal_temp: f64,
    external_temp: Option<f64>,
    power: f64,
}

impl Default for ChillerSimState {
    fn default() -> Self {
        Self {
            status: 2,
            failing: false,
            setpoints: [20.0, 15.0, -20.0],
            active_setpoint: 1,
            external: false,
            pressure_stage: 1,
            internal_temp: 21.5,
            external_temp: None,
            power: 0.0,
        }
    }
}

/// A chiller that starts in remote-control standby (status 2).
#[derive(Debug, Clone, Default)]
pub struct SimulatedChiller {
    state: Arc<Mutex<ChillerSimState>>,
}

impl SimulatedChiller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, code: i32) {
        guard(&self.state).status = code;
    }

    pub fn set_failing(&self, failing: bool) {
        guard(&self.state).failing = failing;
    }

    pub fn set_internal_temperature(&self, temp: f64) {
        guard(&self.state).internal_temp = temp;
    }

    pub fn setpoints(&self) -> [f64; 3] {
        guard(&self.state).setpoints
    }

    pub fn active_setpoint(&self) -> u8 {
        guard(&self.state).active_setpoint
    }

    pub fn pressure_stage(&self) -> u8 {
        guard(&self.state).pressure_stage
    }

    pub fn external_sensor(&self) -> bool {
        guard(&self.state).external
    }

    fn with<T>(&self, f: impl FnOnce(&mut ChillerSimState) -> T) -> DcsResult<T> {
        let mut state = guard(&self.state);
        if state.failing {
            return Err(DcsError::comm("serial timeout"));
        }
        Ok(f(&mut state))
    }
}

fn setpoint_slot(index: u8) -> DcsResult<usize> {
    match index {
        1..=3 => Ok(usize::from(index - 1)),
        _ => Err(DcsError::rejected(format!("no setpoint {}", index))),
    }
}

impl ChillerLink for SimulatedChiller {
    fn open(&mut self) -> DcsResult<()> {
        self.with(|_| ())
    }

    fn status(&mut self) -> DcsResult<(i32, String)> {
        self.with(|s| {
            let message = match s.status {
                2 => "REMOTE STOP",
                3 => "REMOTE START",
                0 | 1 => "MANUAL",
                _ => "ALARM",
            };
            (s.status, message.to_string())
        })
    }

    fn internal_temperature(&mut self) -> DcsResult<f64> {
        self.with(|s| s.internal_temp)
    }

    fn external_temperature(&mut self) -> DcsResult<f64> {
        self.with(|s| s.external_temp)?
            .ok_or_else(|| DcsError::comm("external sensor not connected"))
    }

    fn power(&mut self) -> DcsResult<f64> {
        self.with(|s| s.power)
    }

    fn setpoint(&mut self, index: u8) -> DcsResult<f64> {
        let slot = setpoint_slot(index)?;
        self.with(|s| s.setpoints[slot])
    }

    fn active_setpoint(&mut self) -> DcsResult<u8> {
        self.with(|s| s.active_setpoint)
    }

    fn external_sensor_used(&mut self) -> DcsResult<bool> {
        self.with(|s| s.external)
    }

    fn set_working_temperature(&mut self, index: u8, temp: f64) -> DcsResult<()> {
        let slot = setpoint_slot(index)?;
        self.with(|s| s.setpoints[slot] = temp)
    }

    fn select_setpoint(&mut self, index: u8) -> DcsResult<()> {
        setpoint_slot(index)?;
        self.with(|s| s.active_setpoint = index)
    }

    fn use_external_sensor(&mut self, external: bool) -> DcsResult<()> {
        self.with(|s| s.external = external)
    }

    fn set_pressure_stage(&mut self, stage: u8) -> DcsResult<()> {
        self.with(|s| s.pressure_stage = stage)
    }

    fn set_running(&mut self, on: bool) -> DcsResult<()> {
        self.with(|s| {
            s.status = if on { 3 } else { 2 };
            s.power = if on { -40.0 } else { 0.0 };
        })
    }
}

/// Sink that records every emitted snapshot.
#[derive(Debug, Default)]
pub struct MemorySink {
    emitted: Mutex<Vec<(String, Value)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        guard(&self.emitted).clone()
    }

    pub fn topics(&self) -> Vec<String> {
        guard(&self.emitted).iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn last(&self, topic: &str) -> Option<Value> {
        guard(&self.emitted)
            .iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, v)| v.clone())
    }

    pub fn count(&self, topic: &str) -> usize {
        guard(&self.emitted).iter().filter(|(t, _)| t == topic).count()
    }

    pub fn clear(&self) {
        guard(&self.emitted).clear();
    }
}

impl StatusSink for MemorySink {
    fn emit(&self, topic: &str, payload: &Value) -> DcsResult<()> {
        guard(&self.emitted).push((topic.to_string(), payload.clone()));
        Ok(())
    }
}
