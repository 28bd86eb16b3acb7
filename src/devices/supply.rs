use super::{DeviceAddress, PointIo, PointValue, Stage};
use crate::deadband::DeadbandFilter;
use crate::error::{DcsError, DcsResult};
use serde_json::{Map, Value};

const ANALOG_DEADBAND: f64 = 0.01;
const LV_TEMP_DEADBAND: f64 = 2.0;
// High-resolution current range resolves 1 nA, the high-power range 10 nA (values in uA)
const HV_CURRENT_DEADBAND_LOW_RANGE: f64 = 0.001;
const HV_CURRENT_DEADBAND_HIGH_RANGE: f64 = 0.01;

pub const POWER_POINT: &str = "Pw";
pub const STATUS_POINT: &str = "Status";
pub const SET_VOLTAGE: &str = "set_voltage";
pub const CURRENT_RANGE: &str = "current_range";

/// Static description of one point of a supply stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSpec {
    pub point: &'static str,
    pub attribute: &'static str,
    pub writable: bool,
    pub deadband: Option<f64>,
    /// Allowed text values for enumerated settings; empty means numeric.
    pub tokens: &'static [&'static str],
}

const fn monitor(point: &'static str, attribute: &'static str, deadband: Option<f64>) -> PointSpec {
    PointSpec { point, attribute, writable: false, deadband, tokens: &[] }
}

const fn setting(point: &'static str, attribute: &'static str, deadband: Option<f64>) -> PointSpec {
    PointSpec { point, attribute, writable: true, deadband, tokens: &[] }
}

const fn choice(point: &'static str, attribute: &'static str, tokens: &'static [&'static str]) -> PointSpec {
    PointSpec { point, attribute, writable: true, deadband: None, tokens }
}

const COMMON_POINTS: &[PointSpec] = &[
    monitor(POWER_POINT, "power", None),
    monitor(STATUS_POINT, "status", None),
    setting("V0Set", SET_VOLTAGE, Some(ANALOG_DEADBAND)),
    setting("I0Set", "max_current", Some(ANALOG_DEADBAND)),
    monitor("VMon", "v_mon", Some(ANALOG_DEADBAND)),
    monitor("IMon", "i_mon", Some(ANALOG_DEADBAND)),
    setting("Trip", "trip_time", None),
    setting("TripInt", "trip_int", None),
    setting("TripExt", "trip_ext", None),
];

const LV_POINTS: &[PointSpec] = &[
    setting("UNVThr", "undervoltage_threshold", None),
    setting("OVVThr", "overvoltage_threshold", None),
    setting("RUpTime", "ramp_up_time", None),
    setting("RDwTime", "ramp_down_time", None),
    monitor("Temp", "temp", Some(LV_TEMP_DEADBAND)),
];

const HV_POINTS: &[PointSpec] = &[
    setting("RUp", "ramp_up_speed", None),
    setting("RDWn", "ramp_down_speed", None),
    choice("ImRange", CURRENT_RANGE, &["Low", "High"]),
    choice("PDwn", "trip_mode", &["Kill", "Ramp"]),
];

pub fn point_table(stage: Stage) -> impl Iterator<Item = &'static PointSpec> {
    let extra = match stage {
        Stage::Lv => LV_POINTS,
        Stage::Hv => HV_POINTS,
    };
    COMMON_POINTS.iter().chain(extra.iter())
}

pub fn find_attribute(stage: Stage, attribute: &str) -> Option<&'static PointSpec> {
    point_table(stage).find(|spec| spec.attribute == attribute)
}

/// Checks that `attribute` is a writable setting of `stage` and that `value` fits it.
pub fn resolve_attribute(stage: Stage, attribute: &str, value: &PointValue) -> DcsResult<&'static PointSpec> {
    let spec = find_attribute(stage, attribute)
        .filter(|spec| spec.writable)
        .ok_or_else(|| DcsError::config(format!("{} interface has no writable attribute '{}'", stage, attribute)))?;

    if spec.tokens.is_empty() {
        if value.as_f64().is_none() {
            return Err(DcsError::config(format!(
                "{}.{} expects a number, got '{}'",
                stage, attribute, value
            )));
        }
    } else {
        let token_ok = matches!(value, PointValue::Text(t) if spec.tokens.contains(&t.as_str()));
        if !token_ok {
            return Err(DcsError::config(format!(
                "{}.{} expects one of {:?}, got '{}'",
                stage, attribute, spec.tokens, value
            )));
        }
    }
    Ok(spec)
}

#[derive(Debug, Clone)]
struct PointSlot {
    spec: &'static PointSpec,
    value: Option<PointValue>,
    filter: Option<DeadbandFilter>,
    online: bool,
}

/// Result of feeding one raw notification to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Not a point of this device.
    Unknown,
    /// Inside the deadband; nothing changed downstream.
    Filtered,
    Delivered { status: bool },
}

/// Cached view of one LV or HV stage: every point's last delivered value, its
/// connectivity and the deadband filter guarding analog points.
#[derive(Debug, Clone)]
pub struct SupplyDevice {
    stage: Stage,
    address: DeviceAddress,
    prefix: String,
    points: Vec<PointSlot>,
}

impl SupplyDevice {
    pub fn new(stage: Stage, address: DeviceAddress, crate_prefix: &str) -> Self {
        let points = point_table(stage)
            .map(|spec| PointSlot {
                spec,
                value: None,
                filter: spec.deadband.map(DeadbandFilter::new),
                online: false,
            })
            .collect();

        Self {
            stage,
            address,
            prefix: address.point_prefix(crate_prefix),
            points,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn point_names(&self) -> Vec<&'static str> {
        self.points.iter().map(|slot| slot.spec.point).collect()
    }

    fn slot_mut(&mut self, point: &str) -> Option<&mut PointSlot> {
        self.points.iter_mut().find(|slot| slot.spec.point == point)
    }

    fn slot(&self, point: &str) -> Option<&PointSlot> {
        self.points.iter().find(|slot| slot.spec.point == point)
    }

    pub fn observe(&mut self, point: &str, value: PointValue) -> Observation {
        let Some(slot) = self.slot_mut(point) else {
            return Observation::Unknown;
        };
        slot.online = true;

        if let Some(filter) = slot.filter.as_mut() {
            // Non-numeric readings on analog points carry no information
            let delivered = value.as_f64().map_or(false, |v| filter.observe(v));
            if !delivered {
                return Observation::Filtered;
            }
        }

        slot.value = Some(value);
        Observation::Delivered { status: point == STATUS_POINT }
    }

    pub fn set_online(&mut self, point: &str, online: bool) -> bool {
        match self.slot_mut(point) {
            Some(slot) => {
                slot.online = online;
                true
            }
            None => false,
        }
    }

    pub fn is_online(&self) -> bool {
        self.points.iter().all(|slot| slot.online)
    }

    pub fn status(&self) -> Option<i64> {
        self.slot(STATUS_POINT)?.value.as_ref()?.as_code()
    }

    pub fn value(&self, attribute: &str) -> Option<&PointValue> {
        self.points
            .iter()
            .find(|slot| slot.spec.attribute == attribute)?
            .value
            .as_ref()
    }

    pub fn deadband(&self, point: &str) -> Option<f64> {
        self.slot(point)?.filter.as_ref().map(DeadbandFilter::threshold)
    }

    pub fn set_deadband(&mut self, point: &str, threshold: f64) -> bool {
        match self.slot_mut(point).and_then(|slot| slot.filter.as_mut()) {
            Some(filter) => {
                filter.set_threshold(threshold);
                true
            }
            None => false,
        }
    }

    /// Drop every deadband baseline so the first readings after a re-attach are delivered.
    pub fn reset_filters(&mut self) {
        for filter in self.points.iter_mut().filter_map(|slot| slot.filter.as_mut()) {
            filter.reset();
        }
    }

    pub fn switch(&self, io: &dyn PointIo, on: bool) -> DcsResult<()> {
        let value = if on { "On" } else { "Off" };
        io.put(&format!("{}{}", self.prefix, POWER_POINT), PointValue::text(value))
    }

    /// Write a configurable setting through the I/O boundary.
    ///
    /// The cache is not touched: the written value shows up once the device
    /// reports it back through a notification.
    pub fn write_attribute(&mut self, io: &dyn PointIo, attribute: &str, value: PointValue) -> DcsResult<()> {
        let spec = resolve_attribute(self.stage, attribute, &value)
            .map_err(|e| DcsError::rejected(e.to_string()))?;

        let value = match value.as_f64() {
            Some(v) if spec.tokens.is_empty() => PointValue::Number(v),
            _ => value,
        };

        io.put(&format!("{}{}", self.prefix, spec.point), value.clone())?;

        if spec.attribute == CURRENT_RANGE {
            let threshold = match &value {
                PointValue::Text(t) if t == "Low" => HV_CURRENT_DEADBAND_LOW_RANGE,
                _ => HV_CURRENT_DEADBAND_HIGH_RANGE,
            };
            self.set_deadband("I0Set", threshold);
            self.set_deadband("IMon", threshold);
        }
        Ok(())
    }

    /// Insert `<stage>_<attribute>` entries for every point, `null` when never reported.
    /// With `stale` set every value is `null`, since cached readings no longer
    /// describe the hardware.
    pub fn fill_snapshot(&self, out: &mut Map<String, Value>, stale: bool) {
        let stage = self.stage.as_str();
        out.insert(format!("{}_board", stage), Value::from(self.address.board));
        out.insert(format!("{}_channel", stage), Value::from(self.address.chan));
        for slot in &self.points {
            let value = match &slot.value {
                _ if stale => Value::Null,
                Some(PointValue::Number(v)) => Value::from(*v),
                Some(PointValue::Text(t)) => Value::from(t.clone()),
                None => Value::Null,
            };
            out.insert(format!("{}_{}", stage, slot.spec.attribute), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lv() -> SupplyDevice {
        SupplyDevice::new(Stage::Lv, DeviceAddress::new(0, 3), "cleanroom")
    }

    #[test]
    fn test_point_tables() {
        let lv_points: Vec<_> = point_table(Stage::Lv).map(|p| p.point).collect();
        assert!(lv_points.contains(&"Temp"));
        assert!(!lv_points.contains(&"ImRange"));

        let hv_points: Vec<_> = point_table(Stage::Hv).map(|p| p.point).collect();
        assert!(hv_points.contains(&"PDwn"));
        assert!(!hv_points.contains(&"UNVThr"));
    }

    #[test]
    fn test_resolve_attribute() {
        assert!(resolve_attribute(Stage::Lv, "set_voltage", &PointValue::Number(8.0)).is_ok());
        assert!(resolve_attribute(Stage::Lv, "ramp_up_speed", &PointValue::Number(8.0)).is_err());
        assert!(resolve_attribute(Stage::Hv, "trip_mode", &PointValue::text("Kill")).is_ok());
        assert!(resolve_attribute(Stage::Hv, "trip_mode", &PointValue::text("Explode")).is_err());
        assert!(resolve_attribute(Stage::Hv, "v_mon", &PointValue::Number(1.0)).is_err());
        assert!(resolve_attribute(Stage::Lv, "bogus", &PointValue::Number(1.0)).is_err());
    }

    #[test]
    fn test_observe_status_and_deadband() {
        let mut device = lv();
        assert_eq!(device.observe("Status", PointValue::Number(1.0)), Observation::Delivered { status: true });
        assert_eq!(device.status(), Some(1));

        assert_eq!(device.observe("VMon", PointValue::Number(10.0)), Observation::Delivered { status: false });
        assert_eq!(device.observe("VMon", PointValue::Number(10.005)), Observation::Filtered);
        assert_eq!(device.value("v_mon"), Some(&PointValue::Number(10.0)));

        assert_eq!(device.observe("Nope", PointValue::Number(1.0)), Observation::Unknown);
    }

    #[test]
    fn test_temperature_uses_wide_deadband() {
        let mut device = lv();
        assert_eq!(device.deadband("Temp"), Some(2.0));
        assert!(matches!(device.observe("Temp", PointValue::Number(25.0)), Observation::Delivered { .. }));
        assert_eq!(device.observe("Temp", PointValue::Number(26.5)), Observation::Filtered);
    }

    #[test]
    fn test_snapshot_keys() {
        let mut device = lv();
        device.observe("VMon", PointValue::Number(10.0));
        let mut map = Map::new();
        device.fill_snapshot(&mut map, false);
        assert_eq!(map["lv_board"], Value::from(0));
        assert_eq!(map["lv_channel"], Value::from(3));
        assert_eq!(map["lv_v_mon"], Value::from(10.0));
        assert_eq!(map["lv_status"], Value::Null);

        device.fill_snapshot(&mut map, true);
        assert_eq!(map["lv_channel"], Value::from(3));
        assert_eq!(map["lv_v_mon"], Value::Null);
    }
}
