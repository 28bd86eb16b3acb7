use tracing::Span;
use trackerdcs::config::DcsConfig;
use trackerdcs::cooling::{CoolingState, CoolingUnit};
use trackerdcs::error::DcsError;
use trackerdcs::protocol::CoolingCommand;
use trackerdcs::registers::RegisterValue;
use trackerdcs::sim::SimulatedBus;
use trackerdcs::telemetry::Publishable;

const CONFIG: &str = r#"
cooling:
  max_chunk_len: 8
  registers:
    status: { address: 0 }
    set_start_chiller: { address: 10, type: bool, bit: 0, input: true }
    set_start_co2: { address: 10, type: bool, bit: 1, input: true }
    set_alarm_reset: { address: 10, type: bool, bit: 2, input: true }
    set_flow_active: { address: 10, type: bool, bit: 3, input: true }
    set_speed_setpoint: { address: 12, input: true }
    alarm_pressure: { address: 30, type: bool, bit: 0 }
    alarm_flow: { address: 30, type: bool, bit: 4 }
  alarm_codes:
    alarm_pressure: "Pressure high"
    alarm_flow: "Flow too low"
"#;

fn unit(bus: &SimulatedBus) -> CoolingUnit {
    let config = DcsConfig::from_yaml_str(CONFIG).unwrap();
    CoolingUnit::new(config.cooling.as_ref().unwrap(), Box::new(bus.clone()), &Span::none()).unwrap()
}

fn connected(bus: &SimulatedBus) -> CoolingUnit {
    bus.set_word(0, 1);
    let mut unit = unit(bus);
    unit.connect().unwrap();
    unit
}

#[test]
fn test_default_name_and_init_state() {
    let bus = SimulatedBus::new();
    let mut unit = unit(&bus);
    assert_eq!(unit.name(), "marta");
    assert_eq!(unit.state(), CoolingState::Init);
    assert!(unit.start_chiller().unwrap_err().is_rejection());
    assert!(unit.reconnect().unwrap_err().is_rejection());
    assert_eq!(unit.snapshot(), serde_json::json!({"state": "INIT"}));
}

#[test]
fn test_connect_reads_status() {
    let bus = SimulatedBus::new();
    let mut unit = connected(&bus);
    assert_eq!(unit.state(), CoolingState::Connected);
    assert_eq!(unit.read("status").unwrap(), Some(RegisterValue::Int(1)));
    assert!(unit.connect().unwrap_err().is_rejection());
    assert_eq!(unit.topic(), "marta/status");
    assert_eq!(unit.alarm_topic(), "marta/alarms");
}

#[test]
fn test_full_start_and_stop_cycle() {
    let bus = SimulatedBus::new();
    let mut unit = connected(&bus);

    unit.execute(&CoolingCommand::StartChiller).unwrap();
    unit.update_status().unwrap();
    assert_eq!(unit.state(), CoolingState::ChillerRunning);

    unit.execute(&CoolingCommand::StartCo2).unwrap();
    bus.set_word(0, 2);
    unit.update_status().unwrap();
    assert_eq!(unit.state(), CoolingState::Co2Running);
    assert!(unit.stop_chiller().unwrap_err().is_rejection());

    unit.execute(&CoolingCommand::StopCo2).unwrap();
    bus.set_word(0, 1);
    unit.update_status().unwrap();
    assert_eq!(unit.state(), CoolingState::ChillerRunning);

    unit.execute(&CoolingCommand::StopChiller).unwrap();
    unit.update_status().unwrap();
    assert_eq!(unit.state(), CoolingState::Connected);
    assert_eq!(bus.word(10), 0);
}

#[test]
fn test_unmapped_status_word_keeps_state() {
    let bus = SimulatedBus::new();
    let mut unit = connected(&bus);
    unit.start_chiller().unwrap();
    unit.update_status().unwrap();

    // Running status without the CO2 bit is a transient
    bus.set_word(0, 2);
    unit.update_status().unwrap();
    assert_eq!(unit.state(), CoolingState::ChillerRunning);
}

#[test]
fn test_co2_bit_without_chiller_bit_is_inconsistent() {
    let bus = SimulatedBus::new();
    let mut unit = connected(&bus);
    bus.set_word(10, 0b10);
    let err = unit.update_status().unwrap_err();
    assert!(matches!(err, DcsError::InternalInconsistency(_)));
    assert_eq!(unit.state(), CoolingState::Connected);
}

#[test]
fn test_alarm_message_lists_raised_bits() {
    let bus = SimulatedBus::new();
    let mut unit = connected(&bus);
    assert_eq!(unit.alarm_message(), "");

    bus.set_word(30, 0b1_0001);
    bus.set_word(0, 3);
    unit.update_status().unwrap();
    assert_eq!(unit.state(), CoolingState::Alarm);
    assert_eq!(
        unit.alarm_message(),
        "Flow too low (alarm_flow)\nPressure high (alarm_pressure)\n"
    );
}

#[test]
fn test_clear_alarms_drops_start_bits_then_pulses_reset() {
    let bus = SimulatedBus::new();
    let mut unit = connected(&bus);
    assert!(unit.clear_alarms().unwrap_err().is_rejection());

    unit.start_chiller().unwrap();
    bus.set_word(0, 3);
    unit.update_status().unwrap();
    unit.clear_alarms().unwrap();

    let words: Vec<u16> = bus.writes().into_iter().skip(1).map(|(_, w)| w[0]).collect();
    assert_eq!(words, [0b001, 0b000, 0b100, 0b000]);
}

#[test]
fn test_parameters_writable_while_connected() {
    let bus = SimulatedBus::new();
    let mut unit = connected(&bus);
    unit.execute(&CoolingCommand::SetFlowActive(true)).unwrap();
    assert_eq!(bus.word(10), 0b1000);
    unit.execute(&CoolingCommand::SetSpeedSetpoint(1500.0)).unwrap();
    assert_eq!(bus.word(12), 1500);

    // Not configured on this unit
    assert!(unit
        .execute(&CoolingCommand::SetTemperatureSetpoint(-10.0))
        .unwrap_err()
        .is_rejection());
}

#[test]
fn test_bus_failure_disconnects_and_hides_values() {
    let bus = SimulatedBus::new();
    let mut unit = connected(&bus);
    assert!(unit.snapshot().get("status").is_some());

    bus.set_failing(true);
    assert!(unit.update_status().unwrap_err().is_communication_failure());
    assert_eq!(unit.state(), CoolingState::Disconnected);
    assert!(unit.is_changed());
    assert_eq!(unit.snapshot(), serde_json::json!({"state": "DISCONNECTED"}));
    assert!(unit.set_parameter("set_speed_setpoint", 1.0).unwrap_err().is_rejection());

    bus.set_failing(false);
    unit.execute(&CoolingCommand::Reconnect).unwrap();
    assert_eq!(unit.state(), CoolingState::Connected);
}

#[test]
fn test_failed_write_disconnects() {
    let bus = SimulatedBus::new();
    let mut unit = connected(&bus);
    bus.set_failing(true);
    assert!(unit.start_chiller().unwrap_err().is_communication_failure());
    assert_eq!(unit.state(), CoolingState::Disconnected);
}

#[test]
fn test_reads_follow_configured_chunking() {
    let bus = SimulatedBus::new();
    let unit = connected(&bus);
    assert_eq!(unit.registers().chunks().len(), 4);
    assert!(bus.reads().contains(&(10, 1)));
    assert!(bus.reads().contains(&(12, 1)));
}
