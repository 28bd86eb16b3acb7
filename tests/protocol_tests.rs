use trackerdcs::devices::Stage;
use trackerdcs::error::DcsError;
use trackerdcs::protocol::{
    ChillerCommand, Command, CommandTable, CoolingCommand, FleetCommand, SetpointLimits,
};

fn table() -> CommandTable {
    CommandTable::new("dcs", SetpointLimits::default())
        .with_cooling("marta")
        .with_chiller("julabo")
}

fn parse(topic: &str, payload: &str) -> Result<Command, DcsError> {
    table().parse(topic, payload.as_bytes())
}

fn assert_malformed(topic: &str, payload: &str) {
    match parse(topic, payload) {
        Err(DcsError::MalformedCommand(_)) => {}
        other => panic!("{} {:?} gave {:?}", topic, payload, other),
    }
}

fn assert_out_of_bounds(topic: &str, payload: &str) {
    match parse(topic, payload) {
        Err(DcsError::CommandRejected(_)) => {}
        other => panic!("{} {:?} gave {:?}", topic, payload, other),
    }
}

#[test]
fn test_fleet_switch() {
    assert_eq!(
        parse("dcs/cmd/switch/lv", "on").unwrap(),
        Command::Fleet(FleetCommand::Switch { stage: Stage::Lv, on: true })
    );
    assert_eq!(
        parse("dcs/cmd/switch/hv", " off\n").unwrap(),
        Command::Fleet(FleetCommand::Switch { stage: Stage::Hv, on: false })
    );
    assert_malformed("dcs/cmd/switch/hv", "ON");
    assert_malformed("dcs/cmd/switch/mv", "on");
    assert_malformed("dcs/cmd/switch/lv/3", "on");
}

#[test]
fn test_fleet_setv_limits() {
    assert_eq!(
        parse("dcs/cmd/setv/hv/12", "999.5").unwrap(),
        Command::Fleet(FleetCommand::SetVoltage {
            stage: Stage::Hv,
            channel: "12".into(),
            volts: 999.5,
        })
    );
    assert!(parse("dcs/cmd/setv/lv/1", "15").is_ok());
    assert!(parse("dcs/cmd/setv/lv/1", "0").is_ok());
    assert_out_of_bounds("dcs/cmd/setv/lv/1", "15.01");
    assert_out_of_bounds("dcs/cmd/setv/hv/1", "-1");
    assert_malformed("dcs/cmd/setv/hv/1", "NaN");
    assert_malformed("dcs/cmd/setv/hv", "100");
}

#[test]
fn test_custom_limits() {
    let limits = SetpointLimits {
        lv_setpoint: [0.0, 12.0],
        hv_setpoint: [0.0, 500.0],
    };
    let table = CommandTable::new("dcs", limits);
    assert!(table.parse("dcs/cmd/setv/hv/1", b"501").unwrap_err().is_rejection());
    assert!(table.parse("dcs/cmd/setv/hv/1", b"500").is_ok());
}

#[test]
fn test_fleet_plain_verbs() {
    for (verb, command) in [
        ("clear", FleetCommand::ClearAlarms),
        ("refresh", FleetCommand::Refresh),
        ("reload", FleetCommand::Reload),
        ("reconnect", FleetCommand::Reconnect),
    ] {
        assert_eq!(parse(&format!("dcs/cmd/{}", verb), "").unwrap(), Command::Fleet(command));
        assert_malformed(&format!("dcs/cmd/{}/lv", verb), "");
    }
}

#[test]
fn test_cooling_verbs() {
    assert_eq!(
        parse("marta/cmd/start_co2", "").unwrap(),
        Command::Cooling(CoolingCommand::StartCo2)
    );
    assert_eq!(
        parse("marta/cmd/set_flow_active", "1").unwrap(),
        Command::Cooling(CoolingCommand::SetFlowActive(true))
    );
    assert_eq!(
        parse("marta/cmd/set_speed_setpoint", "6000").unwrap(),
        Command::Cooling(CoolingCommand::SetSpeedSetpoint(6000.0))
    );
    assert_malformed("marta/cmd/set_flow_active", "yes");
    assert_out_of_bounds("marta/cmd/set_temperature_setpoint", "-36");
    assert_out_of_bounds("marta/cmd/set_flow_setpoint", "5.5");
    assert_malformed("marta/cmd/start_chiller/now", "");
}

#[test]
fn test_chiller_payloads() {
    assert_eq!(
        parse("julabo/cmd/set_working_temp", r#"{"setpoint": 1, "temp": -49.5}"#).unwrap(),
        Command::Chiller(ChillerCommand::SetWorkingTemp { setpoint: 1, temp: -49.5 })
    );
    // Upper bound is exclusive
    assert_out_of_bounds("julabo/cmd/set_working_temp", r#"{"setpoint": 1, "temp": 50}"#);
    assert_malformed("julabo/cmd/set_working_temp", r#"{"setpoint": 1}"#);
    assert_out_of_bounds("julabo/cmd/use_setpoint", r#"{"setpoint": 0}"#);
    assert_out_of_bounds("julabo/cmd/set_pressure_stage", r#"{"stage": 5}"#);
    assert_malformed("julabo/cmd/use_setpoint", "3");
    assert_eq!(
        parse("julabo/cmd/set_pressure_stage", r#"{"stage": 4}"#).unwrap(),
        Command::Chiller(ChillerCommand::SetPressureStage { stage: 4 })
    );
}

#[test]
fn test_topic_shape_errors() {
    assert_malformed("dcs/status", "");
    assert_malformed("dcs//cmd/refresh", "");
    assert_malformed("dcs/cmd/setv/hv/1/2", "1");
    assert_malformed("nobody/cmd/refresh", "");
    assert!(matches!(
        table().parse("dcs/cmd/switch/lv", &[0xff, 0xfe]),
        Err(DcsError::MalformedCommand(_))
    ));
}

#[test]
fn test_subscriptions() {
    assert_eq!(table().subscriptions(), ["dcs/cmd/#", "marta/cmd/#", "julabo/cmd/#"]);
    assert_eq!(
        CommandTable::new("dcs", SetpointLimits::default()).subscriptions(),
        ["dcs/cmd/#"]
    );
}
