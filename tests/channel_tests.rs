use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::Span;
use trackerdcs::channel::{
    lock_channel, Channel, ChannelIdentity, ChannelState, SharedChannel, StatusCodes,
};
use trackerdcs::devices::{DeviceAddress, Notification, PointValue, Stage};
use trackerdcs::notify::NotificationRouter;
use trackerdcs::sim::{MemorySink, SimulatedCrate};
use trackerdcs::telemetry::{publish, Publishable};

const LV: &str = "cleanroom:01:004:";
const HV: &str = "cleanroom:13:010:";

struct Rig {
    channel: SharedChannel,
    router: NotificationRouter,
    sim: Arc<SimulatedCrate>,
    rx: UnboundedReceiver<Notification>,
}

impl Rig {
    fn new(module: Option<&str>) -> Self {
        let (sim, rx) = SimulatedCrate::new("cleanroom");
        let sim = Arc::new(sim);
        let identity = ChannelIdentity {
            id: "4".into(),
            module: module.map(str::to_string),
            lv: DeviceAddress::new(1, 4),
            hv: DeviceAddress::new(13, 10),
        };
        let channel = Channel::new(
            identity,
            sim.clone(),
            StatusCodes::default(),
            "cleanroom",
            "dcs/channels".into(),
            &Span::none(),
        );
        let channel = Arc::new(Mutex::new(channel));
        let router = NotificationRouter::new();
        router.register(&channel);
        Self { channel, router, sim, rx }
    }

    fn connected() -> Self {
        let rig = Self::new(Some("M4"));
        rig.with(|c| c.connect().unwrap());
        rig
    }

    fn with<T>(&self, f: impl FnOnce(&mut Channel) -> T) -> T {
        f(&mut lock_channel(&self.channel))
    }

    fn pump(&mut self) -> ChannelState {
        self.router.drain(&mut self.rx);
        self.with(|c| c.state())
    }
}

#[test]
fn test_connect_then_status_drives_state() {
    let mut rig = Rig::new(Some("M4"));
    assert_eq!(rig.with(|c| c.state()), ChannelState::Init);
    assert!(!rig.with(|c| c.is_publishable()));

    // Attach only queues notifications; nothing is known yet
    assert_eq!(rig.with(|c| c.connect()).unwrap(), ChannelState::Connected);
    assert_eq!(rig.pump(), ChannelState::LvOff);
    assert!(rig.with(|c| c.device(Stage::Lv).is_online()));
    assert!(rig.with(|c| c.device(Stage::Hv).is_online()));
}

#[test]
fn test_commands_wait_for_status() {
    let mut rig = Rig::connected();
    rig.pump();

    // The switch leaves the state alone until the supply reports back
    assert_eq!(rig.with(|c| c.switch_lv_on()).unwrap(), ChannelState::LvOff);
    assert_eq!(rig.sim.value(LV, "Pw"), Some(PointValue::text("On")));
    assert_eq!(rig.pump(), ChannelState::LvOn);

    rig.with(|c| c.switch_hv_on()).unwrap();
    assert_eq!(rig.pump(), ChannelState::HvRamp);
    rig.sim.advance();
    assert_eq!(rig.pump(), ChannelState::HvOn);

    // Ramp down can be interrupted mid-way by another off
    rig.with(|c| c.switch_hv_off()).unwrap();
    assert_eq!(rig.pump(), ChannelState::HvRamp);
    rig.with(|c| c.switch_hv_off()).unwrap();
    rig.sim.advance();
    assert_eq!(rig.pump(), ChannelState::LvOn);
}

#[test]
fn test_illegal_commands_change_nothing() {
    let mut rig = Rig::connected();
    rig.pump();
    let err = rig.with(|c| c.switch_hv_on()).unwrap_err();
    assert!(err.is_rejection());
    assert!(rig.sim.puts().is_empty());
    assert!(rig.with(|c| c.switch_lv_off()).is_err());
    assert!(rig.with(|c| c.clear_alarm()).is_err());
    assert_eq!(rig.pump(), ChannelState::LvOff);
}

#[test]
fn test_trip_and_clear() {
    let mut rig = Rig::connected();
    rig.pump();
    rig.with(|c| c.switch_lv_on()).unwrap();
    rig.pump();

    rig.sim.trip(LV, 2.0);
    assert_eq!(rig.pump(), ChannelState::Error);

    // Setpoints stay writable while tripped
    rig.with(|c| c.set_low_voltage_setpoint(8.0)).unwrap();
    assert_eq!(rig.sim.value(LV, "V0Set"), Some(PointValue::Number(8.0)));

    rig.with(|c| c.clear_alarm()).unwrap();
    assert_eq!(rig.sim.puts().last().unwrap().0, "cleanroom:ClearAlarm");
    assert_eq!(rig.pump(), ChannelState::LvOff);
}

#[test]
fn test_connection_loss_from_any_state() {
    let mut rig = Rig::connected();
    rig.pump();
    rig.with(|c| c.switch_lv_on()).unwrap();
    rig.pump();

    rig.sim.disconnect(HV);
    assert_eq!(rig.pump(), ChannelState::Disconnected);
    assert!(rig.with(|c| c.is_publishable()));
    assert!(rig.with(|c| c.set_high_voltage_setpoint(10.0)).unwrap_err().is_rejection());

    // Status updates while disconnected do not move the channel
    rig.sim.trip(LV, 0.0);
    assert_eq!(rig.pump(), ChannelState::Disconnected);

    rig.with(|c| c.reconnect()).unwrap();
    assert_eq!(rig.pump(), ChannelState::LvOff);
}

#[test]
fn test_disconnected_channel_still_publishes() {
    let mut rig = Rig::connected();
    rig.pump();
    let sink = MemorySink::new();
    assert!(rig.with(|c| publish(c, &sink, false)).unwrap());
    assert_eq!(sink.last("dcs/channels").unwrap()["state"], "LV_OFF");

    rig.sim.disconnect(HV);
    rig.pump();
    assert!(rig.with(|c| publish(c, &sink, false)).unwrap());
    let snapshot = sink.last("dcs/channels").unwrap();
    assert_eq!(snapshot["state"], "DISCONNECTED");
    assert_eq!(snapshot["hv_power"], serde_json::Value::Null);
    assert_eq!(snapshot["lv_status"], serde_json::Value::Null);
    assert_eq!(snapshot["hv_channel"], 10);

    // Forced refreshes keep reporting the loss
    assert!(rig.with(|c| publish(c, &sink, true)).unwrap());
    assert_eq!(sink.count("dcs/channels"), 3);
}

#[test]
fn test_reconnect_communication_failure() {
    let mut rig = Rig::connected();
    rig.pump();
    rig.sim.disconnect(LV);
    rig.pump();

    rig.sim.set_offline(true);
    let err = rig.with(|c| c.reconnect()).unwrap_err();
    assert!(err.is_communication_failure());
    assert_eq!(rig.pump(), ChannelState::Disconnected);
}

#[test]
fn test_deadband_suppresses_noise() {
    let mut rig = Rig::connected();
    rig.pump();
    let sink = MemorySink::new();
    rig.with(|c| publish(c, &sink, false)).unwrap();

    rig.sim.set_value(HV, "IMon", PointValue::Number(0.005));
    rig.pump();
    assert!(!rig.with(|c| c.is_changed()));

    rig.sim.set_value(HV, "IMon", PointValue::Number(0.5));
    rig.pump();
    assert!(rig.with(|c| c.is_changed()));
    assert!(rig.with(|c| publish(c, &sink, false)).unwrap());
    assert_eq!(sink.last("dcs/channels").unwrap()["hv_i_mon"], 0.5);
}

#[test]
fn test_current_range_narrows_deadband() {
    let rig = Rig::connected();
    assert_eq!(rig.with(|c| c.device(Stage::Hv).deadband("IMon")), Some(0.01));
    rig.with(|c| c.write_attribute(Stage::Hv, "current_range", PointValue::text("Low")))
        .unwrap();
    assert_eq!(rig.with(|c| c.device(Stage::Hv).deadband("IMon")), Some(0.001));
    assert!(rig
        .with(|c| c.write_attribute(Stage::Hv, "current_range", PointValue::text("Medium")))
        .unwrap_err()
        .is_rejection());
}

#[test]
fn test_snapshot_shape() {
    let mut rig = Rig::connected();
    rig.pump();
    let snapshot = rig.with(|c| c.snapshot());
    assert_eq!(snapshot["id"], "4");
    assert_eq!(snapshot["module"], "M4");
    assert_eq!(snapshot["state"], "LV_OFF");
    assert_eq!(snapshot["lv_board"], 1);
    assert_eq!(snapshot["hv_channel"], 10);
    assert_eq!(snapshot["hv_power"], "Off");
    assert_eq!(rig.with(|c| c.topic()), "dcs/channels");

    let monitored = Rig::new(None);
    assert!(!monitored.with(|c| c.is_active()));
    assert_eq!(monitored.with(|c| c.snapshot())["module"], serde_json::Value::Null);
}

#[test]
fn test_updates_for_unknown_points_are_ignored() {
    let rig = Rig::connected();
    assert!(!rig.with(|c| c.on_point_update(Stage::Lv, "Bogus", PointValue::Number(1.0))));
    let routed = rig.router.dispatch(Notification::Update {
        point: "cleanroom:09:009:Status".into(),
        value: PointValue::Number(1.0),
    });
    assert!(!routed);
}
