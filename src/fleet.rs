//! Fleet-wide state aggregation and command fan-out.

use crate::channel::{lock_channel, Channel, ChannelState, SharedChannel};
use crate::config::DcsConfig;
use crate::devices::{PointIo, PointValue, Stage};
use crate::error::{DcsError, DcsResult};
use crate::notify::NotificationRouter;
use crate::telemetry::{publish, Publishable, StatusSink};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FleetState {
    Init,
    Disconnected,
    Connected,
    LvOff,
    LvMix,
    LvOn,
    HvRamp,
    HvMix,
    HvOn,
    Error,
}

impl FleetState {
    pub fn as_str(self) -> &'static str {
        match self {
            FleetState::Init => "INIT",
            FleetState::Disconnected => "DISCONNECTED",
            FleetState::Connected => "CONNECTED",
            FleetState::LvOff => "LV_OFF",
            FleetState::LvMix => "LV_MIX",
            FleetState::LvOn => "LV_ON",
            FleetState::HvRamp => "HV_RAMP",
            FleetState::HvMix => "HV_MIX",
            FleetState::HvOn => "HV_ON",
            FleetState::Error => "ERROR",
        }
    }
}

impl fmt::Display for FleetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate state of the active channels; the first matching rule wins.
pub fn aggregate_state(states: &[ChannelState]) -> DcsResult<FleetState> {
    use ChannelState as C;

    let any = |s: C| states.contains(&s);
    let all = |s: C| states.iter().all(|&x| x == s);

    let state = if any(C::Error) {
        FleetState::Error
    } else if any(C::Disconnected) {
        FleetState::Disconnected
    } else if all(C::Connected) {
        FleetState::Connected
    } else if all(C::LvOff) {
        FleetState::LvOff
    } else if any(C::LvOff) && any(C::HvOn) {
        FleetState::Error
    } else if any(C::LvOff) && any(C::LvOn) {
        FleetState::LvMix
    } else if all(C::LvOn) {
        FleetState::LvOn
    } else if all(C::HvOn) {
        FleetState::HvOn
    } else if any(C::HvRamp) {
        FleetState::HvRamp
    } else if any(C::LvOn) && any(C::HvOn) {
        FleetState::HvMix
    } else {
        let names: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        return Err(DcsError::InternalInconsistency(format!(
            "no fleet state for channel states [{}]",
            names.join(", ")
        )));
    };
    Ok(state)
}

/// Outcome of a command applied to many channels.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub applied: usize,
    pub rejected: Vec<(String, DcsError)>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

pub struct Fleet {
    name: String,
    state: FleetState,
    channels: Vec<SharedChannel>,
    router: NotificationRouter,
    io: Arc<dyn PointIo>,
    config: Option<DcsConfig>,
    changed: bool,
    span: Span,
    parent: Span,
}

impl fmt::Debug for Fleet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fleet")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl Fleet {
    pub fn new(io: Arc<dyn PointIo>, router: NotificationRouter, parent: &Span) -> Self {
        let name = crate::config::DEFAULT_FLEET_NAME.to_string();
        Self {
            span: tracing::info_span!(parent: parent, "fleet", name = %name),
            name,
            state: FleetState::Init,
            channels: Vec::new(),
            router,
            io,
            config: None,
            changed: true,
            parent: parent.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> FleetState {
        self.state
    }

    pub fn config(&self) -> Option<&DcsConfig> {
        self.config.as_ref()
    }

    pub fn channels(&self) -> &[SharedChannel] {
        &self.channels
    }

    pub fn channel(&self, id: &str) -> Option<SharedChannel> {
        self.channels.iter().find(|c| lock_channel(c).id() == id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.channels.iter().filter(|c| lock_channel(c).is_active()).count()
    }

    pub fn router(&self) -> &NotificationRouter {
        &self.router
    }

    fn enter(&mut self, next: FleetState) {
        if next != self.state {
            info!(parent: &self.span, from = %self.state, to = %next, "FSM state change");
            self.state = next;
            self.changed = true;
        }
    }

    /// Build every configured channel, connect it and apply its attribute defaults.
    ///
    /// Only legal from INIT. Per-channel connect or attribute failures are logged and
    /// leave that channel DISCONNECTED; they do not fail the load.
    pub fn load(&mut self, config: DcsConfig) -> DcsResult<()> {
        if self.state != FleetState::Init {
            return Err(DcsError::rejected(format!("load not allowed in state {}", self.state)));
        }
        config.validate()?;

        self.name = config.name.clone();
        self.span = tracing::info_span!(parent: &self.parent, "fleet", name = %self.name);
        info!(parent: &self.span, channels = config.channels.len(), "loading configuration");

        let topic = format!("{}/channels", self.name);
        for channel_config in &config.channels {
            let channel = Channel::new(
                channel_config.identity(),
                Arc::clone(&self.io),
                config.status_codes.clone(),
                &config.point_prefix,
                topic.clone(),
                &self.span,
            );
            let shared = Arc::new(Mutex::new(channel));
            self.router.register(&shared);
            self.channels.push(shared);
        }
        self.enter(FleetState::Disconnected);

        for (shared, channel_config) in self.channels.iter().zip(&config.channels) {
            let mut channel = lock_channel(shared);
            if let Err(e) = channel.connect() {
                warn!(parent: &self.span, channel = channel.id(), error = %e, "connect failed");
                continue;
            }
            for stage in [Stage::Lv, Stage::Hv] {
                for (attribute, value) in config.merged_attributes(channel_config, stage)? {
                    debug!(parent: &self.span, channel = channel.id(), %stage, %attribute, %value, "applying default");
                    if let Err(e) = channel.write_attribute(stage, &attribute, value) {
                        warn!(parent: &self.span, channel = channel.id(), %stage, %attribute, error = %e, "default not applied");
                    }
                }
            }
        }

        self.config = Some(config);
        self.changed = true;
        Ok(())
    }

    /// Drop every channel and return to INIT. Routed notifications for the old points
    /// are discarded from here on.
    pub fn teardown(&mut self) {
        info!(parent: &self.span, channels = self.channels.len(), "tearing down channels");
        self.router.clear();
        self.channels.clear();
        self.enter(FleetState::Init);
    }

    /// Tear down and rebuild from a freshly read configuration.
    ///
    /// On a loader or validation failure the previous configuration is rebuilt and the
    /// error returned.
    pub fn reload(&mut self, loader: &mut dyn FnMut() -> DcsResult<DcsConfig>) -> DcsResult<()> {
        info!(parent: &self.span, "reloading configuration");
        let previous = self.config.take();
        self.teardown();

        let result = loader().and_then(|config| self.load(config));
        if let Err(e) = result {
            error!(parent: &self.span, error = %e, "reload failed");
            if self.state != FleetState::Init {
                self.teardown();
            }
            if let Some(previous) = previous {
                info!(parent: &self.span, "restoring previous configuration");
                self.load(previous)?;
            }
            return Err(e);
        }
        Ok(())
    }

    fn active_states(&self) -> Vec<ChannelState> {
        self.channels
            .iter()
            .filter_map(|c| {
                let channel = lock_channel(c);
                channel.is_active().then(|| channel.state())
            })
            .collect()
    }

    /// Recompute the aggregate state. Skipped while INIT; an inconsistency is logged
    /// as fatal and leaves the state unchanged.
    pub fn evaluate(&mut self) -> DcsResult<FleetState> {
        if self.state == FleetState::Init {
            return Ok(self.state);
        }
        match aggregate_state(&self.active_states()) {
            Ok(next) => {
                self.enter(next);
                Ok(next)
            }
            Err(e) => {
                error!(parent: &self.span, fatal = true, error = %e, "fleet evaluation failed");
                Err(e)
            }
        }
    }

    fn gate(&self, action: &str, allowed: &[FleetState]) -> DcsResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            warn!(parent: &self.span, state = %self.state, "rejected {}", action);
            Err(DcsError::rejected(format!("{} not allowed in fleet state {}", action, self.state)))
        }
    }

    fn fan_out(&self, action: &str, mut op: impl FnMut(&mut Channel) -> DcsResult<ChannelState>) -> FanOutReport {
        let mut report = FanOutReport::default();
        for shared in &self.channels {
            let mut channel = lock_channel(shared);
            if !channel.is_active() {
                continue;
            }
            match op(&mut *channel) {
                Ok(_) => report.applied += 1,
                Err(e) => {
                    warn!(parent: &self.span, channel = channel.id(), error = %e, "{} failed", action);
                    report.rejected.push((channel.id().to_string(), e));
                }
            }
        }
        info!(parent: &self.span, applied = report.applied, rejected = report.rejected.len(), "{}", action);
        report
    }

    pub fn switch_lv_on(&mut self) -> DcsResult<FanOutReport> {
        self.gate("switch_lv_on", &[FleetState::LvOff, FleetState::LvMix])?;
        Ok(self.fan_out("switch_lv_on", Channel::switch_lv_on))
    }

    pub fn switch_lv_off(&mut self) -> DcsResult<FanOutReport> {
        self.gate("switch_lv_off", &[FleetState::LvOn, FleetState::LvMix])?;
        Ok(self.fan_out("switch_lv_off", Channel::switch_lv_off))
    }

    pub fn switch_hv_on(&mut self) -> DcsResult<FanOutReport> {
        self.gate("switch_hv_on", &[FleetState::LvOn, FleetState::HvMix, FleetState::HvRamp])?;
        Ok(self.fan_out("switch_hv_on", Channel::switch_hv_on))
    }

    pub fn switch_hv_off(&mut self) -> DcsResult<FanOutReport> {
        self.gate("switch_hv_off", &[FleetState::HvOn, FleetState::HvMix, FleetState::HvRamp])?;
        Ok(self.fan_out("switch_hv_off", Channel::switch_hv_off))
    }

    pub fn switch(&mut self, stage: Stage, on: bool) -> DcsResult<FanOutReport> {
        match (stage, on) {
            (Stage::Lv, true) => self.switch_lv_on(),
            (Stage::Lv, false) => self.switch_lv_off(),
            (Stage::Hv, true) => self.switch_hv_on(),
            (Stage::Hv, false) => self.switch_hv_off(),
        }
    }

    /// Pulse the crate-wide alarm clear point.
    pub fn clear_alarms(&mut self) -> DcsResult<()> {
        self.gate("clear_alarms", &[FleetState::Error])?;
        let prefix = self
            .config
            .as_ref()
            .map_or(crate::config::DEFAULT_POINT_PREFIX, |c| c.point_prefix.as_str());
        self.io.put(&format!("{}:ClearAlarm", prefix), PointValue::text("Yes"))
    }

    /// Re-attach every disconnected channel, monitored-only ones included.
    ///
    /// Gated on the channels rather than the aggregate: a lost monitored-only
    /// channel never shows up in the fleet state.
    pub fn reconnect(&mut self) -> DcsResult<FanOutReport> {
        let any_lost = self
            .channels
            .iter()
            .any(|shared| lock_channel(shared).state() == ChannelState::Disconnected);
        if !any_lost {
            warn!(parent: &self.span, state = %self.state, "rejected reconnect");
            return Err(DcsError::rejected("reconnect needs a disconnected channel"));
        }
        let mut report = FanOutReport::default();
        for shared in &self.channels {
            let mut channel = lock_channel(shared);
            if channel.state() != ChannelState::Disconnected {
                continue;
            }
            match channel.reconnect() {
                Ok(_) => report.applied += 1,
                Err(e) => report.rejected.push((channel.id().to_string(), e)),
            }
        }
        info!(parent: &self.span, applied = report.applied, rejected = report.rejected.len(), "reconnect");
        Ok(report)
    }

    /// Voltage setpoint of one active channel.
    pub fn set_voltage(&mut self, stage: Stage, channel_id: &str, volts: f64) -> DcsResult<ChannelState> {
        let shared = self
            .channel(channel_id)
            .filter(|c| lock_channel(c).is_active())
            .ok_or_else(|| DcsError::rejected(format!("'{}' is not an active channel", channel_id)))?;
        let mut channel = lock_channel(&shared);
        channel.set_setpoint(stage, volts)
    }

    /// Publish every channel, then the fleet snapshot. Returns the number of emits.
    pub fn publish_all(&mut self, sink: &dyn StatusSink, force: bool) -> usize {
        let mut emitted = 0;
        for shared in &self.channels {
            let mut channel = lock_channel(shared);
            match publish(&mut *channel, sink, force) {
                Ok(true) => emitted += 1,
                Ok(false) => {}
                Err(e) => warn!(parent: &self.span, channel = channel.id(), error = %e, "publish failed"),
            }
        }
        match publish(self, sink, force) {
            Ok(true) => emitted += 1,
            Ok(false) => {}
            Err(e) => warn!(error = %e, "fleet publish failed"),
        }
        emitted
    }
}

impl Publishable for Fleet {
    fn topic(&self) -> String {
        format!("{}/status", self.name)
    }

    fn snapshot(&self) -> Value {
        json!({
            "state": self.state.as_str(),
            "channels": self.channels.len(),
            "active": self.active_count(),
        })
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
    use ChannelState as C;

    #[test]
    fn test_rule_order() {
        assert_eq!(aggregate_state(&[C::LvOn, C::Error, C::Disconnected]).unwrap(), FleetState::Error);
        assert_eq!(aggregate_state(&[C::LvOn, C::Disconnected]).unwrap(), FleetState::Disconnected);
        assert_eq!(aggregate_state(&[C::Connected, C::Connected]).unwrap(), FleetState::Connected);
        assert_eq!(aggregate_state(&[C::LvOff, C::LvOff, C::LvOff]).unwrap(), FleetState::LvOff);
        assert_eq!(aggregate_state(&[C::LvOff, C::HvOn, C::LvOn]).unwrap(), FleetState::Error);
        assert_eq!(aggregate_state(&[C::LvOff, C::LvOn]).unwrap(), FleetState::LvMix);
        assert_eq!(aggregate_state(&[C::LvOn, C::LvOn]).unwrap(), FleetState::LvOn);
        assert_eq!(aggregate_state(&[C::HvOn, C::HvOn]).unwrap(), FleetState::HvOn);
        assert_eq!(aggregate_state(&[C::HvRamp, C::HvOn, C::LvOn]).unwrap(), FleetState::HvRamp);
        assert_eq!(aggregate_state(&[C::LvOn, C::LvOn, C::HvOn]).unwrap(), FleetState::HvMix);
    }

    #[test]
    fn test_empty_active_set_is_connected() {
        assert_eq!(aggregate_state(&[]).unwrap(), FleetState::Connected);
    }

    #[test]
    fn test_unmatched_mix_is_inconsistent() {
        // CONNECTED next to a settled channel matches no rule
        let err = aggregate_state(&[C::Connected, C::LvOn]).unwrap_err();
        assert!(matches!(err, DcsError::InternalInconsistency(_)));
        assert!(aggregate_state(&[C::Connected, C::LvOff]).is_err());
    }
}
