use crate::chiller::{Chiller, ChillerLink};
use crate::config::ConfigLoader;
use crate::cooling::CoolingUnit;
use crate::devices::PointIo;
use crate::error::{DcsError, DcsResult};
use crate::fleet::Fleet;
use crate::notify::NotificationRouter;
use crate::protocol::{ChillerCommand, Command, CommandTable, CoolingCommand, FleetCommand};
use crate::registers::FieldBus;
use crate::telemetry::{publish, RefreshSchedule, StatusSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Span};

/// Hardware access handed to the supervisor at startup.
pub struct Backends {
    pub io: Arc<dyn PointIo>,
    pub field_bus: Option<Box<dyn FieldBus>>,
    pub chiller_link: Option<Box<dyn ChillerLink>>,
}

impl Backends {
    pub fn new(io: Arc<dyn PointIo>) -> Self {
        Self {
            io,
            field_bus: None,
            chiller_link: None,
        }
    }

    pub fn with_field_bus(mut self, bus: Box<dyn FieldBus>) -> Self {
        self.field_bus = Some(bus);
        self
    }

    pub fn with_chiller_link(mut self, link: Box<dyn ChillerLink>) -> Self {
        self.chiller_link = Some(link);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub ticks: u64,
    pub commands_accepted: u32,
    pub commands_rejected: u32,
    pub publishes: u64,
    pub forced_refreshes: u32,
    pub reloads: u32,
    pub inconsistencies: u32,
}

/// Owns every supervised entity and drives them from one periodic loop.
pub struct Supervisor {
    fleet: Fleet,
    cooling: Option<CoolingUnit>,
    chiller: Option<Chiller>,
    table: CommandTable,
    sink: Arc<dyn StatusSink>,
    loader: ConfigLoader,
    schedule: RefreshSchedule,
    tick_interval: Duration,
    stats: SupervisorStats,
    span: Span,
}

impl Supervisor {
    /// Load the configuration and bring every entity up.
    ///
    /// A configuration error here is fatal. Connection failures are not: the affected
    /// entity stays DISCONNECTED and can be reconnected by command.
    pub fn start(mut loader: ConfigLoader, backends: Backends, sink: Arc<dyn StatusSink>) -> DcsResult<Self> {
        let span = tracing::info_span!("supervisor");
        let config = loader()?;
        info!(parent: &span, fleet = %config.name, channels = config.channels.len(), "starting supervisor");

        let mut fleet = Fleet::new(Arc::clone(&backends.io), NotificationRouter::new(), &span);
        fleet.load(config.clone())?;

        let mut table = CommandTable::new(config.name.clone(), config.limits);

        let cooling = match (&config.cooling, backends.field_bus) {
            (Some(cooling_config), Some(bus)) => {
                let mut unit = CoolingUnit::new(cooling_config, bus, &span)?;
                if let Err(e) = unit.connect() {
                    warn!(parent: &span, error = %e, "cooling unit not connected");
                }
                table = table.with_cooling(unit.name());
                Some(unit)
            }
            (Some(cooling_config), None) => {
                warn!(parent: &span, name = %cooling_config.name, "cooling unit configured without a field bus");
                None
            }
            (None, _) => None,
        };

        let chiller = match (&config.chiller, backends.chiller_link) {
            (Some(chiller_config), Some(link)) => {
                let mut chiller = Chiller::new(chiller_config.name.clone(), link, &span);
                if let Err(e) = chiller.connect() {
                    warn!(parent: &span, error = %e, "chiller not connected");
                }
                table = table.with_chiller(chiller.name());
                Some(chiller)
            }
            (Some(chiller_config), None) => {
                warn!(parent: &span, name = %chiller_config.name, "chiller configured without a link");
                None
            }
            (None, _) => None,
        };

        Ok(Self {
            fleet,
            cooling,
            chiller,
            table,
            sink,
            loader,
            schedule: RefreshSchedule::new(config.publish.refresh_ticks),
            tick_interval: Duration::from_millis(config.publish.tick_ms),
            stats: SupervisorStats::default(),
            span,
        })
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn fleet_mut(&mut self) -> &mut Fleet {
        &mut self.fleet
    }

    pub fn cooling(&self) -> Option<&CoolingUnit> {
        self.cooling.as_ref()
    }

    pub fn chiller(&self) -> Option<&Chiller> {
        self.chiller.as_ref()
    }

    pub fn router(&self) -> &NotificationRouter {
        self.fleet.router()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    pub fn command_table(&self) -> &CommandTable {
        &self.table
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.table.subscriptions()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// One driver-loop iteration: evaluate, refresh, publish. Returns the number of
    /// snapshots emitted.
    pub fn tick(&mut self) -> usize {
        self.stats.ticks += 1;

        if self.fleet.evaluate().is_err() {
            self.stats.inconsistencies += 1;
        }
        if let Some(cooling) = self.cooling.as_mut() {
            if let Err(e) = cooling.update_status() {
                if matches!(e, DcsError::InternalInconsistency(_)) {
                    self.stats.inconsistencies += 1;
                }
                debug!(parent: &self.span, error = %e, "cooling refresh failed");
            }
        }
        if let Some(chiller) = self.chiller.as_mut() {
            if let Err(e) = chiller.poll() {
                debug!(parent: &self.span, error = %e, "chiller poll failed");
            }
        }

        let force = self.schedule.tick();
        if force {
            self.stats.forced_refreshes += 1;
            info!(parent: &self.span, "periodic full refresh");
        }
        self.publish_all(force)
    }

    /// Publish every entity; the cooling alarm digest goes out on every call.
    pub fn publish_all(&mut self, force: bool) -> usize {
        let mut emitted = self.fleet.publish_all(self.sink.as_ref(), force);
        if let Some(cooling) = self.cooling.as_mut() {
            emitted += publish_entity(cooling, self.sink.as_ref(), force);
            let alarms = Value::from(cooling.alarm_message());
            match self.sink.emit(&cooling.alarm_topic(), &alarms) {
                Ok(()) => emitted += 1,
                Err(e) => warn!(parent: &self.span, error = %e, "alarm publish failed"),
            }
        }
        if let Some(chiller) = self.chiller.as_mut() {
            emitted += publish_entity(chiller, self.sink.as_ref(), force);
        }
        self.stats.publishes += emitted as u64;
        emitted
    }

    /// Parse, validate and execute one inbound command message.
    pub fn handle_command(&mut self, topic: &str, payload: &[u8]) -> DcsResult<()> {
        debug!(parent: &self.span, topic, payload = %String::from_utf8_lossy(payload), "command received");
        let result = self
            .table
            .parse(topic, payload)
            .and_then(|command| self.execute(command));

        match &result {
            Ok(()) => self.stats.commands_accepted += 1,
            Err(e) => {
                self.stats.commands_rejected += 1;
                warn!(parent: &self.span, topic, error = %e, "command failed");
            }
        }
        result
    }

    fn execute(&mut self, command: Command) -> DcsResult<()> {
        match command {
            Command::Fleet(command) => self.execute_fleet(command),
            Command::Cooling(command) => self.execute_cooling(&command),
            Command::Chiller(command) => self.execute_chiller(&command),
        }
    }

    fn execute_fleet(&mut self, command: FleetCommand) -> DcsResult<()> {
        match command {
            FleetCommand::Switch { stage, on } => self.fleet.switch(stage, on).map(|_| ()),
            FleetCommand::SetVoltage { stage, channel, volts } => {
                self.fleet.set_voltage(stage, &channel, volts).map(|_| ())
            }
            FleetCommand::ClearAlarms => self.fleet.clear_alarms(),
            FleetCommand::Refresh => {
                self.stats.publishes += self.fleet.publish_all(self.sink.as_ref(), true) as u64;
                Ok(())
            }
            FleetCommand::Reload => self.reload(),
            FleetCommand::Reconnect => self.fleet.reconnect().map(|_| ()),
        }
    }

    fn execute_cooling(&mut self, command: &CoolingCommand) -> DcsResult<()> {
        let cooling = self
            .cooling
            .as_mut()
            .ok_or_else(|| DcsError::rejected("no cooling unit"))?;
        cooling.execute(command)?;
        if *command == CoolingCommand::Refresh {
            self.stats.publishes += publish_entity(cooling, self.sink.as_ref(), true) as u64;
        }
        Ok(())
    }

    fn execute_chiller(&mut self, command: &ChillerCommand) -> DcsResult<()> {
        let chiller = self.chiller.as_mut().ok_or_else(|| DcsError::rejected("no chiller"))?;
        chiller.execute(command)?;
        if *command == ChillerCommand::Refresh {
            chiller.poll()?;
            self.stats.publishes += publish_entity(chiller, self.sink.as_ref(), true) as u64;
        }
        Ok(())
    }

    /// Rebuild the fleet from a freshly loaded configuration.
    pub fn reload(&mut self) -> DcsResult<()> {
        self.stats.reloads += 1;
        let result = self.fleet.reload(&mut *self.loader);

        if let Some(config) = self.fleet.config() {
            self.table.fleet = config.name.clone();
            self.table.limits = config.limits;
            self.schedule = RefreshSchedule::new(config.publish.refresh_ticks);
        }
        match &result {
            Ok(()) => info!(parent: &self.span, channels = self.fleet.channels().len(), "reload complete"),
            Err(e) => error!(parent: &self.span, error = %e, "reload failed, previous configuration kept"),
        }
        result
    }
}

fn publish_entity<P: crate::telemetry::Publishable>(entity: &mut P, sink: &dyn StatusSink, force: bool) -> usize {
    match publish(entity, sink, force) {
        Ok(emitted) => usize::from(emitted),
        Err(e) => {
            warn!(topic = %entity.topic(), error = %e, "publish failed");
            0
        }
    }
}
