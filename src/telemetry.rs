use crate::error::DcsResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_REFRESH_TICKS: u32 = 600; // ~10 minutes at 1 Hz
pub const DEFAULT_TICK_MS: u64 = 1000;

/// Status egress. Implementations must not block the caller for long.
pub trait StatusSink: Send + Sync {
    fn emit(&self, topic: &str, payload: &Value) -> DcsResult<()>;
}

/// An entity that publishes a JSON snapshot of itself when it changed.
pub trait Publishable {
    fn topic(&self) -> String;

    fn snapshot(&self) -> Value;

    fn is_changed(&self) -> bool;

    fn clear_changed(&mut self);

    /// Entities can opt out of publication while their cached values are meaningless.
    fn is_publishable(&self) -> bool {
        true
    }
}

/// Emit the snapshot if the entity changed since the last publish or `force` is set.
///
/// The changed flag is cleared only after a successful emit. Returns whether
/// anything was emitted.
pub fn publish<P: Publishable + ?Sized>(entity: &mut P, sink: &dyn StatusSink, force: bool) -> DcsResult<bool> {
    if !entity.is_publishable() || !(force || entity.is_changed()) {
        return Ok(false);
    }

    let topic = entity.topic();
    let snapshot = entity.snapshot();
    debug!(%topic, force, "publishing");
    sink.emit(&topic, &snapshot)?;
    entity.clear_changed();
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublishConfig {
    pub refresh_ticks: u32,
    pub tick_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            refresh_ticks: DEFAULT_REFRESH_TICKS,
            tick_ms: DEFAULT_TICK_MS,
        }
    }
}

/// Counts driver ticks and asks for a forced full publication every `period` ticks.
#[derive(Debug, Clone)]
pub struct RefreshSchedule {
    period: u32,
    counter: u32,
}

impl RefreshSchedule {
    pub fn new(period: u32) -> Self {
        Self {
            period: period.max(1),
            counter: 0,
        }
    }

    /// Advance one tick; `true` when this tick must force publication.
    pub fn tick(&mut self) -> bool {
        self.counter += 1;
        if self.counter >= self.period {
            self.counter = 0;
            true
        } else {
            false
        }
    }

    pub fn period(&self) -> u32 {
        self.period
    }
}

impl Default for RefreshSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_TICKS)
    }
}
