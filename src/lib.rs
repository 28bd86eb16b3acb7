//! # Tracker DCS
//!
//! Supervisory control for a detector's power-supply fleet and its cooling plant.
//!
//! Each detector channel pairs one low-voltage and one high-voltage supply. The
//! supervisor keeps a state machine per channel, aggregates those into a fleet state,
//! enforces the power-sequencing interlocks (HV only on top of LV, LV only off once HV
//! is off) and publishes JSON status snapshots on change.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use trackerdcs::config::{static_loader, DcsConfig};
//! use trackerdcs::sim::{MemorySink, SimulatedCrate};
//! use trackerdcs::{Backends, Supervisor};
//!
//! let config = DcsConfig::from_yaml_str(
//!     "channels:\n  1:\n    lv: {board: 0, chan: 0}\n    hv: {board: 12, chan: 0}\n",
//! ).unwrap();
//! let (io, mut rx) = SimulatedCrate::new(config.point_prefix.clone());
//! let io = Arc::new(io);
//! let sink = Arc::new(MemorySink::new());
//!
//! let mut supervisor = Supervisor::start(static_loader(config), Backends::new(io), sink.clone()).unwrap();
//! supervisor.router().drain(&mut rx);
//! supervisor.tick();
//! assert!(sink.last("dcs/status").is_some());
//! ```
//!
//! ## Architecture
//!
//! - [`devices`] - LV/HV supply point tables and the process-variable I/O seam
//! - [`channel`] - per-channel state machine and status derivation
//! - [`fleet`] - channel collection, aggregate state, gated fan-out, reload
//! - [`notify`] - routes point notifications to the owning channel
//! - [`registers`] - holding-register map with chunked reads
//! - [`cooling`] - CO2 plant state machine over the register map
//! - [`chiller`] - recirculating chiller over a serial link
//! - [`protocol`] - command topics and payload validation
//! - [`telemetry`] - change-driven and periodic status publication
//! - [`supervisor`] - owns everything and runs the periodic loop
//! - [`sim`] - in-memory backends for the daemon's demo mode and tests

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod channel;
pub mod chiller;
pub mod config;
pub mod cooling;
pub mod deadband;
pub mod devices;
pub mod error;
pub mod fleet;
pub mod notify;
pub mod protocol;
pub mod registers;
pub mod sim;
pub mod supervisor;
pub mod telemetry;

// Re-export main public types for convenience
pub use channel::{Channel, ChannelEvent, ChannelState, SharedChannel};
pub use config::DcsConfig;
pub use error::{DcsError, DcsResult};
pub use fleet::{Fleet, FleetState};
pub use protocol::{Command, CommandTable};
pub use supervisor::{Backends, Supervisor, SupervisorStats};

static_assertions::assert_impl_all!(Channel: Send);
static_assertions::assert_impl_all!(Fleet: Send);
static_assertions::assert_impl_all!(Supervisor: Send);
