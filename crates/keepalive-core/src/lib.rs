//! Keepalive monitoring core: ingests agent keepalive messages from a
//! pub/sub bus, maintains one liveness monitor per entity, detects
//! timeouts, and emits synthetic OK/CRITICAL check events — optionally
//! deregistering ephemeral agents that never recover.
//!
//! [`keepalived::Keepalived`] is the top-level entry point; everything
//! else in this crate is a collaborator it wires together and that can be
//! swapped independently behind its trait (clock, store, bus, emitter,
//! deregisterer) for testing or for a different deployment's backing
//! infrastructure.

pub mod bus;
pub mod clock;
pub mod config;
pub mod deregisterer;
pub mod emitter;
pub mod entity;
pub mod error;
pub mod keepalived;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod store;

pub use bus::{BusMessage, MessageBus, Topic};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use config::KeepalivedConfig;
pub use deregisterer::{Deregisterer, StoreDeregisterer};
pub use emitter::{BusEventEmitter, EventEmitter};
pub use entity::{Entity, EntityKey, KeepaliveEvent, KeepaliveRecord, SyntheticCheckEvent};
pub use error::{BusError, KeepaliveError, KeepaliveResult, StoreError};
pub use keepalived::{DaemonStatus, Keepalived};
pub use logging::MonitorLog;
pub use monitor::{EntityMonitor, MonitorDeps, MonitorStateKind};
pub use registry::MonitorRegistry;
pub use store::KeepaliveStore;
