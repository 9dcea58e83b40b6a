//! Owns the live set of [`EntityMonitor`]s, keyed by [`EntityKey`]
//! (spec.md §4.7).
//!
//! A registry is the only thing that creates or destroys monitors. Ingest
//! workers call [`MonitorRegistry::handle_keepalive`] for every keepalive
//! they consume; the registry starts a monitor on first sight of an entity
//! and hands subsequent keepalives straight to the existing one. A
//! background sweeper periodically evicts monitors that stopped themselves
//! (an ephemeral entity's monitor stops once deregistered) so the map
//! doesn't grow without bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::entity::{Entity, EntityKey};
use crate::error::KeepaliveError;
use crate::logging::MonitorLog;
use crate::monitor::{EntityMonitor, MonitorDeps};

#[derive(Debug)]
pub struct MonitorRegistry {
    monitors: RwLock<HashMap<EntityKey, Arc<EntityMonitor>>>,
    deps: MonitorDeps,
    log: MonitorLog,
}

impl MonitorRegistry {
    pub fn new(deps: MonitorDeps) -> Self {
        let log = deps.log.clone();
        Self {
            monitors: RwLock::new(HashMap::new()),
            deps,
            log,
        }
    }

    /// Routes a keepalive to its entity's monitor, creating one if this is
    /// the first keepalive seen for that key (or the previous monitor for
    /// it already stopped, e.g. after a deregistration).
    ///
    /// The lookup-and-possibly-create step holds a single write lock across
    /// both the check and the insert: spec.md §4.7 requires creation to
    /// happen inside the lock so two workers racing on the same entity's
    /// first keepalive can't both spawn a monitor, leaking whichever one
    /// loses the subsequent `insert`. A freshly created monitor already
    /// starts from `timestamp` (its initial `Update` is implicit in
    /// `EntityMonitor::start`), so only the pre-existing case forwards the
    /// keepalive on.
    pub async fn handle_keepalive(&self, entity: Entity, timestamp: i64) -> Result<(), KeepaliveError> {
        entity.validate()?;
        let key = entity.key();

        enum Routed {
            Existing(Arc<EntityMonitor>),
            Created,
        }

        let routed = {
            let mut monitors = self.monitors.write().await;
            if let Some(monitor) = monitors.get(&key).filter(|m| !m.is_stopped()) {
                Routed::Existing(monitor.clone())
            } else {
                let mut entity = entity.clone();
                entity.last_seen = timestamp;
                let monitor = EntityMonitor::start(entity, self.deps.clone());
                monitors.insert(key, monitor);
                Routed::Created
            }
        };

        match routed {
            Routed::Existing(monitor) => monitor.update(entity, timestamp).await,
            Routed::Created => Ok(()),
        }
    }

    /// Reinstates a monitor for an entity the store believes is still
    /// failing, used once at daemon startup (spec.md §4.8's
    /// `initFromStore`).
    pub async fn recover(&self, entity: Entity, expires_at: i64) {
        let key = entity.key();
        let monitor = EntityMonitor::recover(entity, expires_at, self.deps.clone());
        self.monitors.write().await.insert(key, monitor);
    }

    /// Drops every monitor whose task has already stopped itself. Returns
    /// the number evicted.
    pub async fn sweep_stopped(&self) -> usize {
        let mut monitors = self.monitors.write().await;
        let before = monitors.len();
        monitors.retain(|_, monitor| !monitor.is_stopped());
        let evicted = before - monitors.len();
        if evicted > 0 {
            self.log.debug(format!("swept {evicted} stopped monitor(s) from the registry"));
        }
        evicted
    }

    /// Runs [`Self::sweep_stopped`] on a fixed interval until cancelled.
    /// A ticker rather than a one-shot timer: the spec leaves the cadence
    /// an open question, and a recurring sweep is the natural steady-state
    /// behavior for a daemon that runs indefinitely.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_stopped().await;
        }
    }

    /// Stops every live monitor and clears the registry. Called during
    /// shutdown; each monitor's `stop()` is awaited so in-flight
    /// store/bus I/O from the last `fire()` has a chance to land before
    /// the process exits.
    pub async fn stop_all(&self) {
        let monitors: Vec<_> = self.monitors.read().await.values().cloned().collect();
        for monitor in &monitors {
            monitor.stop().await;
        }
        self.monitors.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.monitors.read().await.len()
    }

    pub async fn get(&self, key: &EntityKey) -> Option<Arc<EntityMonitor>> {
        self.monitors.read().await.get(key).cloned()
    }
}
