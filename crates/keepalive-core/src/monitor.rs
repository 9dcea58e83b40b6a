//! Per-entity liveness state machine (spec.md §4.6).
//!
//! Each [`EntityMonitor`] owns a background task that is the sole writer of
//! that entity's mutable state (current status, check history, armed
//! timer). External callers never touch that state directly — they send a
//! [`Command`] over a channel and await the reply, which is the idiomatic
//! stand-in for the lock-serialized `Update`/timer-fire/`Stop` methods a
//! mutex-guarded struct would otherwise need. The task's single
//! `tokio::select!` loop races the timer against the command channel, so a
//! `Stop` or `Update` always interrupts a pending sleep instead of racing it.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::clock::Clock;
use crate::deregisterer::Deregisterer;
use crate::emitter::EventEmitter;
use crate::entity::{CheckHistory, CheckStatus, Entity, EntityKey, KeepaliveRecord, SyntheticCheckEvent};
use crate::error::KeepaliveError;
use crate::logging::MonitorLog;
use crate::store::KeepaliveStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStateKind {
    Healthy,
    Failing,
    Stopped,
}

enum Command {
    Update {
        entity: Entity,
        timestamp: i64,
        reply: oneshot::Sender<Result<(), KeepaliveError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Collaborators every monitor needs, bundled so constructing one is a
/// single clone rather than five separate `Arc` clones at every call site.
/// Deliberately a plain struct rather than a boxed factory closure: every
/// field is already a trait object callers can swap for a fake, so a
/// closure on top would only add indirection.
#[derive(Clone)]
pub struct MonitorDeps {
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn KeepaliveStore>,
    pub emitter: Arc<dyn EventEmitter>,
    pub deregisterer: Arc<dyn Deregisterer>,
    pub default_keepalive_timeout: u32,
    pub log: MonitorLog,
}

/// Handle to a running monitor task. Dropping all handles does not stop the
/// task — call [`EntityMonitor::stop`] explicitly, or let
/// [`crate::registry::MonitorRegistry`] do it during a sweep.
#[derive(Debug)]
pub struct EntityMonitor {
    key: EntityKey,
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<MonitorStateKind>,
}

impl EntityMonitor {
    /// Starts a fresh monitor for an entity that just sent its first
    /// keepalive. State begins Healthy; the timer is armed for
    /// `entity.effective_timeout(...)` from now.
    pub fn start(entity: Entity, deps: MonitorDeps) -> Arc<Self> {
        let last_seen = entity.last_seen;
        Self::spawn(entity, deps, MonitorStateKind::Healthy, CheckHistory::default(), last_seen, None)
    }

    /// Reconstructs a monitor for an entity the store already has a
    /// [`KeepaliveRecord`] for, i.e. one the daemon believed was failing
    /// when it last stopped. Re-arms the timer for whatever time remains
    /// until `expires_at`, firing immediately if that's already past.
    pub fn recover(entity: Entity, expires_at: i64, deps: MonitorDeps) -> Arc<Self> {
        let last_seen = entity.last_seen;
        Self::spawn(entity, deps, MonitorStateKind::Failing, CheckHistory::default(), last_seen, Some(expires_at))
    }

    fn spawn(
        entity: Entity,
        deps: MonitorDeps,
        initial_state: MonitorStateKind,
        history: CheckHistory,
        last_seen: i64,
        recover_expires_at: Option<i64>,
    ) -> Arc<Self> {
        let key = entity.key();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(initial_state);
        let log = deps.log.for_entity(&key);

        let initial_remaining = match recover_expires_at {
            Some(expires_at) => {
                let remaining = expires_at - deps.clock.unix_now();
                std::time::Duration::from_secs(remaining.max(0) as u64)
            }
            None => std::time::Duration::from_secs(entity.effective_timeout(deps.default_keepalive_timeout) as u64),
        };

        tokio::spawn(run_loop(
            entity,
            deps,
            log,
            command_rx,
            state_tx,
            initial_state,
            history,
            last_seen,
            initial_remaining,
        ));

        Arc::new(Self {
            key,
            command_tx,
            state_rx,
        })
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn state(&self) -> MonitorStateKind {
        *self.state_rx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == MonitorStateKind::Stopped
    }

    /// Feeds a fresh keepalive into the monitor. Resets the timer
    /// regardless of the entity's current status.
    pub async fn update(&self, entity: Entity, timestamp: i64) -> Result<(), KeepaliveError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Update {
                entity,
                timestamp,
                reply: reply_tx,
            })
            .map_err(|_| KeepaliveError::PreconditionFailure("monitor task is no longer running".into()))?;
        reply_rx
            .await
            .map_err(|_| KeepaliveError::PreconditionFailure("monitor task dropped the update reply".into()))?
    }

    /// Stops the monitor's background task. Idempotent: stopping an
    /// already-stopped monitor (e.g. one a deregistration already retired)
    /// is a no-op.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.command_tx.send(Command::Stop { reply: reply_tx }).is_err() {
            return;
        }
        let _ = reply_rx.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut entity: Entity,
    deps: MonitorDeps,
    log: MonitorLog,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<MonitorStateKind>,
    mut state: MonitorStateKind,
    mut history: CheckHistory,
    mut last_seen: i64,
    initial_remaining: std::time::Duration,
) {
    let mut remaining = initial_remaining;

    loop {
        tokio::select! {
            _ = deps.clock.sleep(remaining) => {
                match fire(&mut entity, &deps, &log, &mut history, last_seen).await {
                    FireOutcome::KeepFailing(next_remaining) => {
                        state = MonitorStateKind::Failing;
                        let _ = state_tx.send(state);
                        remaining = next_remaining;
                    }
                    FireOutcome::Stopped => {
                        state = MonitorStateKind::Stopped;
                        let _ = state_tx.send(state);
                        break;
                    }
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(Command::Update { entity: updated, timestamp, reply }) => {
                        let outcome = apply_update(&mut entity, updated, timestamp, &deps, &log, &mut history, state).await;
                        match outcome {
                            Ok(next_state) => {
                                state = next_state;
                                last_seen = timestamp;
                                let _ = state_tx.send(state);
                                remaining = std::time::Duration::from_secs(
                                    entity.effective_timeout(deps.default_keepalive_timeout) as u64,
                                );
                                let _ = reply.send(Ok(()));
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    Some(Command::Stop { reply }) => {
                        state = MonitorStateKind::Stopped;
                        let _ = state_tx.send(state);
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

enum FireOutcome {
    KeepFailing(std::time::Duration),
    Stopped,
}

async fn fire(
    entity: &mut Entity,
    deps: &MonitorDeps,
    log: &MonitorLog,
    history: &mut CheckHistory,
    last_seen: i64,
) -> FireOutcome {
    let timeout = entity.effective_timeout(deps.default_keepalive_timeout);
    let now = deps.clock.unix_now();
    let elapsed = (now - last_seen).max(0);

    let output = format!(
        "No keepalive sent from {} for {} seconds (>= {})",
        entity.id, elapsed, timeout
    );
    history.push(CheckStatus::CRITICAL);

    let record = KeepaliveRecord {
        entity_id: entity.id.clone(),
        organization: entity.organization.clone(),
        environment: entity.environment.clone(),
        expires_at: now,
    };
    if let Err(e) = deps.store.update_keepalive(record).await {
        log.warn(format!("failed to persist keepalive record for {}: {e}", entity.id));
    }

    let event = SyntheticCheckEvent::new(entity.clone(), CheckStatus::CRITICAL, output, history.clone(), now);
    if let Err(e) = deps.store.update_event(&entity.key(), event.clone()).await {
        log.warn(format!("failed to persist check event for {}: {e}", entity.id));
    }
    deps.emitter.pass(event).await;

    if entity.deregister {
        match deps.deregisterer.deregister(entity).await {
            Ok(()) => {
                log.info(format!("deregistered ephemeral entity {}", entity.id));
                return FireOutcome::Stopped;
            }
            Err(e) => {
                log.error(format!("failed to deregister entity {}: {e}; will retry", entity.id));
            }
        }
    }

    FireOutcome::KeepFailing(std::time::Duration::from_secs(timeout as u64))
}

async fn apply_update(
    entity: &mut Entity,
    updated: Entity,
    timestamp: i64,
    deps: &MonitorDeps,
    log: &MonitorLog,
    history: &mut CheckHistory,
    state: MonitorStateKind,
) -> Result<MonitorStateKind, KeepaliveError> {
    updated.validate()?;
    *entity = updated;
    entity.last_seen = timestamp;

    if state == MonitorStateKind::Failing {
        let output = format!("keepalive last sent at {timestamp}");
        history.push(CheckStatus::OK);

        if let Err(e) = deps.store.delete_keepalive(&entity.key()).await {
            log.warn(format!("failed to clear keepalive record for {}: {e}", entity.id));
        }

        let event = SyntheticCheckEvent::new(entity.clone(), CheckStatus::OK, output, history.clone(), timestamp);
        if let Err(e) = deps.store.update_event(&entity.key(), event.clone()).await {
            log.warn(format!("failed to persist recovery event for {}: {e}", entity.id));
        }
        deps.emitter.pass(event).await;

        return Ok(MonitorStateKind::Healthy);
    }

    Ok(MonitorStateKind::Healthy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryMessageBus;
    use crate::bus::{MessageBus, Topic};
    use crate::clock::VirtualClock;
    use crate::deregisterer::StoreDeregisterer;
    use crate::emitter::BusEventEmitter;
    use crate::store::memory::InMemoryKeepaliveStore;
    use std::collections::HashSet;
    use std::time::Duration;

    fn entity(id: &str, timeout: u32, deregister: bool) -> Entity {
        Entity {
            id: id.to_string(),
            organization: "default".to_string(),
            environment: "default".to_string(),
            subscriptions: HashSet::new(),
            keepalive_timeout: timeout,
            deregister,
            deregistration_handler: None,
            last_seen: 0,
        }
    }

    struct Harness {
        deps: MonitorDeps,
        clock: VirtualClock,
        store: Arc<InMemoryKeepaliveStore>,
        events_rx: mpsc::Receiver<crate::bus::BusMessage>,
    }

    async fn harness() -> Harness {
        let clock = VirtualClock::new();
        let store = Arc::new(InMemoryKeepaliveStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let events_rx = bus.subscribe(Topic::Event, "test", 16).await.unwrap();
        let emitter = Arc::new(BusEventEmitter::new(bus, MonitorLog::root()));
        let deregisterer = Arc::new(StoreDeregisterer::new(store.clone(), emitter.clone()));

        let deps = MonitorDeps {
            clock: Arc::new(clock.clone()),
            store: store.clone(),
            emitter,
            deregisterer,
            default_keepalive_timeout: 120,
            log: MonitorLog::root(),
        };

        Harness {
            deps,
            clock,
            store,
            events_rx,
        }
    }

    #[tokio::test]
    async fn starts_healthy_and_emits_nothing_before_timeout() {
        let mut h = harness().await;
        let monitor = EntityMonitor::start(entity("h1", 5, false), h.deps.clone());

        h.clock.advance(Duration::from_secs(3));
        tokio::task::yield_now().await;

        assert_eq!(monitor.state(), MonitorStateKind::Healthy);
        assert!(h.events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fires_critical_after_timeout_elapses() {
        let mut h = harness().await;
        let e = entity("h1", 5, false);
        let monitor = EntityMonitor::start(e.clone(), h.deps.clone());

        h.clock.advance(Duration::from_secs(5));
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if monitor.state() == MonitorStateKind::Failing {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("monitor should transition to Failing");

        let published = h.events_rx.recv().await.unwrap();
        let check = published.as_check().unwrap();
        assert_eq!(check.check.status, CheckStatus::CRITICAL);
        assert!(check.check.output.contains("No keepalive sent"));

        let failing = h.store.get_failing_keepalives().await.unwrap();
        assert_eq!(failing.len(), 1);
        assert_eq!(failing[0].entity_id, "h1");
        assert_eq!(failing[0].expires_at, h.clock.unix_now());
    }

    #[tokio::test]
    async fn update_before_timeout_resets_the_timer() {
        let mut h = harness().await;
        let e = entity("h1", 10, false);
        let monitor = EntityMonitor::start(e.clone(), h.deps.clone());

        h.clock.advance(Duration::from_secs(8));
        tokio::task::yield_now().await;
        monitor.update(e.clone(), h.clock.unix_now()).await.unwrap();

        h.clock.advance(Duration::from_secs(8));
        tokio::task::yield_now().await;
        assert_eq!(monitor.state(), MonitorStateKind::Healthy);
        assert!(h.events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_keepalives_cause_no_spurious_transition() {
        let mut h = harness().await;
        let e = entity("h5", 10, false);
        let monitor = EntityMonitor::start(e.clone(), h.deps.clone());

        for _ in 0..3 {
            monitor.update(e.clone(), h.clock.unix_now()).await.unwrap();
        }

        tokio::task::yield_now().await;
        assert_eq!(monitor.state(), MonitorStateKind::Healthy);
        assert!(h.events_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_while_failing_recovers_to_healthy_and_clears_record() {
        let mut h = harness().await;
        let e = entity("h1", 5, false);
        let monitor = EntityMonitor::start(e.clone(), h.deps.clone());

        h.clock.advance(Duration::from_secs(5));
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if monitor.state() == MonitorStateKind::Failing {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let _critical = h.events_rx.recv().await.unwrap();

        monitor.update(e.clone(), h.clock.unix_now()).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(monitor.state(), MonitorStateKind::Healthy);
        let recovery = h.events_rx.recv().await.unwrap();
        let check = recovery.as_check().unwrap();
        assert_eq!(check.check.status, CheckStatus::OK);
        assert!(h.store.get_failing_keepalives().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ephemeral_entity_is_deregistered_and_monitor_stops() {
        let mut h = harness().await;
        let e = entity("h1", 5, true);
        h.store.put_entity(e.clone()).await;
        let monitor = EntityMonitor::start(e.clone(), h.deps.clone());

        h.clock.advance(Duration::from_secs(5));
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if monitor.is_stopped() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("monitor should stop once the entity is deregistered");

        assert!(h.store.get_entity(&e.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recover_arms_timer_to_remaining_time() {
        let mut h = harness().await;
        h.clock.advance(Duration::from_secs(100));
        let e = entity("h1", 5, false);

        let expires_at = h.clock.unix_now() + 21;
        let monitor = EntityMonitor::recover(e, expires_at, h.deps.clone());
        assert_eq!(monitor.state(), MonitorStateKind::Failing);

        h.clock.advance(Duration::from_secs(20));
        tokio::task::yield_now().await;
        assert!(h.events_rx.try_recv().is_err());

        h.clock.advance(Duration::from_secs(5));
        let event = tokio::time::timeout(Duration::from_secs(1), h.events_rx.recv())
            .await
            .expect("recovered monitor should re-fire once its deadline passes")
            .unwrap();
        assert_eq!(event.as_check().unwrap().check.status, CheckStatus::CRITICAL);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_marks_state_stopped() {
        let h = harness().await;
        let monitor = EntityMonitor::start(entity("h1", 5, false), h.deps.clone());
        monitor.stop().await;
        monitor.stop().await;
        assert!(monitor.is_stopped());
    }
}
