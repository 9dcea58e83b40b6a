//! Top-level daemon: wires ingest workers, the monitor registry, and the
//! sweeper together and owns their lifecycle (spec.md §4.8).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::bus::{BusMessage, MessageBus, Topic};
use crate::config::KeepalivedConfig;
use crate::entity::{CheckStatus, EntityKey, KEEPALIVE_CHECK_NAME};
use crate::logging::MonitorLog;
use crate::monitor::MonitorDeps;
use crate::registry::MonitorRegistry;
use crate::store::KeepaliveStore;

/// How long [`Keepalived::stop`] waits for ingest workers to drain their
/// current message before it gives up and moves on. The spec leaves
/// whether `Stop` blocks at all an open question; a bounded wait gives
/// in-flight keepalives a chance to land without risking an unbounded hang
/// on shutdown.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Single consumer id every worker shares. Spec.md §4.8 step 4 subscribes
/// once under this name and step 6 has `HandlerCount` workers *draining
/// that one queue* as competing consumers — distinct per-worker ids would
/// instead fan the same bus topic out to every worker, reprocessing each
/// keepalive `handler_count` times.
const KEEPALIVE_CONSUMER_ID: &str = "keepalived";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Starting,
    Running,
    Stopped,
}

pub struct Keepalived {
    config: KeepalivedConfig,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn KeepaliveStore>,
    registry: Arc<MonitorRegistry>,
    log: MonitorLog,
    status_tx: watch::Sender<DaemonStatus>,
    status_rx: watch::Receiver<DaemonStatus>,
    shutdown_tx: watch::Sender<bool>,
    error_tx: broadcast::Sender<String>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Keepalived {
    pub fn new(
        config: KeepalivedConfig,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn KeepaliveStore>,
        deps: MonitorDeps,
        log: MonitorLog,
    ) -> Arc<Self> {
        let registry = Arc::new(MonitorRegistry::new(deps));
        let (status_tx, status_rx) = watch::channel(DaemonStatus::Stopped);
        let (shutdown_tx, _) = watch::channel(false);
        let (error_tx, _) = broadcast::channel(64);

        Arc::new(Self {
            config,
            bus,
            store,
            registry,
            log,
            status_tx,
            status_rx,
            shutdown_tx,
            error_tx,
            workers: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        })
    }

    pub fn status(&self) -> DaemonStatus {
        *self.status_rx.borrow()
    }

    /// Stream of non-fatal errors surfaced while running (failed decodes,
    /// transient store/bus hiccups). Stands in for a Go daemon's
    /// `Err() <-chan error`; unlike a single channel this can be
    /// subscribed to more than once since `broadcast` fans the same
    /// message out to every receiver.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<String> {
        self.error_tx.subscribe()
    }

    /// Recovers monitors for entities the store believes are still
    /// failing, then starts the ingest workers and the sweeper.
    /// Fails only if reading the failing-keepalive index itself fails;
    /// an individual record whose entity has since vanished is logged and
    /// skipped rather than treated as fatal.
    pub async fn start(self: &Arc<Self>) -> Result<(), crate::error::KeepaliveError> {
        self.status_tx.send_replace(DaemonStatus::Starting);
        self.init_from_store().await?;

        let rx = self
            .bus
            .subscribe(Topic::Keepalive, KEEPALIVE_CONSUMER_ID, self.config.queue_capacity)
            .await?;
        let shared_rx = Arc::new(Mutex::new(rx));

        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.config.handler_count {
            workers.push(self.spawn_worker(worker_id, shared_rx.clone()));
        }
        drop(workers);

        let registry = self.registry.clone();
        let interval = self.config.sweep_interval;
        *self.sweeper.lock().await = Some(tokio::spawn(async move {
            registry.run_sweeper(interval).await;
        }));

        self.status_tx.send_replace(DaemonStatus::Running);
        self.log.info("keepalived started");
        Ok(())
    }

    async fn init_from_store(&self) -> Result<(), crate::error::KeepaliveError> {
        let failing = self.store.get_failing_keepalives().await?;
        self.log.info(format!("recovering {} failing keepalive(s) from store", failing.len()));

        for record in failing {
            let key = EntityKey {
                organization: record.organization.clone(),
                environment: record.environment.clone(),
                entity_id: record.entity_id.clone(),
            };
            let entity = match self.store.get_entity(&key).await {
                Ok(Some(entity)) => entity,
                Ok(None) => {
                    self.log.warn(format!("orphaned keepalive record for {key}, entity no longer exists; skipping"));
                    continue;
                }
                Err(e) => {
                    self.log.error(format!("failed to load entity {key} during recovery: {e}"));
                    let _ = self.error_tx.send(format!("recovery lookup failed for {key}: {e}"));
                    continue;
                }
            };

            match self.store.get_event_by_entity_check(&key, KEEPALIVE_CHECK_NAME).await {
                Ok(None) => {
                    self.log.warn(format!("no prior check event for {key}, entity was likely deleted; skipping"));
                }
                Ok(Some(event)) if event.check.status == CheckStatus::OK => {
                    self.log.info(format!("{key} was already marked healthy by another replica; skipping"));
                }
                Ok(Some(_)) => {
                    self.registry.recover(entity, record.expires_at).await;
                }
                Err(e) => {
                    self.log.error(format!("failed to load last check event for {key} during recovery: {e}"));
                    let _ = self.error_tx.send(format!("recovery lookup failed for {key}: {e}"));
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, worker_id: usize, shared_rx: Arc<Mutex<mpsc::Receiver<BusMessage>>>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_worker(worker_id, shared_rx).await;
        })
    }

    /// Drains the one shared `keepalive` queue as a competing consumer:
    /// the receiver is locked only long enough to pull the next message,
    /// then released before that message is processed, so the other
    /// `handler_count - 1` workers can pull concurrently instead of
    /// queueing behind this one's processing.
    async fn run_worker(self: Arc<Self>, worker_id: usize, shared_rx: Arc<Mutex<mpsc::Receiver<BusMessage>>>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let message = tokio::select! {
                _ = shutdown_rx.changed() => break,
                message = async { shared_rx.lock().await.recv().await } => message,
            };
            match message {
                Some(BusMessage::Keepalive(event)) => {
                    if let Err(e) = self.registry.handle_keepalive(event.entity, event.timestamp).await {
                        self.log.warn(format!("dropping invalid keepalive: {e}"));
                        let _ = self.error_tx.send(format!("keepalive rejected: {e}"));
                    }
                }
                Some(_) => {
                    self.log.warn(format!("worker {worker_id} got a non-keepalive message on the keepalive topic, skipping"));
                }
                None => break,
            }
        }
    }

    /// Signals every worker and the sweeper to stop, waits up to
    /// [`WORKER_SHUTDOWN_GRACE`] for workers to drain, then stops all live
    /// monitors.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        let had_workers = !workers.is_empty();
        for worker in workers {
            if tokio::time::timeout(WORKER_SHUTDOWN_GRACE, worker).await.is_err() {
                self.log.warn("ingest worker did not shut down within the grace period");
            }
        }
        if had_workers {
            self.bus.unsubscribe(Topic::Keepalive, KEEPALIVE_CONSUMER_ID).await;
        }

        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.abort();
        }

        self.registry.stop_all().await;
        self.status_tx.send_replace(DaemonStatus::Stopped);
        self.log.info("keepalived stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryMessageBus;
    use crate::clock::VirtualClock;
    use crate::deregisterer::StoreDeregisterer;
    use crate::emitter::BusEventEmitter;
    use crate::entity::{CheckHistory, CheckStatus, Entity, KeepaliveEvent, KeepaliveRecord, SyntheticCheckEvent};
    use crate::store::memory::InMemoryKeepaliveStore;
    use std::collections::HashSet;

    fn entity(id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            organization: "default".to_string(),
            environment: "default".to_string(),
            subscriptions: HashSet::new(),
            keepalive_timeout: 0,
            deregister: false,
            deregistration_handler: None,
            last_seen: 0,
        }
    }

    fn daemon() -> (Arc<Keepalived>, Arc<InMemoryMessageBus>, Arc<InMemoryKeepaliveStore>) {
        let store = Arc::new(InMemoryKeepaliveStore::new());
        let bus = Arc::new(InMemoryMessageBus::new());
        let emitter = Arc::new(BusEventEmitter::new(bus.clone(), MonitorLog::root()));
        let deregisterer = Arc::new(StoreDeregisterer::new(store.clone(), emitter.clone()));
        let deps = MonitorDeps {
            clock: Arc::new(VirtualClock::new()),
            store: store.clone(),
            emitter,
            deregisterer,
            default_keepalive_timeout: 120,
            log: MonitorLog::root(),
        };
        let config = KeepalivedConfig {
            handler_count: 2,
            ..KeepalivedConfig::default()
        };
        let daemon = Keepalived::new(config, bus.clone(), store.clone(), deps, MonitorLog::root());
        (daemon, bus, store)
    }

    #[tokio::test]
    async fn start_recovers_failing_keepalives_and_goes_running() {
        let (daemon, _bus, store) = daemon();
        let e = entity("h1");
        store.put_entity(e.clone()).await;
        store
            .update_keepalive(KeepaliveRecord {
                entity_id: e.id.clone(),
                organization: e.organization.clone(),
                environment: e.environment.clone(),
                expires_at: 100,
            })
            .await
            .unwrap();
        store
            .update_event(
                &e.key(),
                SyntheticCheckEvent::new(
                    e.clone(),
                    CheckStatus::CRITICAL,
                    "No keepalive sent from h1 for 120 seconds (>= 120)".to_string(),
                    CheckHistory::default(),
                    100,
                ),
            )
            .await
            .unwrap();

        daemon.start().await.unwrap();
        assert_eq!(daemon.status(), DaemonStatus::Running);
        assert_eq!(daemon.registry.len().await, 1);

        daemon.stop().await;
        assert_eq!(daemon.status(), DaemonStatus::Stopped);
    }

    #[tokio::test]
    async fn worker_consumes_published_keepalive_and_creates_a_monitor() {
        let (daemon, bus, _store) = daemon();
        daemon.start().await.unwrap();

        bus.publish(
            Topic::Keepalive,
            BusMessage::Keepalive(KeepaliveEvent {
                entity: entity("h2"),
                timestamp: 0,
            }),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if daemon.registry.len().await == 1 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker should have picked up the published keepalive");

        daemon.stop().await;
    }

    #[tokio::test]
    async fn orphaned_keepalive_record_is_skipped_not_fatal() {
        let (daemon, _bus, store) = daemon();
        store
            .update_keepalive(KeepaliveRecord {
                entity_id: "ghost".to_string(),
                organization: "default".to_string(),
                environment: "default".to_string(),
                expires_at: 100,
            })
            .await
            .unwrap();

        daemon.start().await.unwrap();
        assert_eq!(daemon.registry.len().await, 0);
        daemon.stop().await;
    }

    #[tokio::test]
    async fn record_already_marked_healthy_elsewhere_is_not_recovered() {
        let (daemon, _bus, store) = daemon();
        let e = entity("h3");
        store.put_entity(e.clone()).await;
        store
            .update_keepalive(KeepaliveRecord {
                entity_id: e.id.clone(),
                organization: e.organization.clone(),
                environment: e.environment.clone(),
                expires_at: 100,
            })
            .await
            .unwrap();
        // Another replica already observed a fresh keepalive and flipped
        // the check back to OK; this replica's index just hasn't caught up.
        store
            .update_event(
                &e.key(),
                SyntheticCheckEvent::new(e.clone(), CheckStatus::OK, "keepalive last sent at 105".to_string(), CheckHistory::default(), 105),
            )
            .await
            .unwrap();

        daemon.start().await.unwrap();
        assert_eq!(daemon.registry.len().await, 0);
        daemon.stop().await;
    }
}
