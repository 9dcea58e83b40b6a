//! Standalone harness: wires `keepalive-core`'s in-memory bus and store
//! together, starts the daemon, and drives a couple of simulated agents
//! through it so the synthetic check events it emits are visible on
//! stdout.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use keepalive_core::bus::memory::InMemoryMessageBus;
use keepalive_core::bus::{BusMessage, MessageBus, Topic};
use keepalive_core::store::memory::InMemoryKeepaliveStore;
use keepalive_core::{
    BusEventEmitter, Entity, KeepaliveEvent, KeepaliveError, Keepalived, KeepalivedConfig, MonitorDeps, MonitorLog,
    StoreDeregisterer, SystemClock,
};

fn agent(id: &str, deregister: bool) -> Entity {
    Entity {
        id: id.to_string(),
        organization: "acme".to_string(),
        environment: "production".to_string(),
        subscriptions: HashSet::new(),
        keepalive_timeout: 2,
        deregister,
        deregistration_handler: deregister.then(|| "slack".to_string()),
        last_seen: 0,
    }
}

async fn send_keepalive(bus: &Arc<InMemoryMessageBus>, entity: Entity, timestamp: i64) -> Result<(), KeepaliveError> {
    bus.publish(
        Topic::Keepalive,
        BusMessage::Keepalive(KeepaliveEvent { entity, timestamp }),
    )
    .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("keepalive_core=debug,keepalive_demo=info").init();

    let config = KeepalivedConfig::default();
    let bus = Arc::new(InMemoryMessageBus::new());
    let store = Arc::new(InMemoryKeepaliveStore::new());

    let mut events_rx = bus.subscribe(Topic::Event, "demo-observer", 32).await?;
    tokio::spawn(async move {
        while let Some(message) = events_rx.recv().await {
            if let Some(check) = message.as_check() {
                println!(
                    "[event] entity={} status={} output=\"{}\"",
                    check.entity.id, check.check.status.0, check.check.output
                );
            }
        }
    });

    let emitter = Arc::new(BusEventEmitter::new(bus.clone(), MonitorLog::root()));
    let deregisterer = Arc::new(StoreDeregisterer::new(store.clone(), emitter.clone()));
    let deps = MonitorDeps {
        clock: Arc::new(SystemClock),
        store: store.clone(),
        emitter,
        deregisterer,
        default_keepalive_timeout: config.default_keepalive_timeout,
        log: MonitorLog::root(),
    };

    let daemon = Keepalived::new(config, bus.clone(), store.clone(), deps, MonitorLog::root());
    daemon.start().await?;

    let steady = agent("web-01", false);
    let flaky = agent("batch-worker-07", true);

    send_keepalive(&bus, steady.clone(), 0).await?;
    send_keepalive(&bus, flaky.clone(), 0).await?;
    store.put_entity(flaky.clone()).await;

    for tick in 1..=2 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        send_keepalive(&bus, steady.clone(), tick).await?;
    }

    println!("letting batch-worker-07 time out...");
    tokio::time::sleep(Duration::from_secs(3)).await;

    daemon.stop().await;
    Ok(())
}
