use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::KeepaliveStore;
use crate::entity::{Entity, EntityKey, KeepaliveRecord, SyntheticCheckEvent};
use crate::error::StoreError;

/// Reference [`KeepaliveStore`]. Good enough for tests and for embedding
/// this core in a single-replica backend; a real deployment swaps this for
/// whatever durable store the surrounding backend already uses (etcd,
/// Postgres, ...) behind the same trait.
#[derive(Debug, Default)]
pub struct InMemoryKeepaliveStore {
    keepalives: RwLock<HashMap<EntityKey, KeepaliveRecord>>,
    events: RwLock<HashMap<(EntityKey, String), SyntheticCheckEvent>>,
    entities: RwLock<HashMap<EntityKey, Entity>>,
}

impl InMemoryKeepaliveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/recovery-scenario helper: seed an entity directly, bypassing
    /// the keepalive ingestion path.
    pub async fn put_entity(&self, entity: Entity) {
        self.entities.write().await.insert(entity.key(), entity);
    }
}

#[async_trait]
impl KeepaliveStore for InMemoryKeepaliveStore {
    async fn update_keepalive(&self, record: KeepaliveRecord) -> Result<(), StoreError> {
        debug!(entity_id = %record.entity_id, expires_at = record.expires_at, "upserting keepalive record");
        self.keepalives.write().await.insert(record.key(), record);
        Ok(())
    }

    async fn delete_keepalive(&self, key: &EntityKey) -> Result<(), StoreError> {
        self.keepalives.write().await.remove(key);
        Ok(())
    }

    async fn get_failing_keepalives(&self) -> Result<Vec<KeepaliveRecord>, StoreError> {
        Ok(self.keepalives.read().await.values().cloned().collect())
    }

    async fn get_event_by_entity_check(
        &self,
        key: &EntityKey,
        check_name: &str,
    ) -> Result<Option<SyntheticCheckEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .get(&(key.clone(), check_name.to_string()))
            .cloned())
    }

    async fn update_event(&self, key: &EntityKey, event: SyntheticCheckEvent) -> Result<(), StoreError> {
        let check_name = event.check.name.clone();
        self.events.write().await.insert((key.clone(), check_name), event);
        Ok(())
    }

    async fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>, StoreError> {
        Ok(self.entities.read().await.get(key).cloned())
    }

    async fn delete_entity(&self, entity: &Entity) -> Result<(), StoreError> {
        self.entities.write().await.remove(&entity.key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{CheckHistory, CheckStatus};
    use std::collections::HashSet;

    fn sample_entity(id: &str) -> Entity {
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

    #[tokio::test]
    async fn keepalive_upsert_and_delete_round_trip() {
        let store = InMemoryKeepaliveStore::new();
        let record = KeepaliveRecord {
            entity_id: "h1".to_string(),
            organization: "default".to_string(),
            environment: "default".to_string(),
            expires_at: 100,
        };
        store.update_keepalive(record.clone()).await.unwrap();
        assert_eq!(store.get_failing_keepalives().await.unwrap(), vec![record.clone()]);

        store.delete_keepalive(&record.key()).await.unwrap();
        assert!(store.get_failing_keepalives().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_keepalive_is_idempotent() {
        let store = InMemoryKeepaliveStore::new();
        let key = EntityKey {
            organization: "default".to_string(),
            environment: "default".to_string(),
            entity_id: "missing".to_string(),
        };
        store.delete_keepalive(&key).await.unwrap();
        store.delete_keepalive(&key).await.unwrap();
    }

    #[tokio::test]
    async fn event_lookup_is_scoped_by_entity_and_check_name() {
        let store = InMemoryKeepaliveStore::new();
        let entity = sample_entity("h1");
        let event = SyntheticCheckEvent::new(
            entity.clone(),
            CheckStatus::OK,
            "ok".to_string(),
            CheckHistory::default(),
            0,
        );
        store.update_event(&entity.key(), event.clone()).await.unwrap();

        let found = store
            .get_event_by_entity_check(&entity.key(), &event.check.name)
            .await
            .unwrap();
        assert!(found.is_some());

        let missing = store
            .get_event_by_entity_check(&entity.key(), "some-other-check")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn entity_delete_removes_it_from_lookup() {
        let store = InMemoryKeepaliveStore::new();
        let entity = sample_entity("h1");
        store.put_entity(entity.clone()).await;
        assert!(store.get_entity(&entity.key()).await.unwrap().is_some());

        store.delete_entity(&entity).await.unwrap();
        assert!(store.get_entity(&entity.key()).await.unwrap().is_none());
    }
}
