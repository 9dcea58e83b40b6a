//! Persists per-entity keepalive records, the failing-keepalive index, and
//! synthetic keepalive events (spec.md §4.2). All operations are
//! linearizable per key and partitioned by [`EntityKey`].

pub mod memory;

use async_trait::async_trait;

use crate::entity::{Entity, EntityKey, KeepaliveRecord, SyntheticCheckEvent};
use crate::error::StoreError;

#[async_trait]
pub trait KeepaliveStore: Send + Sync + std::fmt::Debug {
    /// Upsert.
    async fn update_keepalive(&self, record: KeepaliveRecord) -> Result<(), StoreError>;

    /// Idempotent.
    async fn delete_keepalive(&self, key: &EntityKey) -> Result<(), StoreError>;

    /// All currently-failing records across all orgs/envs; used once per
    /// daemon start during recovery.
    async fn get_failing_keepalives(&self) -> Result<Vec<KeepaliveRecord>, StoreError>;

    async fn get_event_by_entity_check(
        &self,
        key: &EntityKey,
        check_name: &str,
    ) -> Result<Option<SyntheticCheckEvent>, StoreError>;

    async fn update_event(&self, key: &EntityKey, event: SyntheticCheckEvent) -> Result<(), StoreError>;

    async fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>, StoreError>;

    async fn delete_entity(&self, entity: &Entity) -> Result<(), StoreError>;
}
