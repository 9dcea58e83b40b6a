//! Removes an entity's state and emits a deregistration event when an
//! ephemeral entity times out (spec.md §4.5).

use std::sync::Arc;

use async_trait::async_trait;

use crate::emitter::EventEmitter;
use crate::entity::{CheckHistory, CheckStatus, Entity, SyntheticCheckEvent};
use crate::error::KeepaliveError;
use crate::store::KeepaliveStore;

#[async_trait]
pub trait Deregisterer: Send + Sync + std::fmt::Debug {
    /// Precondition: `entity.deregister == true`. On success the entity and
    /// its keepalive record are gone and a status=1 "entity deregistered"
    /// check event carrying `deregistration_handler` (if set) has been
    /// published. On failure the monitor stays Failing so the next timer
    /// tick retries.
    async fn deregister(&self, entity: &Entity) -> Result<(), KeepaliveError>;
}

#[derive(Debug)]
pub struct StoreDeregisterer {
    store: Arc<dyn KeepaliveStore>,
    emitter: Arc<dyn EventEmitter>,
}

impl StoreDeregisterer {
    pub fn new(store: Arc<dyn KeepaliveStore>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self { store, emitter }
    }
}

#[async_trait]
impl Deregisterer for StoreDeregisterer {
    async fn deregister(&self, entity: &Entity) -> Result<(), KeepaliveError> {
        debug_assert!(entity.deregister, "deregister() called on a non-ephemeral entity");

        self.store.delete_entity(entity).await?;
        self.store.delete_keepalive(&entity.key()).await?;

        let mut event = SyntheticCheckEvent::new(
            entity.clone(),
            CheckStatus::CRITICAL,
            "entity deregistered".to_string(),
            CheckHistory::default(),
            entity.last_seen,
        );
        // Spec.md §4.5 step 3: include the handler only on this one-shot
        // deregistration event, not on the routine checks `SyntheticCheckEvent::new`
        // builds elsewhere.
        event.check.handlers.extend(entity.deregistration_handler.clone());
        self.emitter.pass(event).await;

        Ok(())
    }
}
