//! A logger handle injected into [`crate::keepalived::Keepalived`] and
//! cloned into every monitor/registry it owns, so nothing in this crate
//! reaches for the global `tracing` dispatcher implicitly the way a
//! process-wide singleton logger would.

use tracing::Span;

use crate::entity::EntityKey;

#[derive(Debug, Clone)]
pub struct MonitorLog {
    span: Span,
}

impl MonitorLog {
    pub fn root() -> Self {
        Self {
            span: tracing::info_span!("keepalived"),
        }
    }

    /// Scopes this logger to a single entity, tagging every subsequent log
    /// line with its (organization, environment, entity_id).
    pub fn for_entity(&self, key: &EntityKey) -> Self {
        let _enter = self.span.enter();
        Self {
            span: tracing::info_span!(
                "monitor",
                organization = %key.organization,
                environment = %key.environment,
                entity_id = %key.entity_id,
            ),
        }
    }

    pub fn info(&self, message: impl std::fmt::Display) {
        let _enter = self.span.enter();
        tracing::info!("{message}");
    }

    pub fn warn(&self, message: impl std::fmt::Display) {
        let _enter = self.span.enter();
        tracing::warn!("{message}");
    }

    pub fn error(&self, message: impl std::fmt::Display) {
        let _enter = self.span.enter();
        tracing::error!("{message}");
    }

    pub fn debug(&self, message: impl std::fmt::Display) {
        let _enter = self.span.enter();
        tracing::debug!("{message}");
    }
}

impl Default for MonitorLog {
    fn default() -> Self {
        Self::root()
    }
}
