use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::KeepaliveError;

/// Name of the virtual check the keepalive core stands in for.
pub const KEEPALIVE_CHECK_NAME: &str = "keepalive";

/// Bound on [`CheckHistory`], matching spec.md's "bounded to 21 entries".
pub const CHECK_HISTORY_CAPACITY: usize = 21;

/// Identity of an agent, scoped within (organization, environment).
///
/// Mutated by keepalive ingestion, destroyed by explicit delete or by the
/// [`crate::deregisterer::Deregisterer`] once an ephemeral entity times out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub id: String,
    pub organization: String,
    pub environment: String,
    #[serde(default)]
    pub subscriptions: HashSet<String>,
    /// Seconds; 0 means "use [`crate::config::KeepalivedConfig::default_keepalive_timeout`]".
    #[serde(default)]
    pub keepalive_timeout: u32,
    #[serde(default)]
    pub deregister: bool,
    #[serde(default)]
    pub deregistration_handler: Option<String>,
    /// Unix seconds of the last keepalive observed for this entity.
    #[serde(default)]
    pub last_seen: i64,
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        EntityKey {
            organization: self.organization.clone(),
            environment: self.environment.clone(),
            entity_id: self.id.clone(),
        }
    }

    /// The timeout actually applied to this entity's monitor.
    pub fn effective_timeout(&self, default_keepalive_timeout: u32) -> u32 {
        if self.keepalive_timeout > 0 {
            self.keepalive_timeout
        } else {
            default_keepalive_timeout
        }
    }

    /// Rejects entities a worker should drop rather than hand to a monitor.
    pub fn validate(&self) -> Result<(), KeepaliveError> {
        if self.id.trim().is_empty() {
            return Err(KeepaliveError::ValidationFailure(
                "entity id must not be empty".into(),
            ));
        }
        if self.organization.trim().is_empty() {
            return Err(KeepaliveError::ValidationFailure(
                "entity organization must not be empty".into(),
            ));
        }
        if self.environment.trim().is_empty() {
            return Err(KeepaliveError::ValidationFailure(
                "entity environment must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Scoping key every [`crate::store::KeepaliveStore`] operation is partitioned by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub organization: String,
    pub environment: String,
    pub entity_id: String,
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.organization, self.environment, self.entity_id)
    }
}

/// Persisted liveness fact. Exists in the store iff a monitor currently
/// believes the entity is failing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeepaliveRecord {
    pub entity_id: String,
    pub organization: String,
    pub environment: String,
    /// Unix seconds at which this record was written (the monitor's
    /// deadline at the moment it transitioned to Failing).
    pub expires_at: i64,
}

impl KeepaliveRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey {
            organization: self.organization.clone(),
            environment: self.environment.clone(),
            entity_id: self.entity_id.clone(),
        }
    }
}

/// Message consumed from `topic.keepalive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveEvent {
    pub entity: Entity,
    /// Unix seconds.
    pub timestamp: i64,
}

/// 0 = healthy, >=1 = failing. Mirrors a Sensu check's exit status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckStatus(pub u32);

impl CheckStatus {
    pub const OK: CheckStatus = CheckStatus(0);
    pub const CRITICAL: CheckStatus = CheckStatus(1);

    pub fn is_healthy(self) -> bool {
        self.0 == 0
    }

    pub fn is_failing(self) -> bool {
        self.0 >= 1
    }
}

/// Bounded ring of prior statuses, newest last.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckHistory(VecDeque<CheckStatus>);

impl CheckHistory {
    pub fn push(&mut self, status: CheckStatus) {
        if self.0.len() == CHECK_HISTORY_CAPACITY {
            self.0.pop_front();
        }
        self.0.push_back(status);
    }

    pub fn as_slice_oldest_first(&self) -> Vec<CheckStatus> {
        self.0.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The virtual `keepalive` check embedded in a [`SyntheticCheckEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    pub output: String,
    pub history: CheckHistory,
    /// Extra event handlers to invoke downstream, e.g. a deregistered
    /// entity's `deregistration_handler`.
    #[serde(default)]
    pub handlers: Vec<String>,
}

/// Event published by the [`crate::emitter::EventEmitter`] to `topic.event`,
/// standing in for the virtual `keepalive` check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticCheckEvent {
    pub entity: Entity,
    pub check: Check,
    /// Unix seconds.
    pub timestamp: i64,
}

impl SyntheticCheckEvent {
    /// Builds a routine `keepalive` check event with no extra handlers.
    /// [`crate::deregisterer::StoreDeregisterer`] is the only caller that
    /// needs `check.handlers` populated (with `deregistration_handler`),
    /// since that field only makes sense on the one-shot deregistration
    /// event — routing a healthy or routine-critical keepalive through a
    /// deregistration handler would be wrong.
    pub fn new(entity: Entity, status: CheckStatus, output: String, history: CheckHistory, timestamp: i64) -> Self {
        Self {
            entity,
            check: Check {
                name: KEEPALIVE_CHECK_NAME.to_string(),
                status,
                output,
                history,
                handlers: Vec::new(),
            },
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_timeout_falls_back_to_default() {
        let mut e = sample_entity();
        e.keepalive_timeout = 0;
        assert_eq!(e.effective_timeout(120), 120);
        e.keepalive_timeout = 5;
        assert_eq!(e.effective_timeout(120), 5);
    }

    #[test]
    fn validate_rejects_empty_id() {
        let mut e = sample_entity();
        e.id = String::new();
        assert!(e.validate().is_err());
    }

    #[test]
    fn check_history_is_bounded() {
        let mut history = CheckHistory::default();
        for i in 0..30 {
            history.push(CheckStatus(i));
        }
        assert_eq!(history.len(), CHECK_HISTORY_CAPACITY);
        assert_eq!(history.as_slice_oldest_first().last(), Some(&CheckStatus(29)));
    }

    fn sample_entity() -> Entity {
        Entity {
            id: "h1".to_string(),
            organization: "default".to_string(),
            environment: "default".to_string(),
            subscriptions: HashSet::new(),
            keepalive_timeout: 0,
            deregister: false,
            deregistration_handler: None,
            last_seen: 0,
        }
    }
}
