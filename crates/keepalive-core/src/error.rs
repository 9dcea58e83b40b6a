use thiserror::Error;

/// Failures surfaced by a [`crate::store::KeepaliveStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("keepalive store backend error: {0}")]
    Backend(String),

    #[error("failed to (de)serialize store record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),
}

/// Failures surfaced by a [`crate::bus::MessageBus`] implementation.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("subscriber queue for topic {topic} is full")]
    QueueFull { topic: &'static str },

    #[error("failed to subscribe consumer {consumer_id} to topic {topic}: {reason}")]
    SubscriptionFailed {
        topic: &'static str,
        consumer_id: String,
        reason: String,
    },

    #[error("bus is shutting down")]
    Closed,

    #[error("failed to (de)serialize bus payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Top-level error kinds named by the keepalive core's error handling design.
///
/// `PreconditionFailure` and `RecoveryPartial` are fatal to [`crate::keepalived::Keepalived::start`].
/// `ValidationFailure`, `StoreTransient`, and `BusTransient` are logged and
/// handled locally; they never escape the daemon.
#[derive(Error, Debug)]
pub enum KeepaliveError {
    #[error("precondition failed: {0}")]
    PreconditionFailure(String),

    #[error("invalid keepalive event: {0}")]
    ValidationFailure(String),

    #[error("transient store failure: {0}")]
    StoreTransient(#[from] StoreError),

    #[error("transient bus failure: {0}")]
    BusTransient(#[from] BusError),

    #[error("failed to recover monitor state from store: {0}")]
    RecoveryPartial(String),
}

pub type KeepaliveResult<T> = Result<T, KeepaliveError>;
