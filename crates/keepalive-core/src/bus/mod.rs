//! Topic-based pub/sub with per-subscriber queues (spec.md §4.3).
//!
//! Delivery is at-least-once, FIFO per producer within a subscriber's
//! queue, with no ordering guarantee across consumers or across entities.

pub mod memory;
#[cfg(feature = "kafka")]
pub mod kafka;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::entity::{KeepaliveEvent, SyntheticCheckEvent};
use crate::error::BusError;

/// The two topics the keepalive core touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Ingress: carries [`BusMessage::Keepalive`].
    Keepalive,
    /// Egress: carries [`BusMessage::Check`].
    Event,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Keepalive => "topic.keepalive",
            Topic::Event => "topic.event",
        }
    }
}

/// Opaque bus payload. The spec treats messages as opaque blobs the bus
/// merely ferries; in practice the keepalive core only ever produces or
/// consumes these two shapes, so we model the payload as a closed enum
/// rather than `Box<dyn Any>` — a worker that receives the wrong variant
/// for a topic behaves exactly like the Go core's failed type assertion:
/// log and skip (see spec.md §8 property 10).
#[derive(Debug, Clone)]
pub enum BusMessage {
    Keepalive(KeepaliveEvent),
    Check(SyntheticCheckEvent),
}

impl BusMessage {
    pub fn as_keepalive(&self) -> Option<&KeepaliveEvent> {
        match self {
            BusMessage::Keepalive(event) => Some(event),
            _ => None,
        }
    }

    pub fn as_check(&self) -> Option<&SyntheticCheckEvent> {
        match self {
            BusMessage::Check(event) => Some(event),
            _ => None,
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync + std::fmt::Debug {
    /// Registers `consumer_id` for `topic`, returning the receiving half of
    /// its bounded queue. Calling this again for the same (topic,
    /// consumer_id) replaces the previous queue.
    async fn subscribe(
        &self,
        topic: Topic,
        consumer_id: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<BusMessage>, BusError>;

    async fn unsubscribe(&self, topic: Topic, consumer_id: &str);

    /// Bounded-blocking publish: briefly waits for room in each
    /// subscriber's queue, then returns [`BusError::QueueFull`] for the
    /// producer to log and retry rather than dropping the oldest message.
    async fn publish(&self, topic: Topic, message: BusMessage) -> Result<(), BusError>;
}
