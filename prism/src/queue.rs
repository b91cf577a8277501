use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::WorkItem;

/// Identifies one delivery of a message to a consumer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryId {
    /// Create a new delivery ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A work item handed to a consumer, together with its delivery handle.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Handle used to complete or abandon this delivery.
    pub id: DeliveryId,
    /// The decoded work item.
    pub item: WorkItem,
    /// How many times the underlying message has been delivered, including
    /// this one. Maintained by the queue, independent of the retry budget.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn new(item: WorkItem) -> Self {
        Self {
            id: DeliveryId::new(),
            item,
            delivery_count: 1,
        }
    }
}

/// At-least-once work queue consumed by the pipeline.
///
/// Requeueing publishes a new message carrying the updated envelope; the
/// delivery it came from is then completed by the consumer. A delivery that is
/// abandoned (or whose consumer dies) is redelivered by the queue's own policy.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Receive the next available item, or `None` if the queue is empty.
    async fn receive(&self) -> anyhow::Result<Option<Delivery>>;

    /// Settle a delivery as handled.
    async fn complete(&self, delivery: DeliveryId) -> anyhow::Result<()>;

    /// Release a delivery without settling it so the queue redelivers it.
    async fn abandon(&self, delivery: DeliveryId, error: Option<String>) -> anyhow::Result<()>;

    /// Put an item back on the queue, optionally not visible before `delay`.
    async fn requeue(&self, item: &WorkItem, delay: Option<Duration>) -> anyhow::Result<()>;

    /// Route an item to the dead-letter destination.
    async fn dead_letter(&self, item: &WorkItem, reason: Option<String>) -> anyhow::Result<()>;
}
