use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::checkpoint::CheckpointId;
use crate::stage::Stage;

/// Metadata envelope attached to every pipeline event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Shared by every event emitted while processing one delivery.
    pub correlation_id: Uuid,
    /// `{kind}-{item}-{correlation_id}`; unique per event of a delivery.
    pub idempotency_key: String,
    /// Stable name of the item the event is about.
    pub item: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        item: impl Into<String>,
        correlation_id: Option<Uuid>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            idempotency_key: idempotency_key.into(),
            item: item.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub meta: EventMeta,
    pub payload: PipelineEventPayload,
}

impl PipelineEvent {
    /// Event about `item` within the delivery identified by `correlation_id`.
    pub fn for_delivery(item: &str, correlation_id: Uuid, payload: PipelineEventPayload) -> Self {
        let key = format!("{}-{item}-{correlation_id}", payload.kind());
        Self {
            meta: EventMeta::new(item, Some(correlation_id), key),
            payload,
        }
    }
}

/// What happened to an item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PipelineEventPayload {
    /// Stage1 output was loaded from a checkpoint instead of being recomputed.
    CheckpointReused { checkpoint_id: CheckpointId },
    /// A stage exhausted its inner retry budget for this delivery.
    StageFailed { stage: Stage, attempts: u32 },
    /// A checkpoint write finished; `created` is false if it already existed.
    CheckpointStored {
        checkpoint_id: CheckpointId,
        created: bool,
    },
    /// The final document was committed.
    Completed { merged: bool },
    /// The item was returned to the queue.
    Requeued {
        total_retry_count: u32,
        checkpoint_id: Option<CheckpointId>,
    },
    /// The item was routed to the dead-letter destination.
    DeadLettered { total_retry_count: u32, stage: Stage },
}

impl PipelineEventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEventPayload::CheckpointReused { .. } => "checkpoint_reused",
            PipelineEventPayload::StageFailed { .. } => "stage_failed",
            PipelineEventPayload::CheckpointStored { .. } => "checkpoint_stored",
            PipelineEventPayload::Completed { .. } => "completed",
            PipelineEventPayload::Requeued { .. } => "requeued",
            PipelineEventPayload::DeadLettered { .. } => "dead_lettered",
        }
    }

    /// True for the events that settle a delivery.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEventPayload::Completed { .. }
                | PipelineEventPayload::Requeued { .. }
                | PipelineEventPayload::DeadLettered { .. }
        )
    }
}

/// Sink for pipeline events.
///
/// Publishing is best effort: the orchestrator logs a failed publish and
/// carries on, so an implementation must never be load-bearing for delivery
/// settlement.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: PipelineEvent) -> anyhow::Result<()>;
}

/// Source of pipeline events for observers such as dashboards or tests.
pub trait EventSubscriber: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<PipelineEvent>;
}

/// Fan-out event bus on a tokio broadcast channel.
///
/// Publishing never waits. A subscriber that falls more than `capacity`
/// events behind receives `RecvError::Lagged` and skips ahead; events
/// published while nobody is subscribed are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Synchronous publish; returns the number of subscribers reached.
    pub fn send(&self, event: PipelineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus {
    async fn publish(&self, event: PipelineEvent) -> anyhow::Result<()> {
        self.send(event);
        Ok(())
    }
}

impl EventSubscriber for InProcEventBus {
    fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        InProcEventBus::subscribe(self)
    }
}
