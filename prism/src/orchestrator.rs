//! The stage orchestrator: drives one work item through Stage1, Stage2 and the
//! final commit, and decides what happens to the item when a stage gives up.
//!
//! Every delivery ends in exactly one of three ways:
//!
//! - the merged document is committed ([`Outcome::Completed`]),
//! - the item is put back on the queue with an incremented retry count and,
//!   when Stage1 output is available, a checkpoint reference
//!   ([`Outcome::Requeued`]),
//! - the retry budget is spent and the item is dead-lettered
//!   ([`Outcome::DeadLettered`]).
//!
//! A checkpoint is always durable before the requeue that references it is
//! published.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backoff::should_dead_letter;
use crate::checkpoint::{CheckpointId, CheckpointRecord, CheckpointStore};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::events::{EventPublisher, PipelineEvent, PipelineEventPayload};
use crate::item::{ImageSource, WorkItem};
use crate::queue::WorkQueue;
use crate::retry::{run_with_backoff, RetrySettings};
use crate::stage::{LayoutExtraction, Stage, Stage1Client, Stage2Client};
use crate::store::{upsert, CreateOutcome, ResultDocument, ResultStore, UpsertOutcome};
use crate::telemetry;

/// How one delivery of a work item was settled.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Requeued,
    DeadLettered,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Requeued => "requeued",
            Outcome::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the Stage1 result used for this delivery came from.
#[derive(Clone, Debug, PartialEq, Eq)]
enum LayoutSource {
    Fresh,
    Checkpoint(CheckpointId),
}

/// Per-delivery identity shared by the events it emits.
struct DeliveryScope<'a> {
    name: &'a str,
    correlation_id: Uuid,
}

/// Processes work items end to end.
///
/// Construct it with [`StageOrchestratorBuilder`](crate::runtime::StageOrchestratorBuilder).
pub struct StageOrchestrator {
    images: Arc<dyn ImageSource>,
    stage1: Arc<dyn Stage1Client>,
    stage2: Arc<dyn Stage2Client>,
    checkpoints: Arc<dyn CheckpointStore>,
    results: Arc<dyn ResultStore>,
    queue: Arc<dyn WorkQueue>,
    events: Option<Arc<dyn EventPublisher>>,
    config: PipelineConfig,
    retry: RetrySettings,
}

impl fmt::Debug for StageOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageOrchestrator")
            .field("config", &self.config)
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl StageOrchestrator {
    /// Create an orchestrator from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        images: Arc<dyn ImageSource>,
        stage1: Arc<dyn Stage1Client>,
        stage2: Arc<dyn Stage2Client>,
        checkpoints: Arc<dyn CheckpointStore>,
        results: Arc<dyn ResultStore>,
        queue: Arc<dyn WorkQueue>,
        events: Option<Arc<dyn EventPublisher>>,
    ) -> Self {
        let retry = RetrySettings::from_config(&config);
        Self {
            images,
            stage1,
            stage2,
            checkpoints,
            results,
            queue,
            events,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<dyn WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Process one delivery of `item`.
    ///
    /// Stage failures never surface as `Err`: they are settled as
    /// [`Outcome::Requeued`] or [`Outcome::DeadLettered`]. `Err` means the
    /// item could not be resolved, the queue write that settles a failure did
    /// not go through, or the result document could not be built.
    pub async fn process(&self, mut item: WorkItem) -> Result<Outcome, PipelineError> {
        let name = item
            .stable_name()
            .ok_or_else(|| PipelineError::InvalidItem {
                image_ref: item.image_ref.to_string(),
            })?
            .to_string();
        let scope = DeliveryScope {
            name: &name,
            correlation_id: Uuid::now_v7(),
        };

        tracing::debug!(
            item = %name,
            total_retry_count = item.total_retry_count,
            checkpoint_id = ?item.checkpoint_id,
            "processing item"
        );

        let image = self
            .bounded("image fetch", self.images.fetch(&item.image_ref))
            .await
            .map_err(PipelineError::Resolution)?;
        let image = image.as_slice();

        let (layout, source) = match self.resolve_layout(&scope, &mut item, image).await {
            Ok(resolved) => resolved,
            Err(error) => return self.settle_failure(&scope, item, error, None).await,
        };

        let stage2 = self.stage2.as_ref();
        let text = layout.text.as_str();
        let barcode = layout.barcode.as_deref();
        let metadata = match run_with_backoff(Stage::Vision, &self.retry, move || {
            stage2.analyze(image, text, barcode)
        })
        .await
        {
            Ok(metadata) => metadata,
            Err(error) => {
                return self
                    .settle_failure(&scope, item, error, Some((&layout, &source)))
                    .await
            }
        };

        let document = ResultDocument::from_metadata(&name, &item.image_ref, &metadata)?;
        let results = self.results.as_ref();
        let doc = &document;
        let merged = match run_with_backoff(Stage::Commit, &self.retry, move || {
            upsert(results, doc)
        })
        .await
        {
            Ok(outcome) => outcome == UpsertOutcome::Merged,
            Err(error) => {
                return self
                    .settle_failure(&scope, item, error, Some((&layout, &source)))
                    .await
            }
        };

        self.emit(&scope, PipelineEventPayload::Completed { merged })
            .await;
        telemetry::record_outcome(&name, Outcome::Completed.as_str());
        Ok(Outcome::Completed)
    }

    /// Load the Stage1 result from the item's checkpoint, or compute it.
    ///
    /// Store errors on the checkpoint read are retried like a stage call. A
    /// checkpoint that cannot be found is dropped from the envelope so the
    /// next delivery recomputes Stage1 instead of failing on it again.
    async fn resolve_layout(
        &self,
        scope: &DeliveryScope<'_>,
        item: &mut WorkItem,
        image: &[u8],
    ) -> Result<(LayoutExtraction, LayoutSource), StageError> {
        if let Some(checkpoint_id) = item.checkpoint_id.clone() {
            let checkpoints = self.checkpoints.as_ref();
            let id = &checkpoint_id;
            let read =
                run_with_backoff(Stage::Layout, &self.retry, move || checkpoints.read(id)).await;
            return match read {
                Ok(Some(record)) => {
                    tracing::info!(
                        item = %scope.name,
                        checkpoint_id = %checkpoint_id,
                        "reusing stored layout result"
                    );
                    self.emit(
                        scope,
                        PipelineEventPayload::CheckpointReused {
                            checkpoint_id: checkpoint_id.clone(),
                        },
                    )
                    .await;
                    Ok((record.layout, LayoutSource::Checkpoint(checkpoint_id)))
                }
                Ok(None) => {
                    tracing::warn!(
                        item = %scope.name,
                        checkpoint_id = %checkpoint_id,
                        "referenced checkpoint does not exist; layout will be recomputed"
                    );
                    item.checkpoint_id = None;
                    Err(StageError::Call {
                        stage: Stage::Layout,
                        attempt: 1,
                        source: anyhow::anyhow!("checkpoint {checkpoint_id} not found"),
                    })
                }
                Err(error) => Err(error),
            };
        }

        let stage1 = self.stage1.as_ref();
        let layout =
            run_with_backoff(Stage::Layout, &self.retry, move || stage1.extract(image)).await?;
        Ok((layout, LayoutSource::Fresh))
    }

    /// Charge the retry budget and return the item to the queue, or
    /// dead-letter it once the budget is spent.
    async fn settle_failure(
        &self,
        scope: &DeliveryScope<'_>,
        mut item: WorkItem,
        error: StageError,
        layout: Option<(&LayoutExtraction, &LayoutSource)>,
    ) -> Result<Outcome, PipelineError> {
        let stage = error.stage();
        self.emit(
            scope,
            PipelineEventPayload::StageFailed {
                stage,
                attempts: error.attempt(),
            },
        )
        .await;

        item.total_retry_count = item.total_retry_count.saturating_add(1);

        if self.config.capabilities.dead_lettering
            && should_dead_letter(item.total_retry_count, self.config.max_total_retries)
        {
            let reason = format!(
                "{stage} failed after {} total retries: {error}",
                item.total_retry_count
            );
            self.queue
                .dead_letter(&item, Some(reason))
                .await
                .map_err(PipelineError::Queue)?;

            tracing::error!(
                item = %scope.name,
                stage = %stage,
                total_retry_count = item.total_retry_count,
                "retry budget exhausted; item dead-lettered"
            );
            self.emit(
                scope,
                PipelineEventPayload::DeadLettered {
                    total_retry_count: item.total_retry_count,
                    stage,
                },
            )
            .await;
            telemetry::record_outcome(scope.name, Outcome::DeadLettered.as_str());
            return Ok(Outcome::DeadLettered);
        }

        if let Some((layout, LayoutSource::Fresh)) = layout {
            if self.config.capabilities.checkpointing {
                item.checkpoint_id = self.store_checkpoint(scope, layout).await;
            }
        }

        self.queue
            .requeue(&item, self.config.requeue_delay())
            .await
            .map_err(PipelineError::Queue)?;

        tracing::warn!(
            item = %scope.name,
            stage = %stage,
            total_retry_count = item.total_retry_count,
            checkpoint_id = ?item.checkpoint_id,
            "item requeued"
        );
        self.emit(
            scope,
            PipelineEventPayload::Requeued {
                total_retry_count: item.total_retry_count,
                checkpoint_id: item.checkpoint_id.clone(),
            },
        )
        .await;
        telemetry::record_outcome(scope.name, Outcome::Requeued.as_str());
        Ok(Outcome::Requeued)
    }

    /// Persist a Stage1 result. Returns the id to attach to the requeued
    /// item, or `None` when nothing could be stored.
    async fn store_checkpoint(
        &self,
        scope: &DeliveryScope<'_>,
        layout: &LayoutExtraction,
    ) -> Option<CheckpointId> {
        let record = CheckpointRecord::new(scope.name, layout.clone());
        let created = match self
            .bounded("checkpoint write", self.checkpoints.create(&record))
            .await
        {
            Ok(CreateOutcome::Created) => true,
            Ok(CreateOutcome::AlreadyExists) => {
                tracing::info!(
                    item = %scope.name,
                    checkpoint_id = %record.id,
                    "checkpoint already exists"
                );
                false
            }
            Err(error) => {
                tracing::warn!(
                    item = %scope.name,
                    checkpoint_id = %record.id,
                    error = %error,
                    "failed to store checkpoint; requeueing without it"
                );
                telemetry::record_checkpoint(record.id.as_str(), "failed");
                return None;
            }
        };

        telemetry::record_checkpoint(
            record.id.as_str(),
            if created { "created" } else { "already_exists" },
        );
        self.emit(
            scope,
            PipelineEventPayload::CheckpointStored {
                checkpoint_id: record.id.clone(),
                created,
            },
        )
        .await;
        Some(record.id)
    }

    /// Bound a single collaborator call by the configured call timeout.
    async fn bounded<T>(
        &self,
        what: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        let timeout = self.config.call_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("{what} timed out after {timeout:?}")),
        }
    }

    async fn emit(&self, scope: &DeliveryScope<'_>, payload: PipelineEventPayload) {
        let Some(events) = &self.events else {
            return;
        };
        let event = PipelineEvent::for_delivery(scope.name, scope.correlation_id, payload);
        if let Err(err) = events.publish(event).await {
            tracing::error!("publish pipeline event failed: {err}");
        }
    }
}
