//! Prism - checkpointed two-stage image enrichment.
//!
//! Work items reference previously uploaded images. For every item the
//! pipeline runs an expensive layout extraction (Stage1) and a vision
//! extraction (Stage2) that uses the layout output as hints, then merges the
//! resulting product metadata into a document store. Both stages are external,
//! failure-prone calls; the pipeline retries them with backoff, checkpoints the
//! Stage1 result before giving an item back to the queue, and dead-letters
//! items once their retry budget is spent.
//!
//! # Core Concepts
//!
//! - **Work item**: [`WorkItem`] carries the image reference plus the envelope
//!   state that survives redelivery (retry count, checkpoint id).
//!
//! - **Queue**: the [`WorkQueue`] trait abstracts an at-least-once queue with
//!   requeue and dead-letter destinations.
//!
//! - **Stages**: [`Stage1Client`] and [`Stage2Client`] are the two enrichment
//!   services; [`ImageSource`] resolves image bytes.
//!
//! - **Stores**: [`CheckpointStore`] keeps Stage1 results, [`ResultStore`]
//!   holds the final documents and [`upsert`] merges into it idempotently.
//!
//! - **Orchestrator**: [`StageOrchestrator`] processes one delivery and
//!   settles it as completed, requeued or dead-lettered.
//!
//! - **Runtime**: [`PipelineRuntime`] runs a pool of workers that feed queue
//!   deliveries through the orchestrator.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL work queue and stores via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use prism::*;
//!
//! let orchestrator = StageOrchestratorBuilder::new(PipelineConfig::from_env()?)
//!     .with_image_source(images)
//!     .with_stage1(layout)
//!     .with_stage2(vision)
//!     .with_checkpoints(checkpoints)
//!     .with_results(results)
//!     .with_queue(queue)
//!     .build()?;
//!
//! let runtime = PipelineRuntime::new(RuntimeConfig::default(), Arc::new(orchestrator));
//! runtime.spawn_worker_pool(4).await;
//! ```

/// Exponential backoff with jitter and the dead-letter decision.
pub mod backoff;

/// Stage1 checkpoints.
///
/// The `checkpoint` module defines [`CheckpointId`], [`CheckpointRecord`] and
/// the [`CheckpointStore`] trait.
pub mod checkpoint;

/// Pipeline, capability and persistence configuration.
pub mod config;

/// One-shot Stage1 + Stage2 extraction without retry or checkpointing.
pub mod direct;

/// Error taxonomy: [`StageError`], [`PipelineError`] and [`ConfigError`].
pub mod error;

/// Pipeline lifecycle events.
///
/// The orchestrator publishes a [`PipelineEvent`] through an optional
/// [`EventPublisher`]; [`InProcEventBus`] fans them out in-process.
pub mod events;

/// Work items, their queue envelope and image resolution.
pub mod item;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// The stage orchestrator.
pub mod orchestrator;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
///
/// The `persistence` module provides PostgreSQL-backed implementations of the
/// work queue and both stores when the `postgres` feature is enabled.
pub mod persistence;

/// The [`WorkQueue`] trait and delivery handles.
pub mod queue;

/// Bounded inner retry loop.
pub mod retry;

/// Runtime orchestration and worker management.
///
/// The `runtime` module provides:
/// - [`PipelineRuntime`] - worker pool consuming the queue
/// - [`RuntimeConfig`] - runtime configuration
/// - [`ShutdownToken`] - graceful shutdown signaling
/// - [`StageOrchestratorBuilder`] - dependency wiring
/// - [`WorkerConfig`] - individual worker configuration
pub mod runtime;

/// Stage identifiers, stage outputs and the two client traits.
pub mod stage;

/// Result documents and the idempotent merge.
pub mod store;

/// Tracing spans and telemetry recorders.
pub mod telemetry;

pub use backoff::*;
pub use checkpoint::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use item::*;
pub use orchestrator::*;
pub use queue::*;
pub use retry::*;
pub use runtime::*;
pub use stage::*;
pub use store::*;
