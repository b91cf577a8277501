use std::time::Duration;

use crate::stage::Stage;

/// Failure of a single external call made on behalf of a pipeline stage.
///
/// Stage errors are always retryable. The inner retry loop absorbs them and
/// the orchestrator turns an exhausted budget into a requeue or a dead-letter,
/// so they never escape [`StageOrchestrator::process`].
///
/// [`StageOrchestrator::process`]: crate::orchestrator::StageOrchestrator::process
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The collaborator returned an error (rate limit, network, bad response,
    /// store failure).
    #[error("{stage} call failed on attempt {attempt}: {source:#}")]
    Call {
        stage: Stage,
        attempt: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The collaborator did not answer within the configured call timeout.
    #[error("{stage} call timed out after {timeout:?} on attempt {attempt}")]
    Timeout {
        stage: Stage,
        attempt: u32,
        timeout: Duration,
    },
}

impl StageError {
    /// Stage the failed call belonged to.
    pub fn stage(&self) -> Stage {
        match self {
            StageError::Call { stage, .. } | StageError::Timeout { stage, .. } => *stage,
        }
    }

    /// Inner attempt number (1-based) on which the error occurred.
    pub fn attempt(&self) -> u32 {
        match self {
            StageError::Call { attempt, .. } | StageError::Timeout { attempt, .. } => *attempt,
        }
    }
}

/// Errors surfaced by [`StageOrchestrator::process`].
///
/// Ordinary stage failures are not represented here; they end as
/// `Outcome::Requeued` or `Outcome::DeadLettered`.
///
/// [`StageOrchestrator::process`]: crate::orchestrator::StageOrchestrator::process
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The work item carries no usable stable name.
    #[error("work item {image_ref:?} has no stable name")]
    InvalidItem { image_ref: String },

    /// Image bytes or queue metadata could not be resolved. Redelivery is
    /// left to the queue; the retry budget is not charged.
    #[error("failed to resolve work item: {0:#}")]
    Resolution(#[source] anyhow::Error),

    /// Returning the item to the queue (requeue or dead-letter) failed.
    #[error("queue write failed: {0:#}")]
    Queue(#[source] anyhow::Error),

    /// The final document could not be built. Indicates a programming or
    /// configuration error, never a transient condition.
    #[error("invalid result document: {0}")]
    InvalidDocument(String),
}

impl PipelineError {
    /// True for errors that redelivery cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidDocument(_) | PipelineError::InvalidItem { .. }
        )
    }

    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidItem { .. } => "invalid_item",
            PipelineError::Resolution(_) => "resolution",
            PipelineError::Queue(_) => "queue",
            PipelineError::InvalidDocument(_) => "invalid_document",
        }
    }
}

/// Errors raised while reading pipeline configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}
