use std::fmt;
use std::sync::Arc;

use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::events::EventPublisher;
use crate::item::ImageSource;
use crate::orchestrator::StageOrchestrator;
use crate::queue::WorkQueue;
use crate::stage::{Stage1Client, Stage2Client};
use crate::store::ResultStore;

/// Builder for constructing a [`StageOrchestrator`] with explicit dependencies.
///
/// The builder validates that all required dependencies are provided before
/// constructing the orchestrator. Each dependency is configured via a `with_*`
/// method; the event publisher is optional.
///
/// # Example
///
/// ```ignore
/// use prism::*;
///
/// let orchestrator = StageOrchestratorBuilder::new(PipelineConfig::from_env()?)
///     .with_image_source(images)
///     .with_stage1(layout_client)
///     .with_stage2(vision_client)
///     .with_checkpoints(checkpoints)
///     .with_results(results)
///     .with_queue(queue)
///     .with_events(events)
///     .build()?;
/// ```
pub struct StageOrchestratorBuilder {
    config: PipelineConfig,
    images: Option<Arc<dyn ImageSource>>,
    stage1: Option<Arc<dyn Stage1Client>>,
    stage2: Option<Arc<dyn Stage2Client>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    results: Option<Arc<dyn ResultStore>>,
    queue: Option<Arc<dyn WorkQueue>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for StageOrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageOrchestratorBuilder")
            .field("config", &self.config)
            .field("images_set", &self.images.is_some())
            .field("stage1_set", &self.stage1.is_some())
            .field("stage2_set", &self.stage2.is_some())
            .field("checkpoints_set", &self.checkpoints.is_some())
            .field("results_set", &self.results.is_some())
            .field("queue_set", &self.queue.is_some())
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl StageOrchestratorBuilder {
    /// Create a new builder with the given pipeline configuration.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            images: None,
            stage1: None,
            stage2: None,
            checkpoints: None,
            results: None,
            queue: None,
            events: None,
        }
    }

    pub fn with_image_source(mut self, images: Arc<dyn ImageSource>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_stage1(mut self, stage1: Arc<dyn Stage1Client>) -> Self {
        self.stage1 = Some(stage1);
        self
    }

    pub fn with_stage2(mut self, stage2: Arc<dyn Stage2Client>) -> Self {
        self.stage2 = Some(stage2);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_results(mut self, results: Arc<dyn ResultStore>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn WorkQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if any required dependency is missing.
    pub fn build(self) -> anyhow::Result<StageOrchestrator> {
        let images = self
            .images
            .ok_or_else(|| anyhow::anyhow!("image source dependency missing"))?;
        let stage1 = self
            .stage1
            .ok_or_else(|| anyhow::anyhow!("stage1 dependency missing"))?;
        let stage2 = self
            .stage2
            .ok_or_else(|| anyhow::anyhow!("stage2 dependency missing"))?;
        let checkpoints = self
            .checkpoints
            .ok_or_else(|| anyhow::anyhow!("checkpoints dependency missing"))?;
        let results = self
            .results
            .ok_or_else(|| anyhow::anyhow!("results dependency missing"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue dependency missing"))?;

        Ok(StageOrchestrator::new(
            self.config,
            images,
            stage1,
            stage2,
            checkpoints,
            results,
            queue,
            self.events,
        ))
    }
}
