use prism::*;
use std::sync::Arc;

use crate::mock::{ScriptedStage1, ScriptedStage2, StaticImageSource};
use crate::queue::InMemoryWorkQueue;
use crate::store::{InMemoryCheckpointStore, InMemoryResultStore};

pub const BLOB_PREFIX: &str = "https://blobs.example.net/uploads/";

/// A fresh work item for an uploaded image called `name`.
pub fn work_item(name: &str) -> WorkItem {
    WorkItem::new(format!("{BLOB_PREFIX}{name}"))
}

pub fn sample_layout() -> LayoutExtraction {
    LayoutExtraction::new(
        "Acme Oat Drink\n1 L\n2,49 EUR\n2,49 EUR/L\nbest before 12.03.2027",
        Some("4006381333931".to_string()),
    )
}

pub fn sample_metadata() -> ProductMetadata {
    ProductMetadata {
        brand: "Acme".into(),
        product_name: "Oat Drink".into(),
        price: "2,49".into(),
        price_per_unit: "2,49 EUR/L".into(),
        expiration_date: "12.03.2027".into(),
        article_number: NOT_AVAILABLE.into(),
        bar_code_available: true,
        bar_code_numbers: "4006381333931".into(),
    }
}

/// Default configuration with zero backoff and a short call timeout.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        call_timeout_ms: 1_000,
        backoff: BackoffPolicy::immediate(),
        ..PipelineConfig::default()
    }
}

/// Every collaborator of a [`StageOrchestrator`] as an in-memory double.
///
/// Both stage clients succeed by default; reconfigure them through the
/// public fields before building the orchestrator.
#[derive(Clone)]
pub struct Harness {
    pub images: Arc<StaticImageSource>,
    pub stage1: Arc<ScriptedStage1>,
    pub stage2: Arc<ScriptedStage2>,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub results: Arc<InMemoryResultStore>,
    pub queue: Arc<InMemoryWorkQueue>,
    pub events: Arc<InProcEventBus>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            images: Arc::new(StaticImageSource::new()),
            stage1: Arc::new(ScriptedStage1::always(sample_layout())),
            stage2: Arc::new(ScriptedStage2::always(sample_metadata())),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            results: Arc::new(InMemoryResultStore::new()),
            queue: Arc::new(InMemoryWorkQueue::new()),
            events: Arc::new(InProcEventBus::new(256)),
        }
    }

    pub fn with_stage1(mut self, stage1: ScriptedStage1) -> Self {
        self.stage1 = Arc::new(stage1);
        self
    }

    pub fn with_stage2(mut self, stage2: ScriptedStage2) -> Self {
        self.stage2 = Arc::new(stage2);
        self
    }

    /// Build an orchestrator wired to this harness.
    pub fn orchestrator(&self, config: PipelineConfig) -> StageOrchestrator {
        let built = StageOrchestratorBuilder::new(config)
            .with_image_source(self.images.clone())
            .with_stage1(self.stage1.clone())
            .with_stage2(self.stage2.clone())
            .with_checkpoints(self.checkpoints.clone())
            .with_results(self.results.clone())
            .with_queue(self.queue.clone())
            .with_events(self.events.clone())
            .build();
        match built {
            Ok(orchestrator) => orchestrator,
            Err(err) => panic!("harness provides every dependency: {err}"),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
