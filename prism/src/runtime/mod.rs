/// Builder wiring collaborators into a stage orchestrator.
pub mod builder;
/// Runtime supervisor managing the worker pool.
pub mod supervisor;
/// Queue consumers run by the supervisor.
pub mod worker;

pub use builder::StageOrchestratorBuilder;
pub use supervisor::{PipelineRuntime, RuntimeConfig, ShutdownToken};
pub use worker::WorkerConfig;
