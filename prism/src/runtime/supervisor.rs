use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::orchestrator::StageOrchestrator;
use crate::queue::WorkQueue;

use super::worker::{Worker, WorkerConfig};

/// Configuration for the pipeline runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// How long `shutdown` waits for each worker to finish its current item.
    pub shutdown_timeout_secs: u64,
    /// Idle polling interval for workers, in milliseconds.
    pub poll_interval_ms: u64,
    /// Backoff after a failed receive, in milliseconds.
    pub receive_backoff_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: 30,
            poll_interval_ms: 50,
            receive_backoff_ms: 100,
        }
    }
}

/// Shared stop flag watched by every worker of a runtime.
///
/// Clones observe the same flag. Once set it stays set.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    stop: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop: Arc::new(stop),
        }
    }

    /// Ask every worker to stop after its current delivery.
    pub fn cancel(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    pub async fn cancelled(&self) {
        let mut stop = self.stop.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = stop.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker pool feeding queue deliveries through a [`StageOrchestrator`].
///
/// Each worker owns one delivery at a time and settles it before receiving
/// the next: `Ok` from the orchestrator completes the delivery, a retryable
/// `Err` abandons it so the queue redelivers it, and a fatal one is
/// dead-lettered.
pub struct PipelineRuntime {
    config: RuntimeConfig,
    orchestrator: Arc<StageOrchestrator>,
    queue: Arc<dyn WorkQueue>,
    shutdown_token: ShutdownToken,
    worker_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("PipelineRuntime")
            .field("config", &self.config)
            .field("orchestrator", &self.orchestrator)
            .field("worker_count", &worker_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl PipelineRuntime {
    /// Create a runtime consuming the orchestrator's queue.
    pub fn new(config: RuntimeConfig, orchestrator: Arc<StageOrchestrator>) -> Self {
        let queue = orchestrator.queue();
        Self {
            config,
            orchestrator,
            queue,
            shutdown_token: ShutdownToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> Arc<StageOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    /// A clone of the token workers watch for shutdown.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    pub async fn worker_count(&self) -> usize {
        self.worker_handles.lock().await.len()
    }

    /// Gracefully shut down the runtime and all workers.
    ///
    /// Workers finish the item they are processing; they are never cut off
    /// between a stage call and the queue write that settles it.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("Initiating graceful shutdown of pipeline runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Worker task failed: {:?}", e),
                Err(_) => tracing::warn!("Worker task timed out during shutdown"),
            }
        }

        tracing::info!("Pipeline runtime shutdown complete");
        Ok(())
    }

    /// Spawn `parallelism` workers consuming the queue.
    pub async fn spawn_worker_pool(&self, parallelism: usize) {
        #[cfg(feature = "metrics")]
        if let Err(err) = crate::metrics::init_metrics() {
            tracing::warn!("metrics registration failed: {err:#}");
        }

        let worker_group = format!("prism-{}", std::process::id());
        let mut handles = self.worker_handles.lock().await;

        for i in 0..parallelism {
            let config = WorkerConfig::new(format!("{worker_group}-w{i}"))
                .with_poll_interval(Duration::from_millis(self.config.poll_interval_ms))
                .with_receive_backoff(Duration::from_millis(self.config.receive_backoff_ms));
            let worker = Worker::new(
                config,
                Arc::clone(&self.orchestrator),
                Arc::clone(&self.queue),
                self.shutdown_token.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        tracing::info!(workers = handles.len(), "worker pool started");
    }
}
