use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::orchestrator::StageOrchestrator;
use crate::queue::{Delivery, WorkQueue};
use crate::telemetry;

use super::supervisor::ShutdownToken;

/// Per-worker settings derived from the runtime configuration.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Sleep after an empty receive.
    pub poll_interval: Duration,
    /// Sleep after a failed receive.
    pub receive_backoff: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: Duration::from_millis(50),
            receive_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_receive_backoff(mut self, backoff: Duration) -> Self {
        self.receive_backoff = backoff;
        self
    }
}

/// One consumer of the work queue.
///
/// A worker holds at most one delivery and settles it before receiving the
/// next: `Ok` from the orchestrator completes the delivery and a retryable
/// `Err` abandons it so the queue redelivers it. Fatal errors are
/// dead-lettered, since no redelivery can fix them. Shutdown is only observed
/// between deliveries.
pub(crate) struct Worker {
    config: WorkerConfig,
    orchestrator: Arc<StageOrchestrator>,
    queue: Arc<dyn WorkQueue>,
    shutdown: ShutdownToken,
}

impl Worker {
    pub(crate) fn new(
        config: WorkerConfig,
        orchestrator: Arc<StageOrchestrator>,
        queue: Arc<dyn WorkQueue>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            config,
            orchestrator,
            queue,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        let worker_id = self.config.worker_id.as_str();
        tracing::debug!(worker_id, "worker started");

        while !self.shutdown.is_cancelled() {
            let received = self
                .queue
                .receive()
                .instrument(telemetry::queue_receive_span(worker_id))
                .await;

            match received {
                Ok(Some(delivery)) => self.settle(delivery).await,
                Ok(None) => idle(&self.shutdown, self.config.poll_interval).await,
                Err(err) => {
                    tracing::warn!(worker_id, "receive error: {err:#}");
                    idle(&self.shutdown, self.config.receive_backoff).await;
                }
            }
        }

        tracing::info!(worker_id, "worker shutting down");
    }

    async fn settle(&self, delivery: Delivery) {
        let Delivery {
            id,
            item,
            delivery_count,
        } = delivery;
        let name = item
            .stable_name()
            .unwrap_or(item.image_ref.as_str())
            .to_string();
        let timing = telemetry::record_item_start(&name);

        let result = telemetry::instrument_process(
            &name,
            item.total_retry_count,
            self.orchestrator.process(item.clone()),
        )
        .await;

        let settled = match result {
            Ok(outcome) => {
                telemetry::record_item_end(timing, outcome.as_str());
                self.queue.complete(id).await
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(item = %name, delivery_count, kind = err.kind(), "unprocessable item: {err}");
                match self.queue.dead_letter(&item, Some(err.to_string())).await {
                    Ok(()) => {
                        telemetry::record_item_end(timing, "dead_lettered");
                        self.queue.complete(id).await
                    }
                    Err(dead_letter_err) => {
                        telemetry::record_item_end(timing, "abandoned");
                        tracing::warn!(item = %name, "dead-letter write failed: {dead_letter_err:#}");
                        self.queue.abandon(id, Some(err.to_string())).await
                    }
                }
            }
            Err(err) => {
                telemetry::record_item_end(timing, "abandoned");
                tracing::warn!(item = %name, delivery_count, kind = err.kind(), "delivery abandoned: {err}");
                self.queue.abandon(id, Some(err.to_string())).await
            }
        };

        if let Err(err) = settled {
            tracing::error!(item = %name, delivery = %id, "failed to settle delivery: {err:#}");
        }
    }
}

/// Sleep for `duration`, returning early on shutdown.
pub(crate) async fn idle(shutdown: &ShutdownToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
