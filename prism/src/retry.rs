//! Bounded inner retry loop shared by every stage.
//!
//! Each attempt is bounded by a timeout; between attempts the loop suspends
//! the calling task with [`tokio::time::sleep`], so a slow retry never stalls
//! other items processed on the same runtime.

use std::future::Future;
use std::time::Duration;

use tracing::Instrument;

use crate::backoff::BackoffPolicy;
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::stage::Stage;
use crate::telemetry;

/// Attempt budget and timing for one stage within one delivery.
#[derive(Clone, Debug)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl RetrySettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_inner_retries.max(1),
            call_timeout: config.call_timeout(),
            backoff: config.backoff.clone(),
        }
    }
}

/// Run `op` until it succeeds or `max_attempts` is exhausted.
///
/// Returns the last error when every attempt failed. No delay follows the
/// final attempt.
pub async fn run_with_backoff<T, F, Fut>(
    stage: Stage,
    settings: &RetrySettings,
    mut op: F,
) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let call = tokio::time::timeout(settings.call_timeout, op())
            .instrument(telemetry::stage_call_span(stage.as_str(), attempt));
        let error = match call.await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(source)) => StageError::Call {
                stage,
                attempt,
                source,
            },
            Err(_) => StageError::Timeout {
                stage,
                attempt,
                timeout: settings.call_timeout,
            },
        };

        telemetry::record_stage_failure(stage.as_str(), attempt);

        if attempt >= settings.max_attempts {
            tracing::error!(
                stage = %stage,
                attempts = attempt,
                error = %error,
                "stage exhausted its inner retry budget"
            );
            return Err(error);
        }

        let delay = settings.backoff.delay(attempt);
        tracing::warn!(
            stage = %stage,
            attempt,
            max_attempts = settings.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "stage call failed; retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
