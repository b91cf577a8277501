//! In-memory pipeline demo.
//!
//! Runs a small worker pool over prism-testkit's in-memory queue, stores and
//! scripted stage clients. Stage2 fails intermittently so the log shows
//! checkpoints being written and reused on redelivery.
//!
//! ```text
//! RUST_LOG=prism=debug cargo run -p prism --example pipeline_demo
//! ```
//!
//! Pipeline settings are read from `PRISM_*` environment variables (or a
//! `.env` file); backoff defaults are replaced with short delays so the demo
//! finishes in a few seconds.

use std::sync::Arc;
use std::time::Duration;

use prism::*;
use prism_testkit::{sample_metadata, work_item, Harness, ScriptedStage2, Step};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prism=info,pipeline_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = PipelineConfig::from_env()?;
    config.max_inner_retries = config.max_inner_retries.min(2);
    config.backoff = BackoffPolicy {
        base_delay_ms: 10,
        jitter_max_ms: 20,
        max_backoff_ms: 200,
    };

    let stage2 = ScriptedStage2::always(sample_metadata());
    for i in 0..6 {
        stage2.push_step(Step::Fail(format!("vision model overloaded ({i})")));
    }
    let harness = Harness::new().with_stage2(stage2);

    let items = [
        "oat-drink.png",
        "rye-bread.png",
        "espresso-beans.png",
        "sparkling-water.png",
        "dark-chocolate.png",
    ];
    for name in items {
        harness.queue.push(work_item(name));
    }

    let mut events = harness.events.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(
                item = %event.meta.item,
                kind = event.payload.kind(),
                "pipeline event"
            );
        }
    });

    let runtime = PipelineRuntime::new(
        RuntimeConfig::default(),
        Arc::new(harness.orchestrator(config)),
    );
    runtime.spawn_worker_pool(3).await;

    let settled = tokio::time::timeout(Duration::from_secs(30), async {
        while !(harness.queue.is_drained()
            && harness.results.len() + harness.queue.dead_letters().len() == items.len())
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    runtime.shutdown().await?;
    event_log.abort();

    if settled.is_err() {
        anyhow::bail!("items did not settle within 30 seconds");
    }

    tracing::info!(
        documents = harness.results.len(),
        requeued = harness.queue.requeued().len(),
        dead_lettered = harness.queue.dead_letters().len(),
        checkpoints = harness.checkpoints.len(),
        layout_calls = harness.stage1.calls(),
        vision_calls = harness.stage2.calls(),
        "demo finished"
    );

    for name in items {
        if let Some(doc) = harness.results.get(name) {
            println!("{}", serde_json::to_string_pretty(&doc.into_value())?);
        }
    }

    Ok(())
}
