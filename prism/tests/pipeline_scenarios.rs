//! End-to-end scenarios for the stage orchestrator.
//!
//! Every collaborator is an in-memory double from `prism-testkit`; deliveries
//! are pulled from the in-memory queue by hand so each test controls exactly
//! how many times an item is redelivered.

use std::time::Duration;

use prism::direct::extract_once;
use prism::*;
use prism_testkit::{
    fast_config, sample_layout, sample_metadata, work_item, Harness, HintRecord,
    ScriptedStage1, ScriptedStage2, Step,
};
use serde_json::json;
use tokio::sync::broadcast;

/// Receive and settle deliveries until the queue is empty.
async fn drain(harness: &Harness, orchestrator: &StageOrchestrator) -> Vec<Outcome> {
    let mut outcomes = Vec::new();
    while let Some(delivery) = harness.queue.receive().await.unwrap() {
        match orchestrator.process(delivery.item).await {
            Ok(outcome) => {
                harness.queue.complete(delivery.id).await.unwrap();
                outcomes.push(outcome);
            }
            Err(err) => panic!("unexpected pipeline error: {err}"),
        }
        assert!(outcomes.len() < 100, "queue never drained");
    }
    outcomes
}

fn event_kinds(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<&'static str> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.payload.kind());
    }
    kinds
}

fn config_with_inner_retries(max_inner_retries: u32) -> PipelineConfig {
    PipelineConfig {
        max_inner_retries,
        ..fast_config()
    }
}

#[tokio::test]
async fn test_successful_item_is_committed_with_all_fields() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(fast_config());

    let outcome = orchestrator.process(work_item("oat-drink.png")).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let doc = harness.results.get("oat-drink.png").expect("document committed");
    assert_eq!(doc.get("id"), Some(&json!("oat-drink.png")));
    assert_eq!(doc.get("brand"), Some(&json!("Acme")));
    assert_eq!(doc.get("product_name"), Some(&json!("Oat Drink")));
    assert_eq!(doc.get("price"), Some(&json!("2,49")));
    assert_eq!(doc.get("price_per_unit"), Some(&json!("2,49 EUR/L")));
    assert_eq!(doc.get("expiration_date"), Some(&json!("12.03.2027")));
    assert_eq!(doc.get("article_number"), Some(&json!("n/a")));
    assert_eq!(doc.get("bar_code_available"), Some(&json!(true)));
    assert_eq!(doc.get("bar_code_numbers"), Some(&json!("4006381333931")));

    assert_eq!(harness.queue.write_count(), 0);
    assert!(harness.checkpoints.is_empty());
}

#[tokio::test]
async fn test_stage1_recovers_within_inner_retries() {
    let harness = Harness::new()
        .with_stage1(ScriptedStage1::failing_then(
            2,
            LayoutExtraction::new("ABC", Some("123".to_string())),
        ))
        .with_stage2(ScriptedStage2::always(ProductMetadata {
            brand: "X".into(),
            product_name: "Y".into(),
            ..Default::default()
        }));
    let orchestrator = harness.orchestrator(fast_config());

    let outcome = orchestrator.process(work_item("a.png")).await.unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let doc = harness.results.get("a.png").unwrap();
    assert_eq!(doc.get("brand"), Some(&json!("X")));
    assert_eq!(doc.get("product_name"), Some(&json!("Y")));
    assert_eq!(harness.results.create_calls(), 1);
    assert_eq!(harness.results.replace_calls(), 0);

    harness.stage1.assert_call_count_eq(3);
    harness.stage2.assert_call_count_eq(1);
    assert_eq!(
        harness.stage2.hints(),
        vec![HintRecord {
            text: "ABC".into(),
            barcode: Some("123".into()),
        }]
    );
    assert_eq!(harness.queue.write_count(), 0);
}

#[tokio::test]
async fn test_exhausted_budget_dead_letters_without_touching_stores() {
    let harness = Harness::new().with_stage2(ScriptedStage2::always_failing("model overloaded"));
    let orchestrator = harness.orchestrator(fast_config());

    let checkpoint_id = CheckpointId::for_name("a.png");
    let seeded = CheckpointRecord::new("a.png", sample_layout());
    harness.checkpoints.insert(seeded.clone());

    let item = work_item("a.png")
        .with_retry_count(4)
        .with_checkpoint(checkpoint_id.clone());
    let outcome = orchestrator.process(item).await.unwrap();
    assert_eq!(outcome, Outcome::DeadLettered);

    harness.stage1.assert_call_count_eq(0);
    harness.stage2.assert_call_count_eq(5);
    assert_eq!(harness.checkpoints.create_calls(), 0);
    assert_eq!(harness.checkpoints.get(&checkpoint_id), Some(seeded));
    assert_eq!(harness.results.create_calls(), 0);
    assert!(harness.results.is_empty());

    let dead = harness.queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].item.total_retry_count, 5);
    assert_eq!(dead[0].item.checkpoint_id, Some(checkpoint_id));
    let reason = dead[0].reason.as_deref().unwrap_or_default();
    assert!(reason.contains("vision"), "reason: {reason}");
    assert!(harness.queue.requeued().is_empty());
}

#[tokio::test]
async fn test_dead_letter_after_max_total_retries_deliveries() {
    let harness = Harness::new().with_stage1(ScriptedStage1::always_failing("layout service down"));
    let config = config_with_inner_retries(2);
    let orchestrator = harness.orchestrator(config.clone());

    harness.queue.push(work_item("a.png"));
    let outcomes = drain(&harness, &orchestrator).await;

    let mut expected = vec![Outcome::Requeued; config.max_total_retries as usize - 1];
    expected.push(Outcome::DeadLettered);
    assert_eq!(outcomes, expected);

    let counts: Vec<u32> = harness
        .queue
        .requeued()
        .iter()
        .map(|r| r.item.total_retry_count)
        .collect();
    assert_eq!(counts, vec![1, 2, 3, 4]);
    assert!(harness
        .queue
        .requeued()
        .iter()
        .all(|r| r.item.checkpoint_id.is_none()));

    let dead = harness.queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].item.total_retry_count, config.max_total_retries);

    harness.stage1.assert_call_count_eq(2 * config.max_total_retries as usize);
    harness.stage2.assert_call_count_eq(0);
    assert!(harness.queue.is_drained());
}

#[tokio::test]
async fn test_redelivery_reuses_checkpoint_instead_of_rerunning_stage1() {
    let harness = Harness::new().with_stage2(ScriptedStage2::failing_then(2, sample_metadata()));
    let orchestrator = harness.orchestrator(config_with_inner_retries(2));

    harness.queue.push(work_item("a.png"));
    let outcomes = drain(&harness, &orchestrator).await;
    assert_eq!(outcomes, vec![Outcome::Requeued, Outcome::Completed]);

    let requeued = harness.queue.requeued();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].item.total_retry_count, 1);
    assert_eq!(
        requeued[0].item.checkpoint_id,
        Some(CheckpointId::for_name("a.png"))
    );

    harness.stage1.assert_call_count_eq(1);
    harness.stage2.assert_call_count_eq(3);
    assert_eq!(harness.checkpoints.create_calls(), 1);
    assert_eq!(harness.checkpoints.read_calls(), 1);
    assert!(harness.results.get("a.png").is_some());
}

#[tokio::test]
async fn test_checkpoint_layout_is_used_as_stage2_hints() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(fast_config());

    let stored = LayoutExtraction::new("Stored text", Some("999".to_string()));
    harness
        .checkpoints
        .insert(CheckpointRecord::new("a.png", stored));

    let item = work_item("a.png").with_checkpoint(CheckpointId::for_name("a.png"));
    assert_eq!(orchestrator.process(item).await.unwrap(), Outcome::Completed);

    harness.stage1.assert_call_count_eq(0);
    assert_eq!(
        harness.stage2.hints(),
        vec![HintRecord {
            text: "Stored text".into(),
            barcode: Some("999".into()),
        }]
    );
}

#[tokio::test]
async fn test_reprocessing_merges_into_existing_document() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(fast_config());

    let mut fields = serde_json::Map::new();
    fields.insert("reviewed_by".into(), json!("ops"));
    fields.insert("brand".into(), json!("Old Brand"));
    harness
        .results
        .insert(ResultDocument::new("a.png", fields).unwrap());

    assert_eq!(
        orchestrator.process(work_item("a.png")).await.unwrap(),
        Outcome::Completed
    );

    harness.stage2.set_fallback(Step::Succeed(ProductMetadata {
        brand: "Acme Foods".into(),
        ..sample_metadata()
    }));
    assert_eq!(
        orchestrator.process(work_item("a.png")).await.unwrap(),
        Outcome::Completed
    );

    assert_eq!(harness.results.len(), 1);
    let doc = harness.results.get("a.png").unwrap();
    assert_eq!(doc.get("brand"), Some(&json!("Acme Foods")));
    assert_eq!(doc.get("product_name"), Some(&json!("Oat Drink")));
    assert_eq!(doc.get("reviewed_by"), Some(&json!("ops")));
    assert_eq!(harness.results.replace_calls(), 2);
}

#[tokio::test]
async fn test_identical_reprocessing_is_idempotent() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(fast_config());

    orchestrator.process(work_item("a.png")).await.unwrap();
    let first = harness.results.get("a.png").unwrap();

    // Same stable name, different container.
    let other = WorkItem::new("https://mirror.example.net/archive/a.png?sig=abc");
    orchestrator.process(other).await.unwrap();
    let second = harness.results.get("a.png").unwrap();

    assert_eq!(harness.results.len(), 1);
    assert_eq!(first.get("brand"), second.get("brand"));
    assert_eq!(
        second.get(IMAGE_REF_FIELD),
        Some(&json!("https://mirror.example.net/archive/a.png?sig=abc"))
    );
}

#[tokio::test]
async fn test_checkpointing_disabled_requeues_without_checkpoint() {
    let harness = Harness::new().with_stage2(ScriptedStage2::always_failing("model overloaded"));
    let mut config = config_with_inner_retries(1);
    config.capabilities.checkpointing = false;
    let orchestrator = harness.orchestrator(config);

    let outcome = orchestrator.process(work_item("a.png")).await.unwrap();
    assert_eq!(outcome, Outcome::Requeued);

    let item = harness.queue.last_requeued().unwrap();
    assert_eq!(item.total_retry_count, 1);
    assert_eq!(item.checkpoint_id, None);
    assert_eq!(harness.checkpoints.create_calls(), 0);
}

#[tokio::test]
async fn test_dead_lettering_disabled_keeps_requeueing() {
    let harness = Harness::new().with_stage1(ScriptedStage1::always_failing("layout service down"));
    let mut config = config_with_inner_retries(1);
    config.capabilities.dead_lettering = false;
    let orchestrator = harness.orchestrator(config);

    let outcome = orchestrator
        .process(work_item("a.png").with_retry_count(7))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Requeued);
    assert_eq!(harness.queue.last_requeued().unwrap().total_retry_count, 8);
    assert!(harness.queue.dead_letters().is_empty());
}

#[tokio::test]
async fn test_missing_checkpoint_is_dropped_and_stage1_recomputed() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(fast_config());

    let item = work_item("a.png").with_checkpoint(CheckpointId::for_name("a.png"));
    assert_eq!(orchestrator.process(item).await.unwrap(), Outcome::Requeued);

    let requeued = harness.queue.last_requeued().unwrap();
    assert_eq!(requeued.checkpoint_id, None);
    assert_eq!(requeued.total_retry_count, 1);
    harness.stage1.assert_call_count_eq(0);
    harness.stage2.assert_call_count_eq(0);

    assert_eq!(
        orchestrator.process(requeued).await.unwrap(),
        Outcome::Completed
    );
    harness.stage1.assert_call_count_eq(1);
}

#[tokio::test]
async fn test_checkpoint_read_failure_keeps_reference() {
    let harness = Harness::new();
    harness.checkpoints.set_fail_reads(true);
    let orchestrator = harness.orchestrator(fast_config());

    let checkpoint_id = CheckpointId::for_name("a.png");
    let item = work_item("a.png").with_checkpoint(checkpoint_id.clone());
    assert_eq!(orchestrator.process(item).await.unwrap(), Outcome::Requeued);

    let requeued = harness.queue.last_requeued().unwrap();
    assert_eq!(requeued.checkpoint_id, Some(checkpoint_id));
    assert_eq!(requeued.total_retry_count, 1);
    harness.stage1.assert_call_count_eq(0);
    // The read went through the full inner retry loop first.
    assert_eq!(harness.checkpoints.read_calls(), 5);
}

#[tokio::test]
async fn test_transient_checkpoint_read_failure_is_retried_inline() {
    let harness = Harness::new();
    harness
        .checkpoints
        .insert(CheckpointRecord::new("a.png", sample_layout()));
    harness.checkpoints.fail_next_reads(1);
    let orchestrator = harness.orchestrator(fast_config());

    let item = work_item("a.png")
        .with_retry_count(2)
        .with_checkpoint(CheckpointId::for_name("a.png"));
    assert_eq!(orchestrator.process(item).await.unwrap(), Outcome::Completed);

    assert_eq!(harness.checkpoints.read_calls(), 2);
    assert!(harness.queue.requeued().is_empty());
    harness.stage1.assert_call_count_eq(0);
    harness.stage2.assert_call_count_eq(1);
    assert!(harness.results.get("a.png").is_some());
}

#[tokio::test]
async fn test_checkpoint_write_failure_requeues_without_reference() {
    let harness = Harness::new().with_stage2(ScriptedStage2::always_failing("model overloaded"));
    harness.checkpoints.set_fail_creates(true);
    let orchestrator = harness.orchestrator(config_with_inner_retries(1));

    assert_eq!(
        orchestrator.process(work_item("a.png")).await.unwrap(),
        Outcome::Requeued
    );

    let requeued = harness.queue.last_requeued().unwrap();
    assert_eq!(requeued.checkpoint_id, None);
    assert_eq!(requeued.total_retry_count, 1);
    assert_eq!(harness.checkpoints.create_calls(), 1);
    assert!(harness.checkpoints.is_empty());
}

#[tokio::test]
async fn test_existing_checkpoint_is_referenced_not_overwritten() {
    let harness = Harness::new().with_stage2(ScriptedStage2::always_failing("model overloaded"));
    let orchestrator = harness.orchestrator(config_with_inner_retries(1));
    let mut rx = harness.events.subscribe();

    let earlier = CheckpointRecord::new("a.png", LayoutExtraction::new("earlier run", None));
    harness.checkpoints.insert(earlier.clone());

    assert_eq!(
        orchestrator.process(work_item("a.png")).await.unwrap(),
        Outcome::Requeued
    );

    let requeued = harness.queue.last_requeued().unwrap();
    assert_eq!(requeued.checkpoint_id, Some(earlier.id.clone()));
    assert_eq!(harness.checkpoints.get(&earlier.id), Some(earlier.clone()));

    let stored = std::iter::from_fn(|| rx.try_recv().ok()).find_map(|event| match event.payload {
        PipelineEventPayload::CheckpointStored { created, .. } => Some(created),
        _ => None,
    });
    assert_eq!(stored, Some(false));
}

#[tokio::test]
async fn test_commit_failure_checkpoints_and_recovers() {
    let harness = Harness::new();
    harness.results.fail_next(1);
    let orchestrator = harness.orchestrator(config_with_inner_retries(1));
    let mut rx = harness.events.subscribe();

    harness.queue.push(work_item("a.png"));
    let outcomes = drain(&harness, &orchestrator).await;
    assert_eq!(outcomes, vec![Outcome::Requeued, Outcome::Completed]);

    let failed = std::iter::from_fn(|| rx.try_recv().ok()).find_map(|event| match event.payload {
        PipelineEventPayload::StageFailed { stage, .. } => Some(stage),
        _ => None,
    });
    assert_eq!(failed, Some(Stage::Commit));

    harness.stage1.assert_call_count_eq(1);
    harness.stage2.assert_call_count_eq(2);
    assert!(harness.results.get("a.png").is_some());
}

#[tokio::test]
async fn test_missing_image_is_a_resolution_error() {
    let harness = Harness::new();
    let item = work_item("gone.png");
    harness.images.set_missing(item.image_ref.as_str());
    let orchestrator = harness.orchestrator(fast_config());

    let err = orchestrator.process(item).await.unwrap_err();
    assert!(matches!(err, PipelineError::Resolution(_)), "{err}");
    assert!(!err.is_fatal());

    harness.stage1.assert_call_count_eq(0);
    assert_eq!(harness.queue.write_count(), 0);
}

#[tokio::test]
async fn test_item_without_stable_name_is_rejected() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(fast_config());

    let err = orchestrator
        .process(WorkItem::new("https://blobs.example.net/uploads/"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidItem { .. }), "{err}");
    assert!(err.is_fatal());
    assert_eq!(harness.images.fetches(), 0);
}

#[tokio::test]
async fn test_failed_requeue_surfaces_queue_error() {
    let harness = Harness::new().with_stage1(ScriptedStage1::always_failing("layout service down"));
    harness.queue.set_fail_writes(true);
    let orchestrator = harness.orchestrator(config_with_inner_retries(1));

    let err = orchestrator.process(work_item("a.png")).await.unwrap_err();
    assert!(matches!(err, PipelineError::Queue(_)), "{err}");
    assert!(!err.is_fatal());
    assert!(harness.queue.requeued().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_stage1_call_times_out_and_is_retried() {
    let harness = Harness::new();
    harness.stage1.push_step(Step::Stall);
    let orchestrator = harness.orchestrator(fast_config());

    assert_eq!(
        orchestrator.process(work_item("a.png")).await.unwrap(),
        Outcome::Completed
    );
    harness.stage1.assert_call_count_eq(2);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_stage2_requeues_with_checkpoint() {
    let harness = Harness::new().with_stage2(ScriptedStage2::new(Step::Stall));
    let orchestrator = harness.orchestrator(config_with_inner_retries(2));
    let mut rx = harness.events.subscribe();

    assert_eq!(
        orchestrator.process(work_item("a.png")).await.unwrap(),
        Outcome::Requeued
    );

    let event = rx.try_recv().unwrap();
    assert_eq!(
        event.payload,
        PipelineEventPayload::StageFailed {
            stage: Stage::Vision,
            attempts: 2,
        }
    );
    assert_eq!(
        harness.queue.last_requeued().unwrap().checkpoint_id,
        Some(CheckpointId::for_name("a.png"))
    );
}

#[tokio::test]
async fn test_events_follow_item_lifecycle() {
    let harness = Harness::new().with_stage2(ScriptedStage2::failing_then(1, sample_metadata()));
    let orchestrator = harness.orchestrator(config_with_inner_retries(1));
    let mut rx = harness.events.subscribe();

    assert_eq!(
        orchestrator.process(work_item("a.png")).await.unwrap(),
        Outcome::Requeued
    );
    assert_eq!(
        event_kinds(&mut rx),
        vec!["stage_failed", "checkpoint_stored", "requeued"]
    );

    let requeued = harness.queue.last_requeued().unwrap();
    assert_eq!(orchestrator.process(requeued).await.unwrap(), Outcome::Completed);
    assert_eq!(event_kinds(&mut rx), vec!["checkpoint_reused", "completed"]);
}

#[tokio::test]
async fn test_events_of_one_delivery_share_correlation_id() {
    let harness = Harness::new().with_stage2(ScriptedStage2::always_failing("model overloaded"));
    let orchestrator = harness.orchestrator(config_with_inner_retries(1));
    let mut rx = harness.events.subscribe();

    orchestrator.process(work_item("a.png")).await.unwrap();

    let events: Vec<PipelineEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(events.len(), 3);
    let correlation = events[0].meta.correlation_id;
    assert!(events.iter().all(|e| e.meta.correlation_id == correlation));
    assert!(events.iter().all(|e| e.meta.item == "a.png"));

    let mut keys: Vec<&str> = events
        .iter()
        .map(|e| e.meta.idempotency_key.as_str())
        .collect();
    keys.dedup();
    assert_eq!(keys.len(), 3);
}

#[tokio::test]
async fn test_envelope_survives_message_encoding() {
    let harness = Harness::new().with_stage2(ScriptedStage2::always_failing("model overloaded"));
    let orchestrator = harness.orchestrator(config_with_inner_retries(1));

    orchestrator.process(work_item("a.png")).await.unwrap();
    let requeued = harness.queue.last_requeued().unwrap();

    let decoded = WorkItem::from_message(&requeued.body(), &requeued.properties()).unwrap();
    assert_eq!(decoded, requeued);
    assert_eq!(decoded.checkpoint_id, Some(CheckpointId::for_name("a.png")));
}

#[tokio::test]
async fn test_direct_extraction_runs_each_stage_once() {
    let harness = Harness::new();

    let metadata = extract_once(
        harness.stage1.as_ref(),
        harness.stage2.as_ref(),
        b"image bytes",
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    assert_eq!(metadata, sample_metadata());
    let json = metadata.to_nullable_json();
    assert_eq!(json["brand"], json!("Acme"));
    assert_eq!(json["article_number"], serde_json::Value::Null);

    harness.stage1.assert_call_count_eq(1);
    harness.stage2.assert_call_count_eq(1);
    assert!(harness.results.is_empty());
    assert!(harness.checkpoints.is_empty());
}

#[tokio::test]
async fn test_direct_extraction_does_not_retry() {
    let harness = Harness::new().with_stage1(ScriptedStage1::failing_then(1, sample_layout()));

    let err = extract_once(
        harness.stage1.as_ref(),
        harness.stage2.as_ref(),
        b"image bytes",
        Duration::from_secs(1),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("layout call failed"), "{err:#}");
    harness.stage1.assert_call_count_eq(1);
    harness.stage2.assert_call_count_eq(0);
}
