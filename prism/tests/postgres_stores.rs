//! Integration tests for the PostgreSQL work queue and stores.
//!
//! Requires a running Postgres instance; the schema is applied on connect.
//! Run with: `cargo test --test postgres_stores --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use std::time::Duration;

use prism::persistence::{
    apply_schema, PostgresCheckpointStore, PostgresResultStore, PostgresWorkQueue,
};
use prism::*;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

async fn pool() -> PgPool {
    let pool = PgPool::connect(&std::env::var("DATABASE_URL").expect("DATABASE_URL required"))
        .await
        .expect("connect");
    apply_schema(&pool).await.expect("apply schema");
    pool
}

async fn cleanup(pool: &PgPool, queue: &str) {
    sqlx::query("DELETE FROM prism_work_items WHERE queue = $1")
        .bind(queue)
        .execute(pool)
        .await
        .ok();
}

fn unique_name() -> String {
    format!("{}.png", Uuid::new_v4())
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn checkpoint_create_is_create_if_absent() {
    let store = PostgresCheckpointStore::new(pool().await);
    let name = unique_name();

    let first = CheckpointRecord::new(&name, LayoutExtraction::new("first", Some("123".into())));
    let second = CheckpointRecord::new(&name, LayoutExtraction::new("second", None));

    assert_eq!(store.create(&first).await.unwrap(), CreateOutcome::Created);
    assert_eq!(
        store.create(&second).await.unwrap(),
        CreateOutcome::AlreadyExists
    );

    let stored = store.read(&first.id).await.unwrap().expect("checkpoint stored");
    assert_eq!(stored.layout, first.layout);
    assert!(store
        .read(&CheckpointId::for_name(&unique_name()))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn result_upsert_creates_then_merges() {
    let store = PostgresResultStore::new(pool().await);
    let name = unique_name();

    let mut fields = serde_json::Map::new();
    fields.insert("brand".into(), json!("X"));
    fields.insert("reviewed_by".into(), json!("ops"));
    let first = ResultDocument::new(&name, fields).unwrap();

    let mut fields = serde_json::Map::new();
    fields.insert("brand".into(), json!("Y"));
    let second = ResultDocument::new(&name, fields).unwrap();

    assert_eq!(upsert(&store, &first).await.unwrap(), UpsertOutcome::Created);
    assert_eq!(upsert(&store, &second).await.unwrap(), UpsertOutcome::Merged);

    let stored = store.read(&name).await.unwrap().expect("document stored");
    assert_eq!(stored.get("brand"), Some(&json!("Y")));
    assert_eq!(stored.get("reviewed_by"), Some(&json!("ops")));
    assert_eq!(stored.get("id"), Some(&json!(name)));
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn replace_of_missing_document_fails() {
    let store = PostgresResultStore::new(pool().await);
    let doc = ResultDocument::new(unique_name(), serde_json::Map::new()).unwrap();
    assert!(store.replace(&doc).await.is_err());
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn queue_redelivers_abandoned_items() {
    let pool = pool().await;
    let queue_name = format!("test-queue-{}", Uuid::new_v4());
    let queue = PostgresWorkQueue::new(pool.clone(), &queue_name);

    let item = WorkItem::new(format!("https://blobs.example.net/uploads/{}", unique_name()));
    queue.enqueue(&item).await.unwrap();

    let first = queue.receive().await.unwrap().expect("delivery");
    assert_eq!(first.item, item);
    assert_eq!(first.delivery_count, 1);
    assert!(queue.receive().await.unwrap().is_none(), "item is leased");

    queue.abandon(first.id, Some("boom".into())).await.unwrap();

    let second = queue.receive().await.unwrap().expect("redelivery");
    assert_eq!(second.item, item);
    assert_eq!(second.delivery_count, 2);

    queue.complete(second.id).await.unwrap();
    assert!(queue.receive().await.unwrap().is_none());

    cleanup(&pool, &queue_name).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn abandon_past_delivery_limit_dead_letters() {
    let pool = pool().await;
    let queue_name = format!("test-queue-{}", Uuid::new_v4());
    let mut persistence = PersistenceConfig::new("unused");
    persistence.max_delivery_count = 3;
    let queue = PostgresWorkQueue::from_config(pool.clone(), &queue_name, &persistence);

    let item = WorkItem::new(format!("https://blobs.example.net/uploads/{}", unique_name()));
    queue.enqueue(&item).await.unwrap();

    for expected in 1..=3 {
        let delivery = queue.receive().await.unwrap().expect("delivery");
        assert_eq!(delivery.delivery_count, expected);
        queue
            .abandon(delivery.id, Some(format!("failure {expected}")))
            .await
            .unwrap();
    }

    assert!(
        queue.receive().await.unwrap().is_none(),
        "third abandon dead-letters the message"
    );
    assert_eq!(queue.dead_letter_count().await.unwrap(), 1);

    let last_error: Option<String> = sqlx::query_scalar(
        "SELECT last_error FROM prism_work_items WHERE queue = $1 AND state = 'dead_letter'",
    )
    .bind(&queue_name)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(last_error.as_deref(), Some("failure 3"));

    cleanup(&pool, &queue_name).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn queue_requeue_carries_envelope_and_honours_delay() {
    let pool = pool().await;
    let queue_name = format!("test-queue-{}", Uuid::new_v4());
    let queue = PostgresWorkQueue::new(pool.clone(), &queue_name);

    let name = unique_name();
    let item = WorkItem::new(format!("https://blobs.example.net/uploads/{name}"))
        .with_retry_count(2)
        .with_checkpoint(CheckpointId::for_name(&name));

    queue
        .requeue(&item, Some(Duration::from_secs(60)))
        .await
        .unwrap();
    assert!(queue.receive().await.unwrap().is_none(), "requeue is delayed");

    queue.requeue(&item, None).await.unwrap();
    let delivery = queue.receive().await.unwrap().expect("delivery");
    assert_eq!(delivery.item.total_retry_count, 2);
    assert_eq!(delivery.item.checkpoint_id, item.checkpoint_id);

    cleanup(&pool, &queue_name).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn queue_dead_letters_are_not_delivered() {
    let pool = pool().await;
    let queue_name = format!("test-queue-{}", Uuid::new_v4());
    let queue = PostgresWorkQueue::new(pool.clone(), &queue_name);

    let item = WorkItem::new(format!("https://blobs.example.net/uploads/{}", unique_name()))
        .with_retry_count(5);
    queue
        .dead_letter(&item, Some("layout failed after 5 total retries".into()))
        .await
        .unwrap();

    assert_eq!(queue.dead_letter_count().await.unwrap(), 1);
    assert!(queue.receive().await.unwrap().is_none());

    cleanup(&pool, &queue_name).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn expired_lease_is_redelivered() {
    let pool = pool().await;
    let queue_name = format!("test-queue-{}", Uuid::new_v4());
    let queue = PostgresWorkQueue::new(pool.clone(), &queue_name)
        .with_visibility_timeout(Duration::from_millis(50));

    let item = WorkItem::new(format!("https://blobs.example.net/uploads/{}", unique_name()));
    queue.enqueue(&item).await.unwrap();

    let first = queue.receive().await.unwrap().expect("delivery");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let second = queue.receive().await.unwrap().expect("redelivery after lease expiry");
    assert_ne!(first.id, second.id);
    assert_eq!(second.delivery_count, 2);

    cleanup(&pool, &queue_name).await;
}
