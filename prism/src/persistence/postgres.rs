use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointId, CheckpointRecord, CheckpointStore};
use crate::config::PersistenceConfig;
use crate::item::{MessageProperties, WorkItem};
use crate::queue::{Delivery, DeliveryId, WorkQueue};
use crate::stage::LayoutExtraction;
use crate::store::{CreateOutcome, ResultDocument, ResultStore};

const SCHEMA: &str = include_str!("../../migrations/0001_prism.sql");

/// Open a connection pool using the given persistence settings.
pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .connect(&config.connection_string)
        .await?;
    Ok(pool)
}

/// Create the prism tables if they do not exist yet.
pub async fn apply_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// PostgreSQL-backed work queue.
///
/// Each message is a row in `prism_work_items`. Receiving leases a ready row
/// with `FOR UPDATE SKIP LOCKED`; a lease that is neither completed nor
/// abandoned before the visibility timeout makes the row receivable again, so
/// a crashed consumer never loses an item. Requeue and dead-letter insert new
/// rows carrying the updated envelope. An abandoned row that has already been
/// delivered `max_delivery_count` times is dead-lettered instead of released.
#[derive(Debug, Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
    queue_name: String,
    visibility_timeout: Duration,
    max_delivery_count: u32,
}

impl PostgresWorkQueue {
    pub fn new(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            visibility_timeout: Duration::from_secs(300),
            max_delivery_count: 10,
        }
    }

    /// Queue using the redelivery cap from `config`.
    pub fn from_config(
        pool: PgPool,
        queue_name: impl Into<String>,
        config: &PersistenceConfig,
    ) -> Self {
        Self::new(pool, queue_name).with_max_delivery_count(config.max_delivery_count)
    }

    /// Deliveries after which an abandoned message is dead-lettered.
    pub fn with_max_delivery_count(mut self, max: u32) -> Self {
        self.max_delivery_count = max.max(1);
        self
    }

    /// How long a received item stays invisible to other consumers.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Publish a fresh item, as an upstream producer would.
    pub async fn enqueue(&self, item: &WorkItem) -> anyhow::Result<()> {
        self.insert(item, "ready", None, None).await
    }

    /// Number of items waiting in the dead-letter state.
    pub async fn dead_letter_count(&self) -> anyhow::Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM prism_work_items
            WHERE queue = $1
              AND state = 'dead_letter'
            "#,
        )
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn insert(
        &self,
        item: &WorkItem,
        state: &str,
        delay: Option<Duration>,
        last_error: Option<String>,
    ) -> anyhow::Result<()> {
        let body = item.image_ref.as_str();
        let properties = serde_json::to_value(item.properties())?;
        let delay_ms = delay.map(|d| d.as_millis() as i64).unwrap_or(0);

        sqlx::query(
            r#"
            INSERT INTO prism_work_items (
                id, queue, body, properties, state, delivery_count,
                available_at, lease_id, lease_expires_at, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 0,
                    NOW() + ($6::bigint) * INTERVAL '1 millisecond',
                    NULL, NULL, $7, NOW(), NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&self.queue_name)
        .bind(body)
        .bind(&properties)
        .bind(state)
        .bind(delay_ms)
        .bind(&last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    async fn receive(&self) -> anyhow::Result<Option<Delivery>> {
        let lease_id = Uuid::now_v7();
        let visibility_ms = self.visibility_timeout.as_millis() as i64;

        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM prism_work_items
                WHERE queue = $1
                  AND (
                    (state = 'ready' AND available_at <= NOW())
                    OR (state = 'leased' AND lease_expires_at < NOW())
                  )
                ORDER BY available_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE prism_work_items w
            SET state = 'leased',
                lease_id = $2,
                lease_expires_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                delivery_count = w.delivery_count + 1,
                updated_at = NOW()
            FROM next
            WHERE w.id = next.id
            RETURNING w.id, w.body, w.properties, w.delivery_count
            "#,
        )
        .bind(&self.queue_name)
        .bind(lease_id)
        .bind(visibility_ms)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let row_id: Uuid = row.try_get("id")?;
        let body: String = row.try_get("body")?;
        let properties: serde_json::Value = row.try_get("properties")?;
        let delivery_count: i32 = row.try_get("delivery_count")?;

        let decoded = serde_json::from_value::<MessageProperties>(properties)
            .map_err(anyhow::Error::from)
            .and_then(|properties| WorkItem::from_message(body.as_bytes(), &properties));

        let item = match decoded {
            Ok(item) => item,
            Err(err) => {
                warn!(message = %row_id, "undecodable message moved to dead_letter: {err}");
                sqlx::query(
                    r#"
                    UPDATE prism_work_items
                    SET state = 'dead_letter',
                        lease_id = NULL,
                        lease_expires_at = NULL,
                        last_error = $2,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(row_id)
                .bind(err.to_string())
                .execute(&self.pool)
                .await?;
                return Err(err.context(format!("message {row_id} could not be decoded")));
            }
        };

        Ok(Some(Delivery {
            id: DeliveryId(lease_id),
            item,
            delivery_count: delivery_count.max(0) as u32,
        }))
    }

    async fn complete(&self, delivery: DeliveryId) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE prism_work_items
            SET state = 'completed',
                lease_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE lease_id = $1
              AND queue = $2
              AND state = 'leased'
            "#,
        )
        .bind(delivery.0)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() > 0 {
            debug!("completed delivery {}", delivery);
        } else {
            warn!("complete: delivery {} is no longer leased", delivery);
        }
        Ok(())
    }

    async fn abandon(&self, delivery: DeliveryId, error: Option<String>) -> anyhow::Result<()> {
        let row = sqlx::query(
            r#"
            UPDATE prism_work_items
            SET state = CASE WHEN delivery_count >= $4 THEN 'dead_letter' ELSE 'ready' END,
                lease_id = NULL,
                lease_expires_at = NULL,
                available_at = NOW(),
                last_error = $3,
                updated_at = NOW()
            WHERE lease_id = $1
              AND queue = $2
              AND state = 'leased'
            RETURNING id, state, delivery_count
            "#,
        )
        .bind(delivery.0)
        .bind(&self.queue_name)
        .bind(&error)
        .bind(self.max_delivery_count as i32)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            warn!("abandon: delivery {} is no longer leased", delivery);
            return Ok(());
        };

        let state: String = row.try_get("state")?;
        if state == "dead_letter" {
            let row_id: Uuid = row.try_get("id")?;
            let delivery_count: i32 = row.try_get("delivery_count")?;
            warn!(
                message = %row_id,
                delivery_count,
                "delivery limit reached; message moved to dead_letter"
            );
        }
        Ok(())
    }

    async fn requeue(&self, item: &WorkItem, delay: Option<Duration>) -> anyhow::Result<()> {
        self.insert(item, "ready", delay, None).await
    }

    async fn dead_letter(&self, item: &WorkItem, reason: Option<String>) -> anyhow::Result<()> {
        self.insert(item, "dead_letter", None, reason).await?;
        warn!(image_ref = %item.image_ref, "item moved to dead_letter");
        Ok(())
    }
}

/// PostgreSQL-backed checkpoint store (`prism_checkpoints`).
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn create(&self, record: &CheckpointRecord) -> anyhow::Result<CreateOutcome> {
        let res = sqlx::query(
            r#"
            INSERT INTO prism_checkpoints (id, text, barcode, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.layout.text)
        .bind(&record.layout.barcode)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(if res.rows_affected() == 0 {
            CreateOutcome::AlreadyExists
        } else {
            CreateOutcome::Created
        })
    }

    async fn read(&self, id: &CheckpointId) -> anyhow::Result<Option<CheckpointRecord>> {
        let row = sqlx::query(
            r#"
            SELECT text, barcode, created_at
            FROM prism_checkpoints
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(Some(CheckpointRecord {
            id: id.clone(),
            layout: LayoutExtraction::new(
                row.try_get::<String, _>("text")?,
                row.try_get::<Option<String>, _>("barcode")?,
            ),
            created_at,
        }))
    }
}

/// PostgreSQL-backed result store (`prism_results`, one JSONB document per id).
#[derive(Debug, Clone)]
pub struct PostgresResultStore {
    pool: PgPool,
}

impl PostgresResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    async fn create(&self, document: &ResultDocument) -> anyhow::Result<CreateOutcome> {
        let res = sqlx::query(
            r#"
            INSERT INTO prism_results (id, document, created_at, updated_at)
            VALUES ($1, $2, NOW(), NOW())
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(document.id())
        .bind(serde_json::Value::Object(document.fields().clone()))
        .execute(&self.pool)
        .await?;

        Ok(if res.rows_affected() == 0 {
            CreateOutcome::AlreadyExists
        } else {
            CreateOutcome::Created
        })
    }

    async fn read(&self, id: &str) -> anyhow::Result<Option<ResultDocument>> {
        let row = sqlx::query(
            r#"
            SELECT document
            FROM prism_results
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        match row.try_get::<serde_json::Value, _>("document")? {
            serde_json::Value::Object(fields) => Ok(Some(ResultDocument::new(id, fields)?)),
            other => Err(anyhow::anyhow!(
                "stored document {id} is not a JSON object: {other}"
            )),
        }
    }

    async fn replace(&self, document: &ResultDocument) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE prism_results
            SET document = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(document.id())
        .bind(serde_json::Value::Object(document.fields().clone()))
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            anyhow::bail!("document {} does not exist", document.id());
        }
        Ok(())
    }
}
