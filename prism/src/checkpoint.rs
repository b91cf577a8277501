use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::LayoutExtraction;
use crate::store::CreateOutcome;

const CHECKPOINT_PREFIX: &str = "doc_int_results_";

/// Identifier of a stored Stage1 result.
///
/// Derived deterministically from the item's stable name, so every delivery of
/// the same image agrees on where its checkpoint lives.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(String);

impl CheckpointId {
    pub fn for_name(stable_name: &str) -> Self {
        Self(format!("{CHECKPOINT_PREFIX}{stable_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CheckpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CheckpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A durably stored Stage1 result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: CheckpointId,
    pub layout: LayoutExtraction,
    pub created_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(stable_name: &str, layout: LayoutExtraction) -> Self {
        Self {
            id: CheckpointId::for_name(stable_name),
            layout,
            created_at: Utc::now(),
        }
    }
}

/// Storage for Stage1 checkpoints.
///
/// Creation is create-if-absent: an existing record is never overwritten and
/// reporting [`CreateOutcome::AlreadyExists`] is not an error.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a record unless one with the same id already exists.
    async fn create(&self, record: &CheckpointRecord) -> anyhow::Result<CreateOutcome>;

    /// Read a record; `Ok(None)` when it does not exist.
    async fn read(&self, id: &CheckpointId) -> anyhow::Result<Option<CheckpointRecord>>;
}
