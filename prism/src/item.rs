use std::collections::BTreeMap;
use std::fmt::Display;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointId;

/// Message property carrying [`WorkItem::total_retry_count`].
pub const TOTAL_RETRY_COUNT_PROPERTY: &str = "total_retry_count";
/// Message property carrying [`WorkItem::checkpoint_id`].
pub const CHECKPOINT_ID_PROPERTY: &str = "doc_int_results_id";

/// Application properties attached to a queue message.
pub type MessageProperties = BTreeMap<String, serde_json::Value>;

/// Opaque locator of a previously uploaded image (usually a blob URL).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable name of the image: the last path segment of the locator,
    /// without query string or fragment. `None` when that segment is empty.
    pub fn stable_name(&self) -> Option<&str> {
        let path = self.0.split(['?', '#']).next().unwrap_or_default();
        let name = path.rsplit('/').next().unwrap_or_default().trim();
        (!name.is_empty()).then_some(name)
    }
}

impl Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ImageRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ImageRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A unit of pipeline work: one image plus the envelope state carried across
/// redeliveries.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub image_ref: ImageRef,
    /// Number of times the item was returned to the queue after a stage
    /// exhausted its inner retry budget.
    pub total_retry_count: u32,
    /// Set iff a Stage1 result for this item has been durably stored.
    pub checkpoint_id: Option<CheckpointId>,
}

impl WorkItem {
    /// A fresh item as an upstream enqueuer would create it.
    pub fn new(image_ref: impl Into<ImageRef>) -> Self {
        Self {
            image_ref: image_ref.into(),
            total_retry_count: 0,
            checkpoint_id: None,
        }
    }

    pub fn with_retry_count(mut self, total_retry_count: u32) -> Self {
        self.total_retry_count = total_retry_count;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint_id: CheckpointId) -> Self {
        self.checkpoint_id = Some(checkpoint_id);
        self
    }

    /// See [`ImageRef::stable_name`].
    pub fn stable_name(&self) -> Option<&str> {
        self.image_ref.stable_name()
    }

    /// Message body: the UTF-8 encoded image reference.
    pub fn body(&self) -> Vec<u8> {
        self.image_ref.as_str().as_bytes().to_vec()
    }

    /// Envelope fields as message properties.
    pub fn properties(&self) -> MessageProperties {
        let mut properties = MessageProperties::new();
        properties.insert(
            TOTAL_RETRY_COUNT_PROPERTY.to_string(),
            serde_json::Value::from(self.total_retry_count),
        );
        properties.insert(
            CHECKPOINT_ID_PROPERTY.to_string(),
            self.checkpoint_id
                .as_ref()
                .map(|id| serde_json::Value::from(id.as_str()))
                .unwrap_or(serde_json::Value::Null),
        );
        properties
    }

    /// Rebuild an item from a queue message body and its properties.
    ///
    /// Missing properties fall back to a fresh envelope; properties of the
    /// wrong type are rejected.
    pub fn from_message(body: &[u8], properties: &MessageProperties) -> anyhow::Result<Self> {
        let locator = std::str::from_utf8(body)
            .map_err(|e| anyhow::anyhow!("message body is not UTF-8: {e}"))?
            .trim();
        if locator.is_empty() {
            anyhow::bail!("message body is empty");
        }

        let total_retry_count = match properties.get(TOTAL_RETRY_COUNT_PROPERTY) {
            None | Some(serde_json::Value::Null) => 0,
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    anyhow::anyhow!("invalid {TOTAL_RETRY_COUNT_PROPERTY} property: {value}")
                })?,
        };

        let checkpoint_id = match properties.get(CHECKPOINT_ID_PROPERTY) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(id)) if !id.is_empty() => {
                Some(CheckpointId::from(id.as_str()))
            }
            Some(value) => {
                anyhow::bail!("invalid {CHECKPOINT_ID_PROPERTY} property: {value}")
            }
        };

        Ok(Self {
            image_ref: ImageRef::new(locator),
            total_retry_count,
            checkpoint_id,
        })
    }
}

/// Resolves image references to raw bytes (blob storage, HTTP, disk).
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Fetch the bytes behind `image`.
    async fn fetch(&self, image: &ImageRef) -> anyhow::Result<Vec<u8>>;
}
