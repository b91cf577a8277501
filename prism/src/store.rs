use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::item::ImageRef;
use crate::stage::ProductMetadata;

/// Field under which the document id is stored.
pub const ID_FIELD: &str = "id";
/// Field under which the source image reference is stored.
pub const IMAGE_REF_FIELD: &str = "image_ref";

/// Result of a create-if-absent write.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Result of [`upsert`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    /// No document existed; a new one was created.
    Created,
    /// The payload was merged over an existing document.
    Merged,
}

/// Final metadata document keyed by the item's stable name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    id: String,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl ResultDocument {
    /// Build a document; the `id` field is always kept in sync with `id`.
    pub fn new(
        id: impl Into<String>,
        mut fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, PipelineError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(PipelineError::InvalidDocument("document id is empty".into()));
        }
        fields.insert(ID_FIELD.to_string(), serde_json::Value::from(id.as_str()));
        Ok(Self { id, fields })
    }

    /// Document for a successful Stage2 result: every metadata field plus the
    /// stable name and the image reference.
    pub fn from_metadata(
        stable_name: &str,
        image_ref: &ImageRef,
        metadata: &ProductMetadata,
    ) -> Result<Self, PipelineError> {
        let fields = match serde_json::to_value(metadata) {
            Ok(serde_json::Value::Object(fields)) => fields,
            Ok(other) => {
                return Err(PipelineError::InvalidDocument(format!(
                    "metadata serialized to {other}, expected an object"
                )))
            }
            Err(e) => {
                return Err(PipelineError::InvalidDocument(format!(
                    "metadata is not serializable: {e}"
                )))
            }
        };
        let mut document = Self::new(stable_name, fields)?;
        document.fields.insert(
            IMAGE_REF_FIELD.to_string(),
            serde_json::Value::from(image_ref.as_str()),
        );
        Ok(document)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn fields(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }

    /// Overlay `update` onto this document: values from `update` win, fields
    /// absent from `update` are preserved.
    pub fn merged_with(&self, update: &ResultDocument) -> ResultDocument {
        let mut fields = self.fields.clone();
        for (key, value) in &update.fields {
            fields.insert(key.clone(), value.clone());
        }
        fields.insert(ID_FIELD.to_string(), serde_json::Value::from(self.id.as_str()));
        ResultDocument {
            id: self.id.clone(),
            fields,
        }
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::Value::Object(self.fields)
    }
}

/// Document store holding the final merged metadata.
///
/// Concurrent writers to the same id must be serialized by the store itself.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create the document unless one with the same id exists.
    async fn create(&self, document: &ResultDocument) -> anyhow::Result<CreateOutcome>;

    /// Read a document; `Ok(None)` when it does not exist.
    async fn read(&self, id: &str) -> anyhow::Result<Option<ResultDocument>>;

    /// Replace an existing document wholesale.
    async fn replace(&self, document: &ResultDocument) -> anyhow::Result<()>;
}

/// Idempotent create-or-merge.
///
/// Attempts `create`; when the document already exists it is read, the new
/// fields are overlaid and the result replaces the stored copy. Applying the
/// same document any number of times converges to the same state.
pub async fn upsert(
    store: &dyn ResultStore,
    document: &ResultDocument,
) -> anyhow::Result<UpsertOutcome> {
    match store.create(document).await? {
        CreateOutcome::Created => Ok(UpsertOutcome::Created),
        CreateOutcome::AlreadyExists => {
            let existing = store.read(document.id()).await?.ok_or_else(|| {
                anyhow::anyhow!(
                    "document {} reported as existing but could not be read",
                    document.id()
                )
            })?;
            store.replace(&existing.merged_with(document)).await?;
            Ok(UpsertOutcome::Merged)
        }
    }
}
