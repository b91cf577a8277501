use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sentinel a Stage2 response uses for fields it could not read from the image.
pub const NOT_AVAILABLE: &str = "n/a";

/// Pipeline step a failure is attributed to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Stage1: layout, text and barcode extraction.
    Layout,
    /// Stage2: vision extraction of product metadata.
    Vision,
    /// Idempotent upsert of the final document.
    Commit,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Layout => "layout",
            Stage::Vision => "vision",
            Stage::Commit => "commit",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of the layout extraction service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutExtraction {
    /// Structured text found in the image.
    pub text: String,
    /// Value of the first barcode found, if any.
    pub barcode: Option<String>,
}

impl LayoutExtraction {
    pub fn new(text: impl Into<String>, barcode: Option<String>) -> Self {
        Self {
            text: text.into(),
            barcode,
        }
    }
}

fn not_available() -> String {
    NOT_AVAILABLE.to_string()
}

/// Structured product metadata returned by the vision extraction service.
///
/// Textual fields default to [`NOT_AVAILABLE`] rather than being omitted, so a
/// partial response still deserializes into a complete record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductMetadata {
    #[serde(default = "not_available")]
    pub brand: String,
    #[serde(default = "not_available")]
    pub product_name: String,
    #[serde(default = "not_available")]
    pub price: String,
    #[serde(default = "not_available")]
    pub price_per_unit: String,
    #[serde(default = "not_available")]
    pub expiration_date: String,
    #[serde(default = "not_available")]
    pub article_number: String,
    #[serde(default)]
    pub bar_code_available: bool,
    #[serde(default = "not_available")]
    pub bar_code_numbers: String,
}

impl Default for ProductMetadata {
    fn default() -> Self {
        Self {
            brand: not_available(),
            product_name: not_available(),
            price: not_available(),
            price_per_unit: not_available(),
            expiration_date: not_available(),
            article_number: not_available(),
            bar_code_available: false,
            bar_code_numbers: not_available(),
        }
    }
}

impl ProductMetadata {
    /// Serialize into a JSON object, rendering every [`NOT_AVAILABLE`]
    /// sentinel as `null`.
    pub fn to_nullable_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(fields) = &mut value {
            for field in fields.values_mut() {
                if field.as_str() == Some(NOT_AVAILABLE) {
                    *field = serde_json::Value::Null;
                }
            }
        }
        value
    }
}

/// Client for the layout/text/barcode extraction service (Stage1).
///
/// Every failure is treated as transient by the pipeline.
#[async_trait]
pub trait Stage1Client: Send + Sync {
    /// Extract text and an optional barcode from raw image bytes.
    async fn extract(&self, image: &[u8]) -> anyhow::Result<LayoutExtraction>;
}

/// Client for the vision extraction service (Stage2).
#[async_trait]
pub trait Stage2Client: Send + Sync {
    /// Extract product metadata from the image using Stage1 output as hints.
    async fn analyze(
        &self,
        image: &[u8],
        text_hint: &str,
        barcode_hint: Option<&str>,
    ) -> anyhow::Result<ProductMetadata>;
}
