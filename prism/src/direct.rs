//! One-shot extraction for synchronous callers.
//!
//! Runs Stage1 and then Stage2 exactly once each. There is no retry, no
//! checkpoint and no document commit; any failure is returned to the caller.

use std::time::Duration;

use anyhow::Context;

use crate::item::{ImageRef, ImageSource};
use crate::stage::{ProductMetadata, Stage, Stage1Client, Stage2Client};

/// Extract product metadata from raw image bytes.
pub async fn extract_once(
    stage1: &dyn Stage1Client,
    stage2: &dyn Stage2Client,
    image: &[u8],
    timeout: Duration,
) -> anyhow::Result<ProductMetadata> {
    let layout = tokio::time::timeout(timeout, stage1.extract(image))
        .await
        .map_err(|_| anyhow::anyhow!("{} call timed out after {timeout:?}", Stage::Layout))?
        .with_context(|| format!("{} call failed", Stage::Layout))?;

    tracing::debug!(
        text_len = layout.text.len(),
        barcode = layout.barcode.is_some(),
        "layout extracted"
    );

    tokio::time::timeout(
        timeout,
        stage2.analyze(image, &layout.text, layout.barcode.as_deref()),
    )
    .await
    .map_err(|_| anyhow::anyhow!("{} call timed out after {timeout:?}", Stage::Vision))?
    .with_context(|| format!("{} call failed", Stage::Vision))
}

/// Resolve `image` through `source`, then run [`extract_once`].
pub async fn extract_from_source(
    source: &dyn ImageSource,
    stage1: &dyn Stage1Client,
    stage2: &dyn Stage2Client,
    image: &ImageRef,
    timeout: Duration,
) -> anyhow::Result<ProductMetadata> {
    let bytes = tokio::time::timeout(timeout, source.fetch(image))
        .await
        .map_err(|_| anyhow::anyhow!("fetching {image} timed out after {timeout:?}"))?
        .with_context(|| format!("failed to fetch {image}"))?;
    extract_once(stage1, stage2, &bytes, timeout).await
}
