use async_trait::async_trait;
use parking_lot::Mutex;
use prism::*;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One scripted response of a mock stage client.
#[derive(Clone, Debug)]
pub enum Step<T> {
    Succeed(T),
    Fail(String),
    /// Never answer; exercises the call timeout.
    Stall,
}

struct Script<T> {
    steps: VecDeque<Step<T>>,
    fallback: Step<T>,
}

/// Stage client answering from a script.
///
/// Queued steps are consumed in order; once they run out every call gets the
/// fallback step.
#[derive(Clone)]
pub struct ScriptedClient<T> {
    script: Arc<Mutex<Script<T>>>,
    calls: Arc<AtomicUsize>,
    hints: Arc<Mutex<Vec<HintRecord>>>,
}

/// Hints a Stage2 call received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HintRecord {
    pub text: String,
    pub barcode: Option<String>,
}

pub type ScriptedStage1 = ScriptedClient<LayoutExtraction>;
pub type ScriptedStage2 = ScriptedClient<ProductMetadata>;

impl<T: Clone + Send + 'static> ScriptedClient<T> {
    pub fn new(fallback: Step<T>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                steps: VecDeque::new(),
                fallback,
            })),
            calls: Arc::new(AtomicUsize::new(0)),
            hints: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Always succeed with `value`.
    pub fn always(value: T) -> Self {
        Self::new(Step::Succeed(value))
    }

    /// Always fail with `error`.
    pub fn always_failing(error: impl Into<String>) -> Self {
        Self::new(Step::Fail(error.into()))
    }

    /// Fail `times` calls, then succeed with `value` from then on.
    pub fn failing_then(times: usize, value: T) -> Self {
        let client = Self::always(value);
        for i in 0..times {
            client.push_step(Step::Fail(format!("transient failure {}", i + 1)));
        }
        client
    }

    pub fn push_step(&self, step: Step<T>) {
        self.script.lock().steps.push_back(step);
    }

    /// Replace the fallback step; queued steps are kept.
    pub fn set_fallback(&self, step: Step<T>) {
        self.script.lock().fallback = step;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn hints(&self) -> Vec<HintRecord> {
        self.hints.lock().clone()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        assert_eq!(
            self.calls(),
            expected,
            "Expected {} calls, got {}",
            expected,
            self.calls()
        );
    }

    async fn answer(&self) -> anyhow::Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = self.script.lock();
            script
                .steps
                .pop_front()
                .unwrap_or_else(|| script.fallback.clone())
        };

        match step {
            Step::Succeed(value) => Ok(value),
            Step::Fail(error) => Err(anyhow::anyhow!(error)),
            Step::Stall => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Stage1Client for ScriptedClient<LayoutExtraction> {
    async fn extract(&self, _image: &[u8]) -> anyhow::Result<LayoutExtraction> {
        self.answer().await
    }
}

#[async_trait]
impl Stage2Client for ScriptedClient<ProductMetadata> {
    async fn analyze(
        &self,
        _image: &[u8],
        text_hint: &str,
        barcode_hint: Option<&str>,
    ) -> anyhow::Result<ProductMetadata> {
        self.hints.lock().push(HintRecord {
            text: text_hint.to_string(),
            barcode: barcode_hint.map(str::to_string),
        });
        self.answer().await
    }
}

/// Image source that serves the reference string itself as image bytes.
#[derive(Clone, Default)]
pub struct StaticImageSource {
    missing: Arc<Mutex<HashSet<String>>>,
    fetches: Arc<AtomicUsize>,
}

impl StaticImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make fetches of `image_ref` fail.
    pub fn set_missing(&self, image_ref: impl Into<String>) {
        self.missing.lock().insert(image_ref.into());
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageSource for StaticImageSource {
    async fn fetch(&self, image: &ImageRef) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.missing.lock().contains(image.as_str()) {
            anyhow::bail!("blob not found: {image}");
        }
        Ok(image.as_str().as_bytes().to_vec())
    }
}
