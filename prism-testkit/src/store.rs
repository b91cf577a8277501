use async_trait::async_trait;
use parking_lot::Mutex;
use prism::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory checkpoint store with call counters and failure switches.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    records: Arc<Mutex<HashMap<CheckpointId, CheckpointRecord>>>,
    create_calls: Arc<AtomicUsize>,
    read_calls: Arc<AtomicUsize>,
    fail_creates: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    failing_reads: Arc<AtomicUsize>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record without going through `create`.
    pub fn insert(&self, record: CheckpointRecord) {
        self.records.lock().insert(record.id.clone(), record);
    }

    pub fn remove(&self, id: &CheckpointId) -> Option<CheckpointRecord> {
        self.records.lock().remove(id)
    }

    pub fn get(&self, id: &CheckpointId) -> Option<CheckpointRecord> {
        self.records.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make the next `n` reads fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn create(&self, record: &CheckpointRecord) -> anyhow::Result<CreateOutcome> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            anyhow::bail!("checkpoint store unavailable");
        }

        let mut records = self.records.lock();
        if records.contains_key(&record.id) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        records.insert(record.id.clone(), record.clone());
        Ok(CreateOutcome::Created)
    }

    async fn read(&self, id: &CheckpointId) -> anyhow::Result<Option<CheckpointRecord>> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let scheduled = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scheduled || self.fail_reads.load(Ordering::SeqCst) {
            anyhow::bail!("checkpoint store unavailable");
        }
        Ok(self.records.lock().get(id).cloned())
    }
}

/// In-memory result store.
///
/// Every operation is atomic under one lock, which serializes writers per key.
/// `fail_next` makes the next `n` operations fail.
#[derive(Clone, Default)]
pub struct InMemoryResultStore {
    documents: Arc<Mutex<HashMap<String, ResultDocument>>>,
    pending_failures: Arc<AtomicUsize>,
    create_calls: Arc<AtomicUsize>,
    replace_calls: Arc<AtomicUsize>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document without going through `create`.
    pub fn insert(&self, document: ResultDocument) {
        self.documents
            .lock()
            .insert(document.id().to_string(), document);
    }

    pub fn get(&self, id: &str) -> Option<ResultDocument> {
        self.documents.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }

    pub fn fail_next(&self, n: usize) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn replace_calls(&self) -> usize {
        self.replace_calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> anyhow::Result<()> {
        let consumed = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            anyhow::bail!("result store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn create(&self, document: &ResultDocument) -> anyhow::Result<CreateOutcome> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;

        let mut documents = self.documents.lock();
        if documents.contains_key(document.id()) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        documents.insert(document.id().to_string(), document.clone());
        Ok(CreateOutcome::Created)
    }

    async fn read(&self, id: &str) -> anyhow::Result<Option<ResultDocument>> {
        self.maybe_fail()?;
        Ok(self.documents.lock().get(id).cloned())
    }

    async fn replace(&self, document: &ResultDocument) -> anyhow::Result<()> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;

        let mut documents = self.documents.lock();
        let Some(slot) = documents.get_mut(document.id()) else {
            anyhow::bail!("document {} does not exist", document.id());
        };
        *slot = document.clone();
        Ok(())
    }
}
