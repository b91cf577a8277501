use async_trait::async_trait;
use parking_lot::Mutex;
use prism::*;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory at-least-once queue.
///
/// Requeued items go back to the ready list immediately; requested delays are
/// recorded but not honoured. Abandoned deliveries are redelivered with an
/// incremented delivery count.
#[derive(Clone, Default)]
pub struct InMemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
    fail_writes: Arc<AtomicBool>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(WorkItem, u32)>,
    inflight: HashMap<DeliveryId, (WorkItem, u32)>,
    requeued: Vec<RequeueRecord>,
    dead_letters: Vec<DeadLetterRecord>,
    completed: usize,
    abandoned: usize,
}

#[derive(Clone, Debug)]
pub struct RequeueRecord {
    pub item: WorkItem,
    pub delay: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct DeadLetterRecord {
    pub item: WorkItem,
    pub reason: Option<String>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an item as an upstream producer would.
    pub fn push(&self, item: WorkItem) {
        self.state.lock().ready.push_back((item, 0));
    }

    /// Make `requeue` and `dead_letter` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.state.lock().inflight.len()
    }

    /// True when nothing is ready and nothing is being processed.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.ready.is_empty() && state.inflight.is_empty()
    }

    pub fn requeued(&self) -> Vec<RequeueRecord> {
        self.state.lock().requeued.clone()
    }

    /// The envelope of the most recent requeue, as the next delivery would
    /// see it.
    pub fn last_requeued(&self) -> Option<WorkItem> {
        self.state.lock().requeued.last().map(|r| r.item.clone())
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.state.lock().dead_letters.clone()
    }

    pub fn completed_count(&self) -> usize {
        self.state.lock().completed
    }

    pub fn abandoned_count(&self) -> usize {
        self.state.lock().abandoned
    }

    /// Number of durable writes (requeues plus dead-letters) made so far.
    pub fn write_count(&self) -> usize {
        let state = self.state.lock();
        state.requeued.len() + state.dead_letters.len()
    }

    fn check_writable(&self) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("queue unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn receive(&self) -> anyhow::Result<Option<Delivery>> {
        let mut state = self.state.lock();
        let Some((item, count)) = state.ready.pop_front() else {
            return Ok(None);
        };

        let delivery = Delivery {
            id: DeliveryId::new(),
            item: item.clone(),
            delivery_count: count + 1,
        };
        state.inflight.insert(delivery.id, (item, count + 1));
        Ok(Some(delivery))
    }

    async fn complete(&self, delivery: DeliveryId) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.inflight.remove(&delivery).is_none() {
            anyhow::bail!("Delivery not found: {}", delivery);
        }
        state.completed += 1;
        Ok(())
    }

    async fn abandon(&self, delivery: DeliveryId, error: Option<String>) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let Some(entry) = state.inflight.remove(&delivery) else {
            anyhow::bail!("Delivery not found: {}", delivery);
        };
        if let Some(err) = error {
            tracing::warn!("Delivery abandoned: {}", err);
        }
        state.ready.push_back(entry);
        state.abandoned += 1;
        Ok(())
    }

    async fn requeue(&self, item: &WorkItem, delay: Option<Duration>) -> anyhow::Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        state.requeued.push(RequeueRecord {
            item: item.clone(),
            delay,
        });
        state.ready.push_back((item.clone(), 0));
        Ok(())
    }

    async fn dead_letter(&self, item: &WorkItem, reason: Option<String>) -> anyhow::Result<()> {
        self.check_writable()?;
        self.state.lock().dead_letters.push(DeadLetterRecord {
            item: item.clone(),
            reason,
        });
        Ok(())
    }
}
