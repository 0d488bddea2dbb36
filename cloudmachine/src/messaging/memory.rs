use super::{BusMessage, MessageBus};
use crate::common::{CloudMachineError, CloudMachineResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Process-local queues with receive-and-delete semantics.
pub struct InMemoryMessageBus {
    queues: Mutex<HashMap<String, VecDeque<BusMessage>>>,
    arrivals: Arc<Notify>,
    send_calls: AtomicUsize,
    close_count: AtomicUsize,
    closed: AtomicBool,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            arrivals: Arc::new(Notify::new()),
            send_calls: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Messages waiting in `queue`.
    pub fn pending(&self, queue: &str) -> usize {
        self.lock().get(queue).map_or(0, VecDeque::len)
    }

    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<BusMessage>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take(&self, queue: &str, max_count: u32) -> Vec<BusMessage> {
        let mut queues = self.lock();
        let Some(pending) = queues.get_mut(queue) else {
            return Vec::new();
        };
        let count = pending.len().min(max_count as usize);
        pending.drain(..count).collect()
    }

    fn ensure_open(&self) -> CloudMachineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CloudMachineError::Closed);
        }
        Ok(())
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn send(&self, queue: &str, messages: Vec<BusMessage>) -> CloudMachineResult<()> {
        self.ensure_open()?;
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .entry(queue.to_string())
            .or_default()
            .extend(messages);
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_count: u32,
        max_wait: Duration,
    ) -> CloudMachineResult<Vec<BusMessage>> {
        self.ensure_open()?;
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            // registered before checking so a send in between is not missed
            let arrival = self.arrivals.notified();
            let received = self.take(queue, max_count);
            if !received.is_empty() {
                return Ok(received);
            }
            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return Ok(Vec::new());
            }
            self.ensure_open()?;
        }
    }

    async fn close(&self) -> CloudMachineResult<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::Release);
        self.arrivals.notify_waiters();
        Ok(())
    }
}
