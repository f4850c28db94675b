use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::config::{OverflowPolicy, QueueConfig};

/// Ordered buffer of notification payloads.
///
/// `push` is synchronous and safe to call from any thread, which makes it the
/// handoff point for callbacks running on the driver's delivery context.
/// `pop` is meant for a single async consumer.
#[derive(Clone)]
pub struct NotificationQueue {
    inner: Arc<Inner>,
}

struct Inner {
    items: Mutex<VecDeque<String>>,
    available: Notify,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    dropped: AtomicU64,
}

impl NotificationQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self::with_capacity(config.capacity, config.overflow)
    }

    /// A capacity of 0 means unbounded.
    pub fn with_capacity(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::new()),
                available: Notify::new(),
                capacity: (capacity > 0).then_some(capacity),
                overflow,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn unbounded() -> Self {
        Self::with_capacity(0, OverflowPolicy::default())
    }

    /// Append a payload. Returns false when the payload itself was discarded
    /// because the queue was full under [`OverflowPolicy::DropNewest`].
    pub fn push(&self, payload: impl Into<String>) -> bool {
        let payload = payload.into();
        let accepted = {
            let mut items = self.inner.items.lock();
            match self.inner.capacity {
                Some(capacity) if items.len() >= capacity => match self.inner.overflow {
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(payload);
                        self.record_drop(capacity);
                        true
                    }
                    OverflowPolicy::DropNewest => {
                        self.record_drop(capacity);
                        false
                    }
                },
                _ => {
                    items.push_back(payload);
                    true
                }
            }
        };

        if accepted {
            self.inner.available.notify_one();
        }
        accepted
    }

    /// Wait for the next payload.
    ///
    /// Cancel safe: dropping the future before it completes never loses a
    /// payload.
    pub async fn pop(&self) -> String {
        loop {
            let notified = self.inner.available.notified();
            if let Some(payload) = self.try_pop() {
                return payload;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<String> {
        self.inner.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of payloads discarded on overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self, capacity: usize) {
        let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            capacity,
            policy = ?self.inner.overflow,
            dropped_total = total,
            "Notification queue full, dropping payload"
        );
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}
