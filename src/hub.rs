use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::types::ProgressEvent;

/// Buffer of each subscriber channel.
pub const DEFAULT_CAPACITY: usize = 64;

type Payload = Arc<str>;

/// Best-effort broadcaster of run progress.
///
/// Each subscriber owns a bounded channel. Publishing never waits: a
/// subscriber whose buffer is full misses that event.
#[derive(Clone, Debug)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

#[derive(Debug)]
struct HubInner {
    capacity: usize,
    next_id: AtomicU64,
    subs: Mutex<HashMap<u64, mpsc::Sender<Payload>>>,
}

impl HubInner {
    fn remove(&self, id: u64) -> bool {
        self.subs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .is_some()
    }
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Payload>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.guard.id
    }

    /// Next serialized [`ProgressEvent`], or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    /// Hand the receiving half to a stream adapter; the subscription stays
    /// registered until the returned guard is dropped.
    pub fn into_parts(self) -> (mpsc::Receiver<Payload>, SubscriptionGuard) {
        (self.rx, self.guard)
    }
}

/// Keeps a subscription registered while alive.
#[derive(Debug)]
pub struct SubscriptionGuard {
    id: u64,
    hub: Weak<HubInner>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                subs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tx);
        Subscription {
            rx,
            guard: SubscriptionGuard {
                id,
                hub: Arc::downgrade(&self.inner),
            },
        }
    }

    /// Remove a subscriber and close its channel. Returns whether it existed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Serialize once and offer the event to every subscriber without waiting.
    pub fn publish(&self, event: &ProgressEvent) {
        let payload: Payload = match serde_json::to_string(event) {
            Ok(s) => s.into(),
            Err(e) => {
                tracing::warn!("failed to serialize progress event: {e}");
                return;
            }
        };
        tracing::debug!(percent = event.percent, message = %event.message, "progress");
        let mut subs = self.lock();
        subs.retain(|_, tx| match tx.try_send(payload.clone()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn emit(&self, percent: u8, message: impl Into<String>) {
        self.publish(&ProgressEvent::new(percent, message));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, mpsc::Sender<Payload>>> {
        self.inner.subs.lock().unwrap_or_else(|p| p.into_inner())
    }
}
