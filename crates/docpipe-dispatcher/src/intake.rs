//! Bounded intake queue.
//!
//! The only backpressure point between producers and the rest of the system.
//! Producers block in `offer` up to their timeout; the enqueuer drains items
//! one at a time. A `Completed` sentinel marks end-of-producer and is
//! processed in arrival order behind any pending tuples.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use docpipe_core::models::FetchEmitTuple;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeItem {
    Tuple(FetchEmitTuple),
    /// End-of-producer sentinel; the enqueuer propagates it downstream.
    Completed,
}

struct Inner {
    items: VecDeque<IntakeItem>,
    closed: bool,
}

pub struct IntakeQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    /// Signalled when a slot frees up.
    space: Notify,
    /// Signalled when an item arrives.
    arrival: Notify,
}

impl IntakeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            space: Notify::new(),
            arrival: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit one tuple, blocking cooperatively up to `timeout`. Returns false
    /// on timeout or once the queue is closed.
    pub async fn offer(&self, tuple: FetchEmitTuple, timeout: Duration) -> bool {
        self.offer_batch(vec![tuple], timeout).await
    }

    /// Admit a batch all-or-nothing: succeeds only when the remaining
    /// capacity fits the whole batch. An empty batch is trivially admitted.
    pub async fn offer_batch(&self, tuples: Vec<FetchEmitTuple>, timeout: Duration) -> bool {
        if tuples.is_empty() {
            return true;
        }
        if tuples.len() > self.capacity {
            return false;
        }

        let deadline = Instant::now() + timeout;
        let mut tuples = Some(tuples);
        loop {
            // Arm before checking so a slot freed in between is not missed.
            let space = self.space.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return false;
                }
                let batch = tuples.as_ref().map(Vec::len).unwrap_or(0);
                if inner.items.len() + batch <= self.capacity {
                    for tuple in tuples.take().into_iter().flatten() {
                        inner.items.push_back(IntakeItem::Tuple(tuple));
                        self.arrival.notify_one();
                    }
                    return true;
                }
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, space).await;
        }
    }

    /// Push the end-of-producer sentinel and refuse further offers. The
    /// sentinel ignores capacity so close never blocks on a full queue.
    pub fn complete(&self) {
        let mut inner = self.lock();
        if !inner.closed {
            inner.closed = true;
            inner.items.push_back(IntakeItem::Completed);
            self.arrival.notify_one();
            // Wake blocked producers so they observe the closed flag instead
            // of waiting out their timeout.
            self.space.notify_waiters();
        }
    }

    /// Take the next item, waiting up to `timeout`.
    pub async fn poll(&self, timeout: Duration) -> Option<IntakeItem> {
        let deadline = Instant::now() + timeout;
        loop {
            let arrival = self.arrival.notified();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    self.space.notify_one();
                    return Some(item);
                }
            }

            let remaining = deadline.checked_duration_since(Instant::now())?;
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining, arrival).await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
