//! Rate-limited, de-duplicating work queue.
//!
//! Per key: *Unqueued → Queued → Processing → (Done → Unqueued | Failed →
//! Queued after backoff)*. A key enqueued while already queued coalesces
//! with the pending entry; a key enqueued while processing is marked dirty
//! and re-queued once the worker reports back, so the latest state is always
//! processed and never processed twice at once.

use crate::backoff::ExponentialBackoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys waiting to be processed (queued, or re-queue pending after processing)
    dirty: HashSet<String>,
    processing: HashSet<String>,
    /// Consecutive failures per key
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

#[derive(Debug)]
struct Inner {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    backoff: ExponentialBackoff,
    token: CancellationToken,
}

/// Work queue for one (kind, operation)
#[derive(Debug, Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Creates a queue cancelled together with `token`.
    pub fn new(name: &str, backoff: ExponentialBackoff, token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                backoff,
                token,
            }),
        }
    }

    /// Queue name, used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `key` unless it is already pending.
    pub fn enqueue(&self, key: &str) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds `key` once `delay` has elapsed, unless the queue shuts down first.
    pub fn enqueue_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.enqueue(key);
            return;
        }
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => queue.enqueue(&key),
                () = queue.inner.token.cancelled() => {}
            }
        });
    }

    /// Waits for the next key; `None` once the queue is shut down.
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            tokio::select! {
                () = &mut notified => {}
                () = self.inner.token.cancelled() => return None,
            }
        }
    }

    /// Reports success: clears the failure count and re-queues a dirty key.
    pub fn mark_done(&self, key: &str) {
        let mut state = self.state();
        state.processing.remove(key);
        state.failures.remove(key);
        self.requeue_if_dirty(state, key);
    }

    /// Reports failure: re-queues `key` after its backoff delay.
    ///
    /// Returns the delay applied.
    pub fn mark_failed(&self, key: &str) -> Duration {
        let mut state = self.state();
        state.processing.remove(key);
        let failures = state.failures.entry(key.to_string()).or_insert(0);
        let delay = self.inner.backoff.delay_for(*failures);
        *failures = failures.saturating_add(1);
        if state.shutting_down {
            return delay;
        }
        self.requeue_if_dirty(state, key);
        debug!("Queue {} retrying {} in {:?}", self.inner.name, key, delay);
        self.enqueue_after(key, delay);
        delay
    }

    fn requeue_if_dirty(&self, mut state: MutexGuard<'_, State>, key: &str) {
        if state.shutting_down || !state.dirty.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Consecutive failures recorded for `key`.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be popped.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    /// True when no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the queue and wakes every blocked `pop` with `None`.
    ///
    /// Keys being processed are abandoned; their `mark_*` calls are ignored.
    pub fn shutdown(&self) {
        {
            let mut state = self.state();
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        self.inner.token.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Whether `shutdown` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down || self.inner.token.is_cancelled()
    }
}

#[cfg(test)]
#[path = "workqueue_test.rs"]
mod workqueue_test;
