//! Pending request bookkeeping with per-request deadlines
//!
//! Each tracked request owns a timer task sleeping until its deadline.
//! Completing a request aborts the timer. A timer that fires removes its
//! entry and only then reports the timeout, and only if the entry it
//! removes is the one it was started for (re-tracking an id bumps the
//! generation), so a timeout is reported at most once and never after
//! `complete`.

use dapx_config::constants::DEFAULT_REQUEST_TIMEOUT_MS;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Invoked with `(request_id, command)` when a request times out
pub type TimeoutCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Snapshot of one pending request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: String,
    pub command: String,
    pub started_at: Instant,
    pub deadline: Instant,
}

struct TrackedEntry {
    request: PendingRequest,
    generation: u64,
    timer: JoinHandle<()>,
}

struct TrackerInner {
    pending: Mutex<HashMap<String, TrackedEntry>>,
    next_generation: AtomicU64,
    on_timeout: Option<TimeoutCallback>,
}

impl TrackerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks in-flight requests and expires them after a timeout.
///
/// Timers are Tokio tasks: `track` must be called from within a runtime.
pub struct RequestTracker {
    inner: Arc<TrackerInner>,
    default_timeout: Duration,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
    }
}

impl RequestTracker {
    pub fn new(default_timeout: Duration) -> Self {
        Self::build(default_timeout, None)
    }

    fn build(default_timeout: Duration, on_timeout: Option<TimeoutCallback>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                on_timeout,
            }),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a request; an existing entry with the same id is replaced.
    pub fn track(&self, request_id: &str, command: &str, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let started_at = Instant::now();
        let deadline = started_at + timeout;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        // Held across spawn so an already-due timer cannot look before the insert
        let mut pending = self.inner.lock();
        let timer = tokio::spawn(expire_at(
            Arc::downgrade(&self.inner),
            request_id.to_string(),
            generation,
            deadline,
        ));

        let entry = TrackedEntry {
            request: PendingRequest {
                request_id: request_id.to_string(),
                command: command.to_string(),
                started_at,
                deadline,
            },
            generation,
            timer,
        };

        let previous = pending.insert(request_id.to_string(), entry);
        drop(pending);
        if let Some(previous) = previous {
            previous.timer.abort();
            debug!(request_id, "Replaced pending request");
        }
    }

    /// Cancel the timer and forget the request.
    ///
    /// Returns `false` for unknown ids, including requests that already
    /// timed out.
    pub fn complete(&self, request_id: &str) -> bool {
        match self.inner.lock().remove(request_id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer and forget every request.
    pub fn clear(&self) {
        let drained: Vec<TrackedEntry> = self.inner.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.timer.abort();
        }
    }

    pub fn pending(&self) -> Vec<PendingRequest> {
        self.inner
            .lock()
            .values()
            .map(|e| e.request.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.inner.lock().contains_key(request_id)
    }

    /// Time since the request was tracked, `None` for unknown ids.
    pub fn elapsed(&self, request_id: &str) -> Option<Duration> {
        self.inner
            .lock()
            .get(request_id)
            .map(|e| e.request.started_at.elapsed())
    }

    /// [`elapsed`](Self::elapsed) in whole milliseconds.
    pub fn elapsed_ms(&self, request_id: &str) -> Option<u64> {
        self.elapsed(request_id)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        self.clear();
    }
}

async fn expire_at(inner: Weak<TrackerInner>, request_id: String, generation: u64, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;

    let Some(inner) = inner.upgrade() else {
        return;
    };

    let expired = {
        let mut pending = inner.lock();
        match pending.get(&request_id) {
            Some(entry) if entry.generation == generation => pending.remove(&request_id),
            _ => None,
        }
    };

    let Some(entry) = expired else {
        return;
    };

    warn!(
        request_id = %entry.request.request_id,
        command = %entry.request.command,
        "Request timed out"
    );
    if let Some(callback) = &inner.on_timeout {
        callback(&entry.request.request_id, &entry.request.command);
    }
}

/// [`RequestTracker`] that reports each timeout to a callback exactly once.
pub struct CallbackRequestTracker {
    tracker: RequestTracker,
}

impl CallbackRequestTracker {
    pub fn new<F>(on_timeout: F, default_timeout: Duration) -> Self
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        Self {
            tracker: RequestTracker::build(default_timeout, Some(Arc::new(on_timeout))),
        }
    }
}

impl Deref for CallbackRequestTracker {
    type Target = RequestTracker;

    fn deref(&self) -> &RequestTracker {
        &self.tracker
    }
}
