//! RPC correlation and cancellation.
//!
//! One [`CorrelationTable`] per connection tracks in-flight requests by
//! their client-chosen correlation id. The hard rule is **one terminal per
//! correlation**: exactly one `reply` or `error` frame may reach the wire,
//! enforced by a single compare-and-set on [`RpcEntry::try_terminal`]. An
//! abort competes through the same CAS — whichever side wins, the other
//! becomes a silent no-op. Progress frames check the flag without setting
//! it and may be emitted zero or more times before the terminal, never
//! after.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

/// Cancellation signal handed to RPC handlers.
///
/// Fires on client `$ws:abort` or on disconnect. Cheap to clone; all clones
/// observe the same state.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

struct AbortInner {
    aborted: AtomicBool,
    notify: Notify,
    // FnOnce callbacks registered via on_abort, drained exactly once
    callbacks: StdMutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl AbortSignal {
    /// A fresh, unfired signal. Useful as the `signal` option of the
    /// send family.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AbortInner {
                aborted: AtomicBool::new(false),
                notify: Notify::new(),
                callbacks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Whether the signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Resolve once the signal fires; immediately if it already has.
    pub async fn aborted(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Run `f` when the signal fires; immediately if it already has.
    pub fn on_abort(&self, f: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.is_aborted() {
                Some(f)
            } else {
                callbacks.push(Box::new(f));
                None
            }
        };
        if let Some(f) = run_now {
            f();
        }
    }

    /// Fire the signal. Idempotent: callbacks run once, ever.
    pub fn abort(&self) {
        if self
            .inner
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let callbacks = {
            let mut guard = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            core::mem::take(&mut *guard)
        };
        for cb in callbacks {
            cb();
        }
        self.inner.notify.notify_waiters();
    }
}

impl core::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// One in-flight RPC on a connection.
#[derive(Debug)]
pub struct RpcEntry {
    correlation_id: String,
    terminal_sent: AtomicBool,
    abort: AbortSignal,
    created_at: Instant,
    // instant of the last progress frame that made it out, for throttling
    progress_last: StdMutex<Option<Instant>>,
}

impl RpcEntry {
    fn new(correlation_id: String) -> Self {
        Self {
            correlation_id,
            terminal_sent: AtomicBool::new(false),
            abort: AbortSignal::new(),
            created_at: Instant::now(),
            progress_last: StdMutex::new(None),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Claim the one terminal slot. The first caller wins; everyone else
    /// gets `false` and must not emit a frame.
    pub(crate) fn try_terminal(&self) -> bool {
        self.terminal_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn terminal_sent(&self) -> bool {
        self.terminal_sent.load(Ordering::Acquire)
    }

    /// Whether a progress frame may go out now, honoring an optional
    /// throttle window. Calls inside the window are dropped.
    pub(crate) fn progress_gate(&self, throttle: Option<Duration>) -> bool {
        if self.terminal_sent() {
            return false;
        }
        let mut last = self
            .progress_last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let (Some(window), Some(prev)) = (throttle, *last) {
            if prev.elapsed() < window {
                return false;
            }
        }
        *last = Some(Instant::now());
        true
    }

    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Why an inbound RPC request could not be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdmitError {
    /// The correlation id is already in flight on this connection.
    Duplicate,
    /// The connection is at its in-flight limit.
    PendingLimit,
}

/// Per-connection table of in-flight RPCs.
pub(crate) struct CorrelationTable {
    entries: StdMutex<HashMap<String, Arc<RpcEntry>>>,
    max_pending: usize,
}

impl CorrelationTable {
    pub(crate) fn new(max_pending: usize) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            max_pending,
        }
    }

    /// Admit a new request. Correlation ids are unique per in-flight
    /// window; reuse after the terminal is fine.
    pub(crate) fn admit(&self, correlation_id: &str) -> Result<Arc<RpcEntry>, AdmitError> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.contains_key(correlation_id) {
            return Err(AdmitError::Duplicate);
        }
        if entries.len() >= self.max_pending {
            return Err(AdmitError::PendingLimit);
        }
        let entry = Arc::new(RpcEntry::new(correlation_id.to_owned()));
        entries.insert(correlation_id.to_owned(), entry.clone());
        Ok(entry)
    }

    pub(crate) fn get(&self, correlation_id: &str) -> Option<Arc<RpcEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(correlation_id)
            .cloned()
    }

    pub(crate) fn remove(&self, correlation_id: &str) -> Option<Arc<RpcEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(correlation_id)
    }

    /// Abort everything in flight. Used on disconnect.
    pub(crate) fn abort_all(&self) {
        let entries = {
            let mut guard = self
                .entries
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            core::mem::take(&mut *guard)
        };
        for (_, entry) in entries {
            // claim the terminal so any racing reply becomes a no-op
            entry.try_terminal();
            debug!(
                correlation_id = entry.correlation_id(),
                age_ms = entry.age().as_millis() as u64,
                "aborting in-flight rpc on disconnect"
            );
            entry.abort.abort();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
