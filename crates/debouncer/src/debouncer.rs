use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::pool::{ScheduledPool, TaskHandle};
use crate::Result;

/// Counter behind the default `debounce{N}` worker thread names, shared by
/// every debouncer-owned pool in the process.
static THREAD_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Cancellation flag handed to a submitted action.
///
/// The flag reads the cancel state of the submission it was created for,
/// never whatever the debouncer currently holds as pending, so a running
/// action can notice that a newer submission superseded it and cut its work
/// short. Until the submission is registered the flag reads false.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    own: Arc<OnceCell<TaskHandle>>,
}

impl CancelFlag {
    /// True once the action this flag belongs to has been superseded or
    /// otherwise cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.own.get().map(TaskHandle::is_cancelled).unwrap_or(false)
    }
}

/// Collapses bursts of submissions so only the latest action runs.
///
/// A debouncer holds at most one pending action. Submitting a new one
/// cancels whatever is pending first: a queued predecessor never starts, a
/// running one keeps running with its [`CancelFlag`] raised. The debouncer
/// itself takes `&mut self` for submissions; multiple threads share one by
/// putting it behind their own lock.
pub struct Debouncer {
    delay: Duration,
    pool: Arc<ScheduledPool>,
    pending: Option<TaskHandle>,
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("delay", &self.delay)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Debouncer {
    /// Creates a debouncer with the specified delay and its own
    /// single-worker pool, with the worker named `debounce{N}`.
    pub fn new(delay: Duration) -> Self {
        let pool = ScheduledPool::with_thread_names(1, |_| {
            format!("debounce{}", THREAD_COUNT.fetch_add(1, Ordering::Relaxed))
        });
        Self::with_pool(delay, Arc::new(pool))
    }

    /// Creates a debouncer on a caller-supplied pool.
    ///
    /// Several debouncers can share one pool; each keeps its own pending
    /// slot and they never cancel each other's actions. [`shutdown`] closes
    /// the shared pool for all of them.
    ///
    /// [`shutdown`]: Self::shutdown
    pub fn with_pool(delay: Duration, pool: Arc<ScheduledPool>) -> Self {
        Self {
            delay,
            pool,
            pending: None,
        }
    }

    /// Cancels the pending action and submits `action` to run right away.
    pub fn submit_immediately<F>(&mut self, action: F) -> Result<()>
    where
        F: FnOnce(CancelFlag) + Send + 'static,
    {
        trace!("debounce submitting immediately");
        self.replace_pending(None, action)
    }

    /// Cancels the pending action and schedules `action` to run after the
    /// debouncer's delay.
    ///
    /// Each call restarts the quiet period: a burst of calls spaced closer
    /// than the delay runs only the last action, one delay after the last
    /// call.
    pub fn schedule<F>(&mut self, action: F) -> Result<()>
    where
        F: FnOnce(CancelFlag) + Send + 'static,
    {
        trace!("debounce scheduling after {:?}", self.delay);
        self.replace_pending(Some(self.delay), action)
    }

    fn replace_pending<F>(&mut self, delay: Option<Duration>, action: F) -> Result<()>
    where
        F: FnOnce(CancelFlag) + Send + 'static,
    {
        // Cancel strictly before submitting so the slot can never hold a
        // stale handle that outranks the newer action.
        if let Some(prev) = &self.pending {
            prev.cancel();
        }

        let own = Arc::new(OnceCell::new());
        let flag = CancelFlag { own: own.clone() };
        let handle = match delay {
            Some(delay) => self.pool.schedule_after(delay, move || action(flag))?,
            None => self.pool.submit(move || action(flag))?,
        };

        // Fill the flag's cell only once the pool accepted the task; an
        // action that starts before this reads "not cancelled", which is
        // right because nothing else can reach its handle yet.
        let _ = own.set(handle.clone());
        self.pending = Some(handle);
        Ok(())
    }

    /// Blocks until the pending action reaches a terminal state.
    ///
    /// Returns immediately when nothing is pending. Completion of the action
    /// body reports `Ok(())` even if the action was cancelled mid-run;
    /// an action cancelled before it ever started reports
    /// [`Error::Cancelled`](crate::Error::Cancelled) and a panicking one
    /// [`Error::Panicked`](crate::Error::Panicked).
    pub fn wait_for_pending_task(&self) -> Result<()> {
        match &self.pending {
            Some(handle) => handle.wait(),
            None => Ok(()),
        }
    }

    /// Closes the underlying pool; no further submissions are accepted.
    ///
    /// Work that is already queued still runs. With `await_termination` the
    /// call blocks until the queue has drained and every worker has exited.
    pub fn shutdown(&self, await_termination: bool) {
        debug!("debouncer shutdown, await_termination={await_termination}");
        if await_termination {
            self.pool.close_and_await(Duration::MAX);
        } else {
            self.pool.close();
        }
    }
}
