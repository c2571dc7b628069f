//! A small pool of named worker threads draining one shared delay queue.
//!
//! Tasks are submitted for immediate execution or deferred by a delay and
//! can be cancelled on a best-effort basis any time before a worker picks
//! them up. Closing the pool stops intake but lets already-queued work run
//! to completion.

use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::error::Error;
use crate::Result;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Stand-in horizon for due times past what `Instant` can represent.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskState {
    /// Queued, no worker has picked it up yet.
    Scheduled,
    /// A worker is executing the body.
    Running,
    /// The body returned normally.
    Completed,
    /// The body panicked; the payload message is kept for waiters.
    Panicked(String),
    /// Cancelled before any worker picked it up. The body never runs.
    Cancelled,
}

impl TaskState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Panicked(_) | TaskState::Cancelled
        )
    }
}

#[derive(Debug)]
struct TaskInner {
    state: Mutex<TaskState>,
    /// Signalled on every transition into a terminal state.
    done: Condvar,
    /// Set by any cancel that lands before the task finished, including
    /// while the body is still running.
    cancel_requested: AtomicBool,
}

impl TaskInner {
    fn new() -> Self {
        Self {
            state: Mutex::new(TaskState::Scheduled),
            done: Condvar::new(),
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Scheduled -> Running. False when the task was cancelled first.
    fn begin(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == TaskState::Scheduled {
            *state = TaskState::Running;
            true
        } else {
            false
        }
    }

    fn complete(&self) {
        self.terminate(TaskState::Completed);
    }

    fn fail(&self, message: String) {
        self.terminate(TaskState::Panicked(message));
    }

    fn terminate(&self, terminal: TaskState) {
        let mut state = self.state.lock().unwrap();
        *state = terminal;
        drop(state);
        self.done.notify_all();
    }

    fn cancel(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            TaskState::Scheduled => {
                self.cancel_requested.store(true, Ordering::Release);
                *state = TaskState::Cancelled;
                drop(state);
                self.done.notify_all();
                true
            }
            TaskState::Running => {
                // The body keeps running; only the flag flips.
                self.cancel_requested.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    fn is_finished(&self) -> bool {
        self.state.lock().unwrap().is_terminal()
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                TaskState::Completed => return Ok(()),
                TaskState::Panicked(message) => return Err(Error::Panicked(message.clone())),
                TaskState::Cancelled => return Err(Error::Cancelled),
                TaskState::Scheduled | TaskState::Running => {
                    state = self.done.wait(state).unwrap();
                }
            }
        }
    }
}

struct QueuedTask {
    due: Instant,
    seq: u64,
    job: Job,
    task: Arc<TaskInner>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap pops the greatest element, so compare reversed: the
    // earliest due time wins, submission order breaks ties.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState {
    queue: BinaryHeap<QueuedTask>,
    closed: bool,
    live_workers: usize,
    next_seq: u64,
}

struct PoolInner {
    state: Mutex<PoolState>,
    /// Wakes workers: new entry queued, a queued entry cancelled, or closing.
    work: Condvar,
    /// Wakes `close_and_await` when the last worker exits.
    drained: Condvar,
}

/// Handle to one scheduled unit of work.
///
/// Handles are cheap clones over the task's shared state; every clone
/// observes the same task. A handle never controls a running body beyond
/// the advisory cancel flag.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    task: Arc<TaskInner>,
    pool: Weak<PoolInner>,
}

impl TaskHandle {
    /// Requests cancellation without interrupting a body that already runs.
    ///
    /// Returns true when the request landed before the task finished: the
    /// task either never starts (it was still queued) or keeps running with
    /// [`is_cancelled`](Self::is_cancelled) now reading true. Returns false
    /// when the task had already completed, panicked or been cancelled.
    pub fn cancel(&self) -> bool {
        let flipped = self.task.cancel();
        if flipped {
            trace!("cancel requested");
            // Wake sleeping workers so a cancelled entry at the head of the
            // queue is dropped right away instead of at its due time.
            if let Some(pool) = self.pool.upgrade() {
                pool.work.notify_all();
            }
        }
        flipped
    }

    /// Blocks until the task reaches a terminal state.
    ///
    /// Returns `Ok(())` when the body ran to completion, even if it was
    /// cancelled while running. Errors with [`Error::Cancelled`] when the
    /// task never started and [`Error::Panicked`] when the body panicked.
    pub fn wait(&self) -> Result<()> {
        self.task.wait()
    }

    /// True once [`cancel`](Self::cancel) landed before the task finished.
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// True once the task completed, panicked or was cancelled before start.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// A fixed-size worker pool executing immediate and delayed tasks.
pub struct ScheduledPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ScheduledPool {
    /// Creates a pool with `workers` threads named `sched0`, `sched1`, ...
    ///
    /// The worker count is clamped to at least one.
    pub fn new(workers: usize) -> Self {
        Self::with_thread_names(workers, |i| format!("sched{i}"))
    }

    /// Creates a pool whose worker threads are named by `name`.
    ///
    /// The name only shows up in logs and debuggers; it has no effect on
    /// scheduling.
    pub fn with_thread_names<F>(workers: usize, name: F) -> Self
    where
        F: Fn(usize) -> String,
    {
        let workers = workers.max(1);

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queue: BinaryHeap::new(),
                closed: false,
                live_workers: workers,
                next_seq: 0,
            }),
            work: Condvar::new(),
            drained: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let worker_inner = inner.clone();
            let handle = thread::Builder::new()
                .name(name(i))
                .spawn(move || worker_loop(&worker_inner))
                .expect("failed to spawn scheduler worker");
            handles.push(handle);
        }

        Self {
            inner,
            workers: Mutex::new(handles),
        }
    }

    /// Submits `f` to run as soon as a worker is free.
    pub fn submit<F>(&self, f: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        trace!("submitting immediate task");
        self.enqueue(Instant::now(), Box::new(f))
    }

    /// Submits `f` to run once `delay` has elapsed.
    ///
    /// The delay is a lower bound; a pool with every worker busy runs the
    /// task as soon as one frees up. A delay too large for the clock is
    /// clamped to a horizon decades out and in practice never comes due.
    pub fn schedule_after<F>(&self, delay: Duration, f: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        trace!("scheduling task after {delay:?}");
        let now = Instant::now();
        let due = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);
        self.enqueue(due, Box::new(f))
    }

    fn enqueue(&self, due: Instant, job: Job) -> Result<TaskHandle> {
        let task = Arc::new(TaskInner::new());
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(QueuedTask {
            due,
            seq,
            job,
            task: task.clone(),
        });
        drop(state);
        // One new entry needs at most one extra worker awake.
        self.inner.work.notify_one();

        Ok(TaskHandle {
            task,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Stops intake of new tasks. Idempotent.
    ///
    /// Everything queued before the close, delayed entries included, still
    /// runs; workers exit once the queue is empty. Further `submit` and
    /// `schedule_after` calls fail with [`Error::Closed`].
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        let queued = state.queue.len();
        drop(state);
        self.inner.work.notify_all();
        debug!("scheduler closed with {queued} queued tasks");
    }

    /// Closes the pool and waits for the queue to drain and all workers to
    /// exit, giving up after `timeout`.
    ///
    /// Returns true when the pool fully terminated, false on timeout. A
    /// timeout large enough to overflow the clock (`Duration::MAX`) waits
    /// indefinitely.
    pub fn close_and_await(&self, timeout: Duration) -> bool {
        self.close();

        // None means no reachable deadline, wait forever.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock().unwrap();
        while state.live_workers > 0 {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .inner
                        .drained
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
                None => {
                    state = self.inner.drained.wait(state).unwrap();
                }
            }
        }
        drop(state);

        // All workers have exited their loops; reap the join handles.
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        true
    }

    /// True once [`close`](Self::close) or [`close_and_await`](Self::close_and_await)
    /// has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }
}

impl Drop for ScheduledPool {
    fn drop(&mut self) {
        // Workers drain the remaining queue and exit on their own; they
        // stay detached unless close_and_await already reaped them.
        self.close();
    }
}

enum HeadState {
    /// Head entry was cancelled while queued, drop it without running.
    Discard,
    /// Head entry is due, run it.
    Due,
    /// Head entry is not due yet, sleep until then.
    Sleep(Instant),
    /// Queue is empty, wait for work.
    Idle,
    /// Queue is empty and the pool is closed.
    Exit,
}

fn worker_loop(inner: &PoolInner) {
    let mut state = inner.state.lock().unwrap();
    loop {
        let now = Instant::now();
        let head = match state.queue.peek() {
            Some(head) if head.task.is_cancelled() => HeadState::Discard,
            Some(head) if head.due <= now => HeadState::Due,
            Some(head) => HeadState::Sleep(head.due),
            None if state.closed => HeadState::Exit,
            None => HeadState::Idle,
        };

        match head {
            HeadState::Discard => {
                let entry = state.queue.pop();
                drop(state);
                // Dropping the entry drops its job closure, which can run
                // arbitrary user code; never do that under the pool lock.
                drop(entry);
                trace!("dropped cancelled task before start");
                state = inner.state.lock().unwrap();
            }
            HeadState::Due => {
                let Some(entry) = state.queue.pop() else {
                    continue;
                };
                drop(state);
                // Cancel may land between the peek and the pop; begin
                // re-checks under the task's own lock.
                if entry.task.begin() {
                    let QueuedTask { job, task, .. } = entry;
                    run_job(job, &task);
                } else {
                    drop(entry);
                    trace!("dropped cancelled task before start");
                }
                state = inner.state.lock().unwrap();
            }
            HeadState::Sleep(due) => {
                let timeout = due.saturating_duration_since(Instant::now());
                let (guard, _) = inner.work.wait_timeout(state, timeout).unwrap();
                state = guard;
            }
            HeadState::Idle => {
                state = inner.work.wait(state).unwrap();
            }
            HeadState::Exit => break,
        }
    }

    state.live_workers -= 1;
    if state.live_workers == 0 {
        inner.drained.notify_all();
    }
    drop(state);
    trace!("scheduler worker exiting");
}

fn run_job(job: Job, task: &TaskInner) {
    trace!("running task");
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(()) => task.complete(),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("scheduled task panicked: {message}");
            task.fail(message);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
