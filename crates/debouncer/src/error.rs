/// Debounce and scheduling related errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The pool was closed and accepts no new tasks. Work that was already
    /// queued at close time is unaffected.
    #[error("scheduler is closed")]
    Closed,

    /// The awaited task was cancelled before it ever started running.
    #[error("task was cancelled before it started")]
    Cancelled,

    /// The awaited task panicked while running.
    #[error("task panicked: {0}")]
    Panicked(String),
}
