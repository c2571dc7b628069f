mod debouncer;
mod error;
mod pool;

pub use debouncer::{CancelFlag, Debouncer};
pub use error::Error;
pub use pool::{ScheduledPool, TaskHandle};

pub type Result<T> = std::result::Result<T, error::Error>;
