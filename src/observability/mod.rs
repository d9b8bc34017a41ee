pub mod logger;
pub mod progress;

pub use logger::{init_logging, LogGuard};
pub use progress::{ProgressHub, ProgressSink, TaskPhase, TaskUpdate, TerminalProgress};
