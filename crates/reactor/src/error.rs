use thiserror::Error;

/// Errors raised by registration and loop-driving calls.
///
/// Expected runtime conditions (end-of-stream, inactivity timeouts,
/// `WouldBlock`) are never errors; they are delivered to the watcher's
/// handler slots instead.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("watcher is already bound to an event loop")]
    AlreadyBound,
    #[error("watcher has been freed and cannot be registered")]
    Freed,
    #[error("polling backend failure: {0}")]
    Io(#[from] std::io::Error),
}
