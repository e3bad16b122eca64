#![forbid(unsafe_code)]
//! Single-threaded readiness reactor for already-open byte streams.
//!
//! One [`EventLoop`] multiplexes readiness notifications (readable,
//! writable, timed out, end-of-stream, error) across registered
//! [`BufferedStream`] watchers and dispatches each to user-supplied
//! handler slots without ever blocking inside a handler.
//!
//! The crate does not open or close streams. Callers hand in a handle
//! that is already open and already non-blocking; the reactor only
//! registers it with the OS poller (via `mio`), fills and drains the
//! watcher's internal buffers, and invokes handlers. Handlers operate
//! strictly against buffered data: a handler that wants more bytes than
//! are buffered returns and waits for the next notification.
//!
//! Everything here is single-threaded. Watchers are shared between the
//! caller and the loop as `Rc<RefCell<_>>`; there are no `Send` bounds
//! and no locks. Stopping the loop from inside a handler goes through
//! the explicitly cloned [`LoopCtl`] handle.
//!
//! Unix only: registration is raw-fd based.

mod buffered;
mod error;
mod event_loop;
mod watcher;

pub use buffered::{BufferedStream, HandlerSet, ReadOnly, StreamHandle, StreamIo};
pub use error::ReactorError;
pub use event_loop::{EventLoop, LoopCtl, RunMode, RunOutcome};
pub use watcher::{Direction, Ops, StreamWatcher};
