/// Which stream directions a watcher monitors once enabled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Ops {
    Read,
    Write,
    ReadWrite,
}

impl Ops {
    pub fn reads(self) -> bool {
        matches!(self, Ops::Read | Ops::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Ops::Write | Ops::ReadWrite)
    }
}

/// Direction reported by timeout notifications.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// Capability shared by every registration unit an [`EventLoop`] tracks.
///
/// A watcher binds to exactly one loop; rebinding fails with
/// [`ReactorError::AlreadyBound`]. `free` releases the watch
/// registration and must be idempotent, because teardown order between
/// the owning loop and the caller is not strictly controlled.
///
/// [`EventLoop`]: crate::EventLoop
/// [`ReactorError::AlreadyBound`]: crate::ReactorError::AlreadyBound
pub trait StreamWatcher {
    /// Whether the watcher has been registered with a loop.
    fn is_bound(&self) -> bool;

    /// Whether `free` has already run.
    fn is_freed(&self) -> bool;

    /// Releases the watch registration. Calling this twice is a no-op.
    /// The underlying stream handle is not closed.
    fn free(&mut self);
}
