use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::buffered::BufferedStream;
use crate::error::ReactorError;
use crate::watcher::{Direction, StreamWatcher};

/// How a `run` call drives dispatch.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum RunMode {
    /// Block and dispatch until the loop is stopped or no armed
    /// watchers remain.
    #[default]
    UntilIdle,
    /// Wait for one readiness batch (or the nearest deadline),
    /// dispatch it, and return.
    Once,
    /// Dispatch whatever is ready right now; return `NoEvents` instead
    /// of blocking when nothing is.
    NonBlocking,
}

/// Outcome of a `run` call. Backend failures come back as `Err`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RunOutcome {
    /// The loop stopped, drained, or ran out of armed watchers.
    Completed,
    /// Nothing was ready (`NonBlocking`, or nothing registered).
    NoEvents,
}

#[derive(Default)]
struct CtlState {
    running: bool,
    stop_now: bool,
    drain_requested: bool,
    drain_at: Option<Instant>,
}

/// Cloneable stop handle, safe to capture in watcher handlers.
///
/// Handlers never see the loop itself, so stopping from inside a
/// callback goes through this handle instead.
#[derive(Clone)]
pub struct LoopCtl {
    state: Rc<RefCell<CtlState>>,
}

impl LoopCtl {
    /// Aborts the loop after the in-flight callback returns, discarding
    /// any callbacks still pending in the current batch. Returns
    /// whether a running loop was actually interrupted.
    pub fn stop_immediately(&self) -> bool {
        let mut state = self.state.borrow_mut();
        state.stop_now = true;
        state.running
    }

    /// Asks the loop to exit once currently-pending callbacks finish.
    /// With a delay, dispatch continues until the delay elapses; no new
    /// readiness batch starts after the drain point is reached.
    pub fn stop_when_drained(&self, after: Option<Duration>) {
        let mut state = self.state.borrow_mut();
        state.drain_requested = true;
        state.drain_at = Some(match after {
            Some(delay) => Instant::now() + delay,
            None => Instant::now(),
        });
    }
}

/// The closed set of watcher kinds the loop tracks.
enum Registered {
    Stream(Rc<RefCell<BufferedStream>>),
}

struct Fired {
    band: u8,
    key: usize,
    readable: bool,
    writable: bool,
}

/// The dispatch loop: owns the polling context and every registration
/// made against it.
///
/// Single-threaded by construction. All handlers run on the thread
/// driving [`run`](EventLoop::run), one at a time, to completion; the
/// loop suspends only inside the poll wait, never inside a handler.
/// On drop, every tracked watcher is freed before the polling context
/// is released.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    watchers: Slab<Registered>,
    bands: Option<u8>,
    ctl: Rc<RefCell<CtlState>>,
}

impl EventLoop {
    pub fn new() -> Result<Self, ReactorError> {
        Self::with_priority_bands(None)
    }

    /// Like `new`, but partitions dispatch priority into `bands`
    /// discrete bands. Band 0 dispatches first within a readiness
    /// batch; watchers without an explicit priority land in the middle
    /// band.
    pub fn with_priority_bands(bands: Option<u8>) -> Result<Self, ReactorError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            watchers: Slab::new(),
            bands,
            ctl: Rc::new(RefCell::new(CtlState::default())),
        })
    }

    /// A stop handle usable from inside watcher handlers.
    pub fn ctl(&self) -> LoopCtl {
        LoopCtl {
            state: Rc::clone(&self.ctl),
        }
    }

    /// See [`LoopCtl::stop_immediately`].
    pub fn stop_immediately(&self) -> bool {
        self.ctl().stop_immediately()
    }

    /// See [`LoopCtl::stop_when_drained`].
    pub fn stop_when_drained(&self, after: Option<Duration>) {
        self.ctl().stop_when_drained(after)
    }

    /// Binds a watcher to this loop, enables it, and tracks it for
    /// owned teardown. Fails with `AlreadyBound` if the watcher is
    /// bound to any loop and `Freed` if it was already freed.
    pub fn register(&mut self, watcher: &Rc<RefCell<BufferedStream>>) -> Result<(), ReactorError> {
        let token = {
            let mut stream = watcher.borrow_mut();
            if stream.is_freed() {
                return Err(ReactorError::Freed);
            }
            if stream.is_bound() {
                return Err(ReactorError::AlreadyBound);
            }
            let entry = self.watchers.vacant_entry();
            let token = Token(entry.key());
            stream.bind(token, self.bands);
            entry.insert(Registered::Stream(Rc::clone(watcher)));
            debug!(token = token.0, fd = stream.io().raw_fd(), "registered stream watcher");
            token
        };
        self.sync_one(token.0);
        Ok(())
    }

    /// Drives dispatch. See [`RunMode`] for the three behaviors.
    pub fn run(&mut self, mode: RunMode) -> Result<RunOutcome, ReactorError> {
        self.ctl.borrow_mut().running = true;
        let outcome = self.run_inner(mode);
        // stop requests only ever apply to one run
        let mut ctl = self.ctl.borrow_mut();
        ctl.running = false;
        ctl.stop_now = false;
        ctl.drain_requested = false;
        ctl.drain_at = None;
        drop(ctl);
        outcome
    }

    fn run_inner(&mut self, mode: RunMode) -> Result<RunOutcome, ReactorError> {
        loop {
            self.sync_all();
            if !self.has_armed_watchers() {
                return Ok(match mode {
                    RunMode::UntilIdle => RunOutcome::Completed,
                    _ => RunOutcome::NoEvents,
                });
            }
            if self.should_exit(Instant::now()) {
                return Ok(RunOutcome::Completed);
            }

            let timeout = self.poll_timeout(mode);
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ReactorError::Io(err)),
            }

            let now = Instant::now();
            let expired = self.collect_expired(now);
            let fired = self.collect_batch();
            if fired.is_empty() && expired.is_empty() {
                if mode == RunMode::NonBlocking {
                    return Ok(RunOutcome::NoEvents);
                }
                continue;
            }
            trace!(
                ready = fired.len(),
                timers = expired.len(),
                "dispatching readiness batch"
            );
            self.dispatch(&expired, &fired);

            match mode {
                RunMode::Once | RunMode::NonBlocking => return Ok(RunOutcome::Completed),
                RunMode::UntilIdle => {
                    if self.should_exit(Instant::now()) {
                        return Ok(RunOutcome::Completed);
                    }
                }
            }
        }
    }

    fn should_exit(&self, now: Instant) -> bool {
        let ctl = self.ctl.borrow();
        if ctl.stop_now {
            return true;
        }
        ctl.drain_requested && ctl.drain_at.is_some_and(|at| at <= now)
    }

    fn poll_timeout(&self, mode: RunMode) -> Option<Duration> {
        if mode == RunMode::NonBlocking {
            return Some(Duration::ZERO);
        }
        let mut next = self.next_deadline();
        if let Some(drain_at) = self.ctl.borrow().drain_at {
            next = Some(next.map_or(drain_at, |d| d.min(drain_at)));
        }
        next.map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.watchers
            .iter()
            .filter_map(|(_, Registered::Stream(stream))| stream.borrow().io().next_deadline())
            .min()
    }

    fn has_armed_watchers(&self) -> bool {
        self.watchers
            .iter()
            .any(|(_, Registered::Stream(stream))| stream.borrow().is_armed())
    }

    fn collect_expired(&self, now: Instant) -> Vec<(u8, usize, Direction)> {
        let mut expired = Vec::new();
        for (key, Registered::Stream(stream)) in self.watchers.iter() {
            let stream = stream.borrow();
            if let Some(which) = stream.io().expired_direction(now) {
                expired.push((stream.priority_band(self.bands), key, which));
            }
        }
        expired.sort_by_key(|(band, _, _)| *band);
        expired
    }

    fn collect_batch(&self) -> Vec<Fired> {
        let mut fired = Vec::new();
        for event in self.events.iter() {
            let key = event.token().0;
            let Some(Registered::Stream(stream)) = self.watchers.get(key) else {
                continue;
            };
            fired.push(Fired {
                band: stream.borrow().priority_band(self.bands),
                key,
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable(),
            });
        }
        // stable sort: arrival order is preserved within a band
        fired.sort_by_key(|f| f.band);
        fired
    }

    fn dispatch(&mut self, expired: &[(u8, usize, Direction)], fired: &[Fired]) {
        for (_, key, which) in expired {
            if self.ctl.borrow().stop_now {
                return;
            }
            if let Some(Registered::Stream(stream)) = self.watchers.get(*key) {
                let stream = Rc::clone(stream);
                stream.borrow_mut().dispatch_timeout(*which);
            }
        }
        for event in fired {
            if self.ctl.borrow().stop_now {
                return;
            }
            let Some(Registered::Stream(stream)) = self.watchers.get(event.key) else {
                continue;
            };
            let stream = Rc::clone(stream);
            let mut stream = stream.borrow_mut();
            if event.readable {
                stream.dispatch_readable();
            }
            if event.writable {
                stream.dispatch_writable();
            }
        }
    }

    /// Reconciles a watcher's `mio` registration with the interest it
    /// currently wants, and drops freed watchers from the slab.
    fn sync_one(&mut self, key: usize) {
        let stream = match self.watchers.get(key) {
            Some(Registered::Stream(stream)) => Rc::clone(stream),
            None => return,
        };
        let mut stream = stream.borrow_mut();
        let freed = stream.is_freed();
        if stream.io().is_dirty() || freed {
            let io = stream.io_mut();
            let fd = io.raw_fd();
            let desired = io.desired_interest();
            let current = io.registered_interest();
            let mut source = SourceFd(&fd);
            let registry = self.poll.registry();
            let result = match (current, desired) {
                (None, None) => Ok(()),
                (None, Some(want)) => registry.register(&mut source, Token(key), want),
                (Some(_), None) => registry.deregister(&mut source),
                (Some(have), Some(want)) if have == want => Ok(()),
                (Some(_), Some(want)) => registry.reregister(&mut source, Token(key), want),
            };
            match result {
                Ok(()) => io.set_registered_interest(desired),
                Err(err) => warn!(fd, error = %err, "failed to update poll registration"),
            }
            io.clear_dirty();
        }
        drop(stream);
        if freed {
            let _ = self.watchers.try_remove(key);
        }
    }

    fn sync_all(&mut self) {
        let keys: Vec<usize> = self.watchers.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.sync_one(key);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // every watcher is freed before the polling context goes away
        for (_, Registered::Stream(stream)) in self.watchers.iter() {
            let Ok(mut stream) = stream.try_borrow_mut() else {
                continue;
            };
            stream.free();
            let fd = stream.io().raw_fd();
            if stream.io().registered_interest().is_some() {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                stream.io_mut().set_registered_interest(None);
            }
        }
        self.watchers.clear();
    }
}
