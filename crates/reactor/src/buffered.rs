use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use mio::{Interest, Token};
use tracing::{debug, warn};

use crate::watcher::{Direction, Ops, StreamWatcher};

/// Bytes pulled from the OS per fill iteration.
const FILL_CHUNK_BYTES: usize = 4096;

/// An already-open byte stream the reactor can watch.
///
/// The handle must be open and non-blocking before it is handed to a
/// [`BufferedStream`]; the reactor never opens, closes, or duplicates
/// it. Anything `Read + Write + AsRawFd` qualifies (sockets, pipes).
/// Read-only handles are adapted with [`ReadOnly`].
pub trait StreamHandle: Read + Write + AsRawFd {}

impl<T: Read + Write + AsRawFd> StreamHandle for T {}

/// Adapter that gives a read-only handle (pipe read end, child stdout)
/// a `Write` impl that always fails with `ErrorKind::Unsupported`.
pub struct ReadOnly<T>(pub T);

impl<T: Read> Read for ReadOnly<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<T> Write for ReadOnly<T> {
    fn write(&mut self, _data: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream is read-only",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: AsRawFd> AsRawFd for ReadOnly<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// The state half of a [`BufferedStream`], handed to handler slots.
///
/// Handlers receive `&mut StreamIo` rather than the whole watcher so
/// that a handler can never re-enter its own handler slots or the
/// loop's dispatch while it runs.
pub struct StreamIo {
    stream: Option<Box<dyn StreamHandle>>,
    raw_fd: RawFd,
    ops: Ops,
    token: Option<Token>,
    enabled: bool,
    freed: bool,
    eof: bool,
    priority: u8,
    priority_explicit: bool,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    read_low_watermark: usize,
    in_buf: VecDeque<u8>,
    out_buf: VecDeque<u8>,
    out_limit: Option<usize>,
    registered: Option<Interest>,
    dirty: bool,
}

impl StreamIo {
    fn new(stream: Box<dyn StreamHandle>, ops: Ops) -> Self {
        let raw_fd = stream.as_raw_fd();
        Self {
            stream: Some(stream),
            raw_fd,
            ops,
            token: None,
            enabled: false,
            freed: false,
            eof: false,
            priority: 0,
            priority_explicit: false,
            read_timeout: None,
            write_timeout: None,
            read_deadline: None,
            write_deadline: None,
            read_low_watermark: 0,
            in_buf: VecDeque::new(),
            out_buf: VecDeque::new(),
            out_limit: None,
            registered: None,
            dirty: false,
        }
    }

    /// Drains up to `max` bytes from the input buffer. Returns fewer
    /// bytes if less is buffered and an empty vec if nothing is; an
    /// empty result is not an error.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.in_buf.len());
        self.in_buf.drain(..n).collect()
    }

    /// Enqueues bytes for asynchronous draining to the stream.
    ///
    /// Returns `false` when the watcher is freed, was not created with
    /// write operations, or an output cap set via [`set_output_limit`]
    /// would be exceeded. Without a cap the output buffer is unbounded
    /// and `write` always accepts.
    ///
    /// [`set_output_limit`]: StreamIo::set_output_limit
    pub fn write(&mut self, data: &[u8]) -> bool {
        if self.freed || !self.ops.writes() {
            return false;
        }
        if let Some(limit) = self.out_limit {
            if self.out_buf.len() + data.len() > limit {
                return false;
            }
        }
        self.out_buf.extend(data);
        if self.enabled {
            self.arm_write_deadline(Instant::now());
        }
        self.dirty = true;
        true
    }

    /// Sets independent read/write inactivity timeouts. `write` of
    /// `None` reuses the read timeout. Elapsing either disarms the
    /// watch and fires `on_timeout` with the direction that elapsed.
    pub fn set_timeout(&mut self, read: Duration, write: Option<Duration>) {
        self.read_timeout = Some(read);
        self.write_timeout = Some(write.unwrap_or(read));
        if self.enabled {
            self.arm_deadlines(Instant::now());
        }
    }

    /// Removes both inactivity timeouts.
    pub fn clear_timeout(&mut self) {
        self.read_timeout = None;
        self.write_timeout = None;
        self.read_deadline = None;
        self.write_deadline = None;
    }

    /// Suppresses `on_read` until at least `bytes` are buffered.
    pub fn set_read_low_watermark(&mut self, bytes: usize) {
        self.read_low_watermark = bytes;
    }

    /// Caps the output buffer; `write` rejects data that would push the
    /// buffer past the cap. `None` removes the cap.
    pub fn set_output_limit(&mut self, limit: Option<usize>) {
        self.out_limit = limit;
    }

    /// Sets the dispatch priority band. Band 0 dispatches first; values
    /// past the loop's configured band count are clamped at dispatch.
    /// Watchers that never call this default to the middle band.
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
        self.priority_explicit = true;
    }

    /// Re-arms the watch after a timeout or an explicit `disable`.
    pub fn enable(&mut self) {
        if self.freed {
            return;
        }
        self.enabled = true;
        self.arm_deadlines(Instant::now());
        self.dirty = true;
    }

    /// Stops monitoring without releasing the registration.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.read_deadline = None;
        self.write_deadline = None;
        self.dirty = true;
    }

    pub fn buffered(&self) -> usize {
        self.in_buf.len()
    }

    pub fn pending_output(&self) -> usize {
        self.out_buf.len()
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn raw_fd(&self) -> RawFd {
        self.raw_fd
    }

    fn arm_read_deadline(&mut self, now: Instant) {
        self.read_deadline = match self.read_timeout {
            Some(t) if self.ops.reads() && !self.eof => Some(now + t),
            _ => None,
        };
    }

    fn arm_write_deadline(&mut self, now: Instant) {
        self.write_deadline = match self.write_timeout {
            Some(t) if self.ops.writes() && !self.out_buf.is_empty() => Some(now + t),
            _ => None,
        };
    }

    fn arm_deadlines(&mut self, now: Instant) {
        self.arm_read_deadline(now);
        self.arm_write_deadline(now);
    }

    pub(crate) fn bind(&mut self, token: Token, bands: Option<u8>) {
        self.token = Some(token);
        if let Some(bands) = bands {
            if !self.priority_explicit {
                // libevent default: the middle band
                self.priority = bands / 2;
            }
        }
        // a buffered stream is always-active: binding enables it
        self.enabled = true;
        self.arm_deadlines(Instant::now());
        self.dirty = true;
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.freed
    }

    pub(crate) fn free_registration(&mut self) {
        self.freed = true;
        self.enabled = false;
        self.read_deadline = None;
        self.write_deadline = None;
        self.dirty = true;
    }

    /// The interest this watcher wants from the poller right now.
    /// Writable interest is held only while output is pending, so an
    /// idle write-enabled stream does not spin the loop.
    pub(crate) fn desired_interest(&self) -> Option<Interest> {
        if self.freed || !self.enabled {
            return None;
        }
        let mut interest = None;
        if self.ops.reads() && !self.eof {
            interest = Some(Interest::READABLE);
        }
        if self.ops.writes() && !self.out_buf.is_empty() {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        interest
    }

    pub(crate) fn registered_interest(&self) -> Option<Interest> {
        self.registered
    }

    pub(crate) fn set_registered_interest(&mut self, interest: Option<Interest>) {
        self.registered = interest;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match (self.read_deadline, self.write_deadline) {
            (Some(r), Some(w)) => Some(r.min(w)),
            (r, w) => r.or(w),
        }
    }

    pub(crate) fn expired_direction(&self, now: Instant) -> Option<Direction> {
        if self.freed || !self.enabled {
            return None;
        }
        if matches!(self.read_deadline, Some(at) if at <= now) {
            return Some(Direction::Read);
        }
        if matches!(self.write_deadline, Some(at) if at <= now) {
            return Some(Direction::Write);
        }
        None
    }

    /// Reads from the stream into the input buffer until `WouldBlock`.
    /// Returns the byte count delivered and whether end-of-stream was
    /// observed.
    fn fill_input(&mut self) -> io::Result<(usize, bool)> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok((0, false));
        };
        let mut chunk = [0u8; FILL_CHUNK_BYTES];
        let mut total = 0;
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok((total, true)),
                Ok(n) => {
                    self.in_buf.extend(&chunk[..n]);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok((total, false)),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Writes buffered output to the stream until `WouldBlock` or the
    /// buffer empties. Returns the byte count drained.
    fn drain_output(&mut self) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        let mut total = 0;
        while !self.out_buf.is_empty() {
            let (front, _) = self.out_buf.as_slices();
            match stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.out_buf.drain(..n);
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }
}

/// Optional notification slots invoked by the loop. Absence of a
/// handler drops the condition, except end-of-stream and fatal errors,
/// which are logged so they stay observable.
#[derive(Default)]
pub struct HandlerSet {
    pub on_read: Option<Box<dyn FnMut(&mut StreamIo)>>,
    pub on_write: Option<Box<dyn FnMut(&mut StreamIo)>>,
    pub on_error: Option<Box<dyn FnMut(&mut StreamIo, io::Error)>>,
    pub on_eof: Option<Box<dyn FnMut(&mut StreamIo)>>,
    pub on_timeout: Option<Box<dyn FnMut(&mut StreamIo, Direction)>>,
}

/// A stream watcher with internal read/write accumulation buffers.
///
/// The loop fills the input buffer and drains the output buffer
/// against the non-blocking handle; handlers only ever touch the
/// buffers through [`StreamIo`]. Created detached; registering it with
/// an [`EventLoop`](crate::EventLoop) binds and enables it in one step.
pub struct BufferedStream {
    io: StreamIo,
    pub handlers: HandlerSet,
}

impl BufferedStream {
    /// Wraps an already-open, non-blocking stream. `ops` selects which
    /// of read/write readiness is monitored once registered.
    pub fn new<S: StreamHandle + 'static>(stream: S, ops: Ops) -> Self {
        Self {
            io: StreamIo::new(Box::new(stream), ops),
            handlers: HandlerSet::default(),
        }
    }

    pub fn io_mut(&mut self) -> &mut StreamIo {
        &mut self.io
    }

    pub fn read(&mut self, max: usize) -> Vec<u8> {
        self.io.read(max)
    }

    pub fn write(&mut self, data: &[u8]) -> bool {
        self.io.write(data)
    }

    pub fn set_timeout(&mut self, read: Duration, write: Option<Duration>) {
        self.io.set_timeout(read, write)
    }

    pub fn set_read_low_watermark(&mut self, bytes: usize) {
        self.io.set_read_low_watermark(bytes)
    }

    pub fn set_output_limit(&mut self, limit: Option<usize>) {
        self.io.set_output_limit(limit)
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.io.set_priority(priority)
    }

    pub fn buffered(&self) -> usize {
        self.io.buffered()
    }

    pub fn pending_output(&self) -> usize {
        self.io.pending_output()
    }

    pub fn is_eof(&self) -> bool {
        self.io.is_eof()
    }

    pub fn is_enabled(&self) -> bool {
        self.io.is_enabled()
    }

    /// Reclaims the stream handle after `free()`. Returns `None` while
    /// the watcher is still live or the handle was already taken.
    pub fn take_stream(&mut self) -> Option<Box<dyn StreamHandle>> {
        if self.io.freed {
            self.io.stream.take()
        } else {
            None
        }
    }

    pub(crate) fn io(&self) -> &StreamIo {
        &self.io
    }

    pub(crate) fn bind(&mut self, token: Token, bands: Option<u8>) {
        self.io.bind(token, bands);
    }

    pub(crate) fn priority_band(&self, bands: Option<u8>) -> u8 {
        match bands {
            Some(b) if b > 0 => self.io.priority.min(b - 1),
            _ => self.io.priority,
        }
    }

    /// Whether the watcher still wants poller attention.
    pub(crate) fn is_armed(&self) -> bool {
        self.io.desired_interest().is_some() || self.io.next_deadline().is_some()
    }

    pub(crate) fn dispatch_readable(&mut self) {
        let Self { io, handlers } = self;
        if io.freed || !io.enabled || io.eof {
            return;
        }
        match io.fill_input() {
            Ok((delivered, saw_eof)) => {
                if delivered > 0 {
                    io.arm_read_deadline(Instant::now());
                    Self::run_read_handler(io, handlers);
                }
                if saw_eof {
                    io.eof = true;
                    io.read_deadline = None;
                    io.dirty = true;
                    match handlers.on_eof.as_mut() {
                        Some(cb) => cb(io),
                        None => debug!(
                            fd = io.raw_fd,
                            buffered = io.in_buf.len(),
                            "end of stream with no handler installed"
                        ),
                    }
                }
            }
            Err(err) => Self::run_error_handler(io, handlers, err),
        }
    }

    /// Invokes `on_read` while the buffer sits at or above the
    /// watermark and the handler keeps consuming, so a flush threshold
    /// crossed mid-buffer triggers before this dispatch returns.
    fn run_read_handler(io: &mut StreamIo, handlers: &mut HandlerSet) {
        loop {
            let len = io.in_buf.len();
            if len == 0 || len < io.read_low_watermark {
                return;
            }
            let Some(cb) = handlers.on_read.as_mut() else {
                return;
            };
            cb(io);
            if io.in_buf.len() >= len {
                // handler made no progress; wait for the next notification
                return;
            }
        }
    }

    pub(crate) fn dispatch_writable(&mut self) {
        let Self { io, handlers } = self;
        if io.freed || !io.enabled || io.out_buf.is_empty() {
            return;
        }
        match io.drain_output() {
            Ok(drained) => {
                if drained > 0 {
                    io.dirty = true;
                    io.arm_write_deadline(Instant::now());
                }
                if io.out_buf.is_empty() {
                    io.write_deadline = None;
                    if let Some(cb) = handlers.on_write.as_mut() {
                        cb(io);
                    }
                }
            }
            Err(err) => Self::run_error_handler(io, handlers, err),
        }
    }

    /// A timeout disarms the watch before the handler runs; handlers
    /// that treat it as a mere trigger re-arm with `enable()`.
    pub(crate) fn dispatch_timeout(&mut self, which: Direction) {
        let Self { io, handlers } = self;
        if io.freed || !io.enabled {
            return;
        }
        io.enabled = false;
        io.read_deadline = None;
        io.write_deadline = None;
        io.dirty = true;
        match handlers.on_timeout.as_mut() {
            Some(cb) => cb(io, which),
            None => debug!(fd = io.raw_fd, ?which, "timeout with no handler installed"),
        }
    }

    fn run_error_handler(io: &mut StreamIo, handlers: &mut HandlerSet, err: io::Error) {
        io.enabled = false;
        io.dirty = true;
        match handlers.on_error.as_mut() {
            Some(cb) => cb(io, err),
            None => warn!(fd = io.raw_fd, error = %err, "stream error with no handler installed"),
        }
    }
}

impl StreamWatcher for BufferedStream {
    fn is_bound(&self) -> bool {
        self.io.token.is_some()
    }

    fn is_freed(&self) -> bool {
        self.io.freed
    }

    fn free(&mut self) {
        if self.io.freed {
            return;
        }
        self.io.free_registration();
        // releasing the handler slots drops any captured state
        self.handlers = HandlerSet::default();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    use super::*;

    fn read_watcher() -> (UnixStream, BufferedStream) {
        let (tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        let mut bs = BufferedStream::new(rx, Ops::Read);
        bs.io_mut().enable();
        (tx, bs)
    }

    #[test]
    fn fill_then_read_drains_partially() {
        let (mut tx, mut bs) = read_watcher();
        tx.write_all(b"hello").unwrap();
        bs.dispatch_readable();
        assert_eq!(bs.buffered(), 5);
        assert_eq!(bs.io_mut().read(3), b"hel".to_vec());
        assert_eq!(bs.buffered(), 2);
        assert_eq!(bs.io_mut().read(10), b"lo".to_vec());
        assert!(bs.io_mut().read(10).is_empty());
    }

    #[test]
    fn read_handler_runs_until_buffer_consumed() {
        let (mut tx, mut bs) = read_watcher();
        let calls = Rc::new(RefCell::new(0usize));
        let seen = Rc::clone(&calls);
        bs.handlers.on_read = Some(Box::new(move |io| {
            *seen.borrow_mut() += 1;
            io.read(2);
        }));
        tx.write_all(b"abcdef").unwrap();
        bs.dispatch_readable();
        assert_eq!(*calls.borrow(), 3);
        assert_eq!(bs.buffered(), 0);
    }

    #[test]
    fn watermark_suppresses_read_handler() {
        let (mut tx, mut bs) = read_watcher();
        bs.set_read_low_watermark(4);
        let calls = Rc::new(RefCell::new(0usize));
        let seen = Rc::clone(&calls);
        bs.handlers.on_read = Some(Box::new(move |io| {
            *seen.borrow_mut() += 1;
            let buffered = io.buffered();
            io.read(buffered);
        }));
        tx.write_all(b"abc").unwrap();
        bs.dispatch_readable();
        assert_eq!(*calls.borrow(), 0);
        tx.write_all(b"de").unwrap();
        bs.dispatch_readable();
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn eof_fires_once_and_suppresses_further_reads() {
        let (mut tx, mut bs) = read_watcher();
        let eofs = Rc::new(RefCell::new(0usize));
        let seen = Rc::clone(&eofs);
        bs.handlers.on_eof = Some(Box::new(move |_| {
            *seen.borrow_mut() += 1;
        }));
        tx.write_all(b"tail").unwrap();
        drop(tx);
        bs.dispatch_readable();
        assert!(bs.is_eof());
        assert_eq!(*eofs.borrow(), 1);
        // a spurious notification after EOF must not re-fire anything
        bs.dispatch_readable();
        assert_eq!(*eofs.borrow(), 1);
    }

    #[test]
    fn write_rejected_for_read_only_ops() {
        let (_tx, mut bs) = read_watcher();
        assert!(!bs.write(b"nope"));
    }

    #[test]
    fn write_respects_output_limit() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        rx.set_nonblocking(true).unwrap();
        let mut bs = BufferedStream::new(rx, Ops::Write);
        bs.set_output_limit(Some(4));
        assert!(bs.write(b"abc"));
        assert!(!bs.write(b"de"));
        assert!(bs.write(b"d"));
        assert_eq!(bs.pending_output(), 4);
    }

    #[test]
    fn read_only_adapter_rejects_writes() {
        let mut adapted = ReadOnly(std::io::Cursor::new(b"data".to_vec()));
        let err = adapted.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        let mut buf = [0u8; 4];
        assert_eq!(adapted.read(&mut buf).unwrap(), 4);
    }

    #[test]
    fn free_is_idempotent_and_keeps_the_handle() {
        let (_tx, mut bs) = read_watcher();
        assert!(!bs.is_freed());
        bs.free();
        assert!(bs.is_freed());
        bs.free();
        assert!(bs.is_freed());
        assert!(bs.take_stream().is_some());
        assert!(bs.take_stream().is_none());
    }

    #[test]
    fn timeout_dispatch_disarms_until_reenabled() {
        let (_tx, mut bs) = read_watcher();
        bs.set_timeout(Duration::from_millis(5), None);
        let fired = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&fired);
        bs.handlers.on_timeout = Some(Box::new(move |_, which| {
            seen.borrow_mut().push(which);
        }));
        bs.dispatch_timeout(Direction::Read);
        assert_eq!(fired.borrow().as_slice(), &[Direction::Read]);
        assert!(!bs.is_enabled());
        bs.io_mut().enable();
        assert!(bs.is_enabled());
    }
}
