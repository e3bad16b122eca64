#![forbid(unsafe_code)]
//! Batched, line-oriented log ingestion on top of the `reactor` crate.
//!
//! [`LineBatchParser`] watches one already-open readable stream,
//! accumulates raw bytes as they arrive, and delivers batches of
//! complete newline-terminated lines to a flush handler. A flush is
//! triggered by any of three independent conditions:
//!
//! - the accumulation buffer reaching the configured size threshold,
//! - the stream going quiet for the configured inactivity window,
//! - end of stream.
//!
//! A batch always ends exactly at the last newline seen; the
//! unterminated tail stays buffered for the next flush. Trailing bytes
//! that never receive a newline are dropped at end of stream — only
//! newline-terminated lines are ever delivered.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use reactor::{
    BufferedStream, Direction, EventLoop, Ops, ReactorError, StreamHandle, StreamIo,
    StreamWatcher,
};
use tracing::{debug, warn};

/// Bytes pulled from the stream buffer per read notification.
const READ_CHUNK_BYTES: usize = 4096;

/// Default accumulation threshold that forces a flush.
pub const DEFAULT_FLUSH_SIZE: usize = 64 * 1024;

/// Tuning knobs for [`LineBatchParser`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BatchConfig {
    /// Accumulated byte count at which a flush is forced.
    pub flush_size: usize,
    /// Inactivity window that forces a flush and then re-arms the
    /// watch. `None` waits forever; the timeout is a trigger, never a
    /// terminal condition.
    pub inactivity_timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_size: DEFAULT_FLUSH_SIZE,
            inactivity_timeout: None,
        }
    }
}

type FlushHandler = Box<dyn FnMut(&[u8])>;

/// Accumulated not-yet-delivered bytes plus the flush policy.
///
/// Shared between the parser handle and the stream's handler slots as
/// an explicitly cloned `Rc`; the reactor is single-threaded, so the
/// `RefCell` borrows never contend.
struct Accumulator {
    pending: Vec<u8>,
    flush_size: usize,
    on_flush: Option<FlushHandler>,
    complete: bool,
}

impl Accumulator {
    fn append(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() >= self.flush_size {
            self.flush();
        }
    }

    /// Emits everything up to and including the last newline, keeping
    /// exactly the bytes after it. Without a newline there is no
    /// complete line yet and the buffer is left untouched.
    fn flush(&mut self) {
        let Some(cut) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return;
        };
        let tail = self.pending.split_off(cut + 1);
        if let Some(cb) = self.on_flush.as_mut() {
            cb(&self.pending);
        }
        self.pending = tail;
    }
}

/// Reads a stream of log lines and delivers them in newline-complete
/// batches.
///
/// Intended for large line-oriented feeds (webserver logs, pipe-fed
/// audit trails) where each line should not cost a downstream hit:
/// the flush handler sees one batch per threshold/timeout/EOF trigger
/// instead of one callback per line.
pub struct LineBatchParser {
    stream: Rc<RefCell<BufferedStream>>,
    accum: Rc<RefCell<Accumulator>>,
}

impl LineBatchParser {
    /// Wraps an already-open, non-blocking, readable stream. The
    /// parser owns the resulting watcher; register it with a loop via
    /// [`bind`](LineBatchParser::bind).
    pub fn new<S: StreamHandle + 'static>(stream: S, config: BatchConfig) -> Self {
        let mut buffered = BufferedStream::new(stream, Ops::Read);
        let accum = Rc::new(RefCell::new(Accumulator {
            pending: Vec::new(),
            flush_size: config.flush_size.max(1),
            on_flush: None,
            complete: false,
        }));

        let on_data = Rc::clone(&accum);
        buffered.handlers.on_read = Some(Box::new(move |io: &mut StreamIo| {
            let chunk = io.read(READ_CHUNK_BYTES);
            on_data.borrow_mut().append(&chunk);
        }));

        let at_eof = Rc::clone(&accum);
        buffered.handlers.on_eof = Some(Box::new(move |io: &mut StreamIo| {
            let mut accum = at_eof.borrow_mut();
            accum.flush();
            accum.complete = true;
            debug!(
                fd = io.raw_fd(),
                unterminated_bytes = accum.pending.len(),
                "end of stream reached"
            );
        }));

        buffered.handlers.on_error = Some(Box::new(|io: &mut StreamIo, err: std::io::Error| {
            warn!(fd = io.raw_fd(), error = %err, "stream error, halting ingestion");
            io.disable();
        }));

        if let Some(window) = config.inactivity_timeout {
            buffered.set_timeout(window, None);
            let on_idle = Rc::clone(&accum);
            buffered.handlers.on_timeout =
                Some(Box::new(move |io: &mut StreamIo, which: Direction| {
                    if which == Direction::Read {
                        on_idle.borrow_mut().flush();
                    }
                    // the timeout only forces a flush; keep watching
                    io.enable();
                }));
        }

        Self {
            stream: Rc::new(RefCell::new(buffered)),
            accum,
        }
    }

    /// Registers the owned stream watcher with `event_loop`.
    pub fn bind(&self, event_loop: &mut EventLoop) -> Result<(), ReactorError> {
        event_loop.register(&self.stream)
    }

    /// Installs the flush sink. The batch slice always ends with a
    /// newline and contains only complete lines.
    pub fn set_on_flush(&self, handler: impl FnMut(&[u8]) + 'static) {
        self.accum.borrow_mut().on_flush = Some(Box::new(handler));
    }

    /// Forces a flush of any accumulated complete lines.
    pub fn flush(&self) {
        self.accum.borrow_mut().flush();
    }

    /// Bytes accumulated but not yet delivered (at most one partial
    /// line after a flush).
    pub fn buffered(&self) -> usize {
        self.accum.borrow().pending.len()
    }

    /// Whether end of stream has been reached and the final flush ran.
    pub fn is_complete(&self) -> bool {
        self.accum.borrow().complete
    }

    /// The underlying stream watcher, for priority or watermark tuning.
    pub fn stream(&self) -> &Rc<RefCell<BufferedStream>> {
        &self.stream
    }

    /// Releases the stream watch registration. Idempotent; the stream
    /// handle itself stays open.
    pub fn free(&self) {
        self.stream.borrow_mut().free();
    }
}
