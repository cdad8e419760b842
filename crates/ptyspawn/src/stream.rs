//! Byte streams over native PTY handles.
//!
//! A [`PtyReader`] or [`PtyWriter`] is a cheap, cloneable handle to one shared
//! native stream. Only one native operation runs at a time. Closing releases
//! the native handle exactly once, either after the in-flight operation
//! settles ([`CloseMode::Graceful`]) or right away ([`CloseMode::Forced`]).
//!
//! After close, reads report end-of-data and writes fail with
//! [`io::ErrorKind::BrokenPipe`].

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How long the drain loop sleeps between availability checks when no read
/// wakes it up.
const DRAIN_RECHECK: Duration = Duration::from_millis(50);

/// How to close a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Wait for pending native I/O to settle, then release the handle.
    Graceful,
    /// Release immediately, cancelling pending native I/O where possible.
    Forced,
}

/// Reports how many bytes of a native stream are buffered and unread.
///
/// Kept apart from the read handle so the waiter can ask while a read owns
/// the handle.
pub(crate) trait PendingOutput: Send + Sync {
    fn available(&self) -> io::Result<usize>;

    /// Whether [`available`](Self::available) may run while a read is
    /// blocked on the same stream.
    fn concurrent_with_read(&self) -> bool {
        true
    }
}

/// Aborts an in-flight native operation from another thread.
pub(crate) type Canceller = Box<dyn Fn() + Send + Sync>;

struct StreamState<H> {
    handle: Option<H>,
    /// A native operation is in flight and owns the handle.
    busy: bool,
    closed: bool,
}

struct Shared<H> {
    state: Mutex<StreamState<H>>,
    settled: Condvar,
    cancel: Option<Canceller>,
}

impl<H> Shared<H> {
    fn new(handle: H, cancel: Option<Canceller>) -> Self {
        Self {
            state: Mutex::new(StreamState {
                handle: Some(handle),
                busy: false,
                closed: false,
            }),
            settled: Condvar::new(),
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState<H>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the handle for one native operation, queueing behind any
    /// operation already in flight. `None` once the stream is closed.
    fn begin(&self) -> Option<H> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if !state.busy {
                break;
            }
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let handle = state.handle.take()?;
        state.busy = true;
        Some(handle)
    }

    /// Returns the handle after a native operation. Reports whether the
    /// stream was closed meanwhile, in which case the handle is released here.
    fn finish(&self, handle: H) -> bool {
        let mut state = self.lock();
        state.busy = false;
        let closed = state.closed;
        let released = if closed {
            Some(handle)
        } else {
            state.handle = Some(handle);
            None
        };
        drop(state);
        self.settled.notify_all();
        drop(released);
        closed
    }

    fn close(&self, mode: CloseMode) {
        let mut state = self.lock();
        state.closed = true;
        if state.busy {
            match mode {
                CloseMode::Graceful => {
                    while state.busy {
                        state = self
                            .settled
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                }
                CloseMode::Forced => {
                    // The in-flight operation releases the handle in
                    // `finish` once the cancellation lands.
                    if let Some(cancel) = &self.cancel {
                        cancel();
                    }
                }
            }
        }
        let handle = state.handle.take();
        drop(state);
        self.settled.notify_all();
        drop(handle);
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

fn is_end_of_data(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    ) {
        return true;
    }
    // Linux reports a hung-up PTY master as EIO.
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EIO) {
        return true;
    }
    false
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}

/// Output of the child process.
#[derive(Clone)]
pub struct PtyReader {
    shared: Arc<Shared<Box<dyn Read + Send>>>,
    pending: Option<Arc<dyn PendingOutput>>,
}

impl PtyReader {
    /// Wraps any reader. External backends use this to hand their output
    /// stream to the process contract.
    pub fn new(reader: impl Read + Send + 'static) -> Self {
        Self::from_native(Box::new(reader), None, None)
    }

    /// A stream that is always at end-of-data, for backends that merge
    /// stderr into the terminal.
    pub fn empty() -> Self {
        Self::new(io::empty())
    }

    pub(crate) fn from_native(
        input: Box<dyn Read + Send>,
        pending: Option<Arc<dyn PendingOutput>>,
        cancel: Option<Canceller>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(input, cancel)),
            pending,
        }
    }

    pub fn close(&self, mode: CloseMode) {
        self.shared.close(mode);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Blocks until everything the child has written so far has been read
    /// or the stream is closed. Streams that cannot report pending output count
    /// as drained.
    pub(crate) fn await_drained(&self) {
        let Some(pending) = self.pending.as_ref() else {
            return;
        };
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return;
            }
            if state.busy && !pending.concurrent_with_read() {
                let (next, wait) = self
                    .shared
                    .settled
                    .wait_timeout(state, DRAIN_RECHECK)
                    .unwrap_or_else(PoisonError::into_inner);
                state = next;
                // A read that stays blocked for a whole interval found the
                // stream empty.
                if wait.timed_out() && state.busy {
                    return;
                }
                continue;
            }
            match pending.available() {
                Ok(0) => return,
                Ok(count) => log::trace!("waiting for {count} unread output bytes"),
                Err(err) => {
                    log::debug!("cannot query pending output: {err}");
                    return;
                }
            }
            state = self
                .shared
                .settled
                .wait_timeout(state, DRAIN_RECHECK)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut handle) = self.shared.begin() else {
            return Ok(0);
        };
        let result = handle.read(buf);
        let closed = self.shared.finish(handle);
        match result {
            Ok(n) => Ok(n),
            Err(err) if closed || is_end_of_data(&err) => Ok(0),
            Err(err) => Err(err),
        }
    }
}

impl fmt::Debug for PtyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyReader")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Input of the child process.
#[derive(Clone)]
pub struct PtyWriter {
    shared: Arc<Shared<Box<dyn Write + Send>>>,
}

impl PtyWriter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self::from_native(Box::new(writer), None)
    }

    pub(crate) fn from_native(writer: Box<dyn Write + Send>, cancel: Option<Canceller>) -> Self {
        Self {
            shared: Arc::new(Shared::new(writer, cancel)),
        }
    }

    pub fn close(&self, mode: CloseMode) {
        self.shared.close(mode);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Write for PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(mut handle) = self.shared.begin() else {
            return Err(closed_error());
        };
        let result = handle.write(buf);
        self.shared.finish(handle);
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(mut handle) = self.shared.begin() else {
            return Ok(());
        };
        let result = handle.flush();
        self.shared.finish(handle);
        result
    }
}

impl fmt::Debug for PtyWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyWriter")
            .field("closed", &self.is_closed())
            .finish()
    }
}
