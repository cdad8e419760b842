//! Termination status shared between a process's waiter thread and its
//! observers.

use std::fmt;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::{PtyError, Result};

/// Raw value reported by [`ExitStatus::raw`] when the OS could not tell us
/// how the process ended.
pub const UNKNOWN_EXIT_CODE: i32 = -100;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    Code(i32),
    /// The process is gone but its exit code could not be queried.
    Unknown,
}

impl ExitStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            ExitStatus::Unknown => None,
        }
    }

    /// The exit code, with [`UNKNOWN_EXIT_CODE`] standing in for a failed
    /// query.
    pub fn raw(&self) -> i32 {
        self.code().unwrap_or(UNKNOWN_EXIT_CODE)
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {code}"),
            ExitStatus::Unknown => f.write_str("unknown exit code"),
        }
    }
}

/// Set-once holder of a process's [`ExitStatus`].
///
/// Exactly one writer (the process's waiter) publishes the status; any number
/// of threads may block on it, and async code can observe it through an
/// [`ExitWatcher`].
pub struct ExitCodeSync {
    status: Mutex<Option<ExitStatus>>,
    published: Condvar,
    watch: watch::Sender<Option<ExitStatus>>,
}

impl ExitCodeSync {
    /// An unpublished synchronizer.
    pub fn new() -> Self {
        let (watch, _) = watch::channel(None);
        Self {
            status: Mutex::new(None),
            published: Condvar::new(),
            watch,
        }
    }

    /// Publishes the status and wakes every observer.
    ///
    /// Fails with [`PtyError::ExitAlreadyPublished`] on a second call; the
    /// first value is kept.
    pub fn set(&self, status: ExitStatus) -> Result<()> {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return Err(PtyError::ExitAlreadyPublished);
        }
        *current = Some(status);
        self.watch.send_replace(Some(status));
        self.published.notify_all();
        Ok(())
    }

    /// Blocks until the status is published.
    pub fn wait(&self) -> ExitStatus {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(status) = *current {
                return status;
            }
            current = self
                .published
                .wait(current)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the status is published or `timeout` elapses.
    ///
    /// Returns `None` if the process is still running at the deadline.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now().checked_add(timeout);
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(status) = *current {
                return Some(status);
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                // Overflowing deadline: treat as unbounded.
                None => timeout,
            };
            if remaining.is_zero() {
                return None;
            }
            // Spurious wakeups land back here with the remaining time
            // recomputed from the deadline.
            current = self
                .published
                .wait_timeout(current, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// The status, if already published. Never blocks.
    pub fn peek(&self) -> Option<ExitStatus> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes an async observer. Watchers created after publication
    /// see the status immediately.
    pub fn watcher(&self) -> ExitWatcher {
        ExitWatcher {
            rx: self.watch.subscribe(),
        }
    }
}

impl Default for ExitCodeSync {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExitCodeSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitCodeSync")
            .field("status", &self.peek())
            .finish()
    }
}

/// Async observer of an [`ExitCodeSync`].
#[derive(Debug, Clone)]
pub struct ExitWatcher {
    rx: watch::Receiver<Option<ExitStatus>>,
}

impl ExitWatcher {
    /// Resolves once the status is published.
    pub async fn wait(&mut self) -> ExitStatus {
        match self.rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(ExitStatus::Unknown),
            // The synchronizer went away without ever publishing.
            Err(_) => ExitStatus::Unknown,
        }
    }

    pub fn peek(&self) -> Option<ExitStatus> {
        *self.rx.borrow()
    }
}
