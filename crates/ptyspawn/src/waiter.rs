//! The per-process background waiter.
//!
//! Every in-crate backend runs the same sequence on one detached thread:
//! block on the OS termination wait, publish the exit status, optionally let
//! a reader drain the remaining output, then release native resources. The
//! status is always published before anything is released.

use std::io;
use std::sync::Arc;
use std::thread;

use crate::exit::{ExitCodeSync, ExitStatus};
use crate::stream::PtyReader;

/// Starts the waiter thread for process `pid`.
///
/// `wait` blocks until the process terminates. `cleanup` releases the
/// backend's native handles and runs exactly once, after publication.
pub(crate) fn spawn_waiter<W, C>(
    pid: u32,
    exit: Arc<ExitCodeSync>,
    drain: Option<PtyReader>,
    wait: W,
    cleanup: C,
) -> io::Result<()>
where
    W: FnOnce() -> ExitStatus + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("pty-wait-{pid}"))
        .spawn(move || {
            let status = wait();
            log::debug!("process {pid} terminated with {status}");
            if let Err(err) = exit.set(status) {
                log::warn!("process {pid}: {err}");
            }
            if let Some(reader) = drain {
                reader.await_drained();
            }
            cleanup();
            log::debug!("process {pid} resources released");
        })
        .map(drop)
}
