//! Ownership of the native handles behind a pseudo-console process.

use std::io;
use std::os::windows::io::AsRawHandle;
use std::ptr;
use std::sync::Arc;

use filedescriptor::{FileDescriptor, IntoRawFileDescriptor, OwnedHandle};
use winapi::shared::minwindef::DWORD;
use winapi::um::handleapi::CloseHandle;
use winapi::um::ioapiset::CancelIoEx;
use winapi::um::namedpipeapi::PeekNamedPipe;
use winapi::um::processthreadsapi::{ResumeThread, TerminateProcess};
use winapi::um::winnt::HANDLE;

use crate::error::{PtyError, Result};
use crate::stream::{Canceller, PendingOutput, PtyReader, PtyWriter};

/// Process and primary-thread handles of a running child.
pub(crate) struct ProcessHandles {
    pub(crate) process: OwnedHandle,
    pub(crate) thread: OwnedHandle,
}

impl ProcessHandles {
    pub(crate) fn raw_process(&self) -> HANDLE {
        self.process.as_raw_handle() as HANDLE
    }

    /// Force-kills the process with exit code 1.
    pub(crate) fn terminate(&self) -> io::Result<()> {
        if unsafe { TerminateProcess(self.raw_process(), 1) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// A child created suspended, before its first instruction has run.
///
/// [`SuspendedProcess::resume`] lets it run. Dropping it without resuming
/// kills the child and closes its handles.
pub(crate) struct SuspendedProcess {
    handles: Option<ProcessHandles>,
    pid: u32,
}

impl SuspendedProcess {
    pub(crate) fn new(handles: ProcessHandles, pid: u32) -> Self {
        Self {
            handles: Some(handles),
            pid,
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn resume(mut self) -> Result<ProcessHandles> {
        let Some(handles) = self.handles.take() else {
            return Err(PtyError::setup(
                "ResumeThread",
                io::Error::other("process handles already released"),
            ));
        };
        let previous = unsafe { ResumeThread(handles.thread.as_raw_handle() as HANDLE) };
        if previous == DWORD::MAX {
            let err = io::Error::last_os_error();
            abort(&handles, self.pid);
            return Err(PtyError::setup("ResumeThread", err));
        }
        Ok(handles)
    }
}

impl Drop for SuspendedProcess {
    fn drop(&mut self) {
        if let Some(handles) = self.handles.take() {
            abort(&handles, self.pid);
        }
    }
}

/// Kills a child whose setup did not complete. Its handles close when the
/// caller drops them.
pub(crate) fn abort(handles: &ProcessHandles, pid: u32) {
    if let Err(err) = handles.terminate() {
        log::info!("failed to terminate partially set up process {pid}: {err}");
    }
}

/// Closes a pipe end now, reporting failure instead of swallowing it.
pub(crate) fn close_handle(fd: FileDescriptor) -> io::Result<()> {
    let raw = fd.into_raw_file_descriptor();
    if unsafe { CloseHandle(raw as HANDLE) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn canceller(fd: &FileDescriptor) -> Canceller {
    let raw = fd.as_raw_handle() as usize;
    Box::new(move || {
        // Only called while the stream still owns the handle.
        unsafe { CancelIoEx(raw as HANDLE, ptr::null_mut()) };
    })
}

/// Bytes waiting in the console output pipe.
///
/// Holds the raw handle of the reader's pipe end. The reader only queries it
/// while holding the stream open and idle.
struct PipePending {
    raw: usize,
}

impl PendingOutput for PipePending {
    fn available(&self) -> io::Result<usize> {
        let mut available: DWORD = 0;
        let res = unsafe {
            PeekNamedPipe(
                self.raw as HANDLE,
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                &mut available,
                ptr::null_mut(),
            )
        };
        if res == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(available as usize)
    }

    // Synchronous pipe handles serialize every call behind a blocked read.
    fn concurrent_with_read(&self) -> bool {
        false
    }
}

pub(crate) fn output_stream(fd: FileDescriptor) -> PtyReader {
    let cancel = canceller(&fd);
    let pending = PipePending {
        raw: fd.as_raw_handle() as usize,
    };
    PtyReader::from_native(Box::new(fd), Some(Arc::new(pending)), Some(cancel))
}

pub(crate) fn input_stream(fd: FileDescriptor) -> PtyWriter {
    let cancel = canceller(&fd);
    PtyWriter::from_native(Box::new(fd), Some(cancel))
}
