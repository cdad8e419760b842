use std::path::PathBuf;
use std::time::Duration;

use crate::command::Command;
use crate::error::{PtyError, Result};
use crate::exit::{ExitCodeSync, ExitStatus, ExitWatcher};
use crate::native::NativePtyProcess;
use crate::options::WinSize;
use crate::selector::BackendKind;
use crate::stream::{PtyReader, PtyWriter};
#[cfg(windows)]
use crate::win::ConPtyProcess;

/// The contract every backend's process handle fulfils.
///
/// Stream accessors return handles to the same underlying stream on every
/// call. Once the process has terminated and its resources are released,
/// reads report end-of-data, writes fail and resizing only records the size.
pub trait PtyProcess: Send + Sync {
    fn pid(&self) -> u32;

    /// Synchronizer holding this process's exit status.
    fn exit_sync(&self) -> &ExitCodeSync;

    /// Input of the child.
    fn writer(&self) -> PtyWriter;

    /// Output of the child.
    fn reader(&self) -> PtyReader;

    /// Error output of the child. Backends that merge stderr into the
    /// terminal return an empty stream.
    fn error_reader(&self) -> PtyReader;

    fn win_size(&self) -> Result<WinSize>;

    fn set_win_size(&self, size: WinSize) -> Result<()>;

    /// Whether the process can be asked to exit, rather than only killed.
    fn supports_normal_termination(&self) -> bool;

    /// Requests termination. Idempotent, and a no-op once the process has
    /// exited. Failures are logged, never returned.
    fn destroy(&self);

    /// Current working directory of the running child.
    fn working_directory(&self) -> Result<PathBuf>;

    /// Blocks until the process terminates.
    fn wait_for(&self) -> ExitStatus {
        self.exit_sync().wait()
    }

    /// Blocks until the process terminates or `timeout` elapses. `None`
    /// means the process is still running.
    fn wait_for_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        self.exit_sync().wait_timeout(timeout)
    }

    /// The exit status without blocking.
    fn exit_value(&self) -> Result<ExitStatus> {
        self.exit_sync().peek().ok_or(PtyError::StillRunning)
    }

    fn is_alive(&self) -> bool {
        self.exit_sync().peek().is_none()
    }

    fn exit_watcher(&self) -> ExitWatcher {
        self.exit_sync().watcher()
    }
}

/// A process spawned by one of the backends.
pub enum Process {
    #[cfg(windows)]
    ConPty(ConPtyProcess),
    Native(NativePtyProcess),
    /// Produced by a registered [`ExternalBackend`](crate::ExternalBackend).
    External {
        kind: BackendKind,
        process: Box<dyn PtyProcess>,
    },
}

impl Process {
    pub fn kind(&self) -> BackendKind {
        match self {
            #[cfg(windows)]
            Process::ConPty(_) => BackendKind::ConPty,
            Process::Native(_) => BackendKind::Native,
            Process::External { kind, .. } => *kind,
        }
    }

    /// The command the process was spawned with, when the backend keeps it.
    pub fn command(&self) -> Option<&Command> {
        match self {
            #[cfg(windows)]
            Process::ConPty(process) => Some(process.command()),
            Process::Native(process) => Some(process.command()),
            Process::External { .. } => None,
        }
    }

    fn inner(&self) -> &dyn PtyProcess {
        match self {
            #[cfg(windows)]
            Process::ConPty(process) => process,
            Process::Native(process) => process,
            Process::External { process, .. } => process.as_ref(),
        }
    }
}

impl PtyProcess for Process {
    fn pid(&self) -> u32 {
        self.inner().pid()
    }

    fn exit_sync(&self) -> &ExitCodeSync {
        self.inner().exit_sync()
    }

    fn writer(&self) -> PtyWriter {
        self.inner().writer()
    }

    fn reader(&self) -> PtyReader {
        self.inner().reader()
    }

    fn error_reader(&self) -> PtyReader {
        self.inner().error_reader()
    }

    fn win_size(&self) -> Result<WinSize> {
        self.inner().win_size()
    }

    fn set_win_size(&self, size: WinSize) -> Result<()> {
        self.inner().set_win_size(size)
    }

    fn supports_normal_termination(&self) -> bool {
        self.inner().supports_normal_termination()
    }

    fn destroy(&self) {
        self.inner().destroy()
    }

    fn working_directory(&self) -> Result<PathBuf> {
        self.inner().working_directory()
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("kind", &self.kind())
            .field("pid", &self.pid())
            .field("exit", &self.exit_sync().peek())
            .finish()
    }
}
