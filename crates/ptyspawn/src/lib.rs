//! ptyspawn: spawn child processes attached to a pseudo-terminal.
//!
//! Every backend hands back the same process handle, whichever OS mechanism
//! provides the terminal: pid, input/output streams, resize, wait, exit code
//! and forced termination.
//!
//! # Architecture
//!
//! - [`PtyOptions`] / [`Command`]: what to run and how.
//! - [`PtySpawner`]: picks one backend per spawn ([`select`]) and falls back
//!   when the Windows pseudo console cannot be loaded.
//! - [`Process`]: the spawned process, implementing [`PtyProcess`].
//! - [`ExitCodeSync`]: set-once exit status shared with the background waiter.
//! - [`PtyReader`] / [`PtyWriter`]: byte streams with graceful or forced close.
//!
//! Each process owns one detached waiter thread. It blocks on the OS
//! termination wait, publishes the exit status, and only then releases the
//! process's native handles.

pub mod command;
pub mod error;
pub mod exit;
pub mod native;
pub mod options;
pub mod process;
pub mod selector;
pub mod stream;
mod waiter;
#[cfg(windows)]
pub mod win;

pub use command::Command;
pub use error::{PtyError, Result};
pub use exit::{ExitCodeSync, ExitStatus, ExitWatcher, UNKNOWN_EXIT_CODE};
pub use native::NativePtyProcess;
pub use options::{PtyOptions, PtySettings, SuspendedProcessCallback, WinSize};
pub use process::{Process, PtyProcess};
pub use selector::{
    select, spawn, BackendKind, CapabilityError, CapabilityProbe, ExternalBackend, HostPlatform,
    PlatformFamily, PtySpawner, Selection,
};
pub use stream::{CloseMode, PtyReader, PtyWriter};
#[cfg(windows)]
pub use win::ConPtyProcess;
