//! Pseudo-console (ConPTY) backend.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use filedescriptor::Pipe;
use winapi::shared::minwindef::DWORD;
use winapi::um::processthreadsapi::GetExitCodeProcess;
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{INFINITE, WAIT_FAILED, WAIT_OBJECT_0};
use winapi::um::winnt::HANDLE;

use super::cwd;
use super::handles::{self, ProcessHandles};
use super::process_tree;
use super::pseudo_console::{conpty_sideloaded, PseudoConsole};
use crate::command::Command;
use crate::error::{PtyError, Result};
use crate::exit::{ExitCodeSync, ExitStatus};
use crate::options::{PtyOptions, WinSize};
use crate::process::PtyProcess;
use crate::stream::{CloseMode, PtyReader, PtyWriter};
use crate::waiter;

struct Console {
    console: Option<PseudoConsole>,
    size: WinSize,
}

type SharedHandles = Arc<Mutex<Option<ProcessHandles>>>;

/// A child process attached to a Windows pseudo console.
///
/// The waiter releases the process handles first, then the console, then the
/// streams. Until then, `destroy` and `working_directory` use the handles.
pub struct ConPtyProcess {
    pid: u32,
    command: Command,
    handles: SharedHandles,
    console: Arc<Mutex<Console>>,
    reader: PtyReader,
    writer: PtyWriter,
    error: PtyReader,
    exit: Arc<ExitCodeSync>,
    sideloaded: bool,
}

fn pipe(operation: &str) -> Result<Pipe> {
    Pipe::new().map_err(|e| PtyError::setup(operation, io::Error::other(e.to_string())))
}

impl ConPtyProcess {
    /// Spawns `options.command()` on a new pseudo console.
    ///
    /// The child is created suspended. A registered suspended-process
    /// callback runs with its pid before the child executes anything.
    pub fn create(mut options: PtyOptions) -> Result<Self> {
        let size = options.size();
        let input = pipe("CreatePipe (input)")?;
        let output = pipe("CreatePipe (output)")?;

        let console = PseudoConsole::new(size, &input.read, &output.write)?;
        let suspended = console.spawn_suspended(
            options.command(),
            &options.resolved_env(),
            options.working_dir(),
        )?;
        let pid = suspended.pid();
        if let Some(callback) = options.take_suspended_callback() {
            log::debug!("pid {pid}: running suspended-process callback");
            callback(pid);
        }
        let process = suspended.resume()?;

        // The console holds its own duplicates of the child ends; ours would
        // keep the output pipe open after the console closes.
        let Pipe {
            read: child_input,
            write: parent_input,
        } = input;
        let Pipe {
            read: parent_output,
            write: child_output,
        } = output;
        let closed = handles::close_handle(child_input)
            .map_err(|e| PtyError::setup("CloseHandle (console input)", e))
            .and_then(|()| {
                handles::close_handle(child_output)
                    .map_err(|e| PtyError::setup("CloseHandle (console output)", e))
            });
        if let Err(err) = closed {
            handles::abort(&process, pid);
            return Err(err);
        }

        let reader = handles::output_stream(parent_output);
        let writer = handles::input_stream(parent_input);
        let raw_process = process.raw_process() as usize;
        let process: SharedHandles = Arc::new(Mutex::new(Some(process)));
        let console = Arc::new(Mutex::new(Console {
            console: Some(console),
            size,
        }));
        let exit = Arc::new(ExitCodeSync::new());

        let command_line = options.command().to_command_line();
        let drain = options
            .is_keep_output_after_termination()
            .then(|| reader.clone());
        let cleanup = {
            let process = Arc::clone(&process);
            let console = Arc::clone(&console);
            let reader = reader.clone();
            let writer = writer.clone();
            move || {
                drop(process.lock().unwrap_or_else(PoisonError::into_inner).take());
                drop(console.lock().unwrap_or_else(PoisonError::into_inner).console.take());
                reader.close(CloseMode::Graceful);
                writer.close(CloseMode::Graceful);
            }
        };
        // The handle stays open until cleanup, which runs after the wait.
        let spawned = waiter::spawn_waiter(
            pid,
            Arc::clone(&exit),
            drain,
            move || wait_for_exit(raw_process as HANDLE, pid, &command_line),
            cleanup,
        );
        if let Err(err) = spawned {
            if let Some(handles) = process.lock().unwrap_or_else(PoisonError::into_inner).take() {
                handles::abort(&handles, pid);
            }
            reader.close(CloseMode::Forced);
            writer.close(CloseMode::Forced);
            return Err(PtyError::setup("start waiter thread", err));
        }

        log::debug!(
            "spawned `{}` as pid {pid} on a {size} pseudo console",
            options.command()
        );
        Ok(Self {
            pid,
            command: options.command().clone(),
            handles: process,
            console,
            reader,
            writer,
            error: PtyReader::empty(),
            exit,
            sideloaded: conpty_sideloaded(),
        })
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Number of processes attached to the pseudo console: the child and
    /// its live descendants. 0 once the child's handles are released.
    pub fn console_process_count(&self) -> Result<usize> {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if handles.is_none() {
            return Ok(0);
        }
        process_tree::console_process_count(self.pid).map_err(|err| {
            PtyError::query(format!("count console processes of {}", self.pid), err)
        })
    }

    /// Whether the console came from a `conpty.dll` shipped next to the
    /// executable rather than the system's.
    pub fn uses_sideloaded_conpty(&self) -> bool {
        self.sideloaded
    }
}

fn wait_for_exit(process: HANDLE, pid: u32, command_line: &str) -> ExitStatus {
    let result = unsafe { WaitForSingleObject(process, INFINITE) };
    if result != WAIT_OBJECT_0 {
        if result == WAIT_FAILED {
            log::info!(
                "waiting for `{command_line}` (pid {pid}) failed: {}",
                io::Error::last_os_error()
            );
        } else {
            log::info!("waiting for `{command_line}` (pid {pid}) returned {result:#x}");
        }
        return ExitStatus::Unknown;
    }
    let mut code: DWORD = 0;
    if unsafe { GetExitCodeProcess(process, &mut code) } == 0 {
        log::info!(
            "failed to get exit code of `{command_line}` (pid {pid}): {}",
            io::Error::last_os_error()
        );
        return ExitStatus::Unknown;
    }
    ExitStatus::Code(code as i32)
}

impl PtyProcess for ConPtyProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn exit_sync(&self) -> &ExitCodeSync {
        &self.exit
    }

    fn writer(&self) -> PtyWriter {
        self.writer.clone()
    }

    fn reader(&self) -> PtyReader {
        self.reader.clone()
    }

    fn error_reader(&self) -> PtyReader {
        self.error.clone()
    }

    fn win_size(&self) -> Result<WinSize> {
        Ok(self.console.lock().unwrap_or_else(PoisonError::into_inner).size)
    }

    fn set_win_size(&self, size: WinSize) -> Result<()> {
        let mut console = self.console.lock().unwrap_or_else(PoisonError::into_inner);
        match console.console.as_ref() {
            Some(con) => con.resize(size)?,
            None => log::debug!("pid {}: console already closed, recording size {size}", self.pid),
        }
        console.size = size;
        Ok(())
    }

    fn supports_normal_termination(&self) -> bool {
        false
    }

    fn destroy(&self) {
        if !self.is_alive() {
            return;
        }
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handles) = handles.as_ref() {
            if let Err(err) = handles.terminate() {
                log::info!("failed to terminate process with pid {}: {err}", self.pid);
            }
        }
    }

    fn working_directory(&self) -> Result<PathBuf> {
        let handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        match handles.as_ref() {
            Some(handles) => cwd::working_directory(handles.raw_process(), self.pid),
            None => Err(PtyError::query(
                format!("read working directory of process {}", self.pid),
                io::Error::other("process has exited"),
            )),
        }
    }
}
