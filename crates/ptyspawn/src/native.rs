//! Native PTY backend built on `portable-pty` (openpty + fork/exec).
//!
//! Only selected on Unix hosts. `portable-pty`'s Windows PTY system is a
//! pseudo console, which the ConPTY backend already covers.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty};

use crate::command::Command;
use crate::error::{PtyError, Result};
use crate::exit::{ExitCodeSync, ExitStatus};
use crate::options::{PtyOptions, WinSize};
use crate::process::PtyProcess;
use crate::selector::BackendKind;
use crate::stream::{CloseMode, PendingOutput, PtyReader, PtyWriter};
use crate::waiter;

type SharedMaster = Arc<Mutex<Option<Box<dyn MasterPty + Send>>>>;
type SharedKiller = Arc<Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>>;

/// A child process attached to a `portable-pty` master.
pub struct NativePtyProcess {
    pid: u32,
    command: Command,
    master: SharedMaster,
    size: Mutex<WinSize>,
    killer: SharedKiller,
    reader: PtyReader,
    writer: PtyWriter,
    error: PtyReader,
    exit: Arc<ExitCodeSync>,
}

impl NativePtyProcess {
    /// Spawns `options.command()` on a fresh PTY.
    ///
    /// A suspended-process callback is dropped without being called, since
    /// fork/exec has no suspended state to expose.
    pub fn spawn(mut options: PtyOptions) -> Result<Self> {
        if options.take_suspended_callback().is_some() {
            log::warn!(
                "{} backend cannot start processes suspended; ignoring the callback",
                BackendKind::Native
            );
        }

        let size = options.size();
        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(|e| PtyError::setup_any("openpty", e))?;

        let mut child = pair
            .slave
            .spawn_command(command_builder(&options))
            .map_err(|e| {
                log::error!("failed to spawn `{}`: {e:#}", options.command());
                PtyError::setup_any(format!("spawn `{}`", options.command()), e)
            })?;
        // The child holds its own copy of the slave; ours would keep the
        // master from ever seeing end-of-data.
        drop(pair.slave);

        let streams = match open_streams(pair.master.as_ref()) {
            Ok(streams) => streams,
            Err(err) => {
                abort_child(child.as_mut());
                return Err(err);
            }
        };
        let Some(pid) = child.process_id() else {
            abort_child(child.as_mut());
            return Err(PtyError::setup(
                "query process id",
                io::Error::other("child has no process id"),
            ));
        };
        let (reader, writer) = streams;

        let killer: SharedKiller = Arc::new(Mutex::new(Some(child.clone_killer())));
        let master: SharedMaster = Arc::new(Mutex::new(Some(pair.master)));
        let exit = Arc::new(ExitCodeSync::new());

        let drain = options
            .is_keep_output_after_termination()
            .then(|| reader.clone());
        let cleanup = {
            let killer = Arc::clone(&killer);
            let master = Arc::clone(&master);
            let reader = reader.clone();
            let writer = writer.clone();
            move || {
                drop(take(&killer));
                drop(take(&master));
                reader.close(CloseMode::Graceful);
                writer.close(CloseMode::Graceful);
            }
        };
        let spawned = waiter::spawn_waiter(
            pid,
            Arc::clone(&exit),
            drain,
            move || wait_child(pid, child),
            cleanup,
        );
        if let Err(err) = spawned {
            if let Some(mut killer) = take(&killer) {
                let _ = killer.kill();
            }
            reader.close(CloseMode::Forced);
            writer.close(CloseMode::Forced);
            return Err(PtyError::setup("start waiter thread", err));
        }

        log::debug!("spawned `{}` as pid {pid} on a {size} pty", options.command());
        Ok(Self {
            pid,
            command: options.command().clone(),
            master,
            size: Mutex::new(size),
            killer,
            reader,
            writer,
            error: PtyReader::empty(),
            exit,
        })
    }

    /// The command the child was spawned with.
    pub fn command(&self) -> &Command {
        &self.command
    }
}

impl PtyProcess for NativePtyProcess {
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
        Ok(*self.size.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn set_win_size(&self, size: WinSize) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        match master.as_ref() {
            Some(master) => master.resize(size.into()).map_err(|e| PtyError::Resize {
                size,
                source: io::Error::other(format!("{e:#}")),
            })?,
            None => log::debug!("pid {}: pty already released, recording size {size}", self.pid),
        }
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = size;
        Ok(())
    }

    fn supports_normal_termination(&self) -> bool {
        cfg!(unix)
    }

    fn destroy(&self) {
        if !self.is_alive() {
            return;
        }
        // The waiter drops the killer only after publishing the exit status,
        // so while it is present the pid still names our child.
        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(killer) = killer.as_mut() {
            if let Err(err) = force_kill(self.pid, killer.as_mut()) {
                log::info!("failed to terminate process with pid {}: {err}", self.pid);
            }
        }
    }

    fn working_directory(&self) -> Result<PathBuf> {
        working_directory_of(self.pid)
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn command_builder(options: &PtyOptions) -> CommandBuilder {
    let command = options.command();
    let mut builder = CommandBuilder::new(command.program());
    builder.args(command.args());
    if let Some(env) = options.env() {
        builder.env_clear();
        for (key, value) in env {
            builder.env(key, value);
        }
    }
    if let Some(dir) = options.working_dir() {
        builder.cwd(dir);
    }
    builder
}

fn open_streams(master: &(dyn MasterPty + Send)) -> Result<(PtyReader, PtyWriter)> {
    let reader = master
        .try_clone_reader()
        .map_err(|e| PtyError::setup_any("clone pty reader", e))?;
    let pending = master_pending(master)?;
    let writer = master
        .take_writer()
        .map_err(|e| PtyError::setup_any("take pty writer", e))?;
    Ok((
        PtyReader::from_native(reader, pending, None),
        PtyWriter::from_native(writer, None),
    ))
}

fn abort_child(child: &mut (dyn Child + Send + Sync)) {
    if let Err(err) = child.kill() {
        log::info!("failed to kill partially set up child: {err}");
    }
    let _ = child.wait();
}

fn wait_child(pid: u32, mut child: Box<dyn Child + Send + Sync>) -> ExitStatus {
    match child.wait() {
        Ok(status) => match status.signal() {
            Some(signal) => {
                log::debug!("process {pid} killed by {signal}");
                ExitStatus::Code(status.exit_code() as i32)
            }
            None => ExitStatus::Code(status.exit_code() as i32),
        },
        Err(err) => {
            log::info!("failed to query exit code of process {pid}: {err}");
            ExitStatus::Unknown
        }
    }
}

#[cfg(unix)]
fn force_kill(pid: u32, _killer: &mut (dyn ChildKiller + Send + Sync)) -> io::Result<()> {
    // SAFETY: kill(2) has no memory effects.
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn force_kill(_pid: u32, killer: &mut (dyn ChildKiller + Send + Sync)) -> io::Result<()> {
    killer.kill()
}

/// A private duplicate of the pty master, used to ask the kernel how much
/// output is still buffered while a read owns the master.
#[cfg(unix)]
struct MasterPending {
    fd: std::os::fd::OwnedFd,
}

#[cfg(unix)]
fn master_pending(master: &(dyn MasterPty + Send)) -> Result<Option<Arc<dyn PendingOutput>>> {
    use std::os::fd::{BorrowedFd, RawFd};

    let raw: RawFd = master.as_raw_fd().ok_or_else(|| {
        PtyError::setup("locate pty master", io::Error::other("master has no descriptor"))
    })?;
    // SAFETY: the master outlives this call, so the descriptor is open.
    let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
    let fd = borrowed
        .try_clone_to_owned()
        .map_err(|e| PtyError::setup("dup pty master", e))?;
    Ok(Some(Arc::new(MasterPending { fd })))
}

#[cfg(not(unix))]
fn master_pending(_master: &(dyn MasterPty + Send)) -> Result<Option<Arc<dyn PendingOutput>>> {
    Ok(None)
}

#[cfg(unix)]
impl PendingOutput for MasterPending {
    fn available(&self) -> io::Result<usize> {
        use std::os::fd::AsRawFd;

        let fd = self.fd.as_raw_fd();
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // A zero-timeout poll makes the line discipline pull pending bytes
        // into its read buffer, so the FIONREAD below sees them.
        // SAFETY: `pollfd` is a valid single-element array.
        if unsafe { libc::poll(&mut pollfd, 1, 0) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut pending: libc::c_int = 0;
        // SAFETY: FIONREAD writes one c_int through the pointer.
        if unsafe { libc::ioctl(fd, libc::FIONREAD, &mut pending) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(pending.max(0) as usize)
    }
}

#[cfg(target_os = "linux")]
fn working_directory_of(pid: u32) -> Result<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/cwd"))
        .map_err(|e| PtyError::query(format!("read working directory of process {pid}"), e))
}

#[cfg(not(target_os = "linux"))]
fn working_directory_of(pid: u32) -> Result<PathBuf> {
    Err(PtyError::query(
        format!("read working directory of process {pid}"),
        io::Error::from(io::ErrorKind::Unsupported),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> PtyOptions {
        PtyOptions::new(Command::new(["/bin/sh", "-c", script]).unwrap())
    }

    fn read_until(reader: &mut PtyReader, needle: &str, timeout: Duration) -> String {
        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    output.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        break;
                    }
                }
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn test_spawn_reports_pid_and_size() {
        let process = NativePtyProcess::spawn(sh("sleep 5")).unwrap();
        assert!(process.pid() > 0);
        assert!(process.is_alive());
        assert_eq!(process.win_size().unwrap(), WinSize::default());
        assert!(process.supports_normal_termination());
        process.destroy();
        assert!(process.wait_for_timeout(Duration::from_secs(5)).is_some());
    }

    #[test]
    fn test_write_read_echo() {
        let process = NativePtyProcess::spawn(
            PtyOptions::new(Command::new(["/bin/sh"]).unwrap()),
        )
        .unwrap();

        let mut writer = process.writer();
        writer.write_all(b"echo PTYSPAWN_TEST_OK\n").unwrap();
        writer.flush().unwrap();

        let mut reader = process.reader();
        let text = read_until(&mut reader, "PTYSPAWN_TEST_OK", Duration::from_secs(3));
        assert!(
            text.contains("PTYSPAWN_TEST_OK"),
            "Expected output to contain PTYSPAWN_TEST_OK, got: {text}"
        );

        writer.write_all(b"exit 0\n").unwrap();
        assert_eq!(
            process.wait_for_timeout(Duration::from_secs(5)),
            Some(ExitStatus::Code(0))
        );
    }

    #[test]
    fn test_resize_is_seen_by_child() {
        let process = NativePtyProcess::spawn(sh("sleep 0.3; stty size")).unwrap();
        let size = WinSize::new(132, 43).unwrap();
        process.set_win_size(size).unwrap();
        assert_eq!(process.win_size().unwrap(), size);

        let mut reader = process.reader();
        let text = read_until(&mut reader, "43 132", Duration::from_secs(3));
        assert!(text.contains("43 132"), "stty reported: {text}");
    }

    #[test]
    fn test_exit_code_is_published() {
        let process = NativePtyProcess::spawn(sh("exit 42")).unwrap();
        assert_eq!(process.wait_for(), ExitStatus::Code(42));
        assert!(!process.is_alive());
        assert_eq!(process.exit_value().unwrap(), ExitStatus::Code(42));
        // Every later wait sees the same status.
        assert_eq!(process.wait_for(), ExitStatus::Code(42));
        assert_eq!(
            process.wait_for_timeout(Duration::ZERO),
            Some(ExitStatus::Code(42))
        );
    }

    #[test]
    fn test_exit_value_while_running() {
        let process = NativePtyProcess::spawn(sh("sleep 5")).unwrap();
        assert!(matches!(process.exit_value(), Err(PtyError::StillRunning)));

        let start = Instant::now();
        assert_eq!(process.wait_for_timeout(Duration::ZERO), None);
        assert!(start.elapsed() < Duration::from_millis(500));

        process.destroy();
        process.destroy();
        assert!(process.wait_for_timeout(Duration::from_secs(5)).is_some());
        // Destroying an exited process is a no-op.
        process.destroy();
    }

    #[test]
    fn test_streams_close_after_exit() {
        let process = NativePtyProcess::spawn(sh("exit 0")).unwrap();
        process.wait_for();

        let reader = process.reader();
        let writer = process.writer();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !(reader.is_closed() && writer.is_closed()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(reader.is_closed());

        let mut writer = writer;
        let err = writer.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        // Resizing after release only records the size.
        let size = WinSize::new(100, 30).unwrap();
        process.set_win_size(size).unwrap();
        assert_eq!(process.win_size().unwrap(), size);
    }

    #[test]
    fn test_keep_output_after_termination() {
        let process = NativePtyProcess::spawn(
            sh("printf 0123456789").keep_output_after_termination(true),
        )
        .unwrap();
        assert_eq!(process.wait_for(), ExitStatus::Code(0));
        assert!(!process.is_alive());

        let mut reader = process.reader();
        let mut output = Vec::new();
        reader.read_to_end(&mut output).unwrap();
        assert_eq!(output, b"0123456789");
    }

    #[test]
    fn test_keep_output_read_byte_by_byte() {
        let process = NativePtyProcess::spawn(
            sh("head -c 3000 /dev/zero | tr '\\0' x").keep_output_after_termination(true),
        )
        .unwrap();
        assert_eq!(process.wait_for(), ExitStatus::Code(0));

        let mut reader = process.reader();
        let mut total = 0;
        let mut byte = [0u8; 1];
        while reader.read(&mut byte).unwrap() == 1 {
            assert_eq!(byte[0], b'x');
            total += 1;
        }
        assert_eq!(total, 3000);
    }

    #[test]
    fn test_destroy_kills_child_ignoring_hangup() {
        let process = NativePtyProcess::spawn(sh("trap '' HUP; sleep 3; exit 5")).unwrap();
        thread::sleep(Duration::from_millis(200));

        let start = Instant::now();
        process.destroy();
        let status = process.wait_for_timeout(Duration::from_secs(10));
        assert!(status.is_some());
        assert_ne!(status, Some(ExitStatus::Code(5)));
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "child survived until {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn test_environment_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let options = sh("echo \"$PTYSPAWN_VAR:$(pwd)\"; sleep 0.5")
            .environment([("PTYSPAWN_VAR", "marker"), ("PATH", "/usr/bin:/bin")])
            .directory(dir.path());
        let process = NativePtyProcess::spawn(options).unwrap();

        let mut reader = process.reader();
        let text = read_until(&mut reader, "\n", Duration::from_secs(3));
        let expected_dir = dir.path().canonicalize().unwrap();
        assert!(text.starts_with("marker:"), "got: {text}");
        assert!(
            text.contains(expected_dir.to_str().unwrap()),
            "expected {expected_dir:?} in {text}"
        );
        process.wait_for();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_working_directory_query() {
        let dir = tempfile::tempdir().unwrap();
        let process = NativePtyProcess::spawn(sh("sleep 5").directory(dir.path())).unwrap();
        let cwd = process.working_directory().unwrap();
        assert_eq!(cwd, dir.path().canonicalize().unwrap());
        process.destroy();
        process.wait_for();
    }

    #[test]
    fn test_spawn_failure_is_setup_error() {
        let result = NativePtyProcess::spawn(PtyOptions::new(
            Command::new(["/nonexistent/ptyspawn-binary"]).unwrap(),
        ));
        assert!(matches!(result, Err(PtyError::Setup { .. })));
    }

    #[test]
    fn test_suspended_callback_is_not_invoked() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let options = sh("exit 0").suspended_process_callback(move |_pid| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        let process = NativePtyProcess::spawn(options).unwrap();
        process.wait_for();
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }
}
