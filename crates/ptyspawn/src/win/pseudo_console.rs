// Adapted from wezterm (MIT license), Copyright (c) 2018-Present Wez Furlong.

use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle};
use std::path::Path;
use std::ptr;

use filedescriptor::{FileDescriptor, OwnedHandle};
use lazy_static::lazy_static;
use shared_library::shared_library;
use winapi::shared::minwindef::DWORD;
use winapi::shared::ntdef::NTSTATUS;
use winapi::shared::ntstatus::STATUS_SUCCESS;
use winapi::shared::winerror::{HRESULT, S_OK};
use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::processthreadsapi::{CreateProcessW, PROCESS_INFORMATION};
use winapi::um::winbase::{
    CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT,
    STARTF_USESTDHANDLES, STARTUPINFOEXW,
};
use winapi::um::wincon::COORD;
use winapi::um::winnt::{HANDLE, OSVERSIONINFOW};

use super::handles::{ProcessHandles, SuspendedProcess};
use super::proc_thread_attr::ProcThreadAttributeList;
use crate::command::Command;
use crate::error::{PtyError, Result};
use crate::options::WinSize;

pub(crate) type HPCON = HANDLE;

const PSEUDOCONSOLE_RESIZE_QUIRK: DWORD = 0x2;

// First Windows 10 build with CreatePseudoConsole (October 2018 update).
const MIN_CONPTY_BUILD: u32 = 17_763;

shared_library!(ConPtyFuncs,
    pub fn CreatePseudoConsole(
        size: COORD,
        hInput: HANDLE,
        hOutput: HANDLE,
        flags: DWORD,
        hpc: *mut HPCON
    ) -> HRESULT,
    pub fn ResizePseudoConsole(hpc: HPCON, size: COORD) -> HRESULT,
    pub fn ClosePseudoConsole(hpc: HPCON),
);

shared_library!(Ntdll,
    pub fn RtlGetVersion(
        version_info: *mut OSVERSIONINFOW
    ) -> NTSTATUS,
);

struct ConPtyLibrary {
    funcs: ConPtyFuncs,
    sideloaded: bool,
}

fn open_conpty() -> std::result::Result<ConPtyLibrary, String> {
    // A conpty.dll next to the executable carries fixes the system copy
    // lacks, so it takes precedence.
    if let Ok(funcs) = ConPtyFuncs::open(Path::new("conpty.dll")) {
        return Ok(ConPtyLibrary {
            funcs,
            sideloaded: true,
        });
    }
    ConPtyFuncs::open(Path::new("kernel32.dll"))
        .map(|funcs| ConPtyLibrary {
            funcs,
            sideloaded: false,
        })
        .map_err(|err| format!("cannot load pseudo console functions: {err}"))
}

lazy_static! {
    static ref CONPTY: std::result::Result<ConPtyLibrary, String> = open_conpty();
}

fn conpty() -> Result<&'static ConPtyFuncs> {
    CONPTY
        .as_ref()
        .map(|lib| &lib.funcs)
        .map_err(|err| PtyError::setup("load pseudo console", io::Error::other(err.clone())))
}

/// Loads the pseudo-console entry points, reporting why they are missing.
pub fn load_conpty() -> std::result::Result<(), String> {
    CONPTY.as_ref().map(|_| ()).map_err(Clone::clone)
}

/// Whether the loaded pseudo console is a sideloaded `conpty.dll`.
pub(crate) fn conpty_sideloaded() -> bool {
    CONPTY.as_ref().map_or(false, |lib| lib.sideloaded)
}

/// Whether this Windows build ships a pseudo console.
pub fn conpty_supported() -> bool {
    windows_build_number().is_some_and(|build| build >= MIN_CONPTY_BUILD)
}

fn windows_build_number() -> Option<u32> {
    let ntdll = Ntdll::open(Path::new("ntdll.dll")).ok()?;
    let mut info: OSVERSIONINFOW = unsafe { mem::zeroed() };
    info.dwOSVersionInfoSize = mem::size_of::<OSVERSIONINFOW>() as u32;
    let status = unsafe { (ntdll.RtlGetVersion)(&mut info) };
    if status == STATUS_SUCCESS {
        Some(info.dwBuildNumber)
    } else {
        None
    }
}

fn coord(size: WinSize) -> COORD {
    COORD {
        X: size.cols().min(i16::MAX as u16) as i16,
        Y: size.rows().min(i16::MAX as u16) as i16,
    }
}

fn hresult_error(result: HRESULT) -> io::Error {
    io::Error::other(format!("HRESULT {result:#010x}"))
}

/// An open pseudo console. Closed exactly once, on drop.
pub(crate) struct PseudoConsole {
    con: HPCON,
}

unsafe impl Send for PseudoConsole {}
unsafe impl Sync for PseudoConsole {}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        if let Ok(funcs) = conpty() {
            unsafe { (funcs.ClosePseudoConsole)(self.con) };
        }
    }
}

impl PseudoConsole {
    /// Creates a console that reads the child's input from `input` and
    /// writes its output to `output`.
    pub(crate) fn new(size: WinSize, input: &FileDescriptor, output: &FileDescriptor) -> Result<Self> {
        let funcs = conpty()?;
        let mut con: HPCON = INVALID_HANDLE_VALUE;
        let result = unsafe {
            (funcs.CreatePseudoConsole)(
                coord(size),
                input.as_raw_handle() as _,
                output.as_raw_handle() as _,
                PSEUDOCONSOLE_RESIZE_QUIRK,
                &mut con,
            )
        };
        if result != S_OK {
            return Err(PtyError::setup("CreatePseudoConsole", hresult_error(result)));
        }
        Ok(Self { con })
    }

    pub(crate) fn resize(&self, size: WinSize) -> Result<()> {
        let funcs = conpty()?;
        let result = unsafe { (funcs.ResizePseudoConsole)(self.con, coord(size)) };
        if result != S_OK {
            return Err(PtyError::Resize {
                size,
                source: hresult_error(result),
            });
        }
        Ok(())
    }

    /// Creates the child attached to this console, suspended before its
    /// first instruction.
    pub(crate) fn spawn_suspended(
        &self,
        command: &Command,
        env: &[(OsString, OsString)],
        dir: Option<&Path>,
    ) -> Result<SuspendedProcess> {
        let mut si: STARTUPINFOEXW = unsafe { mem::zeroed() };
        si.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        si.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        si.StartupInfo.hStdInput = INVALID_HANDLE_VALUE;
        si.StartupInfo.hStdOutput = INVALID_HANDLE_VALUE;
        si.StartupInfo.hStdError = INVALID_HANDLE_VALUE;

        let mut attrs = ProcThreadAttributeList::with_capacity(1)?;
        attrs.set_pseudo_console(self.con)?;
        si.lpAttributeList = attrs.as_mut_ptr();

        let command_line = command.to_command_line();
        if command_line.contains('\0') {
            return Err(PtyError::setup(
                "CreateProcessW",
                io::Error::new(io::ErrorKind::InvalidInput, "command line contains NUL"),
            ));
        }
        let mut cmdline = wide_nul(OsStr::new(&command_line));
        let mut env_block = environment_block(env);
        let cwd = dir.map(current_directory);

        let mut pi: PROCESS_INFORMATION = unsafe { mem::zeroed() };
        let res = unsafe {
            CreateProcessW(
                ptr::null(),
                cmdline.as_mut_ptr(),
                ptr::null_mut(),
                ptr::null_mut(),
                0,
                EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT | CREATE_SUSPENDED,
                env_block.as_mut_ptr() as *mut _,
                cwd.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
                &mut si.StartupInfo,
                &mut pi,
            )
        };
        if res == 0 {
            let err = io::Error::last_os_error();
            log::error!("CreateProcessW `{command_line}` in {dir:?} failed: {err}");
            return Err(PtyError::setup(format!("CreateProcessW `{command_line}`"), err));
        }

        let handles = unsafe {
            ProcessHandles {
                process: OwnedHandle::from_raw_handle(pi.hProcess as _),
                thread: OwnedHandle::from_raw_handle(pi.hThread as _),
            }
        };
        Ok(SuspendedProcess::new(handles, pi.dwProcessId))
    }
}

fn wide_nul(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(Some(0)).collect()
}

fn current_directory(dir: &Path) -> Vec<u16> {
    if dir.is_relative() {
        if let Ok(current) = env::current_dir() {
            return wide_nul(current.join(dir).as_os_str());
        }
    }
    wide_nul(dir.as_os_str())
}

// CreateProcessW wants names sorted without regard to case. A name given
// twice in different case keeps its last value.
fn environment_block(env: &[(OsString, OsString)]) -> Vec<u16> {
    let mut sorted: BTreeMap<String, (&OsStr, &OsStr)> = BTreeMap::new();
    for (key, value) in env {
        sorted.insert(key.to_string_lossy().to_uppercase(), (key, value));
    }
    let mut block = Vec::new();
    for (key, value) in sorted.into_values() {
        block.extend(key.encode_wide());
        block.push(b'=' as u16);
        block.extend(value.encode_wide());
        block.push(0);
    }
    if env.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_build_number() {
        let version = windows_build_number().unwrap();
        assert!(version > 0);
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    #[test]
    fn test_environment_block_layout() {
        let block = String::from_utf16(&environment_block(&vars(&[("A", "1"), ("B", "2")]))).unwrap();
        assert_eq!(block, "A=1\0B=2\0\0");

        assert_eq!(environment_block(&[]), vec![0, 0]);
    }

    #[test]
    fn test_environment_block_ignores_case() {
        let env = vars(&[("b", "2"), ("Path", "x"), ("A", "1"), ("PATH", "y"), ("_Z", "3")]);
        let block = String::from_utf16(&environment_block(&env)).unwrap();
        assert_eq!(block, "A=1\0b=2\0PATH=y\0_Z=3\0\0");
    }
}
