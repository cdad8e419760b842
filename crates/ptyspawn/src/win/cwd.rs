//! Reads another process's current directory out of its PEB.

use std::ffi::OsString;
use std::io;
use std::mem::{self, MaybeUninit};
use std::os::windows::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::ptr;

use shared_library::shared_library;
use winapi::shared::ntdef::NTSTATUS;
use winapi::um::memoryapi::ReadProcessMemory;
use winapi::um::winnt::HANDLE;

use crate::error::{PtyError, Result};

const PROCESS_BASIC_INFORMATION_CLASS: u32 = 0;

#[cfg(target_pointer_width = "64")]
const PROCESS_PARAMETERS_OFFSET: usize = 0x20;
#[cfg(target_pointer_width = "64")]
const CURRENT_DIRECTORY_OFFSET: usize = 0x38;

#[cfg(target_pointer_width = "32")]
const PROCESS_PARAMETERS_OFFSET: usize = 0x10;
#[cfg(target_pointer_width = "32")]
const CURRENT_DIRECTORY_OFFSET: usize = 0x24;

shared_library!(NtQuery,
    pub fn NtQueryInformationProcess(
        process: HANDLE,
        class: u32,
        info: *mut ProcessBasicInformation,
        length: u32,
        return_length: *mut u32
    ) -> NTSTATUS,
);

#[repr(C)]
pub struct ProcessBasicInformation {
    exit_status: NTSTATUS,
    peb_base_address: usize,
    affinity_mask: usize,
    base_priority: i32,
    unique_process_id: usize,
    inherited_from_unique_process_id: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct UnicodeString {
    length: u16,
    maximum_length: u16,
    buffer: usize,
}

fn read_memory<T: Copy>(process: HANDLE, address: usize) -> io::Result<T> {
    let mut value = MaybeUninit::<T>::uninit();
    let mut read = 0usize;
    let ok = unsafe {
        ReadProcessMemory(
            process,
            address as *const _,
            value.as_mut_ptr() as *mut _,
            mem::size_of::<T>(),
            &mut read,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    if read != mem::size_of::<T>() {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    Ok(unsafe { value.assume_init() })
}

fn peb_address(process: HANDLE) -> io::Result<usize> {
    let ntdll = NtQuery::open(Path::new("ntdll.dll")).map_err(io::Error::other)?;
    let mut info: ProcessBasicInformation = unsafe { mem::zeroed() };
    let status = unsafe {
        (ntdll.NtQueryInformationProcess)(
            process,
            PROCESS_BASIC_INFORMATION_CLASS,
            &mut info,
            mem::size_of::<ProcessBasicInformation>() as u32,
            ptr::null_mut(),
        )
    };
    if status < 0 {
        return Err(io::Error::other(format!(
            "NtQueryInformationProcess returned {status:#010x}"
        )));
    }
    Ok(info.peb_base_address)
}

fn read_current_directory(process: HANDLE) -> io::Result<PathBuf> {
    let peb = peb_address(process)?;
    let parameters: usize = read_memory(process, peb + PROCESS_PARAMETERS_OFFSET)?;
    let dos_path: UnicodeString = read_memory(process, parameters + CURRENT_DIRECTORY_OFFSET)?;

    let units = dos_path.length as usize / 2;
    let mut wide = vec![0u16; units];
    let mut read = 0usize;
    let ok = unsafe {
        ReadProcessMemory(
            process,
            dos_path.buffer as *const _,
            wide.as_mut_ptr() as *mut _,
            units * 2,
            &mut read,
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    wide.truncate(read / 2);
    Ok(trim_separator(OsString::from_wide(&wide).into()))
}

// `C:\work\` names the same directory as `C:\work`; a drive root keeps it.
fn trim_separator(path: PathBuf) -> PathBuf {
    let trimmed = {
        let text = path.as_os_str().to_string_lossy();
        (text.len() > 3 && text.ends_with('\\')).then(|| PathBuf::from(&text[..text.len() - 1]))
    };
    trimmed.unwrap_or(path)
}

pub(crate) fn working_directory(process: HANDLE, pid: u32) -> Result<PathBuf> {
    read_current_directory(process)
        .map_err(|e| PtyError::query(format!("read working directory of process {pid}"), e))
}
