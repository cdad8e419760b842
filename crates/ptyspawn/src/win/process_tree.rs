//! Counts the processes attached to a child's pseudo console.
//!
//! A pseudo console is inherited by everything the child starts unless that
//! process is created detached, so its process list is the child's live
//! process tree. Asking the console itself would mean attaching the calling
//! process to it.

use std::collections::{HashMap, HashSet};
use std::io;
use std::mem;
use std::os::windows::io::{AsRawHandle, FromRawHandle};

use filedescriptor::OwnedHandle;
use winapi::um::handleapi::INVALID_HANDLE_VALUE;
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use winapi::um::winnt::HANDLE;

/// `(pid, parent pid)` of every running process.
fn snapshot() -> io::Result<Vec<(u32, u32)>> {
    let raw = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if raw == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    let snapshot = unsafe { OwnedHandle::from_raw_handle(raw as _) };
    let handle = snapshot.as_raw_handle() as HANDLE;

    let mut entry: PROCESSENTRY32W = unsafe { mem::zeroed() };
    entry.dwSize = mem::size_of::<PROCESSENTRY32W>() as u32;
    let mut processes = Vec::new();
    let mut more = unsafe { Process32FirstW(handle, &mut entry) };
    while more != 0 {
        processes.push((entry.th32ProcessID, entry.th32ParentProcessID));
        more = unsafe { Process32NextW(handle, &mut entry) };
    }
    Ok(processes)
}

/// Size of the process tree rooted at `root`, or 0 if `root` is gone.
fn tree_size(root: u32, processes: &[(u32, u32)]) -> usize {
    if !processes.iter().any(|&(pid, _)| pid == root) {
        return 0;
    }
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, parent) in processes {
        // The idle process lists itself as its own parent.
        if pid != parent {
            children.entry(parent).or_default().push(pid);
        }
    }
    let mut seen = HashSet::from([root]);
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        for &child in children.get(&pid).into_iter().flatten() {
            if seen.insert(child) {
                queue.push(child);
            }
        }
    }
    seen.len()
}

pub(crate) fn console_process_count(pid: u32) -> io::Result<usize> {
    Ok(tree_size(pid, &snapshot()?))
}
