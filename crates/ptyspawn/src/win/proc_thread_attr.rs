// Adapted from wezterm (MIT license), Copyright (c) 2018-Present Wez Furlong.

use std::io;
use std::mem;
use std::ptr;

use winapi::shared::minwindef::DWORD;
use winapi::um::processthreadsapi::{
    DeleteProcThreadAttributeList, InitializeProcThreadAttributeList, UpdateProcThreadAttribute,
    LPPROC_THREAD_ATTRIBUTE_LIST,
};

use super::pseudo_console::HPCON;
use crate::error::{PtyError, Result};

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

/// Attribute list attaching a new process to a pseudo console.
pub(crate) struct ProcThreadAttributeList {
    data: Vec<u8>,
}

impl ProcThreadAttributeList {
    pub(crate) fn with_capacity(num_attributes: DWORD) -> Result<Self> {
        let mut bytes_required: usize = 0;
        // The sizing call always fails; it only reports the required size.
        unsafe {
            InitializeProcThreadAttributeList(
                ptr::null_mut(),
                num_attributes,
                0,
                &mut bytes_required,
            )
        };
        let mut data = vec![0u8; bytes_required];
        let attr_ptr = data.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST;
        let res = unsafe {
            InitializeProcThreadAttributeList(attr_ptr, num_attributes, 0, &mut bytes_required)
        };
        if res == 0 {
            return Err(PtyError::setup(
                "InitializeProcThreadAttributeList",
                io::Error::last_os_error(),
            ));
        }
        Ok(Self { data })
    }

    pub(crate) fn as_mut_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.data.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST
    }

    pub(crate) fn set_pseudo_console(&mut self, con: HPCON) -> Result<()> {
        let res = unsafe {
            UpdateProcThreadAttribute(
                self.as_mut_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                con,
                mem::size_of::<HPCON>(),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if res == 0 {
            return Err(PtyError::setup(
                "UpdateProcThreadAttribute",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

impl Drop for ProcThreadAttributeList {
    fn drop(&mut self) {
        unsafe { DeleteProcThreadAttributeList(self.as_mut_ptr()) };
    }
}
