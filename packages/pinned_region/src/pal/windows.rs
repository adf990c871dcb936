use std::ffi::c_void;
use std::io;

use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE,
    VirtualAlloc2, VirtualFree,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::pal::Bindings;

/// FFI bindings that target the real operating system that the build is targeting.
///
/// You would only use different bindings in PAL unit tests that need to use mock bindings.
/// Even then, whenever possible, unit tests should use real bindings for maximum realism.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetBindings;

impl Bindings for BuildTargetBindings {
    fn allocation_granularity(&self) -> usize {
        let mut system_info = SYSTEM_INFO::default();

        // SAFETY: No safety requirements beyond passing a valid out-pointer.
        unsafe { GetSystemInfo(&mut system_info) };

        system_info.dwAllocationGranularity as usize
    }

    fn reserve(&self, len: usize) -> Result<*mut u8, io::Error> {
        // Reserving claims address space only; no physical pages are used
        // until a prefix is committed.
        // SAFETY: No safety requirements beyond passing valid arguments.
        let ptr = unsafe { VirtualAlloc2(None, None, len, MEM_RESERVE, PAGE_NOACCESS.0, None) };

        if ptr.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr.cast())
        }
    }

    unsafe fn commit(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error> {
        // SAFETY: Caller guarantees the range lies within our reservation.
        let committed = unsafe {
            VirtualAlloc2(
                None,
                Some(ptr.cast_const().cast()),
                len,
                MEM_COMMIT,
                PAGE_READWRITE.0,
                None,
            )
        };

        if committed.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    unsafe fn decommit(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error> {
        // SAFETY: Caller guarantees the range is committed and unreferenced.
        unsafe { VirtualFree(ptr.cast::<c_void>(), len, MEM_DECOMMIT) }.map_err(io::Error::from)
    }

    unsafe fn release(&self, ptr: *mut u8, _len: usize) -> Result<(), io::Error> {
        // MEM_RELEASE requires a zero length; the whole reservation is freed.
        // SAFETY: Caller guarantees this is the base of the reservation.
        unsafe { VirtualFree(ptr.cast::<c_void>(), 0, MEM_RELEASE) }.map_err(io::Error::from)
    }
}
