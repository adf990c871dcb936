use std::{io, ptr};

use crate::pal::Bindings;

/// FFI bindings that target the real operating system that the build is targeting.
///
/// You would only use different bindings in PAL unit tests that need to use mock bindings.
/// Even then, whenever possible, unit tests should use real bindings for maximum realism.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetBindings;

impl Bindings for BuildTargetBindings {
    fn allocation_granularity(&self) -> usize {
        // SAFETY: No safety requirements.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        usize::try_from(page_size).expect("page size is a small positive integer on Linux")
    }

    fn reserve(&self, len: usize) -> Result<*mut u8, io::Error> {
        // PROT_NONE gives us a pure address-space reservation: no physical pages,
        // any access traps. MAP_NORESERVE opts the span out of swap accounting,
        // which matters when reserving terabytes.
        // SAFETY: No safety requirements beyond passing valid arguments.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr.cast())
        }
    }

    unsafe fn commit(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error> {
        // SAFETY: Caller guarantees the range lies within our reservation.
        let result = unsafe { libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_WRITE) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    unsafe fn decommit(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error> {
        // Flipping the protection alone would keep the physical pages around.
        // MADV_DONTNEED returns them to the kernel first.
        // SAFETY: Caller guarantees the range is committed and unreferenced.
        let result = unsafe { libc::madvise(ptr.cast(), len, libc::MADV_DONTNEED) };

        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: As above.
        let result = unsafe { libc::mprotect(ptr.cast(), len, libc::PROT_NONE) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    unsafe fn release(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error> {
        // SAFETY: Caller guarantees this is the exact base and length of the reservation.
        let result = unsafe { libc::munmap(ptr.cast(), len) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}
