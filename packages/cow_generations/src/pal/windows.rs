use std::io;
use std::ptr::NonNull;

use windows::Win32::Foundation::{CloseHandle, EXCEPTION_ACCESS_VIOLATION, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::Diagnostics::Debug::{AddVectoredExceptionHandler, EXCEPTION_POINTERS};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MEM_RELEASE, MEM_REPLACE_PLACEHOLDER, MEM_RESERVE,
    MEM_RESERVE_PLACEHOLDER, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile3, PAGE_NOACCESS,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, UNMAP_VIEW_OF_FILE_FLAGS,
    UnmapViewOfFile, UnmapViewOfFile2, VIRTUAL_ALLOCATION_TYPE, VIRTUAL_FREE_TYPE, VirtualAlloc2,
    VirtualFree, VirtualProtect,
};
use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows::Win32::System::Threading::GetCurrentProcess;
use windows::core::PCWSTR;

use crate::pal::Protection;

/// VirtualFree's MEM_PRESERVE_PLACEHOLDER; splits a placeholder reservation.
const FREE_PRESERVE_PLACEHOLDER: VIRTUAL_FREE_TYPE = VIRTUAL_FREE_TYPE(0x0000_0002);

/// UnmapViewOfFile2's MEM_PRESERVE_PLACEHOLDER; keeps the slot reserved.
const UNMAP_PRESERVE_PLACEHOLDER: UNMAP_VIEW_OF_FILE_FLAGS = UNMAP_VIEW_OF_FILE_FLAGS(0x0000_0002);

/// The shared memory object all chunk views are drawn from: a pagefile-backed
/// file mapping, never touching a filesystem.
#[derive(Debug)]
pub(crate) struct Mapping {
    handle: HANDLE,
}

// SAFETY: A file mapping handle is process-global and freely usable from any
// thread.
unsafe impl Send for Mapping {}
// SAFETY: As above; all operations on the handle are kernel calls.
unsafe impl Sync for Mapping {}

impl Mapping {
    pub(crate) fn create(len: usize) -> io::Result<Self> {
        let high = u32::try_from(len >> 32).expect("mapping size exceeds 64 bits");
        let low = (len & 0xFFFF_FFFF) as u32;

        // SAFETY: INVALID_HANDLE_VALUE selects a pagefile-backed mapping.
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                high,
                low,
                PCWSTR::null(),
            )
        }
        .map_err(io::Error::from)?;

        Ok(Self { handle })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: We own the handle and nothing else closes it.
        unsafe { CloseHandle(self.handle) }.expect("closing an owned mapping handle must succeed");
    }
}

pub(crate) fn allocation_granularity() -> usize {
    let mut system_info = SYSTEM_INFO::default();

    // SAFETY: No safety requirements beyond passing a valid out-pointer.
    unsafe { GetSystemInfo(&mut system_info) };

    system_info.dwAllocationGranularity as usize
}

/// Reserves `len` bytes of placeholder address space that chunk views can
/// later be placed into.
pub(crate) fn reserve_placeholder(len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: No safety requirements beyond passing valid arguments.
    let ptr = unsafe {
        VirtualAlloc2(
            None,
            None,
            len,
            MEM_RESERVE | MEM_RESERVE_PLACEHOLDER,
            PAGE_NOACCESS.0,
            None,
        )
    };

    if ptr.is_null() {
        Err(io::Error::last_os_error())
    } else {
        Ok(NonNull::new(ptr.cast()).expect("checked for null above"))
    }
}

/// Splits a placeholder reservation into chunk-sized placeholders so each
/// chunk can be individually replaced by a view and re-protected.
///
/// # Safety
///
/// `base`/`total_len` must be exactly a reservation created by
/// [`reserve_placeholder()`] that has not been split or mapped yet.
pub(crate) unsafe fn split_placeholder(
    base: NonNull<u8>,
    total_len: usize,
    chunk_len: usize,
) -> io::Result<()> {
    let chunk_count = total_len / chunk_len;

    // Splitting the last chunk off an exactly-sized remainder is an error,
    // hence all but the last.
    for index in 0..chunk_count.saturating_sub(1) {
        // SAFETY: Each call carves one chunk off the front of the remaining
        // placeholder, which the caller guarantees is ours.
        unsafe {
            VirtualFree(
                base.as_ptr().add(index * chunk_len).cast(),
                chunk_len,
                MEM_RELEASE | FREE_PRESERVE_PLACEHOLDER,
            )
        }
        .map_err(io::Error::from)?;
    }

    Ok(())
}

/// Maps `len` bytes of the shared mapping at `offset` into the placeholder
/// slot at `at`, with the given protection.
///
/// # Safety
///
/// `[at, at + len)` must be a placeholder slot within a reservation of ours,
/// with no live reference into it.
pub(crate) unsafe fn map_chunk(
    mapping: &Mapping,
    offset: usize,
    at: NonNull<u8>,
    len: usize,
    protection: Protection,
) -> io::Result<()> {
    // SAFETY: Caller guarantees the slot is a placeholder of ours.
    let view = unsafe {
        MapViewOfFile3(
            mapping.handle,
            None,
            Some(at.as_ptr().cast_const().cast()),
            offset as u64,
            len,
            MEM_REPLACE_PLACEHOLDER,
            protection_flags(protection).0,
            None,
        )
    };

    if view.Value.is_null() {
        return Err(io::Error::last_os_error());
    }

    assert!(
        view.Value == at.as_ptr().cast(),
        "MEM_REPLACE_PLACEHOLDER mapped at an address other than the placeholder"
    );

    Ok(())
}

/// Maps `len` bytes of the shared mapping at `offset` at an address of the
/// kernel's choosing, read-write. Used as the scratch view when cloning a
/// chunk.
pub(crate) fn map_chunk_anywhere(
    mapping: &Mapping,
    offset: usize,
    len: usize,
) -> io::Result<NonNull<u8>> {
    // SAFETY: No safety requirements beyond passing valid arguments.
    let view = unsafe {
        MapViewOfFile3(
            mapping.handle,
            None,
            None,
            offset as u64,
            len,
            VIRTUAL_ALLOCATION_TYPE(0),
            PAGE_READWRITE.0,
            None,
        )
    };

    NonNull::new(view.Value.cast()).ok_or_else(io::Error::last_os_error)
}

/// Unmaps a scratch view created by [`map_chunk_anywhere()`].
///
/// # Safety
///
/// `at` must be exactly a view returned by [`map_chunk_anywhere()`], with no
/// live reference into it.
pub(crate) unsafe fn unmap_chunk_anywhere(at: NonNull<u8>, _len: usize) -> io::Result<()> {
    // SAFETY: Caller guarantees this is a scratch view we mapped.
    unsafe {
        UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
            Value: at.as_ptr().cast(),
        })
    }
    .map_err(io::Error::from)
}

/// Replaces the chunk view at `at` with a placeholder, keeping the address
/// range reserved for a subsequent [`map_chunk()`].
///
/// # Safety
///
/// `[at, at + len)` must currently hold a chunk view of ours, with no live
/// reference into it.
pub(crate) unsafe fn unmap_chunk_to_placeholder(at: NonNull<u8>, _len: usize) -> io::Result<()> {
    // SAFETY: Caller guarantees the range holds our view.
    unsafe {
        UnmapViewOfFile2(
            GetCurrentProcess(),
            MEMORY_MAPPED_VIEW_ADDRESS {
                Value: at.as_ptr().cast(),
            },
            UNMAP_PRESERVE_PLACEHOLDER,
        )
    }
    .map_err(io::Error::from)
}

/// Changes the protection of a mapped chunk.
///
/// # Safety
///
/// `[at, at + len)` must hold a chunk view of ours. Downgrading to read-only
/// additionally requires that no one writes through an existing borrow.
pub(crate) unsafe fn protect_chunk(
    at: NonNull<u8>,
    len: usize,
    protection: Protection,
) -> io::Result<()> {
    let mut old_protection = PAGE_PROTECTION_FLAGS::default();

    // SAFETY: Caller guarantees the range holds our view.
    unsafe {
        VirtualProtect(
            at.as_ptr().cast_const().cast(),
            len,
            protection_flags(protection),
            &mut old_protection,
        )
    }
    .map_err(io::Error::from)
}

/// Releases a generation's entire address range. Every chunk slot holds a
/// view (placeholders only exist transiently during creation and cloning),
/// and unmapping a view without preserving the placeholder frees its address
/// space.
///
/// # Safety
///
/// `base`/`len` must be exactly a fully mapped generation reservation, with
/// no live reference into it.
pub(crate) unsafe fn release_generation(
    base: NonNull<u8>,
    len: usize,
    chunk_len: usize,
) -> io::Result<()> {
    for index in 0..len / chunk_len {
        // SAFETY: Caller guarantees each chunk slot holds a view of ours.
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: base.as_ptr().add(index * chunk_len).cast(),
            })
        }
        .map_err(io::Error::from)?;
    }

    Ok(())
}

fn protection_flags(protection: Protection) -> PAGE_PROTECTION_FLAGS {
    match protection {
        Protection::ReadOnly => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
    }
}

/// Aborts the process after a page-table divergence. A vectored exception
/// handler runs on the faulting thread in ordinary context, so plain stderr
/// output is available here.
pub(crate) fn fatal(message: &str) -> ! {
    eprintln!("{message}");

    std::process::abort();
}

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// The `ExceptionInformation[0]` value identifying a write access violation.
const ACCESS_VIOLATION_WRITE: usize = 1;

/// Installs the process-wide fault handler. Vectored handlers form a chain
/// natively: returning `EXCEPTION_CONTINUE_SEARCH` passes faults this crate
/// does not own to whoever else is registered.
pub(crate) fn install_fault_handler() {
    // SAFETY: The handler is a plain function with the documented signature.
    let registration = unsafe { AddVectoredExceptionHandler(1, Some(fault_handler)) };

    assert!(
        !registration.is_null(),
        "installing the fault handler failed"
    );
}

unsafe extern "system" fn fault_handler(info: *mut EXCEPTION_POINTERS) -> i32 {
    // SAFETY: The OS hands us valid exception pointers.
    let record = unsafe { (*info).ExceptionRecord };

    if record.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    // SAFETY: Checked for null above.
    let record = unsafe { &*record };

    if record.ExceptionCode == EXCEPTION_ACCESS_VIOLATION
        && record.ExceptionInformation[0] == ACCESS_VIOLATION_WRITE
    {
        let address = record.ExceptionInformation[1];

        if crate::fault::repair_write_fault(address) {
            // Resuming re-executes the faulting write, which now succeeds.
            return EXCEPTION_CONTINUE_EXECUTION;
        }
    }

    EXCEPTION_CONTINUE_SEARCH
}
