use std::ffi::{c_int, c_void};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::OnceLock;
use std::{io, mem, ptr};

use crate::pal::Protection;

/// The shared memory object all chunk views are drawn from.
///
/// An anonymous memfd: file-backed as far as `mmap` is concerned, but it
/// never touches a filesystem and dies with the process.
#[derive(Debug)]
pub(crate) struct Mapping {
    fd: OwnedFd,
}

impl Mapping {
    pub(crate) fn create(len: usize) -> io::Result<Self> {
        // SAFETY: The name is NUL-terminated and only used for /proc listings.
        let fd = unsafe { libc::memfd_create(c"cow_generations".as_ptr(), libc::MFD_CLOEXEC) };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: memfd_create just handed us this descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let len = libc::off_t::try_from(len).expect("mapping size exceeds off_t");

        // SAFETY: No safety requirements beyond passing a valid descriptor.
        let result = unsafe { libc::ftruncate(fd.as_raw_fd(), len) };

        if result != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd })
    }
}

pub(crate) fn allocation_granularity() -> usize {
    // SAFETY: No safety requirements.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    usize::try_from(page_size).expect("page size is a small positive integer on Linux")
}

/// Reserves `len` bytes of address space that chunk views can later be
/// placed into. The whole span is inaccessible until then.
pub(crate) fn reserve_placeholder(len: usize) -> io::Result<NonNull<u8>> {
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
        Ok(NonNull::new(ptr.cast()).expect("mmap reported success with a null address"))
    }
}

/// Prepares a reservation for per-chunk replacement.
///
/// `MAP_FIXED` replaces any subrange of an existing mapping atomically, so
/// no explicit split step exists on Linux.
pub(crate) unsafe fn split_placeholder(
    _base: NonNull<u8>,
    _total_len: usize,
    _chunk_len: usize,
) -> io::Result<()> {
    Ok(())
}

/// Maps `len` bytes of the shared mapping at file offset `offset` into the
/// placeholder slot at `at`, with the given protection.
///
/// # Safety
///
/// `[at, at + len)` must lie within a reservation created by
/// [`reserve_placeholder()`] and currently hold either a placeholder or a
/// chunk view, with no live reference into it.
pub(crate) unsafe fn map_chunk(
    mapping: &Mapping,
    offset: usize,
    at: NonNull<u8>,
    len: usize,
    protection: Protection,
) -> io::Result<()> {
    let offset = libc::off_t::try_from(offset).expect("chunk offset exceeds off_t");

    // SAFETY: MAP_FIXED is exactly the dangerous tool for the job here; the
    // caller guarantees the target range is ours to replace.
    let ptr = unsafe {
        libc::mmap(
            at.as_ptr().cast(),
            len,
            protection_flags(protection),
            libc::MAP_SHARED | libc::MAP_FIXED,
            mapping.fd.as_raw_fd(),
            offset,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    assert!(
        ptr == at.as_ptr().cast(),
        "MAP_FIXED returned an address other than the one requested"
    );

    Ok(())
}

/// Maps `len` bytes of the shared mapping at file offset `offset` at an
/// address of the kernel's choosing, read-write. Used as the scratch view
/// when cloning a chunk.
pub(crate) fn map_chunk_anywhere(
    mapping: &Mapping,
    offset: usize,
    len: usize,
) -> io::Result<NonNull<u8>> {
    let offset = libc::off_t::try_from(offset).expect("chunk offset exceeds off_t");

    // SAFETY: No safety requirements beyond passing valid arguments.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            mapping.fd.as_raw_fd(),
            offset,
        )
    };

    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(NonNull::new(ptr.cast()).expect("mmap reported success with a null address"))
    }
}

/// Unmaps a scratch view created by [`map_chunk_anywhere()`].
///
/// # Safety
///
/// `at`/`len` must be exactly a view returned by [`map_chunk_anywhere()`],
/// with no live reference into it.
pub(crate) unsafe fn unmap_chunk_anywhere(at: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: Caller guarantees this is a scratch view we mapped.
    let result = unsafe { libc::munmap(at.as_ptr().cast(), len) };

    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Replaces the chunk view at `at` with an inaccessible placeholder, keeping
/// the address range reserved for a subsequent [`map_chunk()`].
///
/// # Safety
///
/// `[at, at + len)` must currently hold a chunk view of ours, with no live
/// reference into it.
pub(crate) unsafe fn unmap_chunk_to_placeholder(at: NonNull<u8>, len: usize) -> io::Result<()> {
    // SAFETY: Caller guarantees the range holds our view; MAP_FIXED replaces
    // it atomically, so the address space is never up for grabs in between.
    let ptr = unsafe {
        libc::mmap(
            at.as_ptr().cast(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
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
    // SAFETY: Caller guarantees the range holds our view.
    let result = unsafe { libc::mprotect(at.as_ptr().cast(), len, protection_flags(protection)) };

    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Releases a generation's entire address range: chunk views, placeholders
/// and all.
///
/// # Safety
///
/// `base`/`len` must be exactly a reservation created by
/// [`reserve_placeholder()`], with no live reference into it.
pub(crate) unsafe fn release_generation(
    base: NonNull<u8>,
    len: usize,
    _chunk_len: usize,
) -> io::Result<()> {
    // One munmap removes views and placeholders alike.
    // SAFETY: Caller guarantees this is the exact reservation.
    let result = unsafe { libc::munmap(base.as_ptr().cast(), len) };

    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn protection_flags(protection: Protection) -> c_int {
    match protection {
        Protection::ReadOnly => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

/// Aborts the process from a context where unwinding and allocation are off
/// the table. `write(2)` and `abort(2)` are async-signal-safe; formatting a
/// panic message is not.
pub(crate) fn fatal(message: &str) -> ! {
    // SAFETY: Passing a valid buffer to write(2).
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
        libc::write(libc::STDERR_FILENO, b"\n".as_ptr().cast(), 1);
    }

    std::process::abort();
}

struct SignalAction(libc::sigaction);

// SAFETY: A sigaction is a plain record of fn pointers, flags and a signal
// mask; it is only written once at installation.
unsafe impl Send for SignalAction {}
// SAFETY: As above.
unsafe impl Sync for SignalAction {}

static PRIOR_SEGV: OnceLock<SignalAction> = OnceLock::new();
static PRIOR_BUS: OnceLock<SignalAction> = OnceLock::new();

/// Installs the process-wide fault handler, saving any previously installed
/// handlers so that faults this crate does not own are forwarded to them.
pub(crate) fn install_fault_handler() {
    // SIGSEGV is what a write to a read-only chunk raises on Linux; SIGBUS
    // covers file-mapping edge cases on other POSIX systems and costs
    // nothing to route through the same path.
    install_for_signal(libc::SIGSEGV, &PRIOR_SEGV);
    install_for_signal(libc::SIGBUS, &PRIOR_BUS);
}

fn install_for_signal(signal: c_int, prior_slot: &'static OnceLock<SignalAction>) {
    // SAFETY: An all-zero sigaction is a valid starting point.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = fault_handler as usize;
    // SA_ONSTACK keeps us compatible with the runtime's sigaltstack-based
    // stack overflow reporting.
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;

    // SAFETY: The mask is a valid out-pointer.
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }

    // SAFETY: An all-zero sigaction is a valid out-parameter.
    let mut prior: libc::sigaction = unsafe { mem::zeroed() };

    // SAFETY: Valid in/out pointers.
    let result = unsafe { libc::sigaction(signal, &action, &mut prior) };
    assert!(result == 0, "installing the fault handler failed");

    assert!(
        prior_slot.set(SignalAction(prior)).is_ok(),
        "fault handler installed twice for the same signal"
    );
}

unsafe extern "C" fn fault_handler(
    signal: c_int,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    if fault_is_write_candidate(signal, info) {
        // SAFETY: The kernel hands us a valid siginfo for SA_SIGINFO handlers.
        let address = unsafe { (*info).si_addr() } as usize;

        if crate::fault::repair_write_fault(address) {
            // Returning re-executes the faulting write, which now succeeds.
            return;
        }
    }

    // Not ours; let whoever was installed before us have it.
    // SAFETY: Forwarding the values the kernel gave us.
    unsafe {
        chain_to_prior(signal, info, context);
    }
}

// Not exposed by the `libc` crate on Linux; value is fixed by the kernel ABI
// (see `siginfo_t` / `bits/siginfo-consts.h`).
const SEGV_ACCERR: c_int = 2;

fn fault_is_write_candidate(signal: c_int, info: *mut libc::siginfo_t) -> bool {
    if info.is_null() {
        return false;
    }

    // Chunks are always mapped readable, so an access-protection violation
    // (SEGV_ACCERR) inside a generation is necessarily a write. Mapping
    // faults (SEGV_MAPERR) can never be ours.
    // SAFETY: The kernel hands us a valid siginfo for SA_SIGINFO handlers.
    match signal {
        libc::SIGSEGV => (unsafe { (*info).si_code }) == SEGV_ACCERR,
        libc::SIGBUS => true,
        _ => false,
    }
}

/// Forwards a fault to the handler that was installed before ours, or
/// restores the default disposition so the process dies the normal way.
///
/// # Safety
///
/// Only callable from within the installed signal handler, with the values
/// the kernel provided.
unsafe fn chain_to_prior(signal: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let prior = match signal {
        libc::SIGSEGV => PRIOR_SEGV.get(),
        libc::SIGBUS => PRIOR_BUS.get(),
        _ => None,
    };

    if let Some(SignalAction(action)) = prior {
        let raw_handler = action.sa_sigaction;

        if raw_handler != libc::SIG_DFL && raw_handler != libc::SIG_IGN {
            if action.sa_flags & libc::SA_SIGINFO != 0 {
                // SAFETY: The prior registration declared this signature via
                // SA_SIGINFO.
                let prior_handler: unsafe extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
                    unsafe { mem::transmute(raw_handler) };

                // SAFETY: Forwarding the kernel-provided values.
                unsafe {
                    prior_handler(signal, info, context);
                }
            } else {
                // SAFETY: Without SA_SIGINFO the registered handler takes
                // only the signal number.
                let prior_handler: unsafe extern "C" fn(c_int) =
                    unsafe { mem::transmute(raw_handler) };

                // SAFETY: As above.
                unsafe {
                    prior_handler(signal);
                }
            }

            return;
        }
    }

    // No usable prior handler. Restore the default disposition and return;
    // the faulting instruction re-executes and the OS terminates the process
    // with the ordinary fault report.
    // SAFETY: An all-zero sigaction with SIG_DFL is valid; sigaction(2) is
    // async-signal-safe.
    unsafe {
        let mut default_action: libc::sigaction = mem::zeroed();
        default_action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(signal, &default_action, ptr::null_mut());
    }
}
