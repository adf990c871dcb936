//! Platform Abstraction Layer (PAL). This is private API; all virtual-memory
//! and fault-handling syscalls made by this crate go through here.
//!
//! Unlike a mockable PAL, both implementations expose the same concrete
//! surface and are selected at compile time: the fault handler manipulates
//! process-global page tables, which no mock can meaningfully imitate, so
//! integration tests exercise the real platform instead.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;

#[cfg(not(any(target_os = "linux", windows)))]
compile_error!("cow_generations requires the virtual-memory facilities of Linux or Windows");

/// Access protection of a mapped chunk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Protection {
    /// Reads succeed; writes fault into the copy-on-write handler.
    ReadOnly,

    /// Reads and writes succeed.
    ReadWrite,
}
