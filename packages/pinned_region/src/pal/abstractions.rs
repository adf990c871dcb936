use std::fmt::Debug;
use std::io;

/// Bindings for the virtual-memory calls this crate makes into the operating system.
///
/// All PAL FFI calls must go through this trait, enabling them to be mocked.
///
/// The model is the reserve/commit split: a reservation claims a span of address
/// space without any physical backing, after which any prefix of it can be
/// committed (given physical pages and made accessible) or decommitted again.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Bindings: Debug + Send + Sync + 'static {
    /// The granularity to which reservation, commit and decommit lengths are aligned.
    fn allocation_granularity(&self) -> usize;

    /// Reserves `len` bytes of address space with no physical backing.
    ///
    /// The entire reserved span is inaccessible until committed.
    fn reserve(&self, len: usize) -> Result<*mut u8, io::Error>;

    /// Commits `[ptr, ptr + len)`, making it readable, writable and backed
    /// by physical pages on first touch.
    ///
    /// # Safety
    ///
    /// The range must lie entirely within a reservation previously returned
    /// by [`reserve()`][Self::reserve] on these bindings.
    unsafe fn commit(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error>;

    /// Decommits `[ptr, ptr + len)`, returning its physical pages to the
    /// operating system and making the range inaccessible. The address space
    /// itself remains reserved.
    ///
    /// # Safety
    ///
    /// The range must lie entirely within the committed part of a reservation
    /// previously returned by [`reserve()`][Self::reserve] on these bindings,
    /// and no live reference may point into it.
    unsafe fn decommit(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error>;

    /// Releases an entire reservation, committed or not.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must be exactly the base and length of a reservation
    /// previously returned by [`reserve()`][Self::reserve] on these bindings,
    /// and no live reference may point into it.
    unsafe fn release(&self, ptr: *mut u8, len: usize) -> Result<(), io::Error>;
}
