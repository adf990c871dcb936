//! Growable virtual-memory regions whose base address never moves.
//!
//! The usual growable-buffer pattern reallocates on growth, invalidating
//! every outstanding pointer into the buffer. [`PinnedRegion`] avoids that by
//! splitting allocation into the two operations the virtual-memory hardware
//! already provides: it *reserves* a large span of address space once (which
//! costs no physical memory) and then *commits* physical pages into a prefix
//! of it on demand. Growth commits more pages; shrinkage decommits them; the
//! base address is fixed for the life of the region.
//!
//! This is part of the [Folo project](https://github.com/folo-rs/folo) that
//! provides mechanisms for high-performance hardware-aware programming in Rust.
//!
//! The trade-off is that every region must pick an address-space ceiling up
//! front via [`MaxSize`]; see its documentation for guidance. 64-bit address
//! spaces are assumed - the design spends address space freely to avoid
//! spending memory bandwidth on reallocation.
//!
//! Callers who want a typed container instead of raw bytes should use the
//! `pinned_vec` package, which layers a `Vec`-like API over this one.
//!
//! # Example
//!
//! ```
//! use pinned_region::{MaxSize, PinnedRegion};
//!
//! let mut region = PinnedRegion::new(4096, MaxSize::Normal)?;
//!
//! let base = region.as_mut_ptr();
//!
//! // SAFETY: The committed prefix is readable and writable.
//! unsafe { base.write(42) };
//!
//! // Grow to a megabyte. The write above stays where it was.
//! region.resize(1024 * 1024)?;
//!
//! // SAFETY: Still within the committed prefix.
//! assert_eq!(unsafe { base.read() }, 42);
//! # Ok::<(), pinned_region::AllocError>(())
//! ```

mod error;
mod max_size;
mod pal;
mod region;

pub use error::*;
pub use max_size::*;
pub use region::*;

const _: () = assert!(
    size_of::<usize>() >= 8,
    "this is not going to work without far more address space than you need"
);
