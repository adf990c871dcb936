//! A `Vec`-like container whose elements never move.
//!
//! [`PinnedVec`] stores its elements in a virtual-memory region that reserves
//! its maximum size in address space up front and commits physical pages as
//! the vector grows. Growth therefore never reallocates: the address of
//! element 0 is fixed from the first insertion until the vector is dropped,
//! so raw pointers and interior references survive `push`, `reserve`,
//! `insert` after them, and `shrink_to_fit`.
//!
//! This is part of the [Folo project](https://github.com/folo-rs/folo) that
//! provides mechanisms for high-performance hardware-aware programming in Rust.
//!
//! # When to use this
//!
//! Use `PinnedVec` when something outside the vector holds pointers into it
//! while it grows: intrusive data structures, FFI callees, self-referential
//! arenas, lock-free readers. If nothing holds pointers across growth,
//! `Vec` is the better default - it has no address-space ceiling.
//!
//! # Example
//!
//! ```
//! use pinned_vec::PinnedVec;
//!
//! let mut log = PinnedVec::new();
//! log.push("first entry".to_string());
//!
//! // A raw pointer into the vector...
//! let entry = std::ptr::from_ref(&log[0]);
//!
//! // ...survives arbitrary growth.
//! for i in 0..10_000 {
//!     log.push(format!("entry {i}"));
//! }
//!
//! // SAFETY: Element 0 was never removed, so the pointer is still valid.
//! assert_eq!(unsafe { &*entry }, "first entry");
//! ```

mod builder;
mod pinned_vec;

pub use builder::*;
pub use pinned_vec::*;

pub use pinned_region::{AllocError, MaxSize};
