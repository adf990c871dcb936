//! Copy-on-write snapshots of memory regions, driven by the MMU.
//!
//! A [`Generation`] is a mapped byte buffer. Creating a child generation
//! snapshots it without copying anything: both generations map the same
//! physical chunks from one shared backing mapping, write-protected. The
//! first write to a shared chunk - in whichever generation - raises a fault
//! that the process-wide handler resolves by cloning just that chunk and
//! resuming the write. Unmodified data stays physically shared forever.
//!
//! This is part of the [Folo project](https://github.com/folo-rs/folo) that
//! provides mechanisms for high-performance hardware-aware programming in Rust.
//!
//! Generations form chains, not trees: each generation has at most one
//! child. Any link of a chain may be destroyed at any time; its neighbors
//! reconnect and chunks it held alone return to the shared mapping.
//!
//! [`setup()`] must run once per process before the first generation is
//! created, sized to the peak combined physical working set.
//!
//! # Example
//!
//! ```no_run
//! use cow_generations::{Generation, chunk_size, setup, used_chunk_count};
//!
//! setup(64 * 1024 * 1024);
//!
//! let mut state = Generation::new_root(4 * chunk_size());
//! state.as_mut_slice().fill(0xFE);
//!
//! // The snapshot is O(1): no bytes are copied, no chunks are consumed.
//! let mut snapshot = state.new_child();
//! assert_eq!(used_chunk_count(), 4);
//!
//! // Writing one byte clones exactly one chunk.
//! snapshot.as_mut_slice()[0] = 0xFF;
//! assert_eq!(used_chunk_count(), 5);
//!
//! assert_eq!(state.as_slice()[0], 0xFE);
//! assert_eq!(snapshot.as_slice()[0], 0xFF);
//! ```
//!
//! # Threading
//!
//! The runtime is process-wide and thread-safe: any number of threads may
//! write into their own generations concurrently, including generations of
//! the same chain. Concurrent faults on one chain serialize on the chain
//! root's lock.

mod fault;
mod generation;
mod pal;
mod runtime;

pub use generation::Generation;
pub use runtime::{align_to_chunk_size, chunk_size, setup, used_chunk_count};
