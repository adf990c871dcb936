use std::io;

use thiserror::Error;

/// Errors that can occur when creating or resizing a pinned allocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AllocError {
    /// The requested size exceeds the maximum size fixed when the allocation
    /// was created.
    ///
    /// The maximum is a hard ceiling: it determines how much address space was
    /// reserved, and a pinned allocation can never move to a larger reservation.
    #[error("requested {requested} bytes but the allocation's maximum size is {max_size} bytes")]
    MaxSizeExceeded {
        /// The size the caller asked for, in bytes.
        requested: usize,

        /// The ceiling fixed at creation, in bytes.
        max_size: usize,
    },

    /// The operating system refused to reserve, commit or decommit memory.
    #[error("the platform refused to provide memory: {source}")]
    Platform {
        /// The underlying operating system error.
        source: io::Error,
    },
}

/// A specialized `Result` type for pinned allocation operations, returning the
/// crate's [`AllocError`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, AllocError>;
