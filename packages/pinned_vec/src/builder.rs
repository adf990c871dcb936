use std::marker::PhantomData;

use pinned_region::MaxSize;

use crate::PinnedVec;

/// Builder for creating an instance of [`PinnedVec`].
///
/// You only need to use this builder if you want to customize the address-space
/// ceiling. The default configuration used by [`PinnedVec::new()`][1] is
/// sufficient for most use cases.
///
/// # Examples
///
/// ```
/// use pinned_vec::{MaxSize, PinnedVec};
///
/// let vec = PinnedVec::<u64>::builder()
///     .max_size(MaxSize::Huge)
///     .build();
/// # drop(vec);
/// ```
///
/// [1]: PinnedVec::new
#[must_use]
pub struct PinnedVecBuilder<T> {
    max_size: MaxSize,

    _items: PhantomData<T>,
}

impl<T> std::fmt::Debug for PinnedVecBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedVecBuilder")
            .field(
                "item_type",
                &std::format_args!("{}", std::any::type_name::<T>()),
            )
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl<T> PinnedVecBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            max_size: MaxSize::default(),
            _items: PhantomData,
        }
    }

    /// Sets the [address-space ceiling][MaxSize] for the vector's storage.
    ///
    /// The ceiling bounds how many elements the vector can ever hold; it is
    /// what makes a never-moving backing store possible, so it cannot be
    /// changed after the first element is stored.
    pub fn max_size(mut self, max_size: MaxSize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Builds the vector with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn build(self) -> PinnedVec<T> {
        PinnedVec::with_max_size(self.max_size)
    }
}
