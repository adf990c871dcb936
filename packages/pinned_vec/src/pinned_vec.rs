use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut, Range};
use std::ptr::NonNull;
use std::{cmp, fmt, ptr, slice};

use pinned_region::{AllocError, MaxSize, PinnedRegion};

use crate::PinnedVecBuilder;

/// A contiguous growable sequence whose elements never move.
///
/// `PinnedVec<T>` offers the familiar `Vec`-like surface with one additional
/// guarantee: growing the vector never relocates its storage. The backing
/// memory is a [`PinnedRegion`], which reserves its maximum size in address
/// space up front and commits physical pages as the vector grows. The address
/// of element 0 is therefore fixed from the first insertion until the vector
/// is dropped, and `&v[i]` stays at the same numeric address across any
/// operation that does not remove element `i` itself.
///
/// Specifically, [`reserve()`][Self::reserve], [`shrink_to_fit()`][Self::shrink_to_fit],
/// [`push()`][Self::push] and growth inside [`insert()`][Self::insert] are all
/// pointer-preserving, unlike their `Vec` counterparts. Operations that shift
/// elements ([`insert()`][Self::insert], [`remove()`][Self::remove],
/// [`erase()`][Self::erase]) change which *value* lives at an address, exactly
/// as they do for `Vec`; exchanging the contents of two vectors with
/// [`std::mem::swap`] exchanges the storage handles and thereby invalidates
/// pointers into both.
///
/// The price of pinning is an address-space ceiling chosen at construction
/// via [`MaxSize`] (default: 16 GiB of address space, which costs no memory
/// until committed). Use [`builder()`][Self::builder] to pick a different
/// ceiling. Capacity is counted in whole platform allocation granules, so
/// [`capacity()`][Self::capacity] is usually larger than requested.
///
/// # Examples
///
/// ```
/// use pinned_vec::PinnedVec;
///
/// let mut values = PinnedVec::new();
/// values.push(1_u64);
///
/// let first = std::ptr::from_ref(&values[0]);
///
/// for i in 2..10_000_u64 {
///     values.push(i);
/// }
///
/// // Ten thousand pushes later, the first element has not moved.
/// assert!(std::ptr::eq(first, &values[0]));
/// ```
pub struct PinnedVec<T> {
    /// Created on the first growth so that `new()` is allocation-free,
    /// mirroring `Vec::new()`. Once created, its base address never changes.
    storage: Option<PinnedRegion>,

    len: usize,

    /// Remembered for deferred region creation.
    max_size: MaxSize,

    _items: PhantomData<T>,
}

impl<T> PinnedVec<T> {
    /// Creates an empty vector with the default address-space ceiling.
    ///
    /// Does not reserve or commit any memory until the first element is added.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_size(MaxSize::default())
    }

    /// Creates a builder for a vector with a custom configuration.
    pub fn builder() -> PinnedVecBuilder<T> {
        PinnedVecBuilder::new()
    }

    pub(crate) fn with_max_size(max_size: MaxSize) -> Self {
        assert!(
            size_of::<T>() > 0,
            "PinnedVec must have non-zero item size"
        );

        Self {
            storage: None,
            len: 0,
            max_size,
            _items: PhantomData,
        }
    }

    /// Creates a vector of `n` default-constructed elements.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized or the storage cannot be allocated.
    #[must_use]
    pub fn with_len(n: usize) -> Self
    where
        T: Default,
    {
        let mut vec = Self::new();
        vec.resize_with(n, T::default);
        vec
    }

    /// Creates a vector of `n` clones of `value`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized or the storage cannot be allocated.
    #[must_use]
    pub fn with_len_value(n: usize, value: T) -> Self
    where
        T: Clone,
    {
        let mut vec = Self::new();
        vec.resize(n, value);
        vec
    }

    /// The number of elements in the vector.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the vector contains no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of elements the vector can hold without committing more
    /// memory. Always a whole number of platform allocation granules.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage
            .as_ref()
            .map_or(0, |region| region.committed_size() / size_of::<T>())
    }

    /// The element-count ceiling implied by the address-space reservation.
    /// The vector can never grow beyond this.
    #[must_use]
    pub fn max_len(&self) -> usize {
        let max_bytes = self
            .storage
            .as_ref()
            .map_or_else(|| self.max_size.bytes().get(), PinnedRegion::max_size);

        max_bytes / size_of::<T>()
    }

    /// A pointer to element 0. Stable from the first insertion until the
    /// vector is dropped; dangling (but well-aligned) while the vector has
    /// never allocated.
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        match &self.storage {
            Some(region) => region.as_ptr().cast(),
            None => NonNull::<T>::dangling().as_ptr().cast_const(),
        }
    }

    /// A mutable pointer to element 0. Stable from the first insertion until
    /// the vector is dropped; dangling (but well-aligned) while the vector
    /// has never allocated.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut T {
        match &mut self.storage {
            Some(region) => region.as_mut_ptr().cast(),
            None => NonNull::<T>::dangling().as_ptr(),
        }
    }

    /// The elements as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: The first `len` slots are constructed and the storage
        // outlives the borrow.
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// The elements as a mutable slice.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.len;

        // SAFETY: The first `len` slots are constructed and `&mut self`
        // guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }

    /// Grows the committed capacity to at least `capacity` elements. Does
    /// nothing if the vector can already hold that many.
    ///
    /// Unlike `Vec::reserve`, the argument is the desired *total* capacity,
    /// not a count of additional elements - the region model makes total
    /// capacity the natural unit. Also unlike `Vec::reserve`, this never
    /// moves the data.
    ///
    /// # Errors
    ///
    /// [`AllocError::MaxSizeExceeded`] if `capacity` elements would not fit
    /// under the address-space ceiling; [`AllocError::Platform`] if the
    /// operating system refuses to provide memory. The vector is unchanged
    /// on error.
    pub fn try_reserve(&mut self, capacity: usize) -> Result<(), AllocError> {
        if capacity <= self.capacity() {
            return Ok(());
        }

        let bytes = capacity.saturating_mul(size_of::<T>());

        match &mut self.storage {
            Some(region) => region.resize(bytes),
            None => {
                let region = PinnedRegion::new(bytes, self.max_size)?;

                assert!(
                    align_of::<T>() <= region.allocation_granularity(),
                    "PinnedVec item alignment exceeds the platform allocation granularity"
                );

                self.storage = Some(region);
                Ok(())
            }
        }
    }

    /// Grows the committed capacity to at least `capacity` elements, like
    /// [`try_reserve()`][Self::try_reserve].
    ///
    /// # Panics
    ///
    /// Panics if the storage cannot be grown.
    pub fn reserve(&mut self, capacity: usize) {
        self.try_reserve(capacity)
            .unwrap_or_else(|error| panic!("failed to grow PinnedVec storage: {error}"));
    }

    /// Decommits capacity down to [`len()`][Self::len] elements, granularity
    /// permitting. The base address is unchanged.
    pub fn shrink_to_fit(&mut self) {
        let bytes = self.len.saturating_mul(size_of::<T>());

        if let Some(region) = &mut self.storage {
            region
                .resize(bytes)
                .unwrap_or_else(|error| panic!("failed to shrink PinnedVec storage: {error}"));
        }
    }

    /// Ensures room for `additional` more elements, applying the doubling
    /// growth policy when the committed capacity is exhausted.
    fn grow_for(&mut self, additional: usize) -> Result<(), AllocError> {
        let needed = self
            .len
            .checked_add(additional)
            .expect("PinnedVec length overflows usize");

        if needed <= self.capacity() {
            return Ok(());
        }

        let target = cmp::max(self.capacity().saturating_mul(2), needed);

        self.try_reserve(cmp::max(target, 1))
    }

    /// Appends an element.
    ///
    /// # Errors
    ///
    /// [`AllocError`] if the storage cannot be grown; the vector is
    /// unchanged on error.
    pub fn try_push(&mut self, value: T) -> Result<(), AllocError> {
        self.grow_for(1)?;

        // SAFETY: Slot `len` is within committed capacity and uninitialized.
        unsafe {
            self.as_mut_ptr().add(self.len).write(value);
        }

        self.len += 1;

        Ok(())
    }

    /// Appends an element.
    ///
    /// # Panics
    ///
    /// Panics if the storage cannot be grown.
    pub fn push(&mut self, value: T) {
        self.try_push(value)
            .unwrap_or_else(|error| panic!("failed to grow PinnedVec storage: {error}"));
    }

    /// Removes and returns the last element, if any.
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }

        self.len -= 1;

        // SAFETY: The slot was the last constructed element; decrementing
        // `len` first means nothing else will drop it.
        Some(unsafe { self.as_ptr().add(self.len).read() })
    }

    /// Inserts the values of an exact-size iterator at `index`, shifting the
    /// tail right.
    ///
    /// If producing a value panics mid-insertion, the tail is moved back down
    /// so the vector keeps the values inserted so far; every slot in
    /// `[0, len)` remains constructed.
    ///
    /// # Errors
    ///
    /// [`AllocError`] if the storage cannot be grown; the vector is
    /// unchanged on error.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()` or the iterator's exact length is wrong.
    pub fn try_insert_from_iter<I>(&mut self, index: usize, values: I) -> Result<(), AllocError>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        assert!(
            index <= self.len,
            "insertion index {index} out of bounds in PinnedVec of length {}",
            self.len
        );

        let mut values = values.into_iter();
        let count = values.len();

        if count == 0 {
            return Ok(());
        }

        self.grow_for(count)?;

        let old_len = self.len;
        let base = self.as_mut_ptr();

        // Open a gap of `count` slots at `index`.
        // SAFETY: Committed capacity covers `old_len + count` slots; the tail
        // elements are moved bitwise, which is how Rust values move.
        unsafe {
            ptr::copy(base.add(index), base.add(index + count), old_len - index);
        }

        // Until every gap slot is filled the vector is inconsistent, so the
        // bookkeeping is owned by a guard that repairs the gap on unwind.
        let mut guard = GapGuard {
            vec: self,
            index,
            count,
            filled: 0,
            old_len,
        };

        for slot in 0..count {
            let value = values
                .next()
                .expect("iterator produced fewer values than its reported exact length");

            // SAFETY: The gap slot is within committed capacity and currently
            // holds no constructed value.
            unsafe {
                guard.vec.as_mut_ptr().add(index + slot).write(value);
            }

            guard.filled += 1;
        }

        guard.complete();

        Ok(())
    }

    /// Inserts the values of an exact-size iterator at `index`, shifting the
    /// tail right, like [`try_insert_from_iter()`][Self::try_insert_from_iter].
    ///
    /// # Panics
    ///
    /// Panics if `index > len()` or the storage cannot be grown.
    pub fn insert_from_iter<I>(&mut self, index: usize, values: I)
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        self.try_insert_from_iter(index, values)
            .unwrap_or_else(|error| panic!("failed to grow PinnedVec storage: {error}"));
    }

    /// Inserts an element at `index`, shifting the tail right.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()` or the storage cannot be grown.
    pub fn insert(&mut self, index: usize, value: T) {
        self.insert_from_iter(index, std::iter::once(value));
    }

    /// Inserts clones of `values` at `index`, shifting the tail right.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()` or the storage cannot be grown.
    pub fn insert_slice(&mut self, index: usize, values: &[T])
    where
        T: Clone,
    {
        self.insert_from_iter(index, values.iter().cloned());
    }

    /// Removes and returns the element at `index`, shifting the tail left.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn remove(&mut self, index: usize) -> T {
        assert!(
            index < self.len,
            "removal index {index} out of bounds in PinnedVec of length {}",
            self.len
        );

        let base = self.as_mut_ptr();

        // SAFETY: The element is constructed; after the read the slot is
        // treated as uninitialized and immediately overwritten by the tail.
        let value = unsafe { base.add(index).read() };

        // SAFETY: Source and destination are within the constructed prefix.
        unsafe {
            ptr::copy(base.add(index + 1), base.add(index), self.len - index - 1);
        }

        self.len -= 1;

        value
    }

    /// Destroys the elements in `range`, shifting the tail left.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds or inverted.
    pub fn erase(&mut self, range: Range<usize>) {
        let Range { start, end } = range;

        assert!(
            start <= end && end <= self.len,
            "erase range {start}..{end} out of bounds in PinnedVec of length {}",
            self.len
        );

        if start == end {
            return;
        }

        let old_len = self.len;
        let removed = end - start;

        // Uncount the range (and, for now, the tail) before running drops so
        // a panicking drop cannot cause anything to drop twice. A panic here
        // leaks the tail, which mirrors what `Vec` does.
        self.len = start;

        let base = self.as_mut_ptr();

        // SAFETY: `[start, end)` are constructed and no longer counted.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(base.add(start), removed));
        }

        // SAFETY: The tail elements are moved bitwise into the erased range.
        unsafe {
            ptr::copy(base.add(end), base.add(start), old_len - end);
        }

        self.len = old_len - removed;
    }

    /// Shortens the vector to `new_len` elements, dropping the rest. Does
    /// nothing if the vector is already short enough. Capacity is unchanged.
    pub fn truncate(&mut self, new_len: usize) {
        if new_len >= self.len {
            return;
        }

        let removed = self.len - new_len;

        // Uncount before dropping; see `erase()`.
        self.len = new_len;

        // SAFETY: The removed slots are constructed and no longer counted.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                self.as_mut_ptr().add(new_len),
                removed,
            ));
        }
    }

    /// Removes all elements. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Resizes the vector to `new_len` elements, filling with values from `f`.
    ///
    /// # Errors
    ///
    /// [`AllocError`] if the storage cannot be grown; the vector is
    /// unchanged on error.
    pub fn try_resize_with(
        &mut self,
        new_len: usize,
        mut f: impl FnMut() -> T,
    ) -> Result<(), AllocError> {
        if new_len <= self.len {
            self.truncate(new_len);
            return Ok(());
        }

        self.grow_for(new_len - self.len)?;

        while self.len < new_len {
            // SAFETY: Slot `len` is within committed capacity and
            // uninitialized; incrementing `len` per element keeps the
            // constructed prefix exact even if `f` panics.
            unsafe {
                self.as_mut_ptr().add(self.len).write(f());
            }

            self.len += 1;
        }

        Ok(())
    }

    /// Resizes the vector to `new_len` elements, filling with values from `f`.
    ///
    /// # Panics
    ///
    /// Panics if the storage cannot be grown.
    pub fn resize_with(&mut self, new_len: usize, f: impl FnMut() -> T) {
        self.try_resize_with(new_len, f)
            .unwrap_or_else(|error| panic!("failed to grow PinnedVec storage: {error}"));
    }

    /// Resizes the vector to `new_len` elements, filling with clones of `value`.
    ///
    /// # Panics
    ///
    /// Panics if the storage cannot be grown.
    pub fn resize(&mut self, new_len: usize, value: T)
    where
        T: Clone,
    {
        self.resize_with(new_len, || value.clone());
    }
}

/// Repairs the element layout if producing a value panics while an insertion
/// gap is open: the tail is moved back down against the filled prefix, so the
/// vector keeps the values inserted so far and every counted slot is
/// constructed.
struct GapGuard<'v, T> {
    vec: &'v mut PinnedVec<T>,
    index: usize,
    count: usize,
    filled: usize,
    old_len: usize,
}

impl<T> GapGuard<'_, T> {
    /// Disarms the guard once every gap slot is filled and counts the
    /// inserted elements into the vector's length.
    fn complete(self) {
        debug_assert_eq!(self.filled, self.count);

        let mut this = ManuallyDrop::new(self);
        this.vec.len = this.old_len + this.count;
    }
}

impl<T> Drop for GapGuard<'_, T> {
    fn drop(&mut self) {
        let base = self.vec.as_mut_ptr();

        // SAFETY: The tail sits at `index + count`; the filled prefix of the
        // gap ends at `index + filled`. Both ranges are within committed
        // capacity and the move is bitwise.
        unsafe {
            ptr::copy(
                base.add(self.index + self.count),
                base.add(self.index + self.filled),
                self.old_len - self.index,
            );
        }

        self.vec.len = self.old_len + self.filled;
    }
}

impl<T> Drop for PinnedVec<T> {
    fn drop(&mut self) {
        let len = self.len;
        self.len = 0;

        // SAFETY: The first `len` slots are constructed; uncounting first
        // means a panicking element drop cannot cause a second drop.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.as_mut_ptr(), len));
        }

        // The region itself is released by its own drop.
    }
}

impl<T> Default for PinnedVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deref for PinnedVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> DerefMut for PinnedVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T> AsRef<[T]> for PinnedVec<T> {
    fn as_ref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> AsMut<[T]> for PinnedVec<T> {
    fn as_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: fmt::Debug> fmt::Debug for PinnedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<T: PartialEq> PartialEq for PinnedVec<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Eq> Eq for PinnedVec<T> {}

impl<T: Clone> Clone for PinnedVec<T> {
    fn clone(&self) -> Self {
        let mut clone = Self::with_max_size(self.max_size);
        clone.reserve(self.len);
        clone.extend(self.iter().cloned());
        clone
    }
}

impl<T> Extend<T> for PinnedVec<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push(value);
        }
    }
}

impl<T> FromIterator<T> for PinnedVec<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut vec = Self::new();
        vec.extend(iter);
        vec
    }
}

impl<'v, T> IntoIterator for &'v PinnedVec<T> {
    type Item = &'v T;
    type IntoIter = slice::Iter<'v, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'v, T> IntoIterator for &'v mut PinnedVec<T> {
    type Item = &'v mut T;
    type IntoIter = slice::IterMut<'v, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<T> IntoIterator for PinnedVec<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter { vec: self, next: 0 }
    }
}

/// An owning iterator over the elements of a [`PinnedVec`].
///
/// Elements not yet yielded are dropped with the iterator.
#[derive(Debug)]
pub struct IntoIter<T> {
    vec: PinnedVec<T>,
    next: usize,
}

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.next == self.vec.len {
            return None;
        }

        // SAFETY: Slot `next` is constructed and will never be read again;
        // our Drop skips the already-yielded prefix.
        let value = unsafe { self.vec.as_ptr().add(self.next).read() };
        self.next += 1;

        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.vec.len - self.next;
        (remaining, Some(remaining))
    }
}

impl<T> ExactSizeIterator for IntoIter<T> {}

impl<T> Drop for IntoIter<T> {
    fn drop(&mut self) {
        let remaining = self.vec.len - self.next;
        let start = self.next;

        // Uncount everything; the yielded prefix was moved out already.
        self.vec.len = 0;

        // SAFETY: `[start, start + remaining)` are the still-constructed
        // elements and nothing else will drop them.
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(
                self.vec.as_mut_ptr().add(start),
                remaining,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fmt::Debug;
    use std::rc::Rc;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(PinnedVec<u64>: Send, Sync, Debug);
    assert_not_impl_any!(PinnedVec<Rc<u8>>: Send, Sync);

    /// Counts live instances through a shared per-test counter, so tests can
    /// assert that every constructed element is dropped exactly once.
    #[derive(Debug)]
    struct Tracked {
        val: i32,
        live: Rc<Cell<i32>>,
    }

    impl Tracked {
        fn new(live: &Rc<Cell<i32>>, val: i32) -> Self {
            live.set(live.get() + 1);

            Self {
                val,
                live: Rc::clone(live),
            }
        }
    }

    impl Clone for Tracked {
        fn clone(&self) -> Self {
            Self::new(&self.live, self.val)
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.val = -1;
            self.live.set(self.live.get() - 1);
        }
    }

    fn counter() -> Rc<Cell<i32>> {
        Rc::new(Cell::new(0))
    }

    fn values(vec: &PinnedVec<Tracked>) -> Vec<i32> {
        vec.iter().map(|tracked| tracked.val).collect()
    }

    #[test]
    fn new_vec_is_empty_without_storage() {
        let vec = PinnedVec::<u64>::new();

        assert_eq!(vec.len(), 0);
        assert!(vec.is_empty());
        assert_eq!(vec.capacity(), 0);
    }

    #[test]
    #[should_panic]
    fn zero_sized_items_are_rejected() {
        drop(PinnedVec::<()>::new());
    }

    #[test]
    fn with_len_value_constructs_and_drops_every_element() {
        let live = counter();

        {
            let vec = PinnedVec::with_len_value(100, Tracked::new(&live, 7));

            assert_eq!(live.get(), 100);
            assert_eq!(vec.len(), 100);
            assert!(vec.capacity() >= 100);
            assert!(vec.iter().all(|tracked| tracked.val == 7));
        }

        assert_eq!(live.get(), 0);
    }

    #[test]
    fn incremental_resize_retains_values() {
        let live = counter();

        {
            let mut vec = PinnedVec::new();

            for i in 0..512 {
                vec.resize(usize::try_from(i + 1).unwrap(), Tracked::new(&live, i));

                assert_eq!(live.get(), i + 1);
                assert_eq!(vec.len(), usize::try_from(i + 1).unwrap());
            }

            for i in 0..512_usize {
                assert_eq!(vec[i].val, i32::try_from(i).unwrap());
            }
        }

        assert_eq!(live.get(), 0);
    }

    #[test]
    fn push_pop_round_trip() {
        let live = counter();
        let mut vec = PinnedVec::new();

        for i in 0..4 {
            vec.push(Tracked::new(&live, i));
        }

        assert_eq!(live.get(), 4);
        assert_eq!(values(&vec), [0, 1, 2, 3]);
        assert_eq!(vec.first().unwrap().val, 0);
        assert_eq!(vec.last().unwrap().val, 3);

        assert_eq!(vec.pop().unwrap().val, 3);
        assert_eq!(live.get(), 3);

        drop(vec.pop());
        drop(vec.pop());
        drop(vec.pop());

        assert_eq!(live.get(), 0);
        assert!(vec.pop().is_none());
    }

    #[test]
    fn clear_is_idempotent_and_reusable() {
        let live = counter();
        let mut vec = PinnedVec::new();

        vec.resize(100, Tracked::new(&live, 1));
        assert_eq!(live.get(), 100);

        vec.clear();
        assert_eq!(live.get(), 0);
        assert!(vec.is_empty());

        vec.clear();
        assert_eq!(live.get(), 0);

        vec.resize(100, Tracked::new(&live, 2));
        assert_eq!(live.get(), 100);

        vec.clear();
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn growth_does_not_move_elements() {
        let live = counter();
        let mut vec = PinnedVec::new();
        vec.push(Tracked::new(&live, 0));

        let base = vec.as_ptr();
        let first = std::ptr::from_ref(&vec[0]);
        let old_capacity = vec.capacity();

        let mut next = 1;
        while vec.capacity() == old_capacity {
            vec.push(Tracked::new(&live, next));
            next += 1;
        }

        for _ in 0..10 {
            vec.push(Tracked::new(&live, next));
            next += 1;
        }

        assert_eq!(vec.as_ptr(), base);
        assert!(std::ptr::eq(first, &vec[0]));

        assert_eq!(live.get(), next);
        assert_eq!(vec.len(), usize::try_from(next).unwrap());

        for i in 0..vec.len() {
            assert_eq!(vec[i].val, i32::try_from(i).unwrap());
        }
    }

    #[test]
    fn reserve_is_total_capacity_and_noop_when_satisfied() {
        let mut vec = PinnedVec::<u64>::new();

        vec.reserve(512);
        let capacity = vec.capacity();
        assert!(capacity >= 512);

        vec.reserve(10);
        assert_eq!(vec.capacity(), capacity);
    }

    #[test]
    fn shrink_to_fit_returns_expanded_capacity() {
        let mut vec = PinnedVec::new();
        vec.push(1_u64);

        let original_capacity = vec.capacity();
        while vec.capacity() == original_capacity {
            vec.push(0);
        }

        for _ in 0..10 {
            vec.push(0);
        }

        let expanded_capacity = vec.capacity();
        vec.truncate(original_capacity);

        assert_eq!(vec.capacity(), expanded_capacity);

        vec.shrink_to_fit();
        assert_eq!(vec.capacity(), original_capacity);
    }

    #[test]
    fn insert_at_begin_reverses_order() {
        let live = counter();

        {
            let mut vec = PinnedVec::new();

            for i in 0..4 {
                vec.insert(0, Tracked::new(&live, i));
            }

            assert_eq!(vec.len(), 4);
            assert_eq!(live.get(), 4);
            assert_eq!(values(&vec), [3, 2, 1, 0]);
        }

        assert_eq!(live.get(), 0);
    }

    #[test]
    fn insert_slice_in_middle_shifts_tail() {
        let live = counter();

        {
            let mut dest = PinnedVec::new();

            for i in 0..11 {
                dest.push(Tracked::new(&live, i));
            }

            {
                let mut source = PinnedVec::new();
                source.push(Tracked::new(&live, 21));
                source.push(Tracked::new(&live, 22));
                source.push(Tracked::new(&live, 23));

                dest.insert_slice(4, &source);
            }

            assert_eq!(dest.len(), 14);
            assert_eq!(live.get(), 14);
            assert_eq!(
                values(&dest),
                [0, 1, 2, 3, 21, 22, 23, 4, 5, 6, 7, 8, 9, 10]
            );
        }

        assert_eq!(live.get(), 0);
    }

    #[test]
    fn insert_from_iter_moves_values() {
        let live = counter();

        {
            let mut dest = PinnedVec::new();

            for i in 0..11 {
                dest.push(Tracked::new(&live, i));
            }

            let mut source = PinnedVec::new();
            source.push(Tracked::new(&live, 21));
            source.push(Tracked::new(&live, 22));
            source.push(Tracked::new(&live, 23));

            dest.insert_from_iter(4, source.into_iter());

            assert_eq!(dest.len(), 14);
            assert_eq!(live.get(), 14);
            assert_eq!(
                values(&dest),
                [0, 1, 2, 3, 21, 22, 23, 4, 5, 6, 7, 8, 9, 10]
            );
        }

        assert_eq!(live.get(), 0);
    }

    #[test]
    fn insert_then_erase_restores_contents() {
        let live = counter();
        let mut vec = PinnedVec::new();

        for i in 0..8 {
            vec.push(Tracked::new(&live, i));
        }

        let before = values(&vec);

        let extra = [
            Tracked::new(&live, 100),
            Tracked::new(&live, 101),
            Tracked::new(&live, 102),
        ];
        vec.insert_slice(3, &extra);
        drop(extra);

        assert_eq!(vec.len(), 11);

        vec.erase(3..6);

        assert_eq!(values(&vec), before);
        assert_eq!(live.get(), 8);
    }

    #[test]
    fn remove_shifts_tail_left() {
        let live = counter();
        let mut vec = PinnedVec::new();

        for i in 0..10 {
            vec.push(Tracked::new(&live, i));
        }

        assert_eq!(vec.remove(2).val, 2);
        assert_eq!(vec[2].val, 3);
        assert_eq!(live.get(), 9);

        assert_eq!(vec.remove(8).val, 9);
        assert_eq!(vec.last().unwrap().val, 8);
        assert_eq!(live.get(), 8);

        assert_eq!(vec.remove(0).val, 0);
        assert_eq!(vec[0].val, 1);
        assert_eq!(live.get(), 7);
    }

    #[test]
    fn erase_range_at_begin() {
        let live = counter();
        let mut vec = PinnedVec::new();

        for i in 0..10 {
            vec.push(Tracked::new(&live, i));
        }

        vec.erase(0..5);

        assert_eq!(vec.len(), 5);
        assert_eq!(vec[0].val, 5);
        assert_eq!(live.get(), 5);
    }

    #[test]
    fn erase_range_at_end() {
        let live = counter();
        let mut vec = PinnedVec::new();

        for i in 0..10 {
            vec.push(Tracked::new(&live, i));
        }

        vec.erase(5..10);

        assert_eq!(vec.len(), 5);
        assert_eq!(vec[4].val, 4);
        assert_eq!(live.get(), 5);
    }

    #[test]
    fn erase_range_in_middle() {
        let live = counter();
        let mut vec = PinnedVec::new();

        for i in 0..10 {
            vec.push(Tracked::new(&live, i));
        }

        vec.erase(2..5);

        assert_eq!(vec.len(), 7);
        assert_eq!(values(&vec), [0, 1, 5, 6, 7, 8, 9]);
        assert_eq!(live.get(), 7);
    }

    #[test]
    fn into_iter_yields_and_drops_remainder() {
        let live = counter();
        let mut vec = PinnedVec::new();

        for i in 0..5 {
            vec.push(Tracked::new(&live, i));
        }

        let mut iter = vec.into_iter();
        assert_eq!(iter.len(), 5);

        assert_eq!(iter.next().unwrap().val, 0);
        assert_eq!(iter.next().unwrap().val, 1);
        assert_eq!(live.get(), 3);

        drop(iter);
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn growth_past_the_ceiling_fails_and_preserves_state() {
        // A ceiling of one granule: after the first granule is committed,
        // any further growth must be refused.
        let mut vec = PinnedVec::<u64>::builder()
            .max_size(MaxSize::Custom(nz!(1)))
            .build();

        vec.push(0);

        let capacity = vec.capacity();
        assert_eq!(vec.max_len(), capacity);

        while vec.len() < capacity {
            vec.push(u64::try_from(vec.len()).unwrap());
        }

        let result = vec.try_push(u64::MAX);

        assert!(matches!(result, Err(AllocError::MaxSizeExceeded { .. })));
        assert_eq!(vec.len(), capacity);
        assert_eq!(vec[0], 0);
    }

    #[test]
    fn panicking_producer_leaves_consistent_prefix() {
        let live = counter();
        let mut vec = PinnedVec::new();

        for i in 0..6 {
            vec.push(Tracked::new(&live, i));
        }

        struct PanickyIter {
            live: Rc<Cell<i32>>,
            produced: i32,
        }

        impl Iterator for PanickyIter {
            type Item = Tracked;

            fn next(&mut self) -> Option<Tracked> {
                assert!(self.produced < 2, "producer failure");

                self.produced += 1;
                Some(Tracked::new(&self.live, 50 + self.produced))
            }

            fn size_hint(&self) -> (usize, Option<usize>) {
                (4, Some(4))
            }
        }

        impl ExactSizeIterator for PanickyIter {}

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            vec.insert_from_iter(
                2,
                PanickyIter {
                    live: Rc::clone(&live),
                    produced: 0,
                },
            );
        }))
        .is_err();

        assert!(panicked);

        // The two produced values were kept, the tail is intact, and every
        // counted element is constructed.
        assert_eq!(values(&vec), [0, 1, 51, 52, 2, 3, 4, 5]);
        assert_eq!(live.get(), 8);

        vec.clear();
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn clones_are_independent_but_equal() {
        let live = counter();
        let mut vec = PinnedVec::new();

        for i in 0..10 {
            vec.push(Tracked::new(&live, i));
        }

        let clone = vec.clone();

        assert_eq!(live.get(), 20);
        assert_eq!(values(&vec), values(&clone));
        assert_ne!(vec.as_ptr(), clone.as_ptr());
    }

    #[test]
    fn from_iterator_collects() {
        let vec = (0..100_u64).collect::<PinnedVec<_>>();

        assert_eq!(vec.len(), 100);
        assert_eq!(vec[99], 99);
    }

    #[test]
    fn swapping_vectors_exchanges_storage() {
        let mut left = PinnedVec::new();
        left.push(1_u64);

        let mut right = PinnedVec::new();
        right.push(2_u64);

        let left_base = left.as_ptr();
        let right_base = right.as_ptr();

        std::mem::swap(&mut left, &mut right);

        assert_eq!(left.as_ptr(), right_base);
        assert_eq!(right.as_ptr(), left_base);
        assert_eq!(left[0], 2);
        assert_eq!(right[0], 1);
    }
}
