use std::cmp::Ordering;
use std::ptr::NonNull;

use crate::pal::{Bindings, BindingsFacade};
use crate::{AllocError, MaxSize, Result};

/// A growable region of virtual memory whose base address never changes.
///
/// Creating a region reserves `max_size` bytes of address space up front and
/// commits physical pages only for the prefix the caller asked for. Growing
/// and shrinking commit and decommit pages within that reservation, so the
/// base address is stable for the life of the region: raw pointers into the
/// committed prefix survive every [`resize()`][Self::resize].
///
/// The committed prefix `[base, base + committed_size())` is readable and
/// writable. The rest of the reservation has no physical backing and traps on
/// any access.
///
/// Sizes are rounded up to the platform allocation granularity, so
/// [`committed_size()`][Self::committed_size] may exceed what was asked for.
///
/// # Examples
///
/// ```
/// use pinned_region::{MaxSize, PinnedRegion};
///
/// let mut region = PinnedRegion::new(512, MaxSize::Normal)?;
///
/// let base = region.as_ptr();
/// let committed = region.committed_size();
///
/// // Doubling the committed size does not move the region.
/// region.resize(committed * 2)?;
/// assert_eq!(region.as_ptr(), base);
/// # Ok::<(), pinned_region::AllocError>(())
/// ```
#[derive(Debug)]
pub struct PinnedRegion {
    base: NonNull<u8>,

    /// Bytes currently backed by physical pages. Always a multiple of the
    /// allocation granularity and never more than `max_size`.
    committed: usize,

    /// The reservation length, fixed at creation.
    max_size: usize,

    granularity: usize,

    bindings: BindingsFacade,
}

// SAFETY: The region exclusively owns its reservation; the raw base pointer
// is just a handle to it and carries no thread affinity.
unsafe impl Send for PinnedRegion {}

// SAFETY: Shared references only observe bookkeeping; all mutation of the
// mapping goes through `&mut self`.
unsafe impl Sync for PinnedRegion {}

impl PinnedRegion {
    /// Creates a region with `initial_size` bytes committed (rounded up to the
    /// platform allocation granularity) inside a reservation of `max_size`.
    ///
    /// # Errors
    ///
    /// [`AllocError::MaxSizeExceeded`] if `initial_size` exceeds the ceiling;
    /// [`AllocError::Platform`] if the operating system refuses to reserve the
    /// address space or commit the initial prefix.
    pub fn new(initial_size: usize, max_size: MaxSize) -> Result<Self> {
        Self::with_bindings(initial_size, max_size, BindingsFacade::target())
    }

    pub(crate) fn with_bindings(
        initial_size: usize,
        max_size: MaxSize,
        bindings: BindingsFacade,
    ) -> Result<Self> {
        let granularity = bindings.allocation_granularity();
        assert!(
            granularity > 0,
            "platform reported a zero allocation granularity"
        );

        let max_size = round_up(max_size.bytes().get(), granularity);

        if initial_size > max_size {
            return Err(AllocError::MaxSizeExceeded {
                requested: initial_size,
                max_size,
            });
        }

        let base = bindings
            .reserve(max_size)
            .map_err(|source| AllocError::Platform { source })?;
        let base = NonNull::new(base).expect("reserve reported success with a null base address");

        let mut region = Self {
            base,
            committed: 0,
            max_size,
            granularity,
            bindings,
        };

        // Commit only the prefix we need immediately. If this fails, dropping
        // `region` releases the fresh reservation.
        region.resize(initial_size)?;

        Ok(region)
    }

    /// Commits or decommits pages so that `new_size` bytes (rounded up to the
    /// allocation granularity) are accessible. The base address is unchanged.
    ///
    /// Shrinking returns the tail's physical pages to the operating system;
    /// the affected addresses trap until committed again. Growing commits
    /// zero-initialized pages.
    ///
    /// # Errors
    ///
    /// [`AllocError::MaxSizeExceeded`] if `new_size` exceeds the ceiling;
    /// [`AllocError::Platform`] if the operating system refuses the commit or
    /// decommit. On error the region keeps its prior committed size and the
    /// reservation stays valid.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        if new_size > self.max_size {
            return Err(AllocError::MaxSizeExceeded {
                requested: new_size,
                max_size: self.max_size,
            });
        }

        let aligned = round_up(new_size, self.granularity);

        match aligned.cmp(&self.committed) {
            Ordering::Less => {
                let removed = self.committed.wrapping_sub(aligned);

                // SAFETY: `[base + aligned, base + committed)` lies within our
                // reservation and is committed; `&mut self` means no live
                // borrow of the storage exists.
                unsafe {
                    self.bindings
                        .decommit(self.base.as_ptr().add(aligned), removed)
                }
                .map_err(|source| AllocError::Platform { source })?;
            }
            Ordering::Greater => {
                let added = aligned.wrapping_sub(self.committed);

                // SAFETY: `[base + committed, base + aligned)` lies within our
                // reservation because `aligned <= max_size`.
                unsafe {
                    self.bindings
                        .commit(self.base.as_ptr().add(self.committed), added)
                }
                .map_err(|source| AllocError::Platform { source })?;
            }
            Ordering::Equal => {}
        }

        self.committed = aligned;

        Ok(())
    }

    /// The base address of the region. Stable for the life of the region.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// The base address of the region, for writing. Stable for the life of
    /// the region.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Bytes currently committed: readable, writable and physically backed.
    #[must_use]
    pub fn committed_size(&self) -> usize {
        self.committed
    }

    /// The reservation ceiling fixed at creation, after granularity rounding.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// The platform allocation granularity all sizes are rounded to.
    #[must_use]
    pub fn allocation_granularity(&self) -> usize {
        self.granularity
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        // SAFETY: `base`/`max_size` are exactly the reservation we created,
        // and dropping means no borrows of the storage remain.
        unsafe { self.bindings.release(self.base.as_ptr(), self.max_size) }
            .expect("releasing an owned address-space reservation must succeed");
    }
}

fn round_up(value: usize, granularity: usize) -> usize {
    value
        .div_ceil(granularity)
        .checked_mul(granularity)
        .expect("granularity-aligned size overflows usize")
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::pal::MockBindings;

    assert_impl_all!(PinnedRegion: Send, Sync, Debug);

    const GRANULARITY: usize = 4096;

    /// An address the mock hands out as the reservation base. Never
    /// dereferenced; mock-driven tests only exercise bookkeeping.
    const FAKE_BASE: *mut u8 = 0x10_0000 as *mut u8;

    fn mock_with_reservation() -> MockBindings {
        let mut mock = MockBindings::new();
        mock.expect_allocation_granularity()
            .return_const(GRANULARITY);
        mock.expect_reserve().returning(|_| Ok(FAKE_BASE));
        mock.expect_release().returning(|_, _| Ok(()));
        mock
    }

    #[test]
    fn create_commits_rounded_initial_size() {
        let mut mock = mock_with_reservation();
        mock.expect_commit()
            .withf(|ptr, len| *ptr == FAKE_BASE && *len == GRANULARITY)
            .times(1)
            .returning(|_, _| Ok(()));

        let region =
            PinnedRegion::with_bindings(512, MaxSize::Normal, BindingsFacade::from_mock(mock))
                .unwrap();

        assert_eq!(region.committed_size(), GRANULARITY);
        assert_eq!(region.as_ptr(), FAKE_BASE.cast_const());
    }

    #[test]
    fn create_with_zero_size_commits_nothing() {
        // No `expect_commit` - committing would panic the mock.
        let mock = mock_with_reservation();

        let region =
            PinnedRegion::with_bindings(0, MaxSize::Normal, BindingsFacade::from_mock(mock))
                .unwrap();

        assert_eq!(region.committed_size(), 0);
    }

    #[test]
    fn grow_commits_only_the_gap() {
        let mut mock = mock_with_reservation();
        mock.expect_commit()
            .withf(|ptr, len| *ptr == FAKE_BASE && *len == GRANULARITY)
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_commit()
            .withf(|ptr, len| {
                *ptr == FAKE_BASE.wrapping_add(GRANULARITY) && *len == 2 * GRANULARITY
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut region =
            PinnedRegion::with_bindings(GRANULARITY, MaxSize::Normal, BindingsFacade::from_mock(mock))
                .unwrap();

        region.resize(3 * GRANULARITY).unwrap();

        assert_eq!(region.committed_size(), 3 * GRANULARITY);
    }

    #[test]
    fn shrink_decommits_only_the_tail() {
        let mut mock = mock_with_reservation();
        mock.expect_commit().returning(|_, _| Ok(()));
        mock.expect_decommit()
            .withf(|ptr, len| {
                *ptr == FAKE_BASE.wrapping_add(GRANULARITY) && *len == 3 * GRANULARITY
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut region = PinnedRegion::with_bindings(
            4 * GRANULARITY,
            MaxSize::Normal,
            BindingsFacade::from_mock(mock),
        )
        .unwrap();

        region.resize(GRANULARITY).unwrap();

        assert_eq!(region.committed_size(), GRANULARITY);
    }

    #[test]
    fn resize_within_same_granule_is_a_noop() {
        let mut mock = mock_with_reservation();
        mock.expect_commit().times(1).returning(|_, _| Ok(()));

        let mut region =
            PinnedRegion::with_bindings(100, MaxSize::Normal, BindingsFacade::from_mock(mock))
                .unwrap();

        // Still within the first granule; no commit or decommit may happen.
        region.resize(GRANULARITY).unwrap();
        region.resize(1).unwrap();

        assert_eq!(region.committed_size(), GRANULARITY);
    }

    #[test]
    fn resize_beyond_max_size_is_rejected() {
        let mut mock = mock_with_reservation();
        mock.expect_commit().returning(|_, _| Ok(()));

        let mut region =
            PinnedRegion::with_bindings(GRANULARITY, MaxSize::Normal, BindingsFacade::from_mock(mock))
                .unwrap();

        let result = region.resize(region.max_size() + 1);

        assert!(matches!(result, Err(AllocError::MaxSizeExceeded { .. })));
        assert_eq!(region.committed_size(), GRANULARITY);
    }

    #[test]
    fn initial_size_beyond_max_size_is_rejected_before_reserving() {
        let mut mock = MockBindings::new();
        mock.expect_allocation_granularity()
            .return_const(GRANULARITY);
        // No `expect_reserve` - reserving would panic the mock.

        let result = PinnedRegion::with_bindings(
            MaxSize::Normal.bytes().get() + 1,
            MaxSize::Normal,
            BindingsFacade::from_mock(mock),
        );

        assert!(matches!(result, Err(AllocError::MaxSizeExceeded { .. })));
    }

    #[test]
    fn failed_grow_preserves_prior_state() {
        let mut mock = mock_with_reservation();
        mock.expect_commit()
            .withf(|_, len| *len == GRANULARITY)
            .returning(|_, _| Ok(()));
        mock.expect_commit()
            .withf(|_, len| *len != GRANULARITY)
            .returning(|_, _| Err(std::io::Error::from(std::io::ErrorKind::OutOfMemory)));

        let mut region =
            PinnedRegion::with_bindings(GRANULARITY, MaxSize::Normal, BindingsFacade::from_mock(mock))
                .unwrap();

        let result = region.resize(10 * GRANULARITY);

        assert!(matches!(result, Err(AllocError::Platform { .. })));
        assert_eq!(region.committed_size(), GRANULARITY);
    }

    #[test]
    fn failed_initial_commit_releases_the_reservation() {
        let mut mock = MockBindings::new();
        mock.expect_allocation_granularity()
            .return_const(GRANULARITY);
        mock.expect_reserve().returning(|_| Ok(FAKE_BASE));
        mock.expect_commit()
            .returning(|_, _| Err(std::io::Error::from(std::io::ErrorKind::OutOfMemory)));
        mock.expect_release()
            .withf(|ptr, _| *ptr == FAKE_BASE)
            .times(1)
            .returning(|_, _| Ok(()));

        let result =
            PinnedRegion::with_bindings(512, MaxSize::Normal, BindingsFacade::from_mock(mock));

        assert!(matches!(result, Err(AllocError::Platform { .. })));
    }
}
