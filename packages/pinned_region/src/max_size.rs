use std::num::NonZero;

use new_zealand::nz;

/// The address-space ceiling of a pinned allocation.
///
/// A pinned allocation must pick its maximum size up front because that is how
/// much address space it reserves. Virtual memory is big but not infinite, and
/// on mainstream 64-bit systems it is much smaller than the pointer width
/// suggests (64-bit Windows exposes 128 TiB per process, not 16 EiB), so the
/// ceiling also determines roughly how many allocations a process can have.
///
/// Reserved address space costs no physical memory; only committed pages do.
///
/// # Examples
///
/// ```
/// use pinned_region::{MaxSize, PinnedRegion};
///
/// let region = PinnedRegion::new(1024, MaxSize::Normal)?;
/// assert!(region.max_size() >= 1024);
/// # Ok::<(), pinned_region::AllocError>(())
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum MaxSize {
    /// 2^42 bytes (4 TiB). A process can probably only hold tens of
    /// allocations with this ceiling.
    Huge,

    /// 2^37 bytes (128 GiB). A process can probably hold hundreds of
    /// allocations with this ceiling.
    Large,

    /// 2^34 bytes (16 GiB). A process can probably hold thousands of
    /// allocations with this ceiling. This is the default.
    #[default]
    Normal,

    /// A caller-chosen ceiling, rounded up to the platform allocation
    /// granularity at creation time.
    Custom(NonZero<usize>),
}

impl MaxSize {
    const HUGE: NonZero<usize> = nz!(0x0000_0400_0000_0000);
    const LARGE: NonZero<usize> = nz!(0x0000_0020_0000_0000);
    const NORMAL: NonZero<usize> = nz!(0x0000_0004_0000_0000);

    /// The ceiling in bytes, before granularity rounding.
    #[must_use]
    pub fn bytes(self) -> NonZero<usize> {
        match self {
            Self::Huge => Self::HUGE,
            Self::Large => Self::LARGE,
            Self::Normal => Self::NORMAL,
            Self::Custom(bytes) => bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_selectors_are_powers_of_two() {
        assert_eq!(MaxSize::Huge.bytes().get(), 1_usize << 42);
        assert_eq!(MaxSize::Large.bytes().get(), 1_usize << 37);
        assert_eq!(MaxSize::Normal.bytes().get(), 1_usize << 34);
    }

    #[test]
    fn custom_passes_through() {
        let custom = MaxSize::Custom(nz!(12345));
        assert_eq!(custom.bytes().get(), 12345);
    }

    #[test]
    fn default_is_normal() {
        assert_eq!(MaxSize::default(), MaxSize::Normal);
    }
}
