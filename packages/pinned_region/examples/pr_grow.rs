//! Growing a pinned region while holding a pointer into it.
//!
//! The base address is stable across every resize, so the pointer recorded
//! before growth is still valid - and still points at the same byte - after
//! the region has grown a thousandfold.

use pinned_region::{AllocError, MaxSize, PinnedRegion};

fn main() -> Result<(), AllocError> {
    let mut region = PinnedRegion::new(4096, MaxSize::Normal)?;

    let first_byte = region.as_mut_ptr();

    // SAFETY: The committed prefix is readable and writable.
    unsafe { first_byte.write(7) };

    println!(
        "created region at {first_byte:p} with {} bytes committed",
        region.committed_size()
    );

    region.resize(4096 * 1024)?;

    println!(
        "after growth to {} bytes the base is still {:p}",
        region.committed_size(),
        region.as_ptr()
    );

    // SAFETY: The committed prefix only grew; the first byte is untouched.
    assert_eq!(unsafe { first_byte.read() }, 7);

    Ok(())
}
