//! Integration tests for `pinned_region` against the real platform.
//!
//! These exercise actual address-space reservations: every test writes
//! through the committed prefix and asserts that growth neither moves the
//! base address nor disturbs existing contents.

#![cfg(not(miri))] // Miri cannot use the real operating system APIs.

use pinned_region::{AllocError, MaxSize, PinnedRegion};

/// The committed prefix of `region`, as a byte slice.
fn committed_bytes(region: &mut PinnedRegion) -> &mut [u8] {
    // SAFETY: `[base, base + committed_size)` is readable and writable, and
    // we hold the only reference to the region.
    unsafe { std::slice::from_raw_parts_mut(region.as_mut_ptr(), region.committed_size()) }
}

fn fill_with_pattern(bytes: &mut [u8]) {
    for (index, byte) in bytes.iter_mut().enumerate() {
        *byte = (index % 256) as u8;
    }
}

fn assert_pattern(bytes: &[u8]) {
    for (index, byte) in bytes.iter().enumerate() {
        assert_eq!(*byte, (index % 256) as u8, "byte {index} was disturbed");
    }
}

#[test]
fn write_entire_committed_prefix() {
    let mut region = PinnedRegion::new(512, MaxSize::Huge).unwrap();
    assert!(region.committed_size() >= 512);

    fill_with_pattern(committed_bytes(&mut region));
}

#[test]
fn grow_preserves_contents_and_address() {
    let mut region = PinnedRegion::new(512, MaxSize::Large).unwrap();

    fill_with_pattern(committed_bytes(&mut region));

    let old_size = region.committed_size();
    let old_base = region.as_ptr();

    region.resize(old_size * 2).unwrap();

    assert_eq!(region.as_ptr(), old_base);
    assert!(region.committed_size() >= old_size * 2);

    assert_pattern(&committed_bytes(&mut region)[..old_size]);
}

#[test]
fn grow_from_empty() {
    let mut region = PinnedRegion::new(0, MaxSize::Normal).unwrap();
    assert_eq!(region.committed_size(), 0);

    region.resize(512).unwrap();
    assert!(region.committed_size() >= 512);

    fill_with_pattern(committed_bytes(&mut region));
}

#[test]
fn shrink_preserves_remaining_prefix() {
    let mut region = PinnedRegion::new(512, MaxSize::Huge).unwrap();
    region.resize(region.committed_size() * 2).unwrap();

    fill_with_pattern(committed_bytes(&mut region));

    let half = region.committed_size() / 2;
    region.resize(half).unwrap();

    assert_eq!(region.committed_size(), half);
    assert_pattern(committed_bytes(&mut region));
}

#[test]
fn shrink_then_regrow_yields_zeroed_tail() {
    let mut region = PinnedRegion::new(4096, MaxSize::Normal).unwrap();
    let size = region.committed_size();

    committed_bytes(&mut region).fill(0xAB);

    region.resize(0).unwrap();
    region.resize(size).unwrap();

    // Decommit returned the physical pages; recommitted pages read as zero.
    assert!(committed_bytes(&mut region).iter().all(|byte| *byte == 0));
}

#[test]
fn resize_beyond_max_size_reports_invalid_argument() {
    let mut region = PinnedRegion::new(0, MaxSize::Normal).unwrap();

    let result = region.resize(region.max_size() + 1);

    assert!(matches!(result, Err(AllocError::MaxSizeExceeded { .. })));
    assert_eq!(region.committed_size(), 0);
}
