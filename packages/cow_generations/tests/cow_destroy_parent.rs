//! Destroying a generation must not disturb its survivors: the child keeps
//! its contents, and only the chunks the destroyed generation held alone are
//! returned to the mapping.
//!
//! One test per file; the runtime is process-wide.

#![cfg(not(miri))] // Miri cannot use the real operating system APIs.

use cow_generations::{Generation, chunk_size, setup, used_chunk_count};

#[test]
fn destroying_the_parent_keeps_the_child_intact() {
    setup(64 * 1024 * 1024);

    let size = chunk_size() * 4;

    let mut first = Generation::new_root(size);
    first.as_mut_slice().fill(0xFE);

    let mut second = first.new_child();
    second.as_mut_slice()[size / 2..].fill(0xFF);
    first.as_mut_slice()[..size / 2].fill(0x10);

    // Both halves diverged on one side each: 8 chunks total.
    assert_eq!(used_chunk_count(), 8);

    drop(first);

    // The parent's 4 chunks went away; the child still holds 4 (two it
    // inherited, two it cloned).
    assert_eq!(used_chunk_count(), 4);

    assert!(second.as_slice()[..size / 2].iter().all(|byte| *byte == 0xFE));
    assert!(second.as_slice()[size / 2..].iter().all(|byte| *byte == 0xFF));

    drop(second);
    assert_eq!(used_chunk_count(), 0);
}
