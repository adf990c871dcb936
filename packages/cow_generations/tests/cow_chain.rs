//! A three-link chain: grandparent, parent, grandchild. Destroying the
//! middle link splices the chain, and copy-on-write keeps working across
//! the splice in both directions.
//!
//! One test per file; the runtime is process-wide.

#![cfg(not(miri))] // Miri cannot use the real operating system APIs.

use cow_generations::{Generation, chunk_size, setup, used_chunk_count};

#[test]
fn destroying_the_middle_link_splices_the_chain() {
    setup(64 * 1024 * 1024);

    let chunk = chunk_size();
    let size = chunk * 2;

    let mut oldest = Generation::new_root(size);
    oldest.as_mut_slice().fill(0x01);

    let middle = oldest.new_child();
    let mut newest = middle.new_child();

    // Three generations, two chunks of backing.
    assert_eq!(used_chunk_count(), 2);

    // Diverge the newest generation's first chunk.
    newest.as_mut_slice()[..chunk].fill(0x03);
    assert_eq!(used_chunk_count(), 3);

    assert!(oldest.as_slice().iter().all(|byte| *byte == 0x01));
    assert!(middle.as_slice().iter().all(|byte| *byte == 0x01));

    // Remove the middle link. Its first chunk was shared with `oldest`, its
    // second with everyone; nothing it held alone, so the count is flat.
    drop(middle);
    assert_eq!(used_chunk_count(), 3);

    // The spliced chain still copies on write: the second chunk is now
    // shared by `oldest` and `newest` directly.
    oldest.as_mut_slice()[chunk..].fill(0x11);
    assert_eq!(used_chunk_count(), 4);

    assert!(newest.as_slice()[chunk..].iter().all(|byte| *byte == 0x01));

    // And the other direction: `newest` is now the sole holder of the old
    // second chunk, so its write promotes in place.
    newest.as_mut_slice()[chunk..].fill(0x33);
    assert_eq!(used_chunk_count(), 4);

    assert!(oldest.as_slice()[..chunk].iter().all(|byte| *byte == 0x01));
    assert!(oldest.as_slice()[chunk..].iter().all(|byte| *byte == 0x11));
    assert!(newest.as_slice()[..chunk].iter().all(|byte| *byte == 0x03));
    assert!(newest.as_slice()[chunk..].iter().all(|byte| *byte == 0x33));

    drop(oldest);
    drop(newest);
    assert_eq!(used_chunk_count(), 0);
}
