//! Snapshotting a buffer with copy-on-write generations:
//!
//! * One-time runtime setup.
//! * Taking an O(1) snapshot of a filled buffer.
//! * Watching the used-chunk count as writes diverge the copies.

use cow_generations::{Generation, chunk_size, setup, used_chunk_count};

fn main() {
    setup(64 * 1024 * 1024);

    let chunk = chunk_size();

    let mut ledger = Generation::new_root(8 * chunk);
    ledger.as_mut_slice().fill(0xAA);

    println!(
        "filled a ledger of {} chunks; {} chunks of backing used",
        ledger.len() / chunk,
        used_chunk_count()
    );

    // The snapshot copies nothing - both generations share every chunk.
    let mut draft = ledger.new_child();

    println!("snapshot taken; still {} chunks used", used_chunk_count());

    // Writing into the draft clones only the chunks actually touched.
    draft.as_mut_slice()[..2 * chunk].fill(0xBB);

    println!(
        "wrote 2 chunks of the draft; {} chunks used",
        used_chunk_count()
    );

    assert_eq!(ledger.as_slice()[0], 0xAA);
    assert_eq!(draft.as_slice()[0], 0xBB);
    assert_eq!(draft.as_slice()[4 * chunk], 0xAA);

    drop(ledger);

    println!(
        "dropped the original; the draft still reads, {} chunks used",
        used_chunk_count()
    );

    assert_eq!(draft.as_slice()[0], 0xBB);
    assert_eq!(draft.as_slice()[4 * chunk], 0xAA);
}
