use std::ptr;

use crate::generation::chain_root;
use crate::pal::{self, Protection};
use crate::runtime::try_runtime;

/// Repairs a write-access violation at `address`, if it belongs to a live
/// generation. Returns `false` when the fault is not ours, in which case the
/// platform handler chains to whatever was installed before us.
///
/// This is the copy-on-write engine. It runs inside the platform fault
/// handler, which restricts it severely: no allocation, no unwinding, no
/// parking locks. Failures that would leave the page tables diverged from
/// the tracked state abort the process through [`pal::fatal()`].
pub(crate) fn repair_write_fault(address: usize) -> bool {
    // A fault before setup() cannot be ours.
    let Some(runtime) = try_runtime() else {
        return false;
    };

    let chunk_size = runtime.chunk_size();
    let chunk_address = (address / chunk_size) * chunk_size;

    let table = runtime.generations().read();

    let Some(generation) = table.find_containing(chunk_address) else {
        return false;
    };

    // Serialize against every other CoW transition in this chain. The table
    // lock is released only after the root mutex is held: destroy needs both
    // (in the same order), so the states we resolved stay live.
    // SAFETY: Liveness: found through the table while holding its lock.
    let state = unsafe { generation.state() };
    // SAFETY: We hold the table lock.
    let root = unsafe { chain_root(generation) };
    // SAFETY: Liveness: as above.
    let root_state = unsafe { root.state() };

    let root_guard = root_state.lock();
    drop(table);

    let k = (chunk_address - state.base_addr()) / chunk_size;
    let shared_chunk = state.backing_chunk(k);
    let slot = state.chunk_ptr(k, chunk_size);

    if runtime.share_count(shared_chunk) == 1 {
        // Sole holder: the read-only protection is left over from a share
        // that has since been destroyed. Promote in place.
        // SAFETY: The slot holds this generation's view of the chunk.
        if unsafe { pal::protect_chunk(slot, chunk_size, Protection::ReadWrite) }.is_err() {
            pal::fatal("cow_generations: failed to promote a sole-owner chunk to read-write");
        }
    } else {
        // Still shared: clone the chunk for this generation and leave the
        // others on the old one.
        let Some(fresh_chunk) = runtime.claim_chunk(0) else {
            pal::fatal(
                "cow_generations: the shared backing mapping is exhausted during copy-on-write",
            );
        };

        let Ok(scratch) =
            pal::map_chunk_anywhere(runtime.mapping(), fresh_chunk * chunk_size, chunk_size)
        else {
            pal::fatal("cow_generations: failed to map a scratch view of a fresh chunk");
        };

        // SAFETY: The faulted chunk is readable (only its writes trap) and
        // the scratch view is a disjoint, writable mapping of `chunk_size`
        // bytes.
        unsafe {
            ptr::copy_nonoverlapping(
                chunk_address as *const u8,
                scratch.as_ptr(),
                chunk_size,
            );
        }

        // SAFETY: Exactly the scratch view mapped above.
        if unsafe { pal::unmap_chunk_anywhere(scratch, chunk_size) }.is_err() {
            pal::fatal("cow_generations: failed to unmap the scratch view of a fresh chunk");
        }

        runtime.release_chunk(shared_chunk);
        state.set_backing_chunk(k, fresh_chunk);

        // Swap the slot over to the fresh chunk: back to a placeholder,
        // then map the clone read-write.
        // SAFETY: The slot holds this generation's view of the old chunk.
        if unsafe { pal::unmap_chunk_to_placeholder(slot, chunk_size) }.is_err() {
            pal::fatal("cow_generations: failed to detach a faulted chunk from its slot");
        }

        // SAFETY: The slot is the placeholder just restored above.
        if unsafe {
            pal::map_chunk(
                runtime.mapping(),
                fresh_chunk * chunk_size,
                slot,
                chunk_size,
                Protection::ReadWrite,
            )
        }
        .is_err()
        {
            pal::fatal("cow_generations: failed to map a cloned chunk into its slot");
        }
    }

    drop(root_guard);

    true
}
