use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::slice;

use spin::Mutex;

use crate::pal::{self, Protection};
use crate::runtime::{MAX_GENERATION_COUNT, runtime};

/// The bookkeeping for one live generation.
///
/// States are heap-allocated, published in the generation table and
/// referenced by raw handle from the public [`Generation`], the chain links
/// and the fault handler. The interior mutability discipline is:
///
/// * `parent`/`child` links change only while the table is locked
///   exclusively *and* the chain root's mutex is held.
/// * `chunk_map` entries change only under the chain root's mutex.
/// * A state is freed only after it has been unlinked and removed from the
///   table under both locks, so anyone who found it through the table and
///   then took the root mutex can keep using it.
pub(crate) struct GenerationState {
    base: NonNull<u8>,
    size: usize,

    parent: Cell<Option<GenerationHandle>>,
    child: Cell<Option<GenerationHandle>>,

    /// Only the chain root's mutex is ever locked; it serializes every
    /// copy-on-write transition anywhere in its chain.
    lock: Mutex<()>,

    /// `chunk_map[k]` is the index of the mapping chunk currently backing
    /// logical chunk `k` of this generation.
    chunk_map: Box<[Cell<usize>]>,
}

// SAFETY: All mutation of the Cell fields follows the lock protocol
// documented on the type; the raw pointers are plain addresses.
unsafe impl Send for GenerationState {}
// SAFETY: As above.
unsafe impl Sync for GenerationState {}

impl GenerationState {
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        let base = self.base_addr();

        addr >= base && addr < base + self.size
    }

    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub(crate) fn backing_chunk(&self, k: usize) -> usize {
        self.chunk_map[k].get()
    }

    pub(crate) fn set_backing_chunk(&self, k: usize, chunk: usize) {
        self.chunk_map[k].set(chunk);
    }

    pub(crate) fn parent(&self) -> Option<GenerationHandle> {
        self.parent.get()
    }

    /// The address of logical chunk `k`.
    pub(crate) fn chunk_ptr(&self, k: usize, chunk_size: usize) -> NonNull<u8> {
        debug_assert!(k * chunk_size < self.size);

        // SAFETY: In-bounds offset within the generation's reservation.
        unsafe { self.base.add(k * chunk_size) }
    }
}

impl fmt::Debug for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationState")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// A copyable untracked reference to a [`GenerationState`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct GenerationHandle(NonNull<GenerationState>);

// SAFETY: The handle is an address; dereferencing it is what carries the
// (documented, unsafe) obligations.
unsafe impl Send for GenerationHandle {}
// SAFETY: As above.
unsafe impl Sync for GenerationHandle {}

impl GenerationHandle {
    /// # Safety
    ///
    /// The generation must still be live: it is published in the table, or
    /// the caller holds locks that prevent its destruction (the table lock,
    /// or the chain root's mutex acquired while the table was locked), or
    /// the caller owns the [`Generation`] handle.
    pub(crate) unsafe fn state(self) -> &'static GenerationState {
        // SAFETY: Liveness guaranteed by the caller per the contract above.
        unsafe { self.0.as_ref() }
    }
}

/// Finds the root of `handle`'s chain by walking the parent links.
///
/// # Safety
///
/// The caller must hold the table lock (shared or exclusive) so that the
/// links are stable and every state on the path stays live.
pub(crate) unsafe fn chain_root(mut handle: GenerationHandle) -> GenerationHandle {
    loop {
        // SAFETY: Caller holds the table lock per our contract.
        let state = unsafe { handle.state() };

        match state.parent() {
            Some(parent) => handle = parent,
            None => return handle,
        }
    }
}

/// The table of live generations, capacity [`MAX_GENERATION_COUNT`].
#[derive(Debug)]
pub(crate) struct GenerationTable {
    slots: [Option<GenerationHandle>; MAX_GENERATION_COUNT],
}

impl GenerationTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [None; MAX_GENERATION_COUNT],
        }
    }

    /// # Panics
    ///
    /// Panics if the table is full.
    pub(crate) fn insert(&mut self, handle: GenerationHandle) {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .unwrap_or_else(|| {
                panic!("cannot hold more than {MAX_GENERATION_COUNT} live generations")
            });

        *slot = Some(handle);
    }

    /// Removes the generation based at `base`.
    ///
    /// # Panics
    ///
    /// Panics if no such generation is published, which would mean a
    /// double-destroy or corrupted bookkeeping.
    pub(crate) fn remove(&mut self, base: NonNull<u8>) -> GenerationHandle {
        let addr = base.as_ptr() as usize;

        let slot = self
            .slots
            .iter_mut()
            .find(|slot| {
                slot.is_some_and(|handle| {
                    // SAFETY: Published generations are live while we hold
                    // the exclusive table lock.
                    unsafe { handle.state() }.base_addr() == addr
                })
            })
            .expect("destroying a generation that is not live");

        slot.take().expect("matched slot cannot be empty")
    }

    /// The generation whose reservation contains `addr`, if any.
    pub(crate) fn find_containing(&self, addr: usize) -> Option<GenerationHandle> {
        self.slots.iter().flatten().copied().find(|handle| {
            // SAFETY: Published generations are live while the table lock is
            // held (the callers of this method all hold it).
            unsafe { handle.state() }.contains(addr)
        })
    }
}

/// One copy-on-write snapshot: a mapped byte buffer that shares unmodified
/// chunks with its parent and child generations.
///
/// Generations form a chain: a root created by
/// [`new_root()`][Self::new_root] and at most one child per generation,
/// created by [`new_child()`][Self::new_child]. Creating a child makes every
/// shared chunk read-only in all of its holders; the first write to a chunk
/// of any generation faults into the process-wide handler, which either
/// clones the chunk (if it is still shared) or re-enables writes in place
/// (if this generation is by then the sole holder). Reads never fault.
///
/// The buffer address is stable for the generation's lifetime. Dropping a
/// generation splices it out of its chain; parent and child reconnect and
/// the chunks it held alone are returned to the shared mapping.
///
/// [`setup()`][crate::setup] must have been called before any generation is
/// created.
///
/// # Examples
///
/// ```no_run
/// use cow_generations::{Generation, chunk_size, setup};
///
/// setup(64 * 1024 * 1024);
///
/// let mut first = Generation::new_root(4 * chunk_size());
/// first.as_mut_slice().fill(0xFE);
///
/// let mut snapshot = first.new_child();
///
/// // The snapshot shares all pages with `first` until one of them writes.
/// snapshot.as_mut_slice()[0] = 0xFF;
///
/// assert_eq!(first.as_slice()[0], 0xFE);
/// assert_eq!(snapshot.as_slice()[0], 0xFF);
/// ```
pub struct Generation {
    handle: GenerationHandle,
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: The generation exclusively owns its view of the shared chunks;
// cross-generation physical sharing is mediated by the fault handler, never
// by aliased references.
unsafe impl Send for Generation {}
// SAFETY: Shared references permit only reads of the buffer, which never
// fault and never race with a CoW transition reachable from a `&` method.
unsafe impl Sync for Generation {}

impl Generation {
    /// Creates a root generation of `size` bytes (rounded up to whole
    /// chunks), backed by freshly claimed chunks, writable, zero-filled.
    ///
    /// # Panics
    ///
    /// Panics if [`setup()`][crate::setup] has not run, if `size` is zero,
    /// if the generation table or the shared mapping is exhausted, or if the
    /// operating system refuses an operation.
    #[must_use]
    pub fn new_root(size: usize) -> Self {
        let runtime = runtime();
        let chunk_size = runtime.chunk_size();

        let size = runtime.align_to_chunk_size(size);
        assert!(size > 0, "a generation must span at least one chunk");

        let (base, handle) = reserve_and_prepare(size, chunk_size, None);

        // SAFETY: Liveness: we own the only handle; nothing is published yet.
        let state = unsafe { handle.state() };

        // A root is born unshared, so no lock is needed: nobody can fault on
        // these addresses before we hand the buffer out.
        let mut hint = 0;
        for k in 0..size / chunk_size {
            let chunk = runtime.claim_chunk(hint).unwrap_or_else(|| {
                panic!("the shared backing mapping is exhausted; pass a larger size to setup()")
            });
            hint = chunk;

            state.set_backing_chunk(k, chunk);

            // SAFETY: The slot is a placeholder in our fresh reservation.
            unsafe {
                pal::map_chunk(
                    runtime.mapping(),
                    chunk * chunk_size,
                    state.chunk_ptr(k, chunk_size),
                    chunk_size,
                    Protection::ReadWrite,
                )
            }
            .unwrap_or_else(|error| panic!("failed to map a fresh chunk: {error}"));
        }

        runtime.generations().write().insert(handle);

        Self { handle, base, size }
    }

    /// Creates a child generation: a snapshot of this one, of the same size.
    ///
    /// After this call both generations read the same contents, physically
    /// sharing every chunk. The first write to any shared chunk - in either
    /// generation - transparently clones it.
    ///
    /// # Panics
    ///
    /// Panics if this generation already has a child (each generation may
    /// have at most one), if the generation table is exhausted, or if the
    /// operating system refuses an operation.
    #[must_use]
    pub fn new_child(&self) -> Self {
        let runtime = runtime();
        let chunk_size = runtime.chunk_size();
        let size = self.size;

        let (base, child) = reserve_and_prepare(size, chunk_size, Some(self.handle));

        // SAFETY: Liveness: `self` keeps the parent alive.
        let parent_state = unsafe { self.handle.state() };

        // Publish the child and link it under the table lock, then do the
        // mapping work under the chain root's mutex only - the same order
        // the fault handler uses, so neither can deadlock the other.
        let mut table = runtime.generations().write();

        assert!(
            parent_state.child.get().is_none(),
            "a generation may have at most one child; this one is not a leaf"
        );

        // SAFETY: We hold the table lock.
        let root = unsafe { chain_root(self.handle) };
        // SAFETY: Liveness: published (or it is `self`, which we borrow).
        let root_state = unsafe { root.state() };

        let root_guard = root_state.lock();

        parent_state.child.set(Some(child));
        table.insert(child);
        drop(table);

        // SAFETY: Liveness: just published; destruction needs the root
        // mutex, which we hold.
        let child_state = unsafe { child.state() };

        for k in 0..size / chunk_size {
            let chunk = parent_state.backing_chunk(k);

            runtime.adopt_chunk(chunk);
            child_state.set_backing_chunk(k, chunk);

            let child_slot = child_state.chunk_ptr(k, chunk_size);

            // SAFETY: The slot is a placeholder in the child's fresh
            // reservation.
            unsafe {
                pal::map_chunk(
                    runtime.mapping(),
                    chunk * chunk_size,
                    child_slot,
                    chunk_size,
                    Protection::ReadWrite,
                )
            }
            .unwrap_or_else(|error| panic!("failed to map a shared chunk: {error}"));

            // Walk the chain and mark the chunk read-only in every
            // generation still backed by it, so the next write anywhere
            // faults and clones.
            let mut walker = Some(child);
            while let Some(handle) = walker {
                // SAFETY: Liveness: we hold the root mutex (and the states
                // on this path were found through live links).
                let state = unsafe { handle.state() };

                if state.backing_chunk(k) == chunk {
                    // SAFETY: The slot holds this generation's view of the
                    // chunk; making it read-only is what arms the CoW fault.
                    unsafe { pal::protect_chunk(state.chunk_ptr(k, chunk_size), chunk_size, Protection::ReadOnly) }
                        .unwrap_or_else(|error| panic!("failed to write-protect a shared chunk: {error}"));
                }

                walker = state.parent();
            }
        }

        drop(root_guard);

        Self {
            handle: child,
            base,
            size,
        }
    }

    /// The buffer length in bytes. Always a whole number of chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the buffer is empty. It never is; generations span at least
    /// one chunk.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The buffer's base address. Stable for the generation's lifetime.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr().cast_const()
    }

    /// The buffer's base address, for writing. Stable for the generation's
    /// lifetime. Writes may transparently fault into the copy-on-write
    /// handler.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// The buffer contents. Reads never fault.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: The whole buffer is mapped and at least readable for the
        // generation's lifetime, and `&self` rules out concurrent writes
        // through this generation.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.size) }
    }

    /// The buffer contents, writable. The first write to a still-shared
    /// chunk transparently clones it; neither the parent nor the child
    /// observes the write.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: The whole buffer is mapped for the generation's lifetime
        // and `&mut self` guarantees exclusivity; read-only protection is
        // repaired transparently by the fault handler.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.size) }
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        let runtime = runtime();
        let chunk_size = runtime.chunk_size();

        {
            let mut table = runtime.generations().write();

            // SAFETY: We hold the table lock.
            let root = unsafe { chain_root(self.handle) };
            // SAFETY: Liveness: published (or it is this generation).
            let root_state = unsafe { root.state() };

            let root_guard = root_state.lock();

            // Splice the chain: our parent and child become directly
            // connected.
            // SAFETY: Liveness: we own this generation.
            let state = unsafe { self.handle.state() };

            if let Some(parent) = state.parent.get() {
                // SAFETY: Liveness: linked generations are published.
                unsafe { parent.state() }.child.set(state.child.get());
            }

            if let Some(child) = state.child.get() {
                // SAFETY: As above.
                unsafe { child.state() }.parent.set(state.parent.get());
            }

            let removed = table.remove(self.base);
            debug_assert!(std::ptr::eq(
                // SAFETY: Just removed; still allocated.
                unsafe { removed.state() },
                state
            ));

            drop(root_guard);
        }

        // The generation is no longer reachable through the table, so no
        // fault handler can be using it; finish tearing down without locks.

        // SAFETY: The reservation is fully mapped and nothing references it.
        unsafe { pal::release_generation(self.base, self.size, chunk_size) }
            .unwrap_or_else(|error| panic!("failed to release a generation mapping: {error}"));

        for k in 0..self.size / chunk_size {
            // SAFETY: Liveness: the state is freed below, after this loop.
            let chunk = unsafe { self.handle.state() }.backing_chunk(k);
            runtime.release_chunk(chunk);
        }

        // SAFETY: The state was leaked at creation and is now unreachable:
        // unlinked, removed from the table, and this was the only handle.
        drop(unsafe { Box::from_raw(self.handle.0.as_ptr()) });
    }
}

/// Reserves the address range for a new generation, splits it into
/// chunk-sized placeholders and allocates its (unpublished) state.
fn reserve_and_prepare(
    size: usize,
    chunk_size: usize,
    parent: Option<GenerationHandle>,
) -> (NonNull<u8>, GenerationHandle) {
    let base = pal::reserve_placeholder(size)
        .unwrap_or_else(|error| panic!("failed to reserve a generation's address range: {error}"));

    // SAFETY: A fresh reservation, never split or mapped.
    unsafe { pal::split_placeholder(base, size, chunk_size) }
        .unwrap_or_else(|error| panic!("failed to split a generation's address range: {error}"));

    let chunk_map = (0..size / chunk_size)
        .map(|_| Cell::new(usize::MAX))
        .collect();

    let state = Box::new(GenerationState {
        base,
        size,
        parent: Cell::new(parent),
        child: Cell::new(None),
        lock: Mutex::new(()),
        chunk_map,
    });

    (base, GenerationHandle(NonNull::from(Box::leak(state))))
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Generation: Send, Sync, Debug);

    fn fake_state(addr: usize, size: usize) -> GenerationHandle {
        let state = Box::new(GenerationState {
            base: NonNull::new(addr as *mut u8).unwrap(),
            size,
            parent: Cell::new(None),
            child: Cell::new(None),
            lock: Mutex::new(()),
            chunk_map: Box::new([]),
        });

        GenerationHandle(NonNull::from(Box::leak(state)))
    }

    fn free_state(handle: GenerationHandle) {
        // SAFETY: Test-local states have no other references.
        drop(unsafe { Box::from_raw(handle.0.as_ptr()) });
    }

    #[test]
    fn table_finds_generation_by_address() {
        let mut table = GenerationTable::new();

        let low = fake_state(0x10_0000, 0x1000);
        let high = fake_state(0x20_0000, 0x2000);

        table.insert(low);
        table.insert(high);

        let find = |table: &GenerationTable, addr| {
            table
                .find_containing(addr)
                // SAFETY: Test-local states are live until freed below.
                .map(|handle| unsafe { handle.state() }.base_addr())
        };

        assert_eq!(find(&table, 0x10_0000), Some(0x10_0000));
        assert_eq!(find(&table, 0x10_0FFF), Some(0x10_0000));
        assert_eq!(find(&table, 0x10_1000), None);
        assert_eq!(find(&table, 0x20_1234), Some(0x20_0000));
        assert_eq!(find(&table, 0x0F_FFFF), None);

        table.remove(NonNull::new(0x10_0000 as *mut u8).unwrap());
        assert_eq!(find(&table, 0x10_0000), None);

        table.remove(NonNull::new(0x20_0000 as *mut u8).unwrap());

        free_state(low);
        free_state(high);
    }

    #[test]
    #[should_panic]
    fn removing_unknown_generation_panics() {
        let mut table = GenerationTable::new();

        table.remove(NonNull::new(0x1000 as *mut u8).unwrap());
    }

    #[test]
    fn chain_root_walks_parent_links() {
        let root = fake_state(0x10_0000, 0x1000);
        let middle = fake_state(0x20_0000, 0x1000);
        let leaf = fake_state(0x30_0000, 0x1000);

        // SAFETY: Test-local states are trivially live.
        unsafe {
            middle.state().parent.set(Some(root));
            leaf.state().parent.set(Some(middle));

            assert_eq!(chain_root(leaf).state().base_addr(), 0x10_0000);
            assert_eq!(chain_root(middle).state().base_addr(), 0x10_0000);
            assert_eq!(chain_root(root).state().base_addr(), 0x10_0000);
        }

        free_state(root);
        free_state(middle);
        free_state(leaf);
    }
}
