use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use spin::RwLock;

use crate::generation::GenerationTable;
use crate::pal::{self, Mapping};

/// The most generations that can be live at once, across all chains.
pub(crate) const MAX_GENERATION_COUNT: usize = 256;

/// The process-wide copy-on-write state: the shared backing mapping, the
/// chunk refcount ledger and the generation table.
///
/// A single instance lives in a process global established by [`setup()`];
/// the fault handler reaches it through [`try_runtime()`].
#[derive(Debug)]
pub(crate) struct CowRuntime {
    /// The platform allocation granularity: the unit of placeholder
    /// reservation, physical mapping and protection change.
    chunk_size: usize,

    /// Number of chunks the shared mapping is divided into.
    chunk_count: usize,

    mapping: Mapping,

    /// `refcounts[i]` is the number of (generation, logical chunk) pairs
    /// currently backed by physical chunk `i`; zero means free.
    refcounts: Box<[AtomicU32]>,

    /// Held shared for fault-handler lookup, exclusive while generations are
    /// created or destroyed. Always acquired before any chain root's mutex.
    generations: RwLock<GenerationTable>,
}

static RUNTIME: OnceLock<CowRuntime> = OnceLock::new();

/// Initializes the process-wide copy-on-write runtime: determines the chunk
/// size, creates the shared backing mapping of `mapping_size` bytes (rounded
/// up to whole chunks), allocates the refcount ledger and installs the fault
/// handler, chaining to any previously installed one.
///
/// Size the mapping to the peak physical working set of all generations
/// combined: every root chunk and every diverged (written) chunk occupies one
/// mapping chunk until its last holder is destroyed.
///
/// # Panics
///
/// Panics if called more than once, if `mapping_size` is zero, or if the
/// operating system refuses to create the mapping.
pub fn setup(mapping_size: usize) {
    let runtime = CowRuntime::new(mapping_size);

    assert!(
        RUNTIME.set(runtime).is_ok(),
        "the copy-on-write runtime is already set up; setup() may only be called once"
    );

    pal::install_fault_handler();
}

/// The runtime, which must have been established by [`setup()`].
pub(crate) fn runtime() -> &'static CowRuntime {
    RUNTIME
        .get()
        .expect("copy-on-write generations require setup() to be called first")
}

/// The runtime, if [`setup()`] has run. The fault handler uses this form:
/// a fault before setup is simply not ours.
pub(crate) fn try_runtime() -> Option<&'static CowRuntime> {
    RUNTIME.get()
}

/// The chunk size: the platform allocation granularity, which is the unit of
/// sharing, protection and cloning.
///
/// # Panics
///
/// Panics if [`setup()`] has not been called.
#[must_use]
pub fn chunk_size() -> usize {
    runtime().chunk_size()
}

/// Rounds `size` up to a whole number of chunks.
///
/// # Panics
///
/// Panics if [`setup()`] has not been called.
#[must_use]
pub fn align_to_chunk_size(size: usize) -> usize {
    runtime().align_to_chunk_size(size)
}

/// The number of chunks of the shared mapping currently backing at least one
/// generation. A chunk shared by several generations counts once.
///
/// # Panics
///
/// Panics if [`setup()`] has not been called.
#[must_use]
pub fn used_chunk_count() -> usize {
    runtime().used_chunk_count()
}

impl CowRuntime {
    pub(crate) fn new(mapping_size: usize) -> Self {
        let chunk_size = pal::allocation_granularity();
        assert!(chunk_size > 0, "platform reported a zero allocation granularity");

        let chunk_count = mapping_size.div_ceil(chunk_size);
        assert!(
            chunk_count > 0,
            "the shared mapping must hold at least one chunk"
        );

        let mapping_len = chunk_count
            .checked_mul(chunk_size)
            .expect("chunk-aligned mapping size overflows usize");

        let mapping = Mapping::create(mapping_len)
            .unwrap_or_else(|error| panic!("failed to create the shared backing mapping: {error}"));

        let refcounts = (0..chunk_count).map(|_| AtomicU32::new(0)).collect();

        Self {
            chunk_size,
            chunk_count,
            mapping,
            refcounts,
            generations: RwLock::new(GenerationTable::new()),
        }
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub(crate) fn generations(&self) -> &RwLock<GenerationTable> {
        &self.generations
    }

    pub(crate) fn align_to_chunk_size(&self, size: usize) -> usize {
        size.div_ceil(self.chunk_size)
            .checked_mul(self.chunk_size)
            .expect("chunk-aligned size overflows usize")
    }

    /// Claims a free chunk, scanning the ledger once from `hint` with
    /// wrap-around. Returns the claimed index, now holding a refcount of 1.
    ///
    /// `None` means the mapping is exhausted: every chunk is backing
    /// someone. The caller decides whether that is recoverable.
    pub(crate) fn claim_chunk(&self, hint: usize) -> Option<usize> {
        for step in 0..self.chunk_count {
            let index = (hint.wrapping_add(step)) % self.chunk_count;

            if self.refcounts[index]
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(index);
            }
        }

        None
    }

    /// Records one more holder of an already-claimed chunk.
    pub(crate) fn adopt_chunk(&self, index: usize) {
        let prior = self.refcounts[index].fetch_add(1, Ordering::AcqRel);

        debug_assert!(prior > 0, "adopted chunk {index} was not claimed");
    }

    /// Records one less holder of a chunk; at zero the chunk is free for
    /// [`claim_chunk()`][Self::claim_chunk] to hand out again.
    pub(crate) fn release_chunk(&self, index: usize) {
        let prior = self.refcounts[index].fetch_sub(1, Ordering::AcqRel);

        debug_assert!(prior > 0, "released chunk {index} was not claimed");
    }

    /// The number of holders of a chunk. A count of 1 means the inquiring
    /// generation is the sole owner (only ever meaningful under the chain
    /// root's lock).
    pub(crate) fn share_count(&self, index: usize) -> u32 {
        self.refcounts[index].load(Ordering::Acquire)
    }

    pub(crate) fn used_chunk_count(&self) -> usize {
        self.refcounts
            .iter()
            .filter(|count| count.load(Ordering::Acquire) != 0)
            .count()
    }
}
