use std::{
    alloc::{handle_alloc_error, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use bumpalo::Bump;
use fnv::FnvHashMap;
use parking_lot::Mutex;

/// Selects the lifetime of a scheduler-managed allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStrategy {
    /// Valid for the remainder of the current `run` call.
    Transient,
    /// Valid until the current generation completes.
    SingleGeneration,
    /// Valid for the current and the following three generations.
    MultiGeneration,
    /// Valid until the system instance is removed from its group.
    Persistent,
}

/// Per-context bump arena, reset after every `run`.
pub(crate) struct TransientArena(Bump);

impl TransientArena {
    pub(crate) fn new() -> Self {
        Self(Bump::new())
    }

    pub(crate) fn alloc(&self, layout: Layout) -> NonNull<u8> {
        self.0.alloc_layout(layout)
    }

    pub(crate) fn reset(&mut self) {
        self.0.reset();
    }
}

/// Group-level bump arena, reset at every generation completion.
///
/// Allocations escape the mutex as raw pointers; they stay valid because
/// the arena is only reset between generations, when no system runs.
pub(crate) struct GenerationArena {
    bump: Mutex<Bump>,
}

impl GenerationArena {
    pub(crate) fn new() -> Self {
        Self {
            bump: Mutex::new(Bump::new()),
        }
    }

    pub(crate) fn alloc(&self, layout: Layout) -> NonNull<u8> {
        self.bump.lock().alloc_layout(layout)
    }

    pub(crate) fn reset(&self) {
        self.bump.lock().reset();
    }
}

const MULTI_GENERATION_ARENAS: usize = 4;

/// Four rotating bump arenas; an allocation made in generation `g` stays
/// valid until generation `g + 4` begins.
pub(crate) struct MultiGenerationArena {
    arenas: [GenerationArena; MULTI_GENERATION_ARENAS],
    cursor: AtomicUsize,
}

impl MultiGenerationArena {
    pub(crate) fn new() -> Self {
        Self {
            arenas: [
                GenerationArena::new(),
                GenerationArena::new(),
                GenerationArena::new(),
                GenerationArena::new(),
            ],
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn alloc(&self, layout: Layout) -> NonNull<u8> {
        let current = self.cursor.load(Ordering::Acquire) % MULTI_GENERATION_ARENAS;
        self.arenas[current].alloc(layout)
    }

    /// Rotates to the next arena and reclaims what was allocated there four
    /// generations ago.
    pub(crate) fn advance_generation(&self) {
        let next = self.cursor.fetch_add(1, Ordering::AcqRel) + 1;
        self.arenas[next % MULTI_GENERATION_ARENAS].reset();
    }
}

/// Allocator for [`AllocStrategy::Persistent`] allocations.
///
/// Tracks every live allocation so that leftovers can be reclaimed when the
/// owning system instance is torn down.
pub(crate) struct TrackingAlloc {
    live: Mutex<FnvHashMap<usize, Layout>>,
    bytes: AtomicUsize,
}

impl TrackingAlloc {
    pub(crate) fn new() -> Self {
        Self {
            live: Mutex::new(FnvHashMap::default()),
            bytes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn alloc(&self, layout: Layout) -> NonNull<u8> {
        if layout.size() == 0 {
            return zero_sized(layout);
        }
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { std::alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        self.live.lock().insert(ptr.as_ptr() as usize, layout);
        self.bytes.fetch_add(layout.size(), Ordering::AcqRel);
        ptr
    }

    pub(crate) fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        let tracked = self.live.lock().remove(&(ptr.as_ptr() as usize));
        assert_eq!(
            tracked,
            Some(layout),
            "freeing an untracked pointer or with a mismatched layout"
        );
        self.bytes.fetch_sub(layout.size(), Ordering::AcqRel);
        // SAFETY: the pointer was allocated by `alloc` with this layout
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }

    pub(crate) fn grow(&self, ptr: NonNull<u8>, old_layout: Layout, new_size: usize) -> NonNull<u8> {
        assert!(new_size >= old_layout.size());
        let new_layout = Layout::from_size_align(new_size, old_layout.align())
            .expect("invalid grown layout");
        let new_ptr = self.alloc(new_layout);
        if old_layout.size() > 0 {
            // SAFETY: both regions are live and at least `old_layout.size()` long
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_layout.size());
            }
            self.dealloc(ptr, old_layout);
        }
        new_ptr
    }

    pub(crate) fn allocated_bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }
}

impl Drop for TrackingAlloc {
    fn drop(&mut self) {
        for (ptr, layout) in self.live.get_mut().drain() {
            // SAFETY: every tracked pointer came out of `alloc`
            unsafe { std::alloc::dealloc(ptr as *mut u8, layout) };
        }
    }
}

fn zero_sized(layout: Layout) -> NonNull<u8> {
    // no storage needed; hand out an aligned dangling pointer
    unsafe { NonNull::new_unchecked(layout.align() as *mut u8) }
}
