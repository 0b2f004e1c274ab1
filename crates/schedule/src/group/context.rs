use std::{alloc::Layout, ptr::NonNull, sync::Arc};

use fnv::FnvHashSet;
use fray_sync::Fence;

use crate::{
    alloc::{AllocStrategy, TrackingAlloc, TransientArena},
    group::SystemGroup,
    resource::{Res, ResMut},
    system::{System, SystemDescriptor, SystemId},
    world::ResourceCell,
};

/// The state a system occupies inside one group.
///
/// Contexts are heap-boxed and their addresses stay stable across graph
/// mutation; the compiled plan refers to them by pointer for the duration
/// of a generation.
pub(crate) struct SystemContext {
    pub(crate) id: SystemId,
    /// `false` means the system is only present as a transitive dependency
    /// and disappears once nothing references it anymore.
    pub(crate) strong: bool,
    /// Systems this context keeps alive (targets of its ordering edges).
    pub(crate) references: FnvHashSet<SystemId>,
    /// Systems keeping this context alive.
    pub(crate) referenced_by: FnvHashSet<SystemId>,
    /// Fences to signal when this context is finally torn down.
    pub(crate) waiters: Vec<Arc<Fence>>,
    /// Compiled: contexts whose deferred fences `run` waits for.
    pub(crate) deferred_deps: Vec<SystemId>,
    pub(crate) runner: ContextRunner,
}

impl SystemContext {
    pub(crate) fn new(
        id: SystemId,
        descriptor: Arc<SystemDescriptor>,
        value: Box<dyn System>,
        strong: bool,
    ) -> Box<Self> {
        descriptor.acquire();
        Box::new(Self {
            id,
            strong,
            references: FnvHashSet::default(),
            referenced_by: FnvHashSet::default(),
            waiters: Vec::new(),
            deferred_deps: Vec::new(),
            runner: ContextRunner {
                descriptor,
                value: Some(value),
                deferred_fence: Arc::new(Fence::new()),
                merge_deferred: true,
                resource_cells: Vec::new(),
                transient: TransientArena::new(),
                persistent: TrackingAlloc::new(),
            },
        })
    }

    pub(crate) fn is_unloadable(&self) -> bool {
        !self.strong && self.referenced_by.is_empty()
    }

    /// Runs the user deinit hook, signals destruction waiters and releases
    /// the descriptor reference.
    pub(crate) fn teardown(&mut self) {
        assert!(
            self.references.is_empty() && self.referenced_by.is_empty(),
            "tearing down a system context that is still linked"
        );
        if let Some(mut value) = self.runner.value.take() {
            value.deinit();
        }
        for waiter in self.waiters.drain(..) {
            waiter.signal();
        }
        self.runner.descriptor.release();
    }
}

impl Drop for SystemContext {
    fn drop(&mut self) {
        debug_assert!(
            self.runner.value.is_none(),
            "system context dropped without teardown"
        );
    }
}

/// The part of a context the executing task owns for the duration of a
/// generation. Kept separate from the graph bookkeeping so that graph
/// mutation between generations never aliases with a running task.
pub(crate) struct ContextRunner {
    pub(crate) descriptor: Arc<SystemDescriptor>,
    value: Option<Box<dyn System>>,
    pub(crate) deferred_fence: Arc<Fence>,
    /// Compiled: when nothing downstream waits on the deferred fence, the
    /// run itself absorbs the wait so the generation covers all subjobs.
    pub(crate) merge_deferred: bool,
    /// Locked cells in declaration order, `[exclusive.., shared..]`;
    /// repopulated at the start of every generation.
    pub(crate) resource_cells: Vec<NonNull<ResourceCell>>,
    transient: TransientArena,
    persistent: TrackingAlloc,
}

// SAFETY: the cell pointers target world-owned cells that stay alive and
// locked for the whole generation the runner is executed in.
unsafe impl Send for ContextRunner {}

impl ContextRunner {
    pub(crate) fn run(&mut self, group: &SystemGroup, generation: u64, deps: &[Arc<Fence>]) {
        self.deferred_fence.reset();
        for fence in deps {
            fence.wait();
        }
        let mut value = self.value.take().expect("system value missing");
        let mut ctx = SystemRunContext {
            group,
            generation,
            descriptor: self.descriptor.as_ref(),
            resource_cells: &self.resource_cells,
            deferred_fence: &self.deferred_fence,
            transient: &self.transient,
            persistent: &self.persistent,
            deferred_claimed: false,
        };
        value.run(&mut ctx);
        let claimed = ctx.deferred_claimed;
        self.value = Some(value);
        self.transient.reset();
        if !claimed {
            self.deferred_fence.signal();
        }
        if self.merge_deferred {
            self.deferred_fence.wait();
        }
    }
}

/// Handed to [`System::run`]; the system's window into its group.
pub struct SystemRunContext<'a> {
    group: &'a SystemGroup,
    generation: u64,
    descriptor: &'a SystemDescriptor,
    resource_cells: &'a [NonNull<ResourceCell>],
    deferred_fence: &'a Arc<Fence>,
    transient: &'a TransientArena,
    persistent: &'a TrackingAlloc,
    deferred_claimed: bool,
}

impl SystemRunContext<'_> {
    /// Mutable access to the `index`-th resource of the system's exclusive
    /// list.
    pub fn exclusive<T: 'static>(&self, index: usize) -> ResMut<'_, T> {
        let count = self.descriptor.exclusive_resources().len();
        assert!(index < count, "exclusive resource index {index} out of range");
        // SAFETY: the cell is locked by the group for the whole generation
        let cell = unsafe { self.resource_cells[index].as_ref() };
        cell.borrow_mut()
    }

    /// Shared access to the `index`-th resource of the system's shared list.
    pub fn shared<T: 'static>(&self, index: usize) -> Res<'_, T> {
        let offset = self.descriptor.exclusive_resources().len();
        let count = self.descriptor.shared_resources().len();
        assert!(index < count, "shared resource index {index} out of range");
        // SAFETY: the cell is locked by the group for the whole generation
        let cell = unsafe { self.resource_cells[offset + index].as_ref() };
        cell.borrow()
    }

    /// Takes responsibility for the deferred fence.
    ///
    /// The returned handle is meant to travel into subjobs; the fence must
    /// be signaled eventually or dependents (and possibly the generation)
    /// block forever. When `run` returns without this having been called,
    /// the scheduler signals the fence itself.
    pub fn deferred(&mut self) -> Deferred {
        self.deferred_claimed = true;
        Deferred(self.deferred_fence.clone())
    }

    #[inline]
    pub fn group(&self) -> &SystemGroup {
        self.group
    }

    /// The generation currently being driven.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Allocates with the lifetime selected by `strategy`.
    ///
    /// The memory stays valid until the owning scope resets: the end of this
    /// `run` for [`AllocStrategy::Transient`], the end of the generation for
    /// [`AllocStrategy::SingleGeneration`], four generations for
    /// [`AllocStrategy::MultiGeneration`] and the removal of the system for
    /// [`AllocStrategy::Persistent`].
    pub fn alloc(&self, strategy: AllocStrategy, layout: Layout) -> NonNull<u8> {
        match strategy {
            AllocStrategy::Transient => self.transient.alloc(layout),
            AllocStrategy::SingleGeneration => self.group.single_generation_arena().alloc(layout),
            AllocStrategy::MultiGeneration => self.group.multi_generation_arena().alloc(layout),
            AllocStrategy::Persistent => self.persistent.alloc(layout),
        }
    }

    /// Moves an allocation to a larger block, preserving its contents.
    pub fn grow(
        &self,
        strategy: AllocStrategy,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_size: usize,
    ) -> NonNull<u8> {
        match strategy {
            AllocStrategy::Persistent => self.persistent.grow(ptr, old_layout, new_size),
            _ => {
                let new_layout = Layout::from_size_align(new_size, old_layout.align())
                    .expect("invalid grown layout");
                let new_ptr = self.alloc(strategy, new_layout);
                if old_layout.size() > 0 {
                    // SAFETY: both regions live at least as long as the arena
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            ptr.as_ptr(),
                            new_ptr.as_ptr(),
                            old_layout.size(),
                        );
                    }
                }
                new_ptr
            }
        }
    }

    /// Returns an allocation early. Only persistent allocations are
    /// reclaimed eagerly; arena allocations are dropped with their arena.
    pub fn dealloc(&self, strategy: AllocStrategy, ptr: NonNull<u8>, layout: Layout) {
        if strategy == AllocStrategy::Persistent {
            self.persistent.dealloc(ptr, layout);
        }
    }

    /// Bytes currently held by this system's persistent allocations.
    pub fn persistent_bytes(&self) -> usize {
        self.persistent.allocated_bytes()
    }
}

/// A claim on a system's deferred fence, cloneable into subjobs.
#[derive(Clone)]
pub struct Deferred(Arc<Fence>);

impl Deferred {
    /// Marks the system's deferred work as complete.
    pub fn signal(&self) {
        self.0.signal();
    }
}
