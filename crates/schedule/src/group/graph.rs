use std::{collections::VecDeque, ptr::NonNull, sync::Arc};

use fnv::FnvHashMap;
use fray_executor::CommandBuffer;
use fray_sync::Fence;

use crate::{
    group::{
        context::{ContextRunner, SystemContext},
        SystemGroup,
    },
    resource::ResourceId,
    system::SystemId,
    world::{ResourceCell, World},
};

/// One command of the compiled plan.
///
/// `Wait` refers `delta` commands back to a previously emitted `Run`; the
/// executor's driver blocks there, which also holds back every later
/// command of the plan.
#[derive(Debug, Clone, Copy)]
pub(crate) enum PlanCmd {
    Wait { delta: usize },
    Run { system: usize },
}

#[derive(Default)]
struct ResourceUse {
    exclusive: bool,
    referrers: Vec<usize>,
}

/// The mutable dependency graph of one group, plus its compiled plan.
pub(crate) struct Graph {
    /// Insertion-ordered; removal swaps. Ties in the topological order are
    /// broken by position in this list.
    pub(crate) systems: Vec<Box<SystemContext>>,
    pub(crate) index: FnvHashMap<SystemId, usize>,
    /// Contexts whose destruction was deferred past an in-flight
    /// generation; drained at the start of the next recompile.
    deinit_list: Vec<Box<SystemContext>>,
    /// Union of all declared resources, sorted by identity.
    pub(crate) resources: Vec<ResourceId>,
    resource_slots: FnvHashMap<ResourceId, usize>,
    pub(crate) plan: Vec<PlanCmd>,
    pub(crate) dirty: bool,
    locked_cells: Vec<NonNull<ResourceCell>>,
}

// SAFETY: the cell pointers reference world cells that outlive every
// generation scheduled over them; the graph itself is only accessed under
// the group mutex.
unsafe impl Send for Graph {}

impl Graph {
    pub(crate) fn new() -> Self {
        Self {
            systems: Vec::new(),
            index: FnvHashMap::default(),
            deinit_list: Vec::new(),
            resources: Vec::new(),
            resource_slots: FnvHashMap::default(),
            plan: Vec::new(),
            dirty: true,
            locked_cells: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn contains(&self, id: SystemId) -> bool {
        self.index.contains_key(&id)
    }

    pub(crate) fn is_strong(&self, id: SystemId) -> Option<bool> {
        self.index.get(&id).map(|&i| self.systems[i].strong)
    }

    /// Inserts a freshly created context and links its ordering edges.
    /// All dependency targets must already be present.
    pub(crate) fn insert(&mut self, ctx: Box<SystemContext>) {
        let id = ctx.id;
        debug_assert!(!self.index.contains_key(&id));
        let position = self.systems.len();
        self.systems.push(ctx);
        self.index.insert(id, position);
        let targets: Vec<SystemId> = self.systems[position]
            .runner
            .descriptor
            .dependency_targets()
            .collect();
        for target in targets {
            let t = *self
                .index
                .get(&target)
                .expect("dependency target missing from graph");
            self.systems[position].references.insert(target);
            self.systems[t].referenced_by.insert(id);
        }
        self.dirty = true;
    }

    /// Flips a weak member to strong. Returns `false` when the member was
    /// already strong.
    pub(crate) fn promote(&mut self, id: SystemId) -> bool {
        let i = self.index[&id];
        let ctx = &mut self.systems[i];
        if ctx.strong {
            return false;
        }
        ctx.strong = true;
        true
    }

    pub(crate) fn demote(&mut self, id: SystemId) {
        let i = self.index[&id];
        self.systems[i].strong = false;
    }

    /// Removes a system, cascading over weak members that lose their last
    /// referrer.
    ///
    /// With `defer_teardown`, collected contexts are parked on the deinit
    /// list and destroyed at the next recompile; `fence` then travels with
    /// the requested context and is signaled at its destruction. Without
    /// it, teardown happens immediately.
    pub(crate) fn remove_system(
        &mut self,
        id: SystemId,
        fence: Option<Arc<Fence>>,
        defer_teardown: bool,
    ) {
        assert!(
            self.index.contains_key(&id),
            "removing a system that is not part of the group"
        );
        self.demote(id);

        let mut queue = VecDeque::new();
        queue.push_back(id);
        let mut destroyed = Vec::new();
        while let Some(current) = queue.pop_front() {
            let Some(&i) = self.index.get(&current) else {
                continue;
            };
            if !self.systems[i].is_unloadable() {
                continue;
            }
            let mut ctx = self.swap_remove(i);
            for target in ctx.references.drain() {
                if let Some(&t) = self.index.get(&target) {
                    self.systems[t].referenced_by.remove(&current);
                    queue.push_back(target);
                }
            }
            destroyed.push(ctx);
        }
        self.dirty = true;

        for mut ctx in destroyed {
            let requested = ctx.id == id;
            if defer_teardown {
                if requested {
                    if let Some(fence) = fence.clone() {
                        ctx.waiters.push(fence);
                    }
                }
                self.deinit_list.push(ctx);
            } else {
                ctx.teardown();
                if requested {
                    if let Some(fence) = &fence {
                        fence.signal();
                    }
                }
            }
        }

        // still referenced: the system stays as a weak member and the fence
        // fires once it finally goes away
        if let Some(&i) = self.index.get(&id) {
            if let Some(fence) = fence {
                self.systems[i].waiters.push(fence);
            }
        }
    }

    /// Destroys contexts parked by deferred removals.
    pub(crate) fn drain_deinit_list(&mut self) {
        for mut ctx in self.deinit_list.drain(..) {
            ctx.teardown();
        }
    }

    fn swap_remove(&mut self, i: usize) -> Box<SystemContext> {
        let ctx = self.systems.swap_remove(i);
        self.index.remove(&ctx.id);
        if i < self.systems.len() {
            let moved = self.systems[i].id;
            self.index.insert(moved, i);
        }
        ctx
    }

    /// Rebuilds the compiled plan from the current graph.
    ///
    /// Destroys contexts parked by deferred removals, recomputes the
    /// resource union and the deferred-fence bookkeeping, orders the
    /// systems topologically and injects the synchronization commands.
    pub(crate) fn recompile(&mut self, label: &str) {
        self.drain_deinit_list();

        self.resources.clear();
        self.resource_slots.clear();
        for ctx in &self.systems {
            let descriptor = &ctx.runner.descriptor;
            for &resource in descriptor
                .exclusive_resources()
                .iter()
                .chain(descriptor.shared_resources())
            {
                if !self.resource_slots.contains_key(&resource) {
                    self.resource_slots.insert(resource, 0);
                    self.resources.push(resource);
                }
            }
        }
        self.resources.sort_unstable_by_key(|r| r.identity());
        for (slot, &resource) in self.resources.iter().enumerate() {
            self.resource_slots.insert(resource, slot);
        }

        let n = self.systems.len();
        // order_deps[i] = systems that must complete before i runs
        let mut order_deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut deferred: Vec<Vec<SystemId>> = vec![Vec::new(); n];
        let mut merge = vec![true; n];
        for i in 0..n {
            let ctx = &self.systems[i];
            let descriptor = &ctx.runner.descriptor;
            for dep in descriptor.after() {
                let Some(&t) = self.index.get(&dep.system) else {
                    continue;
                };
                push_unique(&mut order_deps[i], t);
                if !dep.ignore_deferred {
                    push_unique(&mut deferred[i], dep.system);
                    merge[t] = false;
                }
            }
            for dep in descriptor.before() {
                let Some(&t) = self.index.get(&dep.system) else {
                    continue;
                };
                push_unique(&mut order_deps[t], i);
                if !dep.ignore_deferred {
                    push_unique(&mut deferred[t], ctx.id);
                    merge[i] = false;
                }
            }
        }

        let order = self.topological_order(&order_deps, label);

        self.plan.clear();
        let mut running: FnvHashMap<usize, usize> = FnvHashMap::default();
        let mut resource_use: FnvHashMap<ResourceId, ResourceUse> = FnvHashMap::default();
        for &s in &order {
            for &dep in &order_deps[s] {
                self.emit_wait(&mut running, dep);
            }
            let descriptor = self.systems[s].runner.descriptor.clone();
            for &resource in descriptor.exclusive_resources() {
                let state = resource_use.entry(resource).or_default();
                for prior in std::mem::take(&mut state.referrers) {
                    self.emit_wait(&mut running, prior);
                }
                state.exclusive = true;
                state.referrers.push(s);
            }
            for &resource in descriptor.shared_resources() {
                let state = resource_use.entry(resource).or_default();
                if state.exclusive {
                    for prior in std::mem::take(&mut state.referrers) {
                        self.emit_wait(&mut running, prior);
                    }
                    state.exclusive = false;
                }
                state.referrers.push(s);
            }
            running.insert(s, self.plan.len());
            self.plan.push(PlanCmd::Run { system: s });
        }

        for i in 0..n {
            let ctx = &mut self.systems[i];
            ctx.deferred_deps = std::mem::take(&mut deferred[i]);
            ctx.runner.merge_deferred = merge[i];
        }

        self.dirty = false;
        tracing::debug!(
            group = label,
            systems = n,
            commands = self.plan.len(),
            resources = self.resources.len(),
            "recompiled plan"
        );
    }

    fn emit_wait(&mut self, running: &mut FnvHashMap<usize, usize>, target: usize) {
        // a target that already left the map has been waited for by an
        // earlier command; the driver's serial order covers it
        if let Some(command) = running.remove(&target) {
            self.plan.push(PlanCmd::Wait {
                delta: self.plan.len() - command,
            });
        }
    }

    /// Ranks every system one past its highest-ranked dependency and
    /// returns the systems sorted by rank, insertion order breaking ties.
    fn topological_order(&self, order_deps: &[Vec<usize>], label: &str) -> Vec<usize> {
        let n = order_deps.len();
        let mut indegree: Vec<usize> = order_deps.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in order_deps.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(i);
            }
        }
        let mut rank = vec![1usize; n];
        let mut queue: VecDeque<usize> =
            (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut processed = 0;
        while let Some(i) = queue.pop_front() {
            processed += 1;
            for &dependent in &dependents[i] {
                rank[dependent] = rank[dependent].max(rank[i] + 1);
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        if processed != n {
            let _ = super::dump::dump_if_env(self);
            panic!(
                "dependency cycle in group {label:?}; \
                 set FRAY_DUMP_PLAN=[path] to dump the graph as a .dot file"
            );
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| rank[i]);
        order
    }

    /// Locks the full resource union and hands every context its cells.
    pub(crate) fn acquire_resources(&mut self, world: &World) {
        self.locked_cells.clear();
        world.lock_resources(&self.resources, &mut self.locked_cells);
        for ctx in &mut self.systems {
            let descriptor = ctx.runner.descriptor.clone();
            ctx.runner.resource_cells.clear();
            for resource in descriptor
                .exclusive_resources()
                .iter()
                .chain(descriptor.shared_resources())
            {
                let slot = self.resource_slots[resource];
                ctx.runner.resource_cells.push(self.locked_cells[slot]);
            }
        }
    }

    /// Reifies the compiled plan into a command buffer for one generation.
    pub(crate) fn build_command_buffer(
        &mut self,
        group: &Arc<SystemGroup>,
        generation: u64,
    ) -> CommandBuffer {
        debug_assert!(!self.dirty, "building a command buffer from a stale plan");
        let mut buffer = CommandBuffer::new();
        for k in 0..self.plan.len() {
            match self.plan[k] {
                PlanCmd::Wait { delta } => buffer.wait_indirect(delta),
                PlanCmd::Run { system } => {
                    let fences: Vec<Arc<Fence>> = self.systems[system]
                        .deferred_deps
                        .iter()
                        .map(|dep| {
                            let i = self.index[dep];
                            self.systems[i].runner.deferred_fence.clone()
                        })
                        .collect();
                    let runner = RunnerPtr(&mut self.systems[system].runner);
                    let group = group.clone();
                    buffer.task(move || {
                        // force capturing the whole `RunnerPtr` (which is
                        // `Send`) rather than its raw-pointer field, which
                        // edition-2021 disjoint closure capture would
                        // otherwise capture directly.
                        let runner = runner;
                        // SAFETY: contexts are heap-boxed and survive until
                        // the deinit list is drained, which happens after
                        // this generation completed; the runner half of a
                        // context is touched by no one else while its task
                        // runs.
                        let runner = unsafe { &mut *runner.0 };
                        runner.run(&group, generation, &fences);
                    });
                }
            }
        }
        buffer
    }

    /// Number of task and wait commands in the compiled plan.
    pub(crate) fn plan_summary(&self) -> (usize, usize) {
        let tasks = self
            .plan
            .iter()
            .filter(|c| matches!(c, PlanCmd::Run { .. }))
            .count();
        (tasks, self.plan.len() - tasks)
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        // orderly teardown for whatever is still present, so user deinit
        // hooks run and destruction waiters are released
        self.drain_deinit_list();
        for ctx in &mut self.systems {
            ctx.references.clear();
            ctx.referenced_by.clear();
            ctx.teardown();
        }
    }
}

struct RunnerPtr(*mut ContextRunner);

// SAFETY: the pointer is consumed by exactly one task of the generation the
// buffer was built for.
unsafe impl Send for RunnerPtr {}

fn push_unique<T: PartialEq>(vec: &mut Vec<T>, value: T) {
    if !vec.contains(&value) {
        vec.push(value);
    }
}
