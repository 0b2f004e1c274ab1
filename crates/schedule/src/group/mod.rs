use std::{
    borrow::Cow,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use fnv::{FnvHashMap, FnvHashSet};
use fray_executor::{CommandBuffer, ThreadPool};
use fray_sync::{Fence, TimelineSemaphore};
use parking_lot::Mutex;

use crate::{
    alloc::{GenerationArena, MultiGenerationArena},
    error::ScheduleError,
    system::{System, SystemId},
    universe::Registry,
    world::World,
};

mod context;
mod dump;
mod graph;

pub use self::context::{Deferred, SystemRunContext};
use self::{context::SystemContext, graph::Graph};

/// A mutable set of systems scheduled together over one world.
///
/// Systems are added and removed between generations; each call to
/// [`schedule`](Self::schedule) drives one complete pass over the current
/// set. Generations complete, and signal their fences, in the order they
/// were scheduled, even when scheduled from different threads.
pub struct SystemGroup {
    label: Cow<'static, str>,
    world: Arc<World>,
    pool: ThreadPool,
    graph: Mutex<Graph>,
    /// Last completed generation.
    generation: AtomicU64,
    /// Next generation to hand out; written under the graph mutex.
    next_generation: AtomicU64,
    /// Signals completed generations in strictly increasing order.
    schedule_semaphore: TimelineSemaphore,
    single_generation: GenerationArena,
    multi_generation: MultiGenerationArena,
}

impl SystemGroup {
    pub fn new(
        label: impl Into<Cow<'static, str>>,
        pool: ThreadPool,
        world: Arc<World>,
    ) -> Arc<Self> {
        world.group_created();
        Arc::new(Self {
            label: label.into(),
            world,
            pool,
            graph: Mutex::new(Graph::new()),
            generation: AtomicU64::new(0),
            next_generation: AtomicU64::new(0),
            schedule_semaphore: TimelineSemaphore::new(0),
            single_generation: GenerationArena::new(),
            multi_generation: MultiGenerationArena::new(),
        })
    }

    /// Waits for the last scheduled generation, then drops `group`.
    ///
    /// # Panics
    ///
    /// Panics when systems are still part of the group; remove them first.
    pub fn destroy(group: Arc<Self>) {
        let pending = group.next_generation.load(Ordering::Acquire);
        group.schedule_semaphore.wait(pending);
        let mut graph = group.graph.lock();
        graph.drain_deinit_list();
        assert!(
            graph.systems.is_empty(),
            "destroying group {:?} with systems still added",
            group.label
        );
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    #[inline]
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// The last completed generation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn contains_system(&self, id: SystemId) -> bool {
        self.graph.lock().contains(id)
    }

    /// `Some(true)` when the system is only present as a transitive
    /// dependency of other members.
    pub fn is_system_weak(&self, id: SystemId) -> Option<bool> {
        self.graph.lock().is_strong(id).map(|strong| !strong)
    }

    pub fn system_count(&self) -> usize {
        self.graph.lock().systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.system_count() == 0
    }

    /// `(tasks, waits)` of the compiled plan, or `None` while the graph is
    /// dirty.
    pub fn plan_summary(&self) -> Option<(usize, usize)> {
        let graph = self.graph.lock();
        (!graph.dirty).then(|| graph.plan_summary())
    }

    /// Renders the dependency graph and compiled plan as Graphviz.
    pub fn write_dot(&self, w: &mut dyn io::Write) -> io::Result<()> {
        dump::write_dot(&self.graph.lock(), w, Some(&self.label))
    }

    pub(crate) fn single_generation_arena(&self) -> &GenerationArena {
        &self.single_generation
    }

    pub(crate) fn multi_generation_arena(&self) -> &MultiGenerationArena {
        &self.multi_generation
    }

    /// Adds systems, pulling in their dependency targets as weak members.
    ///
    /// The whole call is transactional: when any system fails to
    /// initialize, everything it added is removed again and the group is
    /// left untouched.
    pub fn add_systems(&self, ids: &[SystemId]) -> Result<(), ScheduleError> {
        let mut requested = FnvHashSet::default();
        for &id in ids {
            if !requested.insert(id) {
                return Err(ScheduleError::Duplicate);
            }
        }

        // preflight, and a membership snapshot to skip needless factory runs
        let present: FnvHashSet<SystemId> = {
            let graph = self.graph.lock();
            for &id in ids {
                if graph.is_strong(id) == Some(true) {
                    return Err(ScheduleError::Duplicate);
                }
            }
            graph.index.keys().copied().collect()
        };

        let universe = self.world.universe().clone();
        let registry = universe.registry();

        // transitive closure over dependency targets, dependencies first
        let mut order = Vec::new();
        let mut seen = FnvHashMap::default();
        for &id in ids {
            resolve_closure(&registry, id, true, &mut seen, &mut order)?;
        }

        // run the factories without holding the graph mutex; they are user
        // code and may block
        let mut pending: Vec<(SystemId, bool, Option<Box<dyn System>>)> =
            Vec::with_capacity(order.len());
        for &(id, strong) in &order {
            if present.contains(&id) {
                pending.push((id, strong, None));
                continue;
            }
            let descriptor = registry.system(id).expect("resolved above");
            match descriptor.instantiate() {
                Ok(value) => pending.push((id, strong, Some(value))),
                Err(error) => {
                    for (_, _, value) in &mut pending {
                        if let Some(value) = value.as_mut() {
                            value.deinit();
                        }
                    }
                    return Err(ScheduleError::SystemInit(error));
                }
            }
        }

        let mut graph = self.graph.lock();
        let mut inserted: Vec<SystemId> = Vec::new();
        let mut promoted: Vec<SystemId> = Vec::new();
        let mut failure = None;
        for (id, strong, mut value) in pending {
            if graph.contains(id) {
                // someone else added it in the meantime; the speculative
                // value is surplus
                if let Some(value) = value.as_mut() {
                    value.deinit();
                }
                if strong {
                    if graph.promote(id) {
                        promoted.push(id);
                    } else {
                        failure = Some(ScheduleError::Duplicate);
                        break;
                    }
                }
                continue;
            }
            let value = match value {
                Some(value) => value,
                // present at the snapshot but removed since
                None => {
                    let descriptor = registry.system(id).expect("resolved above");
                    match descriptor.instantiate() {
                        Ok(value) => value,
                        Err(error) => {
                            failure = Some(ScheduleError::SystemInit(error));
                            break;
                        }
                    }
                }
            };
            let descriptor = registry.system(id).expect("resolved above").clone();
            graph.insert(SystemContext::new(id, descriptor, value, strong));
            inserted.push(id);
        }

        if let Some(error) = failure {
            for &id in promoted.iter().rev() {
                graph.demote(id);
            }
            for &id in inserted.iter().rev() {
                graph.remove_system(id, None, false);
            }
            return Err(error);
        }
        tracing::debug!(
            group = %self.label,
            requested = ids.len(),
            total = graph.systems.len(),
            "added systems"
        );
        Ok(())
    }

    /// Removes a system added with [`add_systems`](Self::add_systems).
    ///
    /// When a generation is in flight the context outlives it and is
    /// destroyed by the next recompile; `fence` is signaled at that point.
    ///
    /// # Panics
    ///
    /// Panics when the system is not part of the group, or only present as
    /// a weak dependency of other members.
    pub fn remove_system(&self, id: SystemId, fence: Option<Arc<Fence>>) {
        let mut graph = self.graph.lock();
        match graph.is_strong(id) {
            None => panic!(
                "removing a system that is not part of group {:?}",
                self.label
            ),
            Some(false) => panic!(
                "removing a weakly added system from group {:?}",
                self.label
            ),
            Some(true) => {}
        }
        let in_flight =
            self.schedule_semaphore.counter() < self.next_generation.load(Ordering::Acquire);
        graph.remove_system(id, fence, in_flight);
        tracing::debug!(group = %self.label, ?id, in_flight, "removed system");
    }

    /// Enqueues one generation.
    ///
    /// The job waits for every fence in `wait_on` and for all previously
    /// scheduled generations, drives the group once, and finally signals
    /// `signal`. Returns the generation number.
    pub fn schedule(
        self: &Arc<Self>,
        wait_on: Vec<Arc<Fence>>,
        signal: Option<Arc<Fence>>,
    ) -> u64 {
        let graph = self.graph.lock();
        let generation = self.next_generation.load(Ordering::Relaxed);
        self.next_generation
            .store(generation.wrapping_add(1), Ordering::Release);
        let job = ScheduleJob {
            group: self.clone(),
            generation,
            wait_on,
            signal,
        };
        let mut bootstrap = CommandBuffer::new();
        bootstrap.task(move || job.run());
        self.pool.submit_detached(bootstrap);
        drop(graph);
        tracing::trace!(group = %self.label, generation, "scheduled generation");
        generation
    }

    /// Schedules one generation and blocks until it completed.
    pub fn run_once(self: &Arc<Self>) {
        let fence = Arc::new(Fence::new());
        self.schedule(Vec::new(), Some(fence.clone()));
        fence.wait();
    }

    fn run(self: &Arc<Self>, generation: u64) {
        assert_eq!(
            self.generation.load(Ordering::Acquire),
            generation,
            "generations must complete in order"
        );
        let span = tracing::debug_span!("generation", group = %self.label, generation);
        let _entered = span.enter();

        let (buffer, resources) = {
            let mut graph = self.graph.lock();
            if graph.dirty {
                graph.recompile(&self.label);
            }
            graph.acquire_resources(&self.world);
            let buffer = graph.build_command_buffer(self, generation);
            (buffer, graph.resources.clone())
        };

        // user code runs without the graph mutex; the group can be
        // reconfigured for the *next* generation while this one executes
        let handle = self.pool.submit(buffer);
        handle.join();

        for &resource in &resources {
            self.world.unlock_resource_exclusive(resource);
        }
        self.generation
            .store(generation.wrapping_add(1), Ordering::Release);
        self.single_generation.reset();
        self.multi_generation.advance_generation();
        self.schedule_semaphore.signal(generation.wrapping_add(1));
        tracing::trace!(group = %self.label, generation, "generation completed");
    }
}

impl Drop for SystemGroup {
    fn drop(&mut self) {
        self.world.group_dropped();
    }
}

impl std::fmt::Debug for SystemGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemGroup")
            .field("label", &self.label)
            .field("generation", &self.generation())
            .field("systems", &self.system_count())
            .finish_non_exhaustive()
    }
}

/// A one-shot job that drives a single generation to completion.
struct ScheduleJob {
    group: Arc<SystemGroup>,
    generation: u64,
    wait_on: Vec<Arc<Fence>>,
    signal: Option<Arc<Fence>>,
}

impl ScheduleJob {
    fn run(self) {
        let Self {
            group,
            generation,
            wait_on,
            signal,
        } = self;
        for fence in &wait_on {
            fence.wait();
        }
        group.schedule_semaphore.wait(generation);
        group.run(generation);
        // everything group-derived is released before the result fence
        // fires: the signal may hand the last reference back to the caller
        drop(wait_on);
        drop(group);
        if let Some(fence) = signal {
            fence.signal();
        }
    }
}

fn resolve_closure(
    registry: &Registry,
    id: SystemId,
    strong: bool,
    seen: &mut FnvHashMap<SystemId, usize>,
    order: &mut Vec<(SystemId, bool)>,
) -> Result<(), ScheduleError> {
    if let Some(&position) = seen.get(&id) {
        if strong {
            order[position].1 = true;
        }
        return Ok(());
    }
    let descriptor = registry
        .system(id)
        .ok_or(ScheduleError::NotFound)?
        .clone();
    for target in descriptor.dependency_targets() {
        resolve_closure(registry, target, false, seen, order)?;
    }
    seen.insert(id, order.len());
    order.push((id, strong));
    Ok(())
}
