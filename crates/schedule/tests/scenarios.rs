use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use fray_schedule::prelude::*;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn setup() -> (Arc<Universe>, Arc<World>, ThreadPool) {
    let _ = tracing_subscriber::fmt::try_init();
    let universe = Universe::new();
    let world = World::new(universe.clone());
    (universe, world, ThreadPool::new(8))
}

struct Recording {
    name: &'static str,
    log: Log,
}

impl System for Recording {
    fn run(&mut self, _ctx: &mut SystemRunContext<'_>) {
        self.log.lock().unwrap().push(self.name);
    }
}

fn recording(
    universe: &Universe,
    name: &'static str,
    log: &Log,
) -> fray_schedule::system::SystemDescriptorBuilder {
    let log = log.clone();
    SystemDescriptor::builder(name).value(move || Recording {
        name,
        log: log.clone(),
    })
}

fn position(log: &Log, name: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .position(|&n| n == name)
        .unwrap_or_else(|| panic!("{name} never ran"))
}

#[test]
fn single_system_two_resources() {
    let (universe, world, pool) = setup();
    let counter = universe.register_resource(ResourceDescriptor::new("counter"));
    let text = universe.register_resource(ResourceDescriptor::new("text"));
    world.add_resource(counter, 0_u32).unwrap();
    world
        .add_resource(text, String::from("shared-data"))
        .unwrap();

    struct Bump {
        runs: Arc<AtomicUsize>,
    }
    impl System for Bump {
        fn run(&mut self, ctx: &mut SystemRunContext<'_>) {
            *ctx.exclusive::<u32>(0) += 1;
            assert_eq!(&*ctx.shared::<String>(0), "shared-data");
            self.runs.fetch_add(1, Ordering::AcqRel);
        }
    }
    let runs = Arc::new(AtomicUsize::new(0));
    let system = {
        let runs = runs.clone();
        universe
            .register_system(
                SystemDescriptor::builder("bump")
                    .exclusive(counter)
                    .shared(text)
                    .value(move || Bump { runs: runs.clone() })
                    .build(),
            )
            .unwrap()
    };

    let group = SystemGroup::new("solo", pool, world.clone());
    group.add_systems(&[system]).unwrap();
    assert_eq!(group.generation(), 0);

    let fence = Arc::new(Fence::new());
    let generation = group.schedule(Vec::new(), Some(fence.clone()));
    assert_eq!(generation, 0);
    fence.wait();

    assert_eq!(runs.load(Ordering::Acquire), 1);
    assert_eq!(group.generation(), 1);

    group.remove_system(system, None);
    assert_eq!(world.remove_resource::<u32>(counter).unwrap(), 1);
    SystemGroup::destroy(group);
}

#[test]
fn diamond_orders_and_injects_three_waits() {
    let (universe, world, pool) = setup();
    let log: Log = Arc::default();
    let a = universe
        .register_system(recording(&universe, "a", &log).build())
        .unwrap();
    let b = universe
        .register_system(recording(&universe, "b", &log).after(a).build())
        .unwrap();
    let c = universe
        .register_system(recording(&universe, "c", &log).after(a).build())
        .unwrap();
    let d = universe
        .register_system(recording(&universe, "d", &log).after(b).after(c).build())
        .unwrap();

    let group = SystemGroup::new("diamond", pool, world);
    group.add_systems(&[a, b, c, d]).unwrap();
    group.run_once();

    assert_eq!(group.plan_summary(), Some((4, 3)));
    assert!(position(&log, "a") < position(&log, "b"));
    assert!(position(&log, "a") < position(&log, "c"));
    assert_eq!(position(&log, "d"), 3);
}

#[test]
fn exclusive_conflict_never_overlaps() {
    let (universe, world, pool) = setup();
    let resource = universe.register_resource(ResourceDescriptor::new("contended"));
    world.add_resource(resource, 0_u64).unwrap();

    struct Holder {
        name: &'static str,
        log: Log,
        active: Arc<AtomicUsize>,
        overlapped: Arc<AtomicBool>,
    }
    impl System for Holder {
        fn run(&mut self, ctx: &mut SystemRunContext<'_>) {
            let _guard = ctx.exclusive::<u64>(0);
            if self.active.fetch_add(1, Ordering::AcqRel) != 0 {
                self.overlapped.store(true, Ordering::Release);
            }
            self.log.lock().unwrap().push(self.name);
            thread::sleep(Duration::from_millis(30));
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    let log: Log = Arc::default();
    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let mut ids = Vec::new();
    for name in ["x", "y"] {
        let log = log.clone();
        let active = active.clone();
        let overlapped = overlapped.clone();
        ids.push(
            universe
                .register_system(
                    SystemDescriptor::builder(name)
                        .exclusive(resource)
                        .value(move || Holder {
                            name,
                            log: log.clone(),
                            active: active.clone(),
                            overlapped: overlapped.clone(),
                        })
                        .build(),
                )
                .unwrap(),
        );
    }

    let group = SystemGroup::new("conflict", pool, world);
    group.add_systems(&ids).unwrap();
    group.run_once();

    assert!(!overlapped.load(Ordering::Acquire));
    // the tie breaks by insertion order
    assert_eq!(*log.lock().unwrap(), vec!["x", "y"]);
}

#[test]
fn deferred_fan_out() {
    let (universe, world, pool) = setup();
    let subjob_done = Arc::new(AtomicBool::new(false));
    let signal_time: Arc<Mutex<Option<Instant>>> = Arc::default();

    struct Spawner {
        subjob_done: Arc<AtomicBool>,
        signal_time: Arc<Mutex<Option<Instant>>>,
    }
    impl System for Spawner {
        fn run(&mut self, ctx: &mut SystemRunContext<'_>) {
            let deferred = ctx.deferred();
            let subjob_done = self.subjob_done.clone();
            let signal_time = self.signal_time.clone();
            ctx.group().pool().clone().execute(move || {
                thread::sleep(Duration::from_millis(200));
                subjob_done.store(true, Ordering::Release);
                *signal_time.lock().unwrap() = Some(Instant::now());
                deferred.signal();
            });
        }
    }

    let p = {
        let subjob_done = subjob_done.clone();
        let signal_time = signal_time.clone();
        universe
            .register_system(
                SystemDescriptor::builder("p")
                    .value(move || Spawner {
                        subjob_done: subjob_done.clone(),
                        signal_time: signal_time.clone(),
                    })
                    .build(),
            )
            .unwrap()
    };

    struct Observer {
        subjob_done: Arc<AtomicBool>,
        observed: Arc<AtomicBool>,
        started: Arc<Mutex<Option<Instant>>>,
    }
    impl System for Observer {
        fn run(&mut self, _ctx: &mut SystemRunContext<'_>) {
            *self.started.lock().unwrap() = Some(Instant::now());
            self.observed
                .store(self.subjob_done.load(Ordering::Acquire), Ordering::Release);
        }
    }
    let make_observer = |universe: &Universe,
                         name: &'static str,
                         done: &Arc<AtomicBool>|
     -> (SystemId, Arc<AtomicBool>, Arc<Mutex<Option<Instant>>>) {
        let observed = Arc::new(AtomicBool::new(false));
        let started: Arc<Mutex<Option<Instant>>> = Arc::default();
        let builder = SystemDescriptor::builder(name);
        let builder = if name == "q" {
            builder.after(p)
        } else {
            builder.after(Dependency::ignore_deferred(p))
        };
        let id = {
            let done = done.clone();
            let observed = observed.clone();
            let started = started.clone();
            universe
                .register_system(
                    builder
                        .value(move || Observer {
                            subjob_done: done.clone(),
                            observed: observed.clone(),
                            started: started.clone(),
                        })
                        .build(),
                )
                .unwrap()
        };
        (id, observed, started)
    };
    let (q, q_observed, _q_started) = make_observer(&universe, "q", &subjob_done);
    let (r, _r_observed, r_started) = make_observer(&universe, "r", &subjob_done);

    let group = SystemGroup::new("fan-out", pool, world);
    group.add_systems(&[p, q, r]).unwrap();
    group.run_once();

    // q waited for the deferred fence and saw the subjob's effect
    assert!(q_observed.load(Ordering::Acquire));
    // r only waited for p's run and started well before the subjob signaled
    let r_started = r_started.lock().unwrap().expect("r never ran");
    let signaled = signal_time.lock().unwrap().expect("p never signaled");
    assert!(r_started < signaled);
}

#[test]
fn live_removal_waits_for_the_next_recompile() {
    let (universe, world, pool) = setup();
    let started = Arc::new(Fence::new());
    let deinits = Arc::new(AtomicUsize::new(0));

    struct Slow {
        started: Arc<Fence>,
        deinits: Arc<AtomicUsize>,
    }
    impl System for Slow {
        fn run(&mut self, _ctx: &mut SystemRunContext<'_>) {
            self.started.signal();
            thread::sleep(Duration::from_millis(120));
        }
        fn deinit(&mut self) {
            self.deinits.fetch_add(1, Ordering::AcqRel);
        }
    }
    let slow = {
        let started = started.clone();
        let deinits = deinits.clone();
        universe
            .register_system(
                SystemDescriptor::builder("slow")
                    .value(move || Slow {
                        started: started.clone(),
                        deinits: deinits.clone(),
                    })
                    .build(),
            )
            .unwrap()
    };

    let group = SystemGroup::new("live", pool, world);
    group.add_systems(&[slow]).unwrap();

    let result = Arc::new(Fence::new());
    group.schedule(Vec::new(), Some(result.clone()));
    started.wait();

    // the generation is in flight: removal must defer the teardown
    let removed = Arc::new(Fence::new());
    group.remove_system(slow, Some(removed.clone()));
    assert!(!group.contains_system(slow));
    assert!(!removed.is_signaled());

    result.wait();
    // completed, but the context is destroyed only by the next recompile
    assert!(!removed.is_signaled());
    assert_eq!(deinits.load(Ordering::Acquire), 0);

    group.run_once();
    removed.wait();
    assert_eq!(deinits.load(Ordering::Acquire), 1);
    SystemGroup::destroy(group);
}

#[test]
fn weak_promotion_lifecycle() {
    let (universe, world, pool) = setup();
    let log: Log = Arc::default();
    let b = universe
        .register_system(recording(&universe, "b", &log).build())
        .unwrap();
    let a = universe
        .register_system(recording(&universe, "a", &log).after(b).build())
        .unwrap();

    let group = SystemGroup::new("membership", pool, world);

    // adding a pulls b in as a weak dependency
    group.add_systems(&[a]).unwrap();
    assert_eq!(group.system_count(), 2);
    assert_eq!(group.is_system_weak(b), Some(true));
    assert!(universe.unregister_system(a).is_err());

    // a strong add promotes the weak member
    group.add_systems(&[b]).unwrap();
    assert_eq!(group.system_count(), 2);
    assert_eq!(group.is_system_weak(b), Some(false));

    // removing a leaves the promoted b behind
    let fence = Arc::new(Fence::new());
    group.remove_system(a, Some(fence.clone()));
    fence.wait();
    assert!(!group.contains_system(a));
    assert_eq!(group.is_system_weak(b), Some(false));

    group.remove_system(b, None);
    assert!(group.is_empty());

    // the group no longer pins the descriptors
    universe.unregister_system(a).unwrap();
    universe.unregister_system(b).unwrap();
    SystemGroup::destroy(group);
}

#[test]
fn add_remove_restores_the_previous_set() {
    let (universe, world, pool) = setup();
    let log: Log = Arc::default();
    let base = universe
        .register_system(recording(&universe, "base", &log).build())
        .unwrap();
    let top = universe
        .register_system(recording(&universe, "top", &log).after(base).build())
        .unwrap();

    let group = SystemGroup::new("law", pool, world);
    group.add_systems(&[top]).unwrap();
    assert_eq!(group.system_count(), 2);
    group.remove_system(top, None);
    assert!(group.is_empty());

    // the set is usable again afterwards
    group.add_systems(&[top]).unwrap();
    group.run_once();
    assert_eq!(*log.lock().unwrap(), vec!["base", "top"]);
}

#[test]
fn failed_add_rolls_back_completely() {
    let (universe, world, pool) = setup();
    let deinits = Arc::new(AtomicUsize::new(0));

    struct Good {
        deinits: Arc<AtomicUsize>,
    }
    impl System for Good {
        fn run(&mut self, _ctx: &mut SystemRunContext<'_>) {}
        fn deinit(&mut self) {
            self.deinits.fetch_add(1, Ordering::AcqRel);
        }
    }
    let good = {
        let deinits = deinits.clone();
        universe
            .register_system(
                SystemDescriptor::builder("good")
                    .value(move || Good {
                        deinits: deinits.clone(),
                    })
                    .build(),
            )
            .unwrap()
    };
    let bad = universe
        .register_system(
            SystemDescriptor::builder("bad")
                .factory(|| -> Result<Good, SystemInitError> {
                    Err(SystemInitError::new("boom"))
                })
                .build(),
        )
        .unwrap();

    let group = SystemGroup::new("rollback", pool, world);
    let error = group.add_systems(&[good, bad]).unwrap_err();
    assert!(matches!(error, ScheduleError::SystemInit(_)));
    assert!(group.is_empty());
    // the speculatively created instance was torn down again
    assert_eq!(deinits.load(Ordering::Acquire), 1);

    // duplicate requests are rejected up front
    group.add_systems(&[good]).unwrap();
    assert!(matches!(
        group.add_systems(&[good]),
        Err(ScheduleError::Duplicate)
    ));
    group.remove_system(good, None);
}

#[test]
fn generations_complete_in_schedule_order() {
    let (universe, world, pool) = setup();
    let seen = Arc::new(Mutex::new(Vec::new()));

    struct Tracker {
        seen: Arc<Mutex<Vec<u64>>>,
    }
    impl System for Tracker {
        fn run(&mut self, ctx: &mut SystemRunContext<'_>) {
            self.seen.lock().unwrap().push(ctx.generation());
        }
    }
    let tracker = {
        let seen = seen.clone();
        universe
            .register_system(
                SystemDescriptor::builder("tracker")
                    .value(move || Tracker { seen: seen.clone() })
                    .build(),
            )
            .unwrap()
    };

    let group = SystemGroup::new("ordered", pool, world);
    group.add_systems(&[tracker]).unwrap();

    let fences: Vec<Arc<Fence>> = (0..3).map(|_| Arc::new(Fence::new())).collect();
    for (expected, fence) in fences.iter().enumerate() {
        let generation = group.schedule(Vec::new(), Some(fence.clone()));
        assert_eq!(generation, expected as u64);
    }
    fences.last().unwrap().wait();

    assert!(fences.iter().all(|f| f.is_signaled()));
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(group.generation(), 3);
}

#[test]
fn schedule_honors_wait_fences() {
    let (universe, world, pool) = setup();
    let log: Log = Arc::default();
    let system = universe
        .register_system(recording(&universe, "gated", &log).build())
        .unwrap();

    let group = SystemGroup::new("gated", pool, world);
    group.add_systems(&[system]).unwrap();

    let gate = Arc::new(Fence::new());
    let result = Arc::new(Fence::new());
    group.schedule(vec![gate.clone()], Some(result.clone()));

    thread::sleep(Duration::from_millis(50));
    assert_eq!(group.generation(), 0);
    assert!(log.lock().unwrap().is_empty());

    gate.signal();
    result.wait();
    assert_eq!(group.generation(), 1);
    assert_eq!(*log.lock().unwrap(), vec!["gated"]);
}

#[test]
fn recompile_is_idempotent() {
    let (universe, world, pool) = setup();
    let log: Log = Arc::default();
    let a = universe
        .register_system(recording(&universe, "a", &log).build())
        .unwrap();
    let b = universe
        .register_system(recording(&universe, "b", &log).after(a).build())
        .unwrap();

    let group = SystemGroup::new("stable", pool, world);
    group.add_systems(&[a, b]).unwrap();
    group.run_once();
    let first = group.plan_summary();
    group.run_once();
    assert_eq!(group.plan_summary(), first);
    assert_eq!(*log.lock().unwrap(), vec!["a", "b", "a", "b"]);
}

#[test]
fn generation_allocations_respect_their_strategy() {
    let (universe, world, pool) = setup();

    struct Allocating {
        previous: Option<std::ptr::NonNull<u8>>,
    }
    // SAFETY: the pointer is only dereferenced by this system's own runs
    unsafe impl Send for Allocating {}
    impl System for Allocating {
        fn run(&mut self, ctx: &mut SystemRunContext<'_>) {
            let layout = std::alloc::Layout::from_size_align(32, 8).unwrap();
            let transient = ctx.alloc(AllocStrategy::Transient, layout);
            unsafe { transient.as_ptr().write_bytes(0x11, 32) };

            let persistent = ctx.alloc(AllocStrategy::Persistent, layout);
            assert!(ctx.persistent_bytes() >= 32);
            if let Some(previous) = self.previous.take() {
                ctx.dealloc(AllocStrategy::Persistent, previous, layout);
            }
            self.previous = Some(persistent);

            let single = ctx.alloc(AllocStrategy::SingleGeneration, layout);
            unsafe { single.as_ptr().write_bytes(0x22, 32) };
            let multi = ctx.alloc(AllocStrategy::MultiGeneration, layout);
            unsafe { multi.as_ptr().write_bytes(0x33, 32) };
        }
    }
    let system = universe
        .register_system(
            SystemDescriptor::builder("allocating")
                .value(|| Allocating { previous: None })
                .build(),
        )
        .unwrap();

    let group = SystemGroup::new("alloc", pool, world);
    group.add_systems(&[system]).unwrap();
    for _ in 0..6 {
        group.run_once();
    }
    group.remove_system(system, None);
    SystemGroup::destroy(group);
}
