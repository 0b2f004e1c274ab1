use std::sync::{Mutex, OnceLock};

use crossbeam_utils::sync::WaitGroup;
use fray_sync::Fence;

use crate::command::{drive, CommandBuffer, SubmitHandle};

static GLOBAL: OnceLock<Mutex<ThreadPool>> = OnceLock::new();

/// A clonable handle to a pool of worker threads.
///
/// Schedule drivers block inside the pool while their tasks run on other
/// workers, so the pool refuses to shrink below four threads.
#[derive(Clone)]
pub struct ThreadPool(::threadpool::ThreadPool);

const MIN_THREADS: usize = 4;

impl ThreadPool {
    const DEFAULT_NAME: &'static str = module_path!();

    /// Builds a pool sized from the `FRAY_NUM_THREADS` environment variable,
    /// falling back to the number of CPUs.
    pub fn from_env() -> Self {
        if let Some(num_threads) = std::env::var("FRAY_NUM_THREADS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            return Self::new(num_threads);
        }
        // the builder defaults to one thread per CPU
        let pool = ::threadpool::Builder::new()
            .thread_name(Self::DEFAULT_NAME.to_string())
            .build();
        if pool.max_count() < MIN_THREADS {
            return Self::new(MIN_THREADS);
        }
        Self(pool)
    }

    #[inline]
    pub fn new(num_threads: usize) -> Self {
        Self::with_name(Self::DEFAULT_NAME.to_string(), num_threads)
    }

    #[inline]
    pub fn with_name(name: String, num_threads: usize) -> Self {
        Self(::threadpool::ThreadPool::with_name(
            name,
            num_threads.max(MIN_THREADS),
        ))
    }

    #[inline]
    pub fn max_count(&self) -> usize {
        self.0.max_count()
    }

    /// Executes `job` on a worker thread.
    #[inline]
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.0.execute(job);
    }

    /// Blocks until all queued jobs have been executed.
    #[inline]
    pub fn join(&self) {
        self.0.join()
    }

    /// Submits a command buffer and returns a handle that can be joined.
    ///
    /// A driver task walks the buffer on a worker thread: every task command
    /// is spawned on the pool, every wait command blocks the driver until the
    /// referenced task has completed. Tasks separated only by other tasks run
    /// concurrently.
    pub fn submit(&self, buffer: CommandBuffer) -> SubmitHandle {
        let wait_group = WaitGroup::new();
        let handle = SubmitHandle::new(wait_group.clone());
        let pool = self.clone();
        self.execute(move || drive(&pool, buffer, wait_group));
        handle
    }

    /// Submits a command buffer without a way to observe its completion.
    pub fn submit_detached(&self, buffer: CommandBuffer) {
        let pool = self.clone();
        self.execute(move || drive(&pool, buffer, WaitGroup::new()));
    }

    /// Executes `job` and blocks the calling thread until it finished.
    ///
    /// The job still runs on a worker; this is occasionally useful in tests.
    pub fn execute_blocking<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let fence = std::sync::Arc::new(Fence::new());
        let done = fence.clone();
        self.execute(move || {
            job();
            done.signal();
        });
        fence.wait();
    }
}

impl Default for ThreadPool {
    #[inline]
    fn default() -> Self {
        Self::from_env()
    }
}

impl From<::threadpool::ThreadPool> for ThreadPool {
    #[inline]
    fn from(pool: ::threadpool::ThreadPool) -> Self {
        Self(pool)
    }
}

/// Returns a clone of the process-wide pool, creating it on first use.
pub fn global() -> ThreadPool {
    get_or_init_global().lock().unwrap().clone()
}

/// Replaces the process-wide pool, returning the previous one.
pub fn replace_global_pool(pool: ThreadPool) -> Option<ThreadPool> {
    let mut tmp = Some(pool);
    let mutex = GLOBAL.get_or_init(|| Mutex::new(tmp.take().unwrap()));
    tmp.map(|tmp| std::mem::replace(&mut *mutex.lock().unwrap(), tmp))
}

fn get_or_init_global() -> &'static Mutex<ThreadPool> {
    GLOBAL.get_or_init(|| Mutex::new(ThreadPool::from_env()))
}
