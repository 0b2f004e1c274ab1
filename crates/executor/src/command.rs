use std::sync::Arc;

use crossbeam_utils::sync::WaitGroup;
use fray_sync::Fence;

use crate::pool::ThreadPool;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// One entry of a [`CommandBuffer`].
pub enum Command {
    /// Spawn a task on the pool. Runs concurrently with every other task
    /// that is not separated from it by a wait.
    Task(Task),
    /// Block until the task emitted `delta` commands earlier has completed,
    /// and with it everything that comes later in the buffer.
    WaitIndirect(usize),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task(_) => f.write_str("Task"),
            Self::WaitIndirect(delta) => f.debug_tuple("WaitIndirect").field(delta).finish(),
        }
    }
}

/// An ordered list of commands, executed front to back by a driver task.
#[derive(Default, Debug)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task command.
    #[inline]
    pub fn task<F>(&mut self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.commands.push(Command::Task(Box::new(task)));
    }

    /// Appends a wait on the task emitted `delta` commands back.
    ///
    /// `delta` counts *commands*, not tasks, and must point at a task
    /// command; the driver panics otherwise.
    #[inline]
    pub fn wait_indirect(&mut self, delta: usize) {
        debug_assert!(delta > 0, "a wait cannot reference itself");
        self.commands.push(Command::WaitIndirect(delta));
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Completion handle for a submitted [`CommandBuffer`].
#[must_use]
pub struct SubmitHandle {
    wait_group: WaitGroup,
}

impl SubmitHandle {
    pub(crate) fn new(wait_group: WaitGroup) -> Self {
        Self { wait_group }
    }

    /// Blocks until every command of the buffer has completed.
    pub fn join(self) {
        self.wait_group.wait();
    }
}

pub(crate) fn drive(pool: &ThreadPool, buffer: CommandBuffer, wait_group: WaitGroup) {
    // one completion slot per command, so wait deltas can index directly
    let mut completions: Vec<Option<Arc<Fence>>> = Vec::with_capacity(buffer.commands.len());
    for command in buffer.commands {
        match command {
            Command::Task(task) => {
                let fence = Arc::new(Fence::new());
                let done = fence.clone();
                let task_wait_group = wait_group.clone();
                pool.execute(move || {
                    task();
                    done.signal();
                    drop(task_wait_group);
                });
                completions.push(Some(fence));
            }
            Command::WaitIndirect(delta) => {
                let index = completions
                    .len()
                    .checked_sub(delta)
                    .expect("wait references a command before the buffer start");
                completions[index]
                    .as_ref()
                    .expect("wait references a non-task command")
                    .wait();
                completions.push(None);
            }
        }
    }
    drop(wait_group);
}
