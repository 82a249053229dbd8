//! Per-worker state and the worker thread loop.

use crate::queue::SpmcDeque;
use crate::runtime::context::{self, JobSystemContext};
use crate::runtime::scheduler;
use crate::task::pool::TaskPool;
use crate::task::ptr::TaskIndex;
use crate::task::{TaskPtr, WorkerId};
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

/// Everything a worker owns: its two deques, its task pool, the list of live
/// allocations for garbage collection, the steal PRNG and the last-victim
/// hint.
///
/// Only the owning thread mutates the non-atomic fields; other workers
/// interact with this slot exclusively through the deques' thief end and by
/// reading task records out of the pool via handles.
pub(crate) struct ThreadLocalState {
    pub(crate) normal_queue: SpmcDeque,
    pub(crate) worker_queue: SpmcDeque,
    pub(crate) task_pool: TaskPool,

    /// Indices of tasks currently alive in this worker's pool.
    allocated_tasks: NonNull<TaskIndex>,
    num_allocated_tasks: Cell<u16>,

    rng: RefCell<fastrand::Rng>,
    last_stolen_worker: Cell<NonNull<ThreadLocalState>>,

    /// Join handle for owned workers; `None` for the main thread and user
    /// threads.
    pub(crate) join_handle: Cell<Option<JoinHandle<()>>>,
}

// Safety: single-writer discipline documented on the struct; the fields
// touched cross-thread (deque slots, task records) synchronize themselves.
unsafe impl Send for ThreadLocalState {}
unsafe impl Sync for ThreadLocalState {}

impl ThreadLocalState {
    pub(crate) fn new(
        normal_queue: SpmcDeque,
        worker_queue: SpmcDeque,
        task_pool: TaskPool,
        allocated_tasks: NonNull<TaskIndex>,
        rng_seed: u64,
        last_stolen_worker: NonNull<ThreadLocalState>,
    ) -> Self {
        Self {
            normal_queue,
            worker_queue,
            task_pool,
            allocated_tasks,
            num_allocated_tasks: Cell::new(0),
            rng: RefCell::new(fastrand::Rng::with_seed(rng_seed)),
            last_stolen_worker: Cell::new(last_stolen_worker),
            join_handle: Cell::new(None),
        }
    }

    #[inline(always)]
    pub(crate) fn num_allocated_tasks(&self) -> u16 {
        self.num_allocated_tasks.get()
    }

    pub(crate) fn record_allocated(&self, index: TaskIndex) {
        let count = self.num_allocated_tasks.get();
        debug_assert!(count < self.task_pool.capacity(), "allocation untracked");

        // Safety: the list has one slot per pool slot and count is bounded
        // by the pool capacity.
        unsafe { self.allocated_tasks.as_ptr().add(usize::from(count)).write(index) };
        self.num_allocated_tasks.set(count + 1);
    }

    /// Compacts the allocated list in place, returning every slot whose ref
    /// count has dropped to zero back to the pool. Called by the owner under
    /// allocation pressure and opportunistically from the thread loop.
    pub(crate) fn garbage_collect(&self) {
        let list = self.allocated_tasks.as_ptr();
        let count = self.num_allocated_tasks.get();
        let mut write_index: u16 = 0;

        for read_index in 0..count {
            // Safety: indices below `count` were written by
            // `record_allocated`.
            let handle = unsafe { *list.add(usize::from(read_index)) };
            let task = self.task_pool.task_from_index(handle);

            // Safety: tracked slots hold live task records until this pass
            // reclaims them.
            let finished = unsafe { task.as_ref() }.ref_count.load(Ordering::Acquire) == 0;

            if finished {
                self.task_pool.deallocate(task);
            } else {
                // Safety: write_index <= read_index < capacity.
                unsafe { list.add(usize::from(write_index)).write(handle) };
                write_index += 1;
            }
        }

        self.num_allocated_tasks.set(write_index);
    }

    /// Acquires one task (own queues first, then stealing) and runs it to
    /// completion. Returns false if no work was found anywhere.
    pub(crate) fn try_run_task(&self, ctx: &JobSystemContext) -> bool {
        let is_main_thread = ctx.is_main_worker(self);

        let mut from_main_queue = false;
        let mut task = self.normal_queue.pop();

        if task.is_none() {
            if is_main_thread {
                // The main thread drains its restricted queue in place of a
                // WORKER deque; it must never execute WORKER tasks.
                if let Some(ptr) = ctx.main_queue().pop() {
                    from_main_queue = true;
                    task = Some(ptr);
                }
            } else {
                task = self.worker_queue.pop();
            }
        }

        if task.is_none() {
            // Safety: the hint always points at a live worker slot.
            let last_victim = unsafe { self.last_stolen_worker.get().as_ref() };
            task = self.try_steal_from(last_victim, is_main_thread);
        }

        if task.is_none() {
            let victim = ctx.worker(self.random_victim_id(ctx));
            task = self.try_steal_from(victim, is_main_thread);

            if task.is_some() {
                self.last_stolen_worker.set(NonNull::from(victim));
            }
        }

        let Some(task_ptr) = task else {
            return false;
        };

        if !from_main_queue {
            ctx.take_available_job();
        }

        let task = ctx
            .resolve(task_ptr)
            .expect("a queued handle always resolves");
        scheduler::run_task_function(ctx, task);

        true
    }

    fn try_steal_from(
        &self,
        victim: &ThreadLocalState,
        is_main_thread: bool,
    ) -> Option<TaskPtr> {
        if std::ptr::eq(self, victim) {
            return None;
        }

        victim.normal_queue.steal().success().or_else(|| {
            if is_main_thread {
                None
            } else {
                victim.worker_queue.steal().success()
            }
        })
    }

    fn random_victim_id(&self, ctx: &JobSystemContext) -> WorkerId {
        self.rng.borrow_mut().u16(..ctx.num_workers())
    }
}

/// Thread body for scheduler-owned workers.
pub(crate) fn owned_worker_entry(worker_id: WorkerId) {
    let ctx = context::system();
    let worker = ctx.worker(worker_id);

    context::bind_current_worker(worker);
    ctx.report_worker_ready_and_wait();

    log::trace!("worker {worker_id} running");

    while ctx.is_running() {
        if !worker.try_run_task(ctx) {
            ctx.sleep_until_work();
        }
    }

    log::trace!("worker {worker_id} exiting");
}
