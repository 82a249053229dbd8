//! The process-wide scheduler context and the thread-local worker binding.
//!
//! Everything in the context is immutable after `initialize` except the
//! running flag, the available-jobs counter and the sleep primitives. The
//! context itself lives inside the scheduler's single memory buffer.

use crate::queue::LockedQueue;
use crate::runtime::worker::ThreadLocalState;
use crate::task::{Task, TaskPtr, WorkerId};
use crate::utils::cpu::pause_processor;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU32, Ordering};

/// Rendezvous for worker startup: the running flag is set only once every
/// owned and user worker has arrived, so no task can be stolen by a
/// half-initialized worker.
pub(crate) struct InitializationLatch {
    state: Mutex<u32>,
    cv: Condvar,
}

impl InitializationLatch {
    fn new() -> Self {
        Self {
            state: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Registers one worker; runs `on_last` under the latch lock if this was
    /// the final arrival. Does not block (the main thread must return from
    /// `initialize` immediately).
    pub(crate) fn arrive(&self, total: u32, on_last: impl FnOnce()) {
        let mut count = self.state.lock();
        *count += 1;
        debug_assert!(*count <= total);

        if *count == total {
            on_last();
            self.cv.notify_all();
        }
    }

    /// Same as [`InitializationLatch::arrive`], then blocks until every
    /// worker has arrived.
    pub(crate) fn arrive_and_wait(&self, total: u32, on_last: impl FnOnce()) {
        let mut count = self.state.lock();
        *count += 1;
        debug_assert!(*count <= total);

        if *count == total {
            on_last();
            self.cv.notify_all();
        } else {
            while *count < total {
                self.cv.wait(&mut count);
            }
        }
    }
}

pub(crate) struct JobSystemContext {
    // Immutable after initialization.
    workers: NonNull<ThreadLocalState>,
    num_workers: u16,
    num_owned_workers: u16,
    num_tasks_per_worker: u16,

    buffer_base: NonNull<u8>,
    buffer_size: usize,
    buffer_alignment: usize,
    owns_buffer: bool,

    num_user_threads_setup: AtomicU16,
    init_latch: InitializationLatch,
    is_running: AtomicBool,

    // Shared mutable state.
    main_queue: LockedQueue,
    sleep_mutex: Mutex<()>,
    sleep_cv: Condvar,
    num_available_jobs: CachePadded<AtomicU32>,
}

// Safety: worker slots are only mutated by their owning threads (see
// `ThreadLocalState`), everything else here is atomic or lock-guarded.
unsafe impl Send for JobSystemContext {}
unsafe impl Sync for JobSystemContext {}

pub(crate) struct ContextConfig {
    pub(crate) workers: NonNull<ThreadLocalState>,
    pub(crate) num_workers: u16,
    pub(crate) num_owned_workers: u16,
    pub(crate) num_tasks_per_worker: u16,
    pub(crate) main_queue: LockedQueue,
    pub(crate) buffer_base: NonNull<u8>,
    pub(crate) buffer_size: usize,
    pub(crate) buffer_alignment: usize,
    pub(crate) owns_buffer: bool,
}

impl JobSystemContext {
    pub(crate) fn new(config: ContextConfig) -> Self {
        Self {
            workers: config.workers,
            num_workers: config.num_workers,
            num_owned_workers: config.num_owned_workers,
            num_tasks_per_worker: config.num_tasks_per_worker,
            buffer_base: config.buffer_base,
            buffer_size: config.buffer_size,
            buffer_alignment: config.buffer_alignment,
            owns_buffer: config.owns_buffer,
            num_user_threads_setup: AtomicU16::new(0),
            init_latch: InitializationLatch::new(),
            is_running: AtomicBool::new(false),
            main_queue: config.main_queue,
            sleep_mutex: Mutex::new(()),
            sleep_cv: Condvar::new(),
            num_available_jobs: CachePadded::new(AtomicU32::new(0)),
        }
    }

    #[inline(always)]
    pub(crate) fn num_workers(&self) -> u16 {
        self.num_workers
    }

    #[inline(always)]
    pub(crate) fn num_owned_workers(&self) -> u16 {
        self.num_owned_workers
    }

    #[inline(always)]
    pub(crate) fn num_tasks_per_worker(&self) -> u16 {
        self.num_tasks_per_worker
    }

    pub(crate) fn buffer_parts(&self) -> (NonNull<u8>, usize, usize, bool) {
        (
            self.buffer_base,
            self.buffer_size,
            self.buffer_alignment,
            self.owns_buffer,
        )
    }

    pub(crate) fn next_user_worker_id(&self) -> WorkerId {
        self.num_owned_workers + self.num_user_threads_setup.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn worker(&self, id: WorkerId) -> &ThreadLocalState {
        assert!(id < self.num_workers, "worker id out of range");
        // Safety: the worker array holds `num_workers` initialized slots for
        // the lifetime of the context.
        unsafe { &*self.workers.as_ptr().add(usize::from(id)) }
    }

    pub(crate) fn worker_id_of(&self, worker: &ThreadLocalState) -> WorkerId {
        let offset = worker as *const ThreadLocalState as usize - self.workers.as_ptr() as usize;
        (offset / size_of::<ThreadLocalState>()) as WorkerId
    }

    #[inline(always)]
    pub(crate) fn is_main_worker(&self, worker: &ThreadLocalState) -> bool {
        std::ptr::eq(worker, self.workers.as_ptr())
    }

    pub(crate) fn main_queue(&self) -> &LockedQueue {
        &self.main_queue
    }

    /// Translates a handle into its task record.
    pub(crate) fn resolve(&self, ptr: TaskPtr) -> Option<NonNull<Task>> {
        if ptr.is_null() {
            return None;
        }

        let task = self
            .worker(ptr.worker_id)
            .task_pool
            .task_from_index(ptr.task_index);

        // Safety: handles are only resolved while the task is referenced or
        // queued, both of which keep the slot live.
        debug_assert_eq!(
            unsafe { task.as_ref() }.owning_worker,
            ptr.worker_id,
            "corrupted worker id in task handle"
        );

        Some(task)
    }

    /// Recovers the handle for a task record.
    pub(crate) fn task_ptr_of(&self, task: &Task) -> TaskPtr {
        let worker = self.worker(task.owning_worker);
        let index = worker.task_pool.index_of(NonNull::from(task));

        TaskPtr::new(task.owning_worker, index)
    }

    // Lifecycle flags ------------------------------------------------------

    #[inline(always)]
    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    pub(crate) fn report_main_thread_ready(&self) {
        self.init_latch.arrive(u32::from(self.num_workers), || {
            self.is_running.store(true, Ordering::Relaxed);
        });
    }

    pub(crate) fn report_worker_ready_and_wait(&self) {
        self.init_latch
            .arrive_and_wait(u32::from(self.num_workers), || {
                self.is_running.store(true, Ordering::Relaxed);
            });
    }

    pub(crate) fn begin_shutdown(&self) {
        self.is_running.store(false, Ordering::Relaxed);
        self.wake_all_workers();
    }

    // Sleep discipline -----------------------------------------------------

    #[inline(always)]
    pub(crate) fn add_available_job(&self) -> u32 {
        self.num_available_jobs.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline(always)]
    pub(crate) fn take_available_job(&self) {
        self.num_available_jobs.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn wake_all_workers(&self) {
        // Taking the sleep lock orders the wake against a worker that has
        // checked the counter but not yet blocked; a fire-and-forget notify
        // could land in that window and be lost.
        drop(self.sleep_mutex.lock());
        self.sleep_cv.notify_all();
    }

    pub(crate) fn wake_one_worker(&self) {
        drop(self.sleep_mutex.lock());
        self.sleep_cv.notify_one();
    }

    /// Blocks the calling worker until work may be available. Returns
    /// immediately when the scheduler is shutting down or jobs are pending.
    pub(crate) fn sleep_until_work(&self) {
        if !self.is_running() {
            return;
        }

        pause_processor();

        if self.num_available_jobs.load(Ordering::Relaxed) == 0 {
            let mut guard = self.sleep_mutex.lock();
            while self.is_running() && self.num_available_jobs.load(Ordering::Relaxed) == 0 {
                self.sleep_cv.wait(&mut guard);
            }
        }
    }
}

// Process-wide singleton --------------------------------------------------

static JOB_SYSTEM: AtomicPtr<JobSystemContext> = AtomicPtr::new(std::ptr::null_mut());

thread_local! {
    static CURRENT_WORKER: Cell<Option<NonNull<ThreadLocalState>>> = const { Cell::new(None) };
}

/// Publishes the context. Fails if another scheduler is already live.
pub(crate) fn install_system(context: NonNull<JobSystemContext>) -> bool {
    JOB_SYSTEM
        .compare_exchange(
            std::ptr::null_mut(),
            context.as_ptr(),
            Ordering::Release,
            Ordering::Relaxed,
        )
        .is_ok()
}

pub(crate) fn clear_system() -> Option<NonNull<JobSystemContext>> {
    NonNull::new(JOB_SYSTEM.swap(std::ptr::null_mut(), Ordering::Acquire))
}

pub(crate) fn try_system() -> Option<&'static JobSystemContext> {
    // Safety: the context stays live from install until `clear_system`;
    // callers are scheduler entry points that the shutdown contract forbids
    // racing with.
    NonNull::new(JOB_SYSTEM.load(Ordering::Acquire)).map(|ptr| unsafe { &*ptr.as_ptr() })
}

#[track_caller]
pub(crate) fn system() -> &'static JobSystemContext {
    try_system().expect("the job system has not been initialized")
}

pub(crate) fn bind_current_worker(worker: &ThreadLocalState) {
    CURRENT_WORKER.with(|cell| cell.set(Some(NonNull::from(worker))));
}

pub(crate) fn unbind_current_worker() {
    CURRENT_WORKER.with(|cell| cell.set(None));
}

#[track_caller]
pub(crate) fn current_worker() -> &'static ThreadLocalState {
    let ptr = CURRENT_WORKER
        .with(Cell::get)
        .expect("this thread is not registered with the job system");

    // Safety: worker slots live until shutdown, and a registered thread is
    // forbidden from calling in after shutdown.
    unsafe { &*ptr.as_ptr() }
}
