//! Scheduler lifecycle: buffer layout, initialization, user-thread
//! registration, shutdown, and the identity queries.

use crate::arena::LinearAllocator;
use crate::config::{InitializationToken, MemoryRequirements};
use crate::queue::{LockedQueue, SpmcDeque};
use crate::runtime::context::{self, ContextConfig, JobSystemContext};
use crate::runtime::worker::{self, ThreadLocalState};
use crate::task::WorkerId;
use crate::task::pool::{TaskPool, TaskSlot};
use crate::task::ptr::TaskIndex;
use crate::utils;
use anyhow::{Context as _, Result, bail, ensure};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

/// The number of hardware threads on this machine. Callable before and
/// after initialization.
pub fn num_system_threads() -> usize {
    utils::sys::num_system_threads()
}

/// Lays out all scheduler state in `buffer` (which must match
/// `requirements`), or in a self-allocated buffer when `None`. The calling
/// thread becomes worker 0, the main thread.
///
/// Worker threads are spawned here, but the scheduler only starts running
/// once every owned and user worker has finished registering.
pub fn initialize(
    requirements: &MemoryRequirements,
    buffer: Option<NonNull<u8>>,
) -> Result<InitializationToken> {
    let options = &requirements.options;
    let num_workers = options.worker_count();
    let num_owned_workers = options.owned_worker_count();
    let tasks_per_worker = options.tasks_per_worker();
    let total_tasks = usize::from(tasks_per_worker) * usize::from(num_workers);

    ensure!(
        context::try_system().is_none(),
        "the job system is already initialized"
    );

    let layout = Layout::from_size_align(requirements.byte_size, requirements.alignment)?;
    let owns_buffer = buffer.is_none();
    let base = match buffer {
        Some(ptr) => {
            ensure!(
                ptr.as_ptr() as usize % requirements.alignment == 0,
                "buffer must be aligned to the requirements' alignment"
            );
            ptr
        }
        // Safety: the layout always has a non-zero size.
        None => NonNull::new(unsafe { std::alloc::alloc(layout) })
            .context("failed to allocate the scheduler buffer")?,
    };

    // Carve the buffer. Order must mirror `MemoryRequirements::new`.
    // Safety: `base` spans `byte_size` writable bytes.
    let mut arena = unsafe { LinearAllocator::new(base, requirements.byte_size) };

    let context_slot = arena.alloc_array_uninit::<JobSystemContext>(1);
    let workers = arena.alloc_array_uninit::<ThreadLocalState>(usize::from(num_workers));
    let task_slots = arena.alloc_array_uninit::<TaskSlot>(total_tasks);
    let main_ring =
        arena.alloc_array_with::<u32>(usize::from(options.main_queue_capacity), |_| 0);
    let deque_slots = arena.alloc_array_with::<AtomicU32>(total_tasks, |_| AtomicU32::new(0));
    let handle_lists = arena.alloc_array_uninit::<TaskIndex>(total_tasks);
    debug_assert_eq!(arena.remaining(), 0, "carve order drifted from layout");

    let normal_capacity = usize::from(options.normal_queue_capacity);
    let worker_capacity = usize::from(options.worker_queue_capacity);

    for i in 0..usize::from(num_workers) {
        // Safety (all blocks below): the sub-span offsets stay within the
        // arrays carved above; every worker gets disjoint spans.
        let deque_base = unsafe { deque_slots.as_ptr().add(i * (normal_capacity + worker_capacity)) };
        let normal_queue = unsafe {
            SpmcDeque::new(NonNull::new_unchecked(deque_base), normal_capacity)
        };
        let worker_queue = unsafe {
            SpmcDeque::new(
                NonNull::new_unchecked(deque_base.add(normal_capacity)),
                worker_capacity,
            )
        };

        let pool_base = unsafe { task_slots.as_ptr().add(i * usize::from(tasks_per_worker)) };
        let task_pool =
            unsafe { TaskPool::new(NonNull::new_unchecked(pool_base), tasks_per_worker) };

        let allocated_list = unsafe {
            NonNull::new_unchecked(handle_lists.as_ptr().add(i * usize::from(tasks_per_worker)))
        };

        // Distinct streams per worker off the one seed.
        let rng_seed = options
            .steal_rng_seed
            .wrapping_add((i as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));

        let state = ThreadLocalState::new(
            normal_queue,
            worker_queue,
            task_pool,
            allocated_list,
            rng_seed,
            // Every worker's first steal target is the main thread.
            workers,
        );

        unsafe { workers.as_ptr().add(i).write(state) };
    }

    // Safety: main_ring holds `main_queue_capacity` u32 slots.
    let main_queue = unsafe {
        LockedQueue::new(main_ring, usize::from(options.main_queue_capacity))
    };

    let ctx = JobSystemContext::new(ContextConfig {
        workers,
        num_workers,
        num_owned_workers,
        num_tasks_per_worker: tasks_per_worker,
        main_queue,
        buffer_base: base,
        buffer_size: requirements.byte_size,
        buffer_alignment: requirements.alignment,
        owns_buffer,
    });

    // Safety: `context_slot` is the uninitialized first block of the arena.
    unsafe { context_slot.as_ptr().write(ctx) };

    if !context::install_system(context_slot) {
        // Lost an initialization race; undo our buffer.
        // Safety: nothing else has seen this buffer.
        unsafe {
            std::ptr::drop_in_place(context_slot.as_ptr());
            if owns_buffer {
                std::alloc::dealloc(base.as_ptr(), layout);
            }
        }
        bail!("the job system is already initialized");
    }

    let ctx = context::system();
    context::bind_current_worker(ctx.worker(0));
    ctx.report_main_thread_ready();

    log::debug!(
        "initialized {num_workers} workers ({num_owned_workers} owned) in {} bytes",
        requirements.byte_size
    );

    for worker_id in 1..num_owned_workers {
        let handle = std::thread::Builder::new()
            .name(format!("forq-worker-{worker_id}"))
            .spawn(move || worker::owned_worker_entry(worker_id))
            .expect("failed to spawn worker thread");

        ctx.worker(worker_id).join_handle.set(Some(handle));
    }

    Ok(InitializationToken::new(num_owned_workers))
}

/// Registers the calling thread as the next user worker slot. Must be
/// called once per configured user thread, after [`initialize`], before the
/// thread submits any work. Blocks until the whole pool has rendezvoused.
pub fn setup_user_thread() {
    let ctx = context::system();
    let worker_id = ctx.next_user_worker_id();

    assert!(
        worker_id < ctx.num_workers(),
        "more calls to setup_user_thread than configured user threads"
    );

    utils::thread::set_current_thread_name(&format!("forq-user-{worker_id}"));
    context::bind_current_worker(ctx.worker(worker_id));
    ctx.report_worker_ready_and_wait();
}

/// Stops and joins the owned workers, then releases all scheduler state.
/// Main-thread-only. In-flight tasks run to completion first; user threads
/// must already have stopped using the API.
pub fn shutdown() -> Result<()> {
    let ctx = context::system();
    assert!(
        ctx.is_main_worker(context::current_worker()),
        "shutdown may only be called from the main thread"
    );

    log::debug!("shutting down {} workers", ctx.num_workers());
    ctx.begin_shutdown();

    let mut panicked_workers = 0usize;
    for worker_id in 1..ctx.num_owned_workers() {
        if let Some(handle) = ctx.worker(worker_id).join_handle.take()
            && handle.join().is_err()
        {
            panicked_workers += 1;
        }
    }

    let context_ptr = context::clear_system().expect("context was installed");
    context::unbind_current_worker();

    // Safety: all worker threads have exited; this thread holds the only
    // remaining access to the context.
    let (base, byte_size, alignment, owns_buffer) =
        unsafe { context_ptr.as_ref() }.buffer_parts();
    let num_workers = unsafe { context_ptr.as_ref() }.num_workers();

    // Tear down the in-place state before releasing the buffer.
    for worker_id in 0..num_workers {
        let worker_ptr =
            unsafe { context_ptr.as_ref() }.worker(worker_id) as *const ThreadLocalState;
        // Safety: constructed in `initialize`, never dropped elsewhere.
        unsafe { std::ptr::drop_in_place(worker_ptr.cast_mut()) };
    }
    // Safety: same.
    unsafe { std::ptr::drop_in_place(context_ptr.as_ptr()) };

    if owns_buffer {
        let layout =
            Layout::from_size_align(byte_size, alignment).expect("validated at initialize");
        // Safety: allocated with this exact layout in `initialize`.
        unsafe { std::alloc::dealloc(base.as_ptr(), layout) };
    }

    ensure!(
        panicked_workers == 0,
        "{panicked_workers} worker thread(s) panicked"
    );
    Ok(())
}

/// The id of the calling worker. The main thread is always 0.
pub fn current_worker() -> WorkerId {
    let ctx = context::system();
    ctx.worker_id_of(context::current_worker())
}

/// Whether the calling thread is the main thread (worker 0). Must only be
/// called from a registered thread.
pub fn is_main_thread() -> bool {
    context::system().is_main_worker(context::current_worker())
}

/// The total number of workers (owned + user) in the running scheduler.
pub fn num_workers() -> u16 {
    context::system().num_workers()
}
