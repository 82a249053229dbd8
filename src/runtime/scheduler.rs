//! The scheduler core: task creation, submission routing, the completion
//! protocol, waiting, and reference counting.
//!
//! None of the hot-path operations here can fail. Capacity pressure (full
//! deque, exhausted pool) is absorbed by running other tasks until space
//! frees up, so user code never observes a submission error.

use crate::queue::{QueueType, SpmcDeque};
use crate::runtime::context::{self, JobSystemContext};
use crate::runtime::worker::ThreadLocalState;
use crate::task::{
    RawTaskFn, Task, TaskData, TaskPtr, TaskRef, closure_trampoline, install_closure,
};
use smallvec::SmallVec;
use std::panic::AssertUnwindSafe;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

// Task creation -----------------------------------------------------------

/// Creates an unsubmitted task on the current worker running `f`.
///
/// If `parent` is given, the new task becomes part of the parent's subtree:
/// the parent does not count as done until this task (and its own subtree)
/// has finished. The closure and its captures are stored inline in the task
/// record; anything larger than the inline region panics.
pub fn task_make<F>(f: F, parent: Option<TaskRef>) -> TaskRef
where
    F: FnOnce(TaskRef) + Send + 'static,
{
    // Safety: `'static` closures cannot smuggle borrows that outlive the
    // task.
    unsafe { task_make_unchecked(f, parent) }
}

/// [`task_make`] without the `'static` bound.
///
/// # Safety
///
/// Every borrow captured by `f` must outlive the completion of the task:
/// the caller must wait on the task (or a parent that transitively owns it)
/// before the borrowed data goes out of scope.
pub unsafe fn task_make_unchecked<F>(f: F, parent: Option<TaskRef>) -> TaskRef
where
    F: FnOnce(TaskRef) + Send,
{
    let ctx = context::system();
    let task = make_raw_task(ctx, closure_trampoline::<F> as RawTaskFn, parent);

    // Safety: the task was just allocated with the matching trampoline.
    install_closure(unsafe { task.as_ref() }, f);

    TaskRef::from_raw(task)
}

fn make_raw_task(
    ctx: &JobSystemContext,
    fn_storage: RawTaskFn,
    parent: Option<TaskRef>,
) -> NonNull<Task> {
    let worker = context::current_worker();
    let worker_id = ctx.worker_id_of(worker);
    let max_tasks = ctx.num_tasks_per_worker();

    if worker.num_allocated_tasks() == max_tasks {
        worker.garbage_collect();

        if worker.num_allocated_tasks() == max_tasks {
            // The pool stays full until some of our tasks retire; run work
            // (ours or anyone's) until a GC pass frees a slot.
            ctx.wake_all_workers();
            while worker.num_allocated_tasks() == max_tasks {
                worker.try_run_task(ctx);
                worker.garbage_collect();
            }
        }
    }

    let parent_ptr = parent.map_or(TaskPtr::NULL, |p| ctx.task_ptr_of(p.task()));
    let task = worker.task_pool.allocate(worker_id, fn_storage, parent_ptr);

    if let Some(parent) = parent {
        // Counted before the child can possibly be submitted, so the parent
        // cannot complete in the window between its own function returning
        // and this child entering a queue.
        parent
            .task()
            .num_unfinished
            .fetch_add(1, Ordering::Release);
    }

    worker.record_allocated(worker.task_pool.index_of(task));

    task
}

// Submission --------------------------------------------------------------

/// Submits the task to `queue`. The task is not required to have been
/// created on the submitting thread. Panics if the task was already
/// submitted.
pub fn task_submit(task: TaskRef, queue: QueueType) {
    let ctx = context::system();
    submit(ctx, task, queue);
}

/// [`task_submit`] followed by [`wait_on_task`].
pub fn task_submit_and_wait(task: TaskRef, queue: QueueType) {
    task_submit(task, queue);
    wait_on_task(task);
}

pub(crate) fn submit(ctx: &JobSystemContext, task: TaskRef, mut queue: QueueType) {
    // With one total worker there is no thread the WORKER queue could
    // legally run on.
    if queue == QueueType::Worker && ctx.num_workers() == 1 {
        queue = QueueType::Normal;
    }

    let worker = context::current_worker();
    let task_ptr = ctx.task_ptr_of(task.task());

    task.task().set_queue_tag(queue);

    match queue {
        QueueType::Normal => push_or_run(ctx, worker, &worker.normal_queue, task_ptr),
        QueueType::Worker => push_or_run(ctx, worker, &worker.worker_queue, task_ptr),
        QueueType::Main => {
            // Only the main thread drains this queue; while it is full, help
            // it along instead of spinning.
            while !ctx.main_queue().push(task_ptr) {
                worker.try_run_task(ctx);
            }
        }
    }

    if queue != QueueType::Main {
        let pending = ctx.add_available_job();
        if pending >= u32::from(ctx.num_workers()) {
            ctx.wake_all_workers();
        } else {
            ctx.wake_one_worker();
        }
    }
}

fn push_or_run(
    ctx: &JobSystemContext,
    worker: &ThreadLocalState,
    queue: &SpmcDeque,
    task_ptr: TaskPtr,
) {
    if queue.push(task_ptr).is_err() {
        // Only this worker can drain its own deque, so progress is
        // guaranteed: each failed retry executes one task.
        ctx.wake_all_workers();
        while queue.push(task_ptr).is_err() {
            worker.try_run_task(ctx);
        }
    }
}

// Continuations -----------------------------------------------------------

/// Registers `continuation` to be submitted to `queue` once `task`'s entire
/// subtree has finished.
///
/// Neither task may have been submitted yet, and `continuation` must not
/// already be chained to another task.
pub fn task_add_continuation(task: TaskRef, continuation: TaskRef, queue: QueueType) {
    let ctx = context::system();
    let parent = task.task();
    let cont = continuation.task();

    assert!(
        parent.queue_tag().is_none(),
        "continuations must be added before the task is submitted"
    );
    assert!(
        cont.next_continuation.load(Ordering::Relaxed).is_null(),
        "a continuation may only be chained to one task"
    );

    // Parks the destination queue in the tag; `set_queue_tag` also asserts
    // the continuation was never submitted.
    cont.set_queue_tag(queue);

    let new_head = ctx.task_ptr_of(cont);
    let mut head = parent.first_continuation.load(Ordering::Relaxed);

    loop {
        cont.next_continuation.store(head, Ordering::Relaxed);

        match parent.first_continuation.compare_exchange(
            head,
            new_head,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(current) => head = current,
        }
    }
}

// Reference counting ------------------------------------------------------

/// Takes a reference on the task, keeping its slot from being reclaimed.
///
/// To extend a task's life past its execution, the first extra reference
/// must be taken before the task is submitted; afterwards the scheduler may
/// already have released its own.
pub fn task_inc_ref(task: TaskRef) {
    let t = task.task();
    let previous = t.ref_count.fetch_add(1, Ordering::Relaxed);

    debug_assert!(
        previous >= 1 || t.queue_tag().is_none(),
        "the first task_inc_ref must happen before submission"
    );
}

/// Releases a reference taken with [`task_inc_ref`]. Once the count reaches
/// zero the owning worker's next GC pass reclaims the slot.
pub fn task_dec_ref(task: TaskRef) {
    let previous = task.task().ref_count.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(previous >= 1, "task_dec_ref called too many times");
}

/// Whether the task's entire subtree has finished executing.
///
/// After submission this is only safe to call while holding a reference from
/// [`task_inc_ref`].
pub fn task_is_done(task: TaskRef) -> bool {
    task.is_done()
}

// Waiting -----------------------------------------------------------------

/// Blocks until `task` is done, executing other tasks the whole time. Must
/// be called from the worker that created the task, after submitting it.
pub fn wait_on_task(task: TaskRef) {
    let ctx = context::system();
    let worker = context::current_worker();
    let t = task.task();

    assert!(
        t.queue_tag().is_some(),
        "the task must be submitted before waiting on it"
    );
    assert_eq!(
        t.owning_worker,
        ctx.worker_id_of(worker),
        "wait_on_task requires a task created on the current worker"
    );

    ctx.wake_all_workers();

    while !t.is_done() {
        worker.try_run_task(ctx);
    }
}

// Main queue --------------------------------------------------------------

/// Runs tasks from the main queue while `predicate` returns true; returns
/// when the queue is empty or the predicate fails. The predicate is checked
/// after each task. Main-thread-only.
pub fn tick_main_queue_while(mut predicate: impl FnMut() -> bool) {
    let ctx = context::system();
    let worker = context::current_worker();
    assert!(
        ctx.is_main_worker(worker),
        "tick_main_queue may only be called from the main thread"
    );

    loop {
        let Some(task_ptr) = ctx.main_queue().pop() else {
            break;
        };

        let task = ctx
            .resolve(task_ptr)
            .expect("a queued handle always resolves");
        run_task_function(ctx, task);

        if !predicate() {
            break;
        }
    }
}

/// Drains the main queue. Main-thread-only.
pub fn tick_main_queue() {
    tick_main_queue_while(|| true);
}

// Execution and completion ------------------------------------------------

/// Runs the task's function and then the completion protocol.
pub(crate) fn run_task_function(ctx: &JobSystemContext, task: NonNull<Task>) {
    let fn_storage = unsafe { task.as_ref() }.fn_storage;

    // Task functions are run-to-completion; an unwind would leave the
    // subtree counters permanently unbalanced, so treat it as fatal.
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        // Safety: the task came off a queue, so it is live and runs exactly
        // once, here.
        unsafe { fn_storage(task) };
    }));

    if outcome.is_err() {
        log::error!("task function panicked; task functions must not unwind");
        std::process::abort();
    }

    finish(ctx, task);
}

/// The completion protocol. Walks the parent chain iteratively (a deep task
/// tree would otherwise recurse one frame per ancestor level).
fn finish(ctx: &JobSystemContext, task: NonNull<Task>) {
    // Phase 1: decrement outstanding-work counters upward, collecting every
    // task whose subtree just became complete. The walk stops at the first
    // ancestor that still has children in flight.
    let mut completed: SmallVec<[NonNull<Task>; 8]> = SmallVec::new();
    let mut current = Some(task);

    while let Some(t) = current {
        let remaining = unsafe { t.as_ref() }
            .num_unfinished
            .fetch_sub(1, Ordering::Relaxed)
            - 1;

        if remaining != 0 {
            break;
        }

        completed.push(t);
        current = ctx.resolve(unsafe { t.as_ref() }.parent);
    }

    // Phase 2: finish ancestor-first, matching the unwind order of the
    // recursive formulation: publish "done", submit continuations, release
    // the scheduler's reference.
    for t in completed.iter().rev() {
        // Safety: collected tasks stay live; their ref_count is still held.
        let t = unsafe { t.as_ref() };

        // The release pairs with the acquire in `task_is_done`, publishing
        // every side effect of the subtree to waiters.
        t.num_unfinished.fetch_sub(1, Ordering::Release);

        let mut continuation_ptr = t.first_continuation.load(Ordering::Relaxed);
        while let Some(continuation) = ctx.resolve(continuation_ptr) {
            // Safety: continuations hold their initial reference until they
            // run, which cannot happen before this submit.
            let continuation = unsafe { continuation.as_ref() };

            let next = continuation.next_continuation.load(Ordering::Relaxed);
            let queue = continuation
                .take_queue_tag()
                .expect("continuation queue recorded at add time");

            submit(ctx, TaskRef::from_raw(NonNull::from(continuation)), queue);

            continuation_ptr = next;
        }

        t.ref_count.fetch_sub(1, Ordering::Relaxed);
    }
}

// Data access --------------------------------------------------------------

/// Borrows the task's inline user-data region at `alignment`. Free-function
/// spelling of [`TaskRef::data`].
pub fn task_data(task: TaskRef, alignment: usize) -> TaskData {
    task.data(alignment)
}
