//! Fork/join convenience combinators layered on the task API: parallel-for
//! over index ranges and slices, parallel-invoke, and an in-place parallel
//! reduction.
//!
//! Work is split recursively: each task either splits its range in half and
//! submits the halves as children (to the same queue it was submitted to),
//! or runs the body over its leaf range. A splitter is any
//! `Fn(usize) -> bool` returning whether a range of that length should still
//! be split.
//!
//! # Safety
//!
//! The combinators place no `'static` bound on their bodies so they can
//! operate on borrowed data. Every one of them is `unsafe` for that reason:
//! the caller must guarantee all captured borrows outlive the completion of
//! the returned task, i.e. [`crate::wait_on_task`] runs before the borrowed
//! data goes out of scope.

use crate::num_workers;
use crate::queue::QueueType;
use crate::task::TaskRef;
use crate::{task_make_unchecked, task_submit, task_submit_and_wait};

/// Splitter that keeps splitting while a range holds more than `max_count`
/// items.
pub fn count_splitter(max_count: usize) -> impl Fn(usize) -> bool + Copy + Send + Sync {
    move |count| count > max_count
}

/// Splitter that divides `total_num_items` evenly into
/// `num_groups_per_thread` leaf ranges per worker.
///
/// Must be called after [`crate::initialize`]; the current worker count
/// determines the split.
pub fn even_splitter(
    total_num_items: usize,
    num_groups_per_thread: usize,
) -> impl Fn(usize) -> bool + Copy + Send + Sync {
    let groups = num_groups_per_thread.max(1);
    count_splitter((total_num_items / groups) / usize::from(num_workers()))
}

/// Splitter that keeps splitting while a range of `T`s is larger than
/// `max_bytes`.
pub fn data_size_splitter<T>(max_bytes: usize) -> impl Fn(usize) -> bool + Copy + Send + Sync {
    move |count| count * size_of::<T>() > max_bytes
}

/// Creates (without submitting) a task that runs `body` once per index in
/// `start..start + count`, splitting per `splitter`.
///
/// # Safety
///
/// Borrows captured by `body` must outlive the completion of the returned
/// task (see the module docs).
pub unsafe fn parallel_for<S, F>(
    start: usize,
    count: usize,
    splitter: S,
    body: F,
    parent: Option<TaskRef>,
) -> TaskRef
where
    S: Fn(usize) -> bool + Clone + Send,
    F: Fn(TaskRef, usize) + Clone + Send,
{
    // Safety: forwarded from the caller.
    unsafe {
        task_make_unchecked(
            move |task: TaskRef| {
                if count > 1 && splitter(count) {
                    let left_count = count / 2;
                    let right_count = count - left_count;
                    let queue = submitted_queue(task);

                    // Safety: the children share the parent's borrows and
                    // finish before it does.
                    unsafe {
                        let left = parallel_for(
                            start,
                            left_count,
                            splitter.clone(),
                            body.clone(),
                            Some(task),
                        );
                        task_submit(left, queue);

                        let right =
                            parallel_for(start + left_count, right_count, splitter, body, Some(task));
                        task_submit(right, queue);
                    }
                } else {
                    for offset in 0..count {
                        body(task, start + offset);
                    }
                }
            },
            parent,
        )
    }
}

/// Creates (without submitting) a task that runs `body` over disjoint
/// sub-slices of `data[..count]`, splitting per `splitter`. The slice each
/// leaf sees is as long as the splitter allows.
///
/// # Safety
///
/// `data` must point at `count` valid elements that no one else touches
/// until the returned task completes, and captured borrows must outlive the
/// completion of the returned task (see the module docs).
pub unsafe fn parallel_for_slice<T, S, F>(
    data: *mut T,
    count: usize,
    splitter: S,
    body: F,
    parent: Option<TaskRef>,
) -> TaskRef
where
    T: Send,
    S: Fn(usize) -> bool + Clone + Send,
    F: Fn(TaskRef, &mut [T]) + Clone + Send,
{
    let data = SendPtr(data);

    // Safety: forwarded from the caller.
    unsafe {
        task_make_unchecked(
            move |task: TaskRef| {
                let data = data;
                if count > 1 && splitter(count) {
                    let left_count = count / 2;
                    let right_count = count - left_count;
                    let queue = submitted_queue(task);

                    // Safety: the halves are disjoint and the children
                    // finish before the parent.
                    unsafe {
                        let left = parallel_for_slice(
                            data.0,
                            left_count,
                            splitter.clone(),
                            body.clone(),
                            Some(task),
                        );
                        task_submit(left, queue);

                        let right = parallel_for_slice(
                            data.0.add(left_count),
                            right_count,
                            splitter,
                            body,
                            Some(task),
                        );
                        task_submit(right, queue);
                    }
                } else {
                    // Safety: this leaf's range is disjoint from every other
                    // leaf's, per the recursive split.
                    body(task, unsafe { std::slice::from_raw_parts_mut(data.0, count) });
                }
            },
            parent,
        )
    }
}

/// Creates (without submitting) a task that runs `a` and `b` as parallel
/// sibling children.
///
/// # Safety
///
/// Borrows captured by `a` and `b` must outlive the completion of the
/// returned task (see the module docs).
pub unsafe fn parallel_invoke<A, B>(parent: Option<TaskRef>, a: A, b: B) -> TaskRef
where
    A: FnOnce(TaskRef) + Send,
    B: FnOnce(TaskRef) + Send,
{
    // Safety: forwarded from the caller; the children finish before the
    // spawner task does.
    unsafe {
        task_make_unchecked(
            move |task: TaskRef| {
                let queue = submitted_queue(task);

                let left = task_make_unchecked(a, Some(task));
                task_submit(left, queue);

                let right = task_make_unchecked(b, Some(task));
                task_submit(right, queue);
            },
            parent,
        )
    }
}

/// Creates (without submitting) a task performing an in-place tree reduction
/// over `start..start + count`: each round halves the range, combining
/// element `i` with element `i + stride` through `reduce(task, i, i + stride)`
/// until a single element remains at `start`.
///
/// # Safety
///
/// Borrows captured by `reduce` must outlive the completion of the returned
/// task (see the module docs).
pub unsafe fn parallel_reduce<S, R>(
    start: usize,
    count: usize,
    splitter: S,
    reduce: R,
    parent: Option<TaskRef>,
) -> TaskRef
where
    S: Fn(usize) -> bool + Clone + Send,
    R: Fn(TaskRef, usize, usize) + Clone + Send,
{
    // Safety: forwarded from the caller.
    unsafe {
        task_make_unchecked(
            move |task: TaskRef| {
                let queue = submitted_queue(task);
                let mut count_left = count;

                while count_left > 1 {
                    let stride = count_left / 2;

                    let combine = {
                        let reduce = reduce.clone();
                        move |sub_task: TaskRef, index: usize| {
                            reduce(sub_task, index, index + stride)
                        }
                    };

                    // Safety: each round's pairs are disjoint; the wait
                    // below keeps rounds ordered.
                    unsafe {
                        let round =
                            parallel_for(start, stride, splitter.clone(), combine, None);
                        task_submit_and_wait(round, queue);
                    }

                    // Fold the odd element into the bottom of the range.
                    if count_left & 1 != 0 {
                        reduce(task, start, start + count_left - 1);
                    }

                    count_left = stride;
                }
            },
            parent,
        )
    }
}

/// The queue the currently-running task was submitted to; children of a
/// combinator task inherit it.
fn submitted_queue(task: TaskRef) -> QueueType {
    task.task()
        .queue_tag()
        .expect("a running task was submitted to a queue")
}

struct SendPtr<T>(*mut T);

impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SendPtr<T> {}

// Safety: the combinators hand each leaf a disjoint sub-range; the pointer
// itself is only a capability to reach that range.
unsafe impl<T: Send> Send for SendPtr<T> {}
