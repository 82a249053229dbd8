//! Per-worker intrusive freelist allocator for task records.
//!
//! Alloc and dealloc are O(1) pointer swaps and are only ever called by the
//! owning worker, so the pool needs no synchronization at all. Other workers
//! read task contents through handles without touching the pool.

use super::ptr::TaskIndex;
use super::{RawTaskFn, TASK_SIZE, Task, TaskPtr, WorkerId};
use std::cell::Cell;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

/// One pool slot: either a link in the freelist or a live task record.
#[repr(C, align(64))]
pub(crate) union TaskSlot {
    next: *mut TaskSlot,
    storage: ManuallyDrop<Task>,
}

static_assertions::const_assert_eq!(std::mem::size_of::<TaskSlot>(), TASK_SIZE);
static_assertions::const_assert_eq!(
    std::mem::align_of::<TaskSlot>(),
    std::mem::align_of::<Task>()
);

pub(crate) struct TaskPool {
    memory: NonNull<TaskSlot>,
    freelist: Cell<*mut TaskSlot>,
    capacity: u16,
}

impl TaskPool {
    /// # Safety
    ///
    /// `memory` must point at `capacity` writable slots that outlive the
    /// pool and are used by no one else.
    pub(crate) unsafe fn new(memory: NonNull<TaskSlot>, capacity: u16) -> Self {
        let base = memory.as_ptr();

        // Thread every slot onto the freelist in index order.
        for i in 0..usize::from(capacity) - 1 {
            // Safety: i and i + 1 are in bounds.
            unsafe { (*base.add(i)).next = base.add(i + 1) };
        }
        // Safety: capacity is at least 1 per the queue-capacity validation.
        unsafe { (*base.add(usize::from(capacity) - 1)).next = std::ptr::null_mut() };

        Self {
            memory,
            freelist: Cell::new(base),
            capacity,
        }
    }

    /// In-place constructs a task in the next free slot. The caller must
    /// have ensured a slot is free (it tracks the live count and garbage
    /// collects before allocating).
    pub(crate) fn allocate(
        &self,
        owning_worker: WorkerId,
        fn_storage: RawTaskFn,
        parent: TaskPtr,
    ) -> NonNull<Task> {
        let slot = self.freelist.get();
        assert!(!slot.is_null(), "task pool exhausted");

        // Safety: `slot` came off the freelist, so it holds a `next` link
        // and no live task.
        self.freelist.set(unsafe { (*slot).next });

        let task = slot.cast::<Task>();
        // Safety: the slot is sized and aligned for a Task and is unused.
        unsafe { task.write(Task::new(owning_worker, fn_storage, parent)) };

        // Safety: derived from the non-null slot pointer.
        unsafe { NonNull::new_unchecked(task) }
    }

    /// Returns a slot to the freelist. `Task` is trivially destructible by
    /// construction (closures are consumed when the task runs), so there is
    /// no teardown beyond relinking.
    pub(crate) fn deallocate(&self, task: NonNull<Task>) {
        let slot = task.as_ptr().cast::<TaskSlot>();

        // Safety: `task` was produced by `allocate` on this pool and the
        // caller guarantees nothing references it anymore.
        unsafe { (*slot).next = self.freelist.get() };
        self.freelist.set(slot);
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> u16 {
        self.capacity
    }

    pub(crate) fn index_of(&self, task: NonNull<Task>) -> TaskIndex {
        let offset = task.as_ptr() as usize - self.memory.as_ptr() as usize;
        let index = offset / TASK_SIZE;

        debug_assert!(index < usize::from(self.capacity), "task not in this pool");
        index as TaskIndex
    }

    pub(crate) fn task_from_index(&self, index: TaskIndex) -> NonNull<Task> {
        debug_assert!(index < self.capacity, "task index out of range");

        // Safety: index is within the pool's slots; callers only pass
        // indices of live tasks, per the handle-validity contract.
        unsafe { NonNull::new_unchecked(self.memory.as_ptr().add(usize::from(index)).cast()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(capacity: usize) -> Vec<TaskSlot> {
        (0..capacity)
            .map(|_| TaskSlot {
                next: std::ptr::null_mut(),
            })
            .collect()
    }

    fn pool(slots: &mut [TaskSlot]) -> TaskPool {
        // Safety: `slots` outlives the pool in every test below.
        unsafe {
            TaskPool::new(
                NonNull::new(slots.as_mut_ptr()).unwrap(),
                slots.len() as u16,
            )
        }
    }

    fn nop(_: NonNull<Task>) {}

    #[test]
    fn allocates_every_slot_with_unique_indices() {
        let mut slots = backing(8);
        let p = pool(&mut slots);

        let mut indices: Vec<TaskIndex> = (0..8)
            .map(|_| p.index_of(p.allocate(0, nop as RawTaskFn, TaskPtr::NULL)))
            .collect();

        indices.sort_unstable();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
        assert!(p.freelist.get().is_null());
    }

    #[test]
    fn index_round_trips() {
        let mut slots = backing(4);
        let p = pool(&mut slots);

        let task = p.allocate(3, nop as RawTaskFn, TaskPtr::NULL);
        let index = p.index_of(task);
        assert_eq!(p.task_from_index(index), task);
        // Safety: task is live and unaliased.
        assert_eq!(unsafe { task.as_ref() }.owning_worker, 3);
    }

    #[test]
    fn deallocate_recycles_lifo() {
        let mut slots = backing(4);
        let p = pool(&mut slots);

        let a = p.allocate(0, nop as RawTaskFn, TaskPtr::NULL);
        let _b = p.allocate(0, nop as RawTaskFn, TaskPtr::NULL);

        let a_index = p.index_of(a);
        p.deallocate(a);

        let c = p.allocate(0, nop as RawTaskFn, TaskPtr::NULL);
        assert_eq!(p.index_of(c), a_index);
    }
}
