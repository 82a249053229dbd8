use std::sync::atomic::{AtomicU32, Ordering};

/// Index of a worker thread. The main thread is always worker 0.
pub type WorkerId = u16;

/// Index of a task slot inside its owning worker's pool.
pub(crate) type TaskIndex = u16;

pub(crate) const NULL_TASK_INDEX: TaskIndex = TaskIndex::MAX;

/// A compressed cross-thread task handle: (worker id, slot index).
///
/// Handles fit in 32 bits so they can live in lock-free queue slots and in
/// the intrusive continuation list without indirection. A handle stays valid
/// for as long as the task's `ref_count` is held or the owning worker still
/// tracks the slot in its allocated list; slots are only reused after the
/// owner's garbage collection pass reclaims them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct TaskPtr {
    pub(crate) worker_id: WorkerId,
    pub(crate) task_index: TaskIndex,
}

impl TaskPtr {
    pub(crate) const NULL: TaskPtr = TaskPtr {
        worker_id: WorkerId::MAX,
        task_index: NULL_TASK_INDEX,
    };

    pub(crate) fn new(worker_id: WorkerId, task_index: TaskIndex) -> Self {
        Self {
            worker_id,
            task_index,
        }
    }

    #[inline(always)]
    pub(crate) fn is_null(self) -> bool {
        self.task_index == NULL_TASK_INDEX
    }

    #[inline(always)]
    pub(crate) fn to_bits(self) -> u32 {
        (u32::from(self.worker_id) << 16) | u32::from(self.task_index)
    }

    #[inline(always)]
    pub(crate) fn from_bits(bits: u32) -> Self {
        Self {
            worker_id: (bits >> 16) as u16,
            task_index: bits as u16,
        }
    }
}

/// A `TaskPtr` that can be read and written concurrently. Backed by a single
/// `AtomicU32` so it is always lock-free.
#[derive(Debug)]
pub(crate) struct AtomicTaskPtr(AtomicU32);

impl AtomicTaskPtr {
    pub(crate) fn new(ptr: TaskPtr) -> Self {
        Self(AtomicU32::new(ptr.to_bits()))
    }

    #[inline(always)]
    pub(crate) fn load(&self, order: Ordering) -> TaskPtr {
        TaskPtr::from_bits(self.0.load(order))
    }

    #[inline(always)]
    pub(crate) fn store(&self, ptr: TaskPtr, order: Ordering) {
        self.0.store(ptr.to_bits(), order);
    }

    #[inline(always)]
    pub(crate) fn compare_exchange(
        &self,
        current: TaskPtr,
        new: TaskPtr,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaskPtr, TaskPtr> {
        self.0
            .compare_exchange(current.to_bits(), new.to_bits(), success, failure)
            .map(TaskPtr::from_bits)
            .map_err(TaskPtr::from_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_round_trip() {
        let ptr = TaskPtr::new(3, 1027);
        assert_eq!(TaskPtr::from_bits(ptr.to_bits()), ptr);
        assert!(!ptr.is_null());
    }

    #[test]
    fn null_is_null() {
        assert!(TaskPtr::NULL.is_null());
        assert!(TaskPtr::from_bits(TaskPtr::NULL.to_bits()).is_null());
    }

    #[test]
    fn atomic_ptr_is_lock_free_sized() {
        assert_eq!(
            std::mem::size_of::<AtomicTaskPtr>(),
            std::mem::size_of::<u32>()
        );
    }
}
