//! Mutex-guarded bounded ring for main-thread-only tasks.
//!
//! Contention stays low: the main thread is the sole consumer and producers
//! are few, so a plain lock beats a lock-free structure here.

use crate::task::TaskPtr;
use parking_lot::Mutex;
use std::ptr::NonNull;

struct RingState {
    write_index: usize,
    size: usize,
}

pub(crate) struct LockedQueue {
    state: Mutex<RingState>,

    // Immutable after construction; element slots are only touched while
    // holding `state`.
    data: NonNull<u32>,
    capacity: usize,
    capacity_mask: usize,
}

// Safety: all access to `data` happens under the `state` mutex.
unsafe impl Send for LockedQueue {}
unsafe impl Sync for LockedQueue {}

impl LockedQueue {
    /// # Safety
    ///
    /// `data` must point at `capacity` writable `u32` slots that outlive the
    /// queue. `capacity` must be a power of two.
    pub(crate) unsafe fn new(data: NonNull<u32>, capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of 2");

        Self {
            state: Mutex::new(RingState {
                write_index: 0,
                size: 0,
            }),
            data,
            capacity,
            capacity_mask: capacity - 1,
        }
    }

    #[inline(always)]
    fn element(&self, raw_index: usize) -> *mut u32 {
        // Safety: masked index is within the `capacity` slots.
        unsafe { self.data.as_ptr().add(raw_index & self.capacity_mask) }
    }

    /// Returns false when the ring is full.
    pub(crate) fn push(&self, value: TaskPtr) -> bool {
        let mut state = self.state.lock();

        if state.size == self.capacity {
            return false;
        }

        // Safety: slot access under the lock.
        unsafe { self.element(state.write_index).write(value.to_bits()) };
        state.write_index = state.write_index.wrapping_add(1);
        state.size += 1;

        true
    }

    pub(crate) fn pop(&self) -> Option<TaskPtr> {
        let mut state = self.state.lock();

        if state.size == 0 {
            return None;
        }

        let read_index = state.write_index.wrapping_sub(state.size);
        // Safety: slot access under the lock.
        let value = unsafe { self.element(read_index).read() };
        state.size -= 1;

        Some(TaskPtr::from_bits(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(slots: &mut [u32]) -> LockedQueue {
        // Safety: `slots` outlives the queue in every test below.
        unsafe { LockedQueue::new(NonNull::new(slots.as_mut_ptr()).unwrap(), slots.len()) }
    }

    fn ptr(value: u32) -> TaskPtr {
        TaskPtr::from_bits(value)
    }

    #[test]
    fn push_pop_is_fifo() {
        let mut slots = [0u32; 8];
        let q = queue(&mut slots);

        for i in 0..5 {
            assert!(q.push(ptr(i)));
        }
        for i in 0..5 {
            assert_eq!(q.pop(), Some(ptr(i)));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn full_rejects_until_popped() {
        let mut slots = [0u32; 4];
        let q = queue(&mut slots);

        for i in 0..4 {
            assert!(q.push(ptr(i)));
        }
        assert!(!q.push(ptr(99)));

        assert_eq!(q.pop(), Some(ptr(0)));
        assert!(q.push(ptr(99)));
        assert_eq!(q.pop(), Some(ptr(1)));
    }

    #[test]
    fn wraps_around_the_ring() {
        let mut slots = [0u32; 4];
        let q = queue(&mut slots);

        for round in 0..64u32 {
            assert!(q.push(ptr(round)));
            assert_eq!(q.pop(), Some(ptr(round)));
        }
    }
}
