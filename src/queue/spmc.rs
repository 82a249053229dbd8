//! Chase-Lev work-stealing deque over 32-bit task handles.
//!
//! The owning worker pushes and pops at the producer end; any other worker
//! steals from the consumer end. Indices are *signed* 64-bit counters: `pop`
//! temporarily drives the deque into an underflow state (`producer` one
//! below `consumer`) before restoring the canonical empty position, and the
//! emptiness checks rely on signed comparison to stay correct during that
//! window.
//!
//! References:
//!   [Dynamic Circular Work-Stealing Deque](https://www.dre.vanderbilt.edu/~schmidt/PDF/work-stealing-dequeue.pdf)
//!   [Correct and Efficient Work-Stealing for Weak Memory Models](https://fzn.fr/readings/ppopp13.pdf)

use crate::task::TaskPtr;
use crossbeam_utils::CachePadded;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering, fence};

/// Outcome of a steal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Steal {
    /// The deque was observed empty.
    Empty,
    /// Lost the consumer-index race to another thief (or the owner's pop);
    /// the caller should move on to another victim.
    Retry,
    Success(TaskPtr),
}

impl Steal {
    pub(crate) fn success(self) -> Option<TaskPtr> {
        match self {
            Steal::Success(ptr) => Some(ptr),
            _ => None,
        }
    }
}

/// Deque is full; the owner must drain before the push can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DequeFull;

pub(crate) struct SpmcDeque {
    /// Owner-written index of the next push slot.
    producer: CachePadded<AtomicI64>,
    /// Thief-advanced index of the next steal slot.
    consumer: CachePadded<AtomicI64>,

    // Immutable after construction.
    data: NonNull<AtomicU32>,
    capacity_mask: i64,
}

// Safety: `data` points at arena memory that outlives the scheduler; slots
// are atomics and the index protocol below keeps owner and thieves off the
// same element.
unsafe impl Send for SpmcDeque {}
unsafe impl Sync for SpmcDeque {}

impl SpmcDeque {
    /// # Safety
    ///
    /// `data` must point at `capacity` initialized `AtomicU32` slots that
    /// outlive the deque. `capacity` must be a power of two.
    pub(crate) unsafe fn new(data: NonNull<AtomicU32>, capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of 2");

        Self {
            producer: CachePadded::new(AtomicI64::new(0)),
            consumer: CachePadded::new(AtomicI64::new(0)),
            data,
            capacity_mask: capacity as i64 - 1,
        }
    }

    #[inline(always)]
    fn slot(&self, index: i64) -> &AtomicU32 {
        // Safety: masked index is always within the `capacity` slots the
        // constructor was given.
        unsafe { &*self.data.as_ptr().add((index & self.capacity_mask) as usize) }
    }

    /// Owner-only. Publishes `value` at the producer end.
    pub(crate) fn push(&self, value: TaskPtr) -> Result<(), DequeFull> {
        let write_index = self.producer.load(Ordering::Relaxed);
        let read_index = self.consumer.load(Ordering::Acquire);

        if write_index - read_index > self.capacity_mask {
            return Err(DequeFull);
        }

        self.slot(write_index).store(value.to_bits(), Ordering::Relaxed);

        // The release store is what hands the element (and everything the
        // owner wrote into the task before pushing) to thieves.
        self.producer.store(write_index + 1, Ordering::Release);

        Ok(())
    }

    /// Owner-only. Takes the most recently pushed element, racing thieves
    /// for the last one. Returns `None` when empty or when the race for the
    /// final element is lost.
    pub(crate) fn pop(&self) -> Option<TaskPtr> {
        // Reserve the slot at the producer end, then fence: the reservation
        // must be visible before we look at what the thieves have taken, or
        // a concurrent steal and this pop can both claim the last element.
        let write_index = self.producer.load(Ordering::Relaxed) - 1;
        self.producer.store(write_index, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let read_index = self.consumer.load(Ordering::Relaxed);

        if read_index <= write_index {
            if read_index == write_index {
                // One element left; settle the race with any thief through a
                // CAS on the consumer index.
                let won = self
                    .consumer
                    .compare_exchange(
                        read_index,
                        read_index + 1,
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    )
                    .is_ok();

                let result =
                    won.then(|| TaskPtr::from_bits(self.slot(write_index).load(Ordering::Relaxed)));

                // Either way the deque is now empty; restore the canonical
                // empty position.
                self.producer.store(write_index + 1, Ordering::Relaxed);
                return result;
            }

            // More than one element: the reserved slot is safely ours.
            return Some(TaskPtr::from_bits(
                self.slot(write_index).load(Ordering::Relaxed),
            ));
        }

        // Deque was empty; undo the reservation.
        self.producer.store(write_index + 1, Ordering::SeqCst);
        None
    }

    /// Thief-side. Claims the oldest element via CAS on the consumer index.
    pub(crate) fn steal(&self) -> Steal {
        let read_index = self.consumer.load(Ordering::Acquire);

        // Must fully read the consumer index before the producer-owned
        // index; mirrors the fence in `pop`.
        fence(Ordering::SeqCst);

        let write_index = self.producer.load(Ordering::Acquire);

        if read_index < write_index {
            // Read the element before the CAS: immediately after a
            // successful CAS the owner may reuse the slot for a new push.
            let result = TaskPtr::from_bits(self.slot(read_index).load(Ordering::Relaxed));

            if self
                .consumer
                .compare_exchange(
                    read_index,
                    read_index + 1,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Steal::Success(result);
            }

            return Steal::Retry;
        }

        Steal::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn backing(capacity: usize) -> Box<[AtomicU32]> {
        (0..capacity).map(|_| AtomicU32::new(0)).collect()
    }

    fn deque(slots: &[AtomicU32]) -> SpmcDeque {
        // Safety: `slots` outlives the deque in every test below.
        unsafe {
            SpmcDeque::new(
                NonNull::new(slots.as_ptr() as *mut AtomicU32).unwrap(),
                slots.len(),
            )
        }
    }

    fn ptr(value: u32) -> TaskPtr {
        TaskPtr::from_bits(value)
    }

    #[test]
    fn push_pop_is_lifo() {
        let slots = backing(8);
        let q = deque(&slots);

        for i in 0..5 {
            q.push(ptr(i)).unwrap();
        }
        for i in (0..5).rev() {
            assert_eq!(q.pop(), Some(ptr(i)));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn push_full_fails_until_drained() {
        let slots = backing(4);
        let q = deque(&slots);

        for i in 0..4 {
            q.push(ptr(i)).unwrap();
        }
        assert_eq!(q.push(ptr(99)), Err(DequeFull));

        assert_eq!(q.pop(), Some(ptr(3)));
        q.push(ptr(99)).unwrap();
    }

    #[test]
    fn steal_is_fifo() {
        let slots = backing(8);
        let q = deque(&slots);

        for i in 0..4 {
            q.push(ptr(i)).unwrap();
        }
        assert_eq!(q.steal(), Steal::Success(ptr(0)));
        assert_eq!(q.steal(), Steal::Success(ptr(1)));
        assert_eq!(q.pop(), Some(ptr(3)));
        assert_eq!(q.steal(), Steal::Success(ptr(2)));
        assert_eq!(q.steal(), Steal::Empty);
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn indices_wrap_around_the_ring() {
        let slots = backing(4);
        let q = deque(&slots);

        for round in 0..64u32 {
            q.push(ptr(round)).unwrap();
            assert_eq!(q.steal(), Steal::Success(ptr(round)));
        }
        assert_eq!(q.steal(), Steal::Empty);
    }

    // Every pushed element must be delivered exactly once across the owner's
    // pops and all thieves' steals.
    #[test]
    fn concurrent_owner_and_thieves_lose_nothing() {
        const TOTAL: u32 = 50_000;
        const NUM_THIEVES: usize = 3;

        let slots = backing(256);
        let q = deque(&slots);
        let done = AtomicBool::new(false);

        let (popped, stolen) = std::thread::scope(|scope| {
            let thieves: Vec<_> = (0..NUM_THIEVES)
                .map(|_| {
                    scope.spawn(|| {
                        let mut got = Vec::new();
                        while !done.load(Ordering::Acquire) {
                            match q.steal() {
                                Steal::Success(ptr) => got.push(ptr.to_bits()),
                                Steal::Retry | Steal::Empty => std::hint::spin_loop(),
                            }
                        }
                        // Drain whatever the owner left behind.
                        while let Steal::Success(ptr) = q.steal() {
                            got.push(ptr.to_bits());
                        }
                        got
                    })
                })
                .collect();

            let mut popped = Vec::new();
            for value in 0..TOTAL {
                while q.push(ptr(value)).is_err() {
                    if let Some(p) = q.pop() {
                        popped.push(p.to_bits());
                    }
                }
            }
            done.store(true, Ordering::Release);

            let stolen: Vec<u32> = thieves
                .into_iter()
                .flat_map(|t| t.join().unwrap())
                .collect();
            (popped, stolen)
        });

        let mut all: Vec<u32> = popped.into_iter().chain(stolen).collect();
        all.sort_unstable();
        let expected: Vec<u32> = (0..TOTAL).collect();
        assert_eq!(all, expected);
    }
}
