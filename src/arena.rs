//! Bump allocator over the single caller-provided (or self-allocated)
//! buffer that holds every piece of scheduler state.
//!
//! The carve order here and the `Layout` accumulation in
//! [`crate::config::MemoryRequirements`] must stay in lockstep: both align
//! each block to its type and concatenate, so a buffer of exactly
//! `byte_size` bytes at `alignment` fits everything with nothing left over.

use std::ptr::NonNull;

pub(crate) struct LinearAllocator {
    cursor: *mut u8,
    end: *mut u8,
}

impl LinearAllocator {
    /// # Safety
    ///
    /// `base` must point at `len` writable bytes that outlive every
    /// allocation carved from this allocator.
    pub(crate) unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self {
            cursor: base.as_ptr(),
            // Safety: one-past-the-end of the caller's buffer.
            end: unsafe { base.as_ptr().add(len) },
        }
    }

    /// Carves space for `count` elements of `T`, constructing each with
    /// `init`.
    pub(crate) fn alloc_array_with<T>(
        &mut self,
        count: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> NonNull<T> {
        let base = self.carve::<T>(count);
        for i in 0..count {
            // Safety: `carve` bounds-checked the whole block.
            unsafe { base.as_ptr().add(i).write(init(i)) };
        }
        base
    }

    /// Carves space for `count` elements of `T`, leaving them
    /// uninitialized. The caller takes over initialization.
    pub(crate) fn alloc_array_uninit<T>(&mut self, count: usize) -> NonNull<T> {
        self.carve::<T>(count)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.end as usize - self.cursor as usize
    }

    fn carve<T>(&mut self, count: usize) -> NonNull<T> {
        let align = align_of::<T>();
        let aligned = (self.cursor as usize).next_multiple_of(align) as *mut u8;
        let byte_len = size_of::<T>() * count;

        assert!(
            aligned as usize + byte_len <= self.end as usize,
            "scheduler buffer too small; was it sized from the same options?"
        );

        // Safety: in bounds per the assert above.
        self.cursor = unsafe { aligned.add(byte_len) };

        // Safety: `aligned` is derived from a non-null cursor.
        unsafe { NonNull::new_unchecked(aligned.cast()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carves_in_order_with_alignment() {
        let mut buffer = vec![0u8; 256];
        let mut arena =
            // Safety: `buffer` outlives the arena.
            unsafe { LinearAllocator::new(NonNull::new(buffer.as_mut_ptr()).unwrap(), 256) };

        let bytes = arena.alloc_array_with::<u8>(3, |i| i as u8);
        let words = arena.alloc_array_with::<u64>(2, |i| i as u64);

        assert_eq!(words.as_ptr() as usize % align_of::<u64>(), 0);
        assert!((words.as_ptr() as usize) > (bytes.as_ptr() as usize));
        // Safety: just initialized above.
        unsafe {
            assert_eq!(*bytes.as_ptr().add(2), 2);
            assert_eq!(*words.as_ptr().add(1), 1);
        }
    }

    #[test]
    #[should_panic(expected = "buffer too small")]
    fn overflow_panics() {
        let mut buffer = vec![0u8; 16];
        let mut arena =
            // Safety: `buffer` outlives the arena.
            unsafe { LinearAllocator::new(NonNull::new(buffer.as_mut_ptr()).unwrap(), 16) };

        arena.alloc_array_uninit::<u64>(3);
    }
}
