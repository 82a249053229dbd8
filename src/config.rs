//! Runtime configuration and the memory-requirements computation.

use crate::runtime::context::JobSystemContext;
use crate::runtime::worker::ThreadLocalState;
use crate::task::pool::TaskSlot;
use crate::task::ptr::{NULL_TASK_INDEX, TaskIndex};
use crate::utils::sys::num_system_threads;
use std::alloc::Layout;
use std::sync::atomic::AtomicU32;

/// Hard cap on total (owned + user) workers. Worker ids are 16-bit and every
/// per-worker structure is a flat array, so the cap keeps state compact.
pub const MAX_WORKERS: u16 = 64;

/// Creation parameters for the scheduler.
///
/// All queue capacities must be powers of two. `num_owned_threads == 0`
/// means "use the system thread count".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSystemCreateOptions {
    /// Worker threads spawned and owned by the scheduler; 0 = one per
    /// hardware thread.
    pub num_owned_threads: u16,
    /// External threads that will register via
    /// [`crate::setup_user_thread`].
    pub num_user_threads: u16,
    /// Capacity of the shared main-thread-only queue.
    pub main_queue_capacity: u16,
    /// Capacity of each worker's NORMAL deque.
    pub normal_queue_capacity: u16,
    /// Capacity of each worker's WORKER deque.
    pub worker_queue_capacity: u16,
    /// Seed for the per-worker steal-victim PRNGs.
    pub steal_rng_seed: u64,
}

impl Default for JobSystemCreateOptions {
    fn default() -> Self {
        Self {
            num_owned_threads: 0,
            num_user_threads: 0,
            main_queue_capacity: 256,
            normal_queue_capacity: 1024,
            worker_queue_capacity: 32,
            steal_rng_seed: 0,
        }
    }
}

impl JobSystemCreateOptions {
    /// Total worker count: owned (resolving 0 = auto) plus user threads.
    pub(crate) fn worker_count(&self) -> u16 {
        let owned = if self.num_owned_threads != 0 {
            self.num_owned_threads
        } else {
            num_system_threads().min(usize::from(MAX_WORKERS)) as u16
        };

        owned + self.num_user_threads
    }

    pub(crate) fn owned_worker_count(&self) -> u16 {
        self.worker_count() - self.num_user_threads
    }

    /// Pool capacity per worker: one slot for every queue position the
    /// worker can have outstanding.
    pub(crate) fn tasks_per_worker(&self) -> u16 {
        let total =
            usize::from(self.normal_queue_capacity) + usize::from(self.worker_queue_capacity);

        assert!(
            total < usize::from(NULL_TASK_INDEX),
            "too many task slots per worker for a 16-bit handle"
        );
        total as u16
    }

    fn validate(&self) {
        assert!(
            self.main_queue_capacity.is_power_of_two(),
            "main queue capacity must be a power of two"
        );
        assert!(
            self.normal_queue_capacity.is_power_of_two(),
            "normal queue capacity must be a power of two"
        );
        assert!(
            self.worker_queue_capacity.is_power_of_two(),
            "worker queue capacity must be a power of two"
        );

        let total = self.worker_count();
        assert!(total >= 1, "at least one worker is required");
        assert!(
            total <= MAX_WORKERS,
            "worker count exceeds the supported maximum"
        );
    }
}

/// Size and alignment of the single buffer holding all scheduler state for a
/// given configuration. Pure computation; pass the result to
/// [`crate::initialize`] together with a caller-provided buffer, or let the
/// scheduler allocate one.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequirements {
    pub options: JobSystemCreateOptions,
    pub byte_size: usize,
    pub alignment: usize,
}

impl MemoryRequirements {
    pub fn new(options: &JobSystemCreateOptions) -> Self {
        options.validate();

        let num_workers = usize::from(options.worker_count());
        let tasks_per_worker = usize::from(options.tasks_per_worker());
        let total_tasks = tasks_per_worker * num_workers;

        // Must mirror the carve order in `runtime::system::initialize`.
        let layout = Layout::new::<JobSystemContext>();
        let layout = extend::<ThreadLocalState>(layout, num_workers);
        let layout = extend::<TaskSlot>(layout, total_tasks);
        let layout = extend::<u32>(layout, usize::from(options.main_queue_capacity));
        let layout = extend::<AtomicU32>(layout, total_tasks);
        let layout = extend::<TaskIndex>(layout, total_tasks);

        Self {
            options: *options,
            byte_size: layout.size(),
            alignment: layout.align(),
        }
    }
}

impl Default for MemoryRequirements {
    fn default() -> Self {
        Self::new(&JobSystemCreateOptions::default())
    }
}

fn extend<T>(layout: Layout, count: usize) -> Layout {
    layout
        .extend(Layout::array::<T>(count).expect("layout overflow"))
        .expect("layout overflow")
        .0
}

/// Proof that [`crate::initialize`] completed; other subsystems can require
/// one to guarantee the scheduler is up.
#[derive(Debug, Clone, Copy)]
pub struct InitializationToken {
    /// The number of threads the scheduler spawned (excluding the main
    /// thread and user threads).
    pub num_workers_created: u16,
}

impl InitializationToken {
    pub(crate) fn new(num_workers_created: u16) -> Self {
        Self {
            num_workers_created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = JobSystemCreateOptions::default();
        assert_eq!(options.main_queue_capacity, 256);
        assert_eq!(options.normal_queue_capacity, 1024);
        assert_eq!(options.worker_queue_capacity, 32);
        assert_eq!(options.num_owned_threads, 0);
    }

    #[test]
    fn auto_thread_count_resolves_to_system() {
        let options = JobSystemCreateOptions::default();
        assert!(options.worker_count() >= 1);
        assert_eq!(options.owned_worker_count(), options.worker_count());
    }

    #[test]
    fn requirements_scale_with_worker_count() {
        let small = MemoryRequirements::new(&JobSystemCreateOptions {
            num_owned_threads: 1,
            ..Default::default()
        });
        let large = MemoryRequirements::new(&JobSystemCreateOptions {
            num_owned_threads: 4,
            ..Default::default()
        });

        assert!(small.byte_size > 0);
        assert!(large.byte_size > small.byte_size);
        assert!(small.alignment.is_power_of_two());
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_pow2_queue_capacity_panics() {
        MemoryRequirements::new(&JobSystemCreateOptions {
            normal_queue_capacity: 1000,
            ..Default::default()
        });
    }
}
