//! An in-process work-stealing task scheduler for compute-bound,
//! data-parallel workloads.
//!
//! A fixed pool of pinned worker threads runs short-lived tasks with
//! queueing costs in the tens of nanoseconds. Tasks are fixed-size,
//! cache-line-sized records allocated from per-worker pools; each worker
//! owns a lock-free deque that others steal from, plus a second deque for
//! work that must stay off the main thread, and one shared locked queue
//! feeds tasks that must run *on* the main thread. Parent/child links give
//! fork/join, continuations chain follow-up work after a task's whole
//! subtree completes, and waiting always executes other tasks instead of
//! blocking.
//!
//! ```no_run
//! use forq::{MemoryRequirements, QueueType};
//!
//! let _token = forq::initialize(&MemoryRequirements::default(), None)?;
//!
//! let task = forq::task_make(|_task| println!("hello from a worker"), None);
//! forq::task_submit_and_wait(task, QueueType::Normal);
//!
//! forq::shutdown()?;
//! # anyhow::Ok(())
//! ```
//!
//! Higher-level fork/join shapes (parallel-for over ranges and slices,
//! parallel-invoke, parallel-reduce) live in [`parallel`].

mod arena;

mod config;
pub use config::{InitializationToken, JobSystemCreateOptions, MAX_WORKERS, MemoryRequirements};

pub mod parallel;

mod queue;
pub use queue::QueueType;

mod runtime;
pub use runtime::{
    current_worker, initialize, is_main_thread, num_system_threads, num_workers,
    setup_user_thread, shutdown, task_add_continuation, task_data, task_dec_ref, task_inc_ref,
    task_is_done, task_make, task_make_unchecked, task_submit, task_submit_and_wait,
    tick_main_queue, tick_main_queue_while, wait_on_task,
};

mod task;
pub use task::{TaskData, TaskRef, WorkerId};

pub mod utils;
pub use utils::cpu::{pause_processor, processor_architecture_name, yield_time_slice};
