//! The scheduler runtime: global context, the worker loop, and the core
//! task operations.

// Public API
pub mod scheduler;
pub use scheduler::{
    task_add_continuation, task_data, task_dec_ref, task_inc_ref, task_is_done, task_make,
    task_make_unchecked, task_submit, task_submit_and_wait, tick_main_queue,
    tick_main_queue_while, wait_on_task,
};

pub mod system;
pub use system::{
    current_worker, initialize, is_main_thread, num_system_threads, num_workers,
    setup_user_thread, shutdown,
};

// Internals
pub(crate) mod context;

pub(crate) mod worker;
