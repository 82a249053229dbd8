//! Queue structures backing the three-tiered submission topology.

mod locked;
pub(crate) use locked::LockedQueue;

mod spmc;
pub(crate) use spmc::{SpmcDeque, Steal};

/// Determines which threads a task is allowed to run on.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    /// Runs on any worker, including the main thread.
    Normal = 0,
    /// Runs only on the main thread.
    Main = 1,
    /// Never runs on the main thread. With a single worker total this is
    /// transparently coerced to `Normal` at submission.
    Worker = 2,
}

impl QueueType {
    pub(crate) fn from_u8(value: u8) -> Option<QueueType> {
        match value {
            0 => Some(QueueType::Normal),
            1 => Some(QueueType::Main),
            2 => Some(QueueType::Worker),
            _ => None,
        }
    }
}
