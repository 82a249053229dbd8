/// Padding granularity for hot shared state. `crossbeam_utils::CachePadded`
/// handles per-field padding; this constant is for whole-record alignment.
pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// The number of hardware threads on this machine. Never returns 0; callable
/// before the scheduler is initialized.
pub(crate) fn num_system_threads() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
