//! Thin wrappers over the CPU pause instruction and OS thread-yield.
//!
//! These are public so code layered on top of the scheduler can match its
//! spin policy instead of inventing a second one.

/// CPU pause instruction to indicate a spin wait loop.
#[inline(always)]
pub fn pause_processor() {
    std::hint::spin_loop();
}

/// Asks the OS to yield this thread's execution to another thread on the
/// current core.
#[inline]
pub fn yield_time_slice() {
    std::thread::yield_now();
}

/// Name of the CPU architecture this binary was compiled for.
pub fn processor_architecture_name() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "x64 (Intel or AMD)"
    } else if cfg!(target_arch = "x86") {
        "Intel x86"
    } else if cfg!(target_arch = "aarch64") {
        "ARM64"
    } else if cfg!(target_arch = "arm") {
        "ARM"
    } else if cfg!(target_arch = "riscv64") {
        "RISC-V 64"
    } else {
        "Unknown Arch"
    }
}
