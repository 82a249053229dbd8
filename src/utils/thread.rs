#![allow(unused)]

const MAX_PTHREAD_NAME_LEN: usize = 16;

// Linux uses pthread_setname_np(pthread_t, *const c_char).
// It's limited to 16 bytes, including the null terminator.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_name(name: &str) {
    let bytes = name.as_bytes();
    let len_to_copy = std::cmp::min(bytes.len(), MAX_PTHREAD_NAME_LEN - 1);

    // The buffer is zero-initialized and we write at most
    // `MAX_PTHREAD_NAME_LEN - 1` bytes, so it stays null-terminated.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for i in 0..len_to_copy {
        c_name_buf[i] = bytes[i] as libc::c_char;
    }

    unsafe {
        let thread = libc::pthread_self();
        libc::pthread_setname_np(thread, c_name_buf.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_name(_name: &str) {}

/// Gets the name of the current thread via `pthread_getname_np`, the
/// counterpart to `pthread_setname_np`.
#[cfg(target_os = "linux")]
pub(crate) fn get_current_thread_name() -> Option<String> {
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        let thread = libc::pthread_self();
        libc::pthread_getname_np(thread, c_name_buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };

    if ret != 0 {
        return None;
    }

    let c_str = unsafe { std::ffi::CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str.to_str().map(|s| s.to_string()).ok()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn get_current_thread_name() -> Option<String> {
    std::thread::current().name().map(|s| s.to_string())
}
