use anyhow::Result;
#[cfg(target_os = "linux")]
use anyhow::anyhow;
#[cfg(target_os = "linux")]
use std::ffi::CStr;

#[cfg(target_os = "linux")]
const MAX_PTHREAD_NAME_LEN: usize = 16;

// Linux uses pthread_setname_np(pthread_t, *const c_char), limited to
// 16 bytes including the null terminator.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_name(name: &str) {
    let bytes = name.as_bytes();
    let len_to_copy = std::cmp::min(bytes.len(), MAX_PTHREAD_NAME_LEN - 1);

    // The buffer is zero-initialized and we write at most
    // MAX_PTHREAD_NAME_LEN - 1 bytes, so it stays null-terminated.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for (dst, src) in c_name_buf.iter_mut().zip(&bytes[..len_to_copy]) {
        *dst = *src as libc::c_char;
    }

    unsafe {
        let thread = libc::pthread_self();
        libc::pthread_setname_np(thread, c_name_buf.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_name(_name: &str) {}

/// Gets the name of the current thread via `pthread_getname_np`, the
/// counterpart to `pthread_setname_np`. Exercised by the thread-naming
/// tests.
#[cfg(target_os = "linux")]
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        let thread = libc::pthread_self();
        libc::pthread_getname_np(thread, c_name_buf.as_mut_ptr(), MAX_PTHREAD_NAME_LEN)
    };

    if ret != 0 {
        return Err(anyhow!("pthread_getname_np failed with error code: {ret}"));
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| anyhow!("failed to convert thread name from CStr: {e}"))
}

#[cfg(not(target_os = "linux"))]
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) fn get_current_thread_name() -> Result<String> {
    Ok(std::thread::current().name().unwrap_or_default().to_string())
}
