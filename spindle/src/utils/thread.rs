// Linux limits thread names to 16 bytes, including the null terminator.
const MAX_PTHREAD_NAME_LEN: usize = 16;

/// Names the current OS thread, truncated to what pthread accepts.
#[cfg(target_os = "linux")]
pub(crate) fn set_current_thread_name(name: &str) {
    let bytes = name.as_bytes();
    let len_to_copy = std::cmp::min(bytes.len(), MAX_PTHREAD_NAME_LEN - 1);

    // Zero-initialized, so the name stays null-terminated.
    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];
    for (dst, src) in c_name_buf.iter_mut().zip(&bytes[..len_to_copy]) {
        *dst = *src as libc::c_char;
    }

    unsafe {
        libc::pthread_setname_np(libc::pthread_self(), c_name_buf.as_ptr());
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_current_thread_name(_name: &str) {}

/// Gets the name of the current thread through `pthread_getname_np`.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn get_current_thread_name() -> anyhow::Result<String> {
    use anyhow::anyhow;
    use std::ffi::CStr;

    let mut c_name_buf: [libc::c_char; MAX_PTHREAD_NAME_LEN] = [0; MAX_PTHREAD_NAME_LEN];

    let ret = unsafe {
        libc::pthread_getname_np(
            libc::pthread_self(),
            c_name_buf.as_mut_ptr(),
            MAX_PTHREAD_NAME_LEN,
        )
    };

    if ret != 0 {
        return Err(anyhow!("pthread_getname_np failed with error code: {ret}"));
    }

    let c_str = unsafe { CStr::from_ptr(c_name_buf.as_ptr()) };
    c_str
        .to_str()
        .map(str::to_owned)
        .map_err(|e| anyhow!("thread name is not valid UTF-8: {e}"))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use anyhow::{Result, anyhow};

    #[test]
    fn test_name_is_truncated() -> Result<()> {
        let name = std::thread::spawn(|| {
            set_current_thread_name("a-very-long-processor-name");
            get_current_thread_name()
        })
        .join()
        .map_err(|_| anyhow!("thread panicked"))??;

        assert_eq!(name, "a-very-long-pro");
        Ok(())
    }
}
