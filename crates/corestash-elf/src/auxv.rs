//! Access to the process auxiliary vector.
//!
//! The kernel populates the vector at exec time; `AT_PLATFORM` carries a
//! pointer to a platform string (`x86_64`, `aarch64`, ...) used when
//! expanding `$PLATFORM` in rpath entries.

/// Key of the platform string entry.
///
/// See include/uapi/linux/auxvec.h for the full list.
pub const AT_PLATFORM: usize = 15;

/// Returns the platform string of the running process, if available.
///
/// The value is read once from `/proc/self/auxv` and cached. We assume the
/// platform of the running forwarder matches the platform of the files it
/// inspects, which holds for the kernel-invoked crash path.
#[cfg(target_os = "linux")]
pub fn platform() -> Option<String> {
    use std::sync::OnceLock;

    static PLATFORM: OnceLock<Option<String>> = OnceLock::new();
    PLATFORM.get_or_init(read_platform).clone()
}

#[cfg(not(target_os = "linux"))]
pub fn platform() -> Option<String> {
    None
}

#[cfg(target_os = "linux")]
fn read_platform() -> Option<String> {
    let raw = std::fs::read("/proc/self/auxv").ok()?;

    let word = std::mem::size_of::<usize>();
    for pair in raw.chunks_exact(word * 2) {
        let key = usize::from_ne_bytes(pair[..word].try_into().ok()?);
        let value = usize::from_ne_bytes(pair[word..].try_into().ok()?);
        if key != AT_PLATFORM || value == 0 {
            continue;
        }

        // The entry is a pointer into our own address space, placed there by
        // the kernel; reading it as a C string is valid for the lifetime of
        // the process.
        let s = unsafe { std::ffi::CStr::from_ptr(value as *const std::os::raw::c_char) };
        return s.to_str().ok().map(str::to_owned);
    }

    None
}
