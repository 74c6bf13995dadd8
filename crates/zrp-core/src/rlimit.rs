//! Best-effort open-file-descriptor limit bump, mirroring the upstream's
//! `rlimit.hpp`: raise `RLIMIT_NOFILE` on POSIX systems, no-op elsewhere.

/// Attempt to set both the soft and hard `RLIMIT_NOFILE` to `nofile`.
/// Failure is logged by the caller via the returned error, not fatal.
#[cfg(unix)]
pub fn try_set_rlimit_nofile(nofile: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: nofile as libc::rlim_t,
        rlim_max: nofile as libc::rlim_t,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
pub fn try_set_rlimit_nofile(_nofile: u64) -> std::io::Result<()> {
    Ok(())
}
