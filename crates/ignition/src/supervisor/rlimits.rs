//! Kernel resource limits for supervised children
//!
//! Applied in the child between fork and exec. Memory is limited through
//! both `RLIMIT_AS` and `RLIMIT_DATA`; `RLIMIT_NPROC` is only applied when
//! the child runs under a dedicated slot uid, because the kernel counts
//! processes per uid and a shared uid would let unrelated processes eat the
//! budget.

use crate::supervisor::ProcessLimits;

pub(super) fn apply(limits: &ProcessLimits, dedicated_uid: bool) -> std::io::Result<()> {
    set_rlimit(libc::RLIMIT_CORE, 0)?;
    set_rlimit(libc::RLIMIT_FSIZE, limits.max_file_size_bytes)?;
    set_rlimit(libc::RLIMIT_NOFILE, u64::from(limits.max_open_files))?;
    if dedicated_uid {
        set_rlimit(libc::RLIMIT_NPROC, u64::from(limits.max_processes))?;
    }
    if let Some(memory) = limits.memory_bytes {
        set_rlimit(libc::RLIMIT_AS, memory)?;
        set_rlimit(libc::RLIMIT_DATA, memory)?;
    }
    Ok(())
}

#[inline]
fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> std::io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    // SAFETY: rlim is a valid struct, resource is a valid constant.
    if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn get_current_nofile() {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(
            unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) },
            0
        );
        assert!(rlim.rlim_cur > 0);
    }
}
