//! OS process signals.

/// Whether a process with this pid currently exists.
///
/// Uses the signal-0 probe: nothing is delivered, only existence and
/// permission are checked. `EPERM` still means the process exists.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Safety: kill with signal 0 performs only permission/existence checks.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    true
}

/// Ask a process to terminate (SIGTERM).
///
/// A process that is already gone is not an error.
#[cfg(unix)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // Safety: sending SIGTERM to a pid has no memory-safety implications.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful termination is only supported on Unix",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn own_process_exists() {
        assert!(process_exists(std::process::id()));
    }

    #[test]
    fn absurd_pid_does_not_exist() {
        assert!(!process_exists(i32::MAX as u32));
        assert!(!process_exists(u32::MAX));
    }

    #[test]
    fn terminating_missing_process_is_ok() {
        assert!(terminate(i32::MAX as u32).is_ok());
    }
}
