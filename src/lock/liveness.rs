// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process liveness probing for lock staleness arbitration.

/// Answers whether a local process id still refers to a running process.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessLiveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes the operating system with a zero signal.
///
/// Only "no such process" counts as dead. Any other probe error (for example
/// a permission error for another user's process) is reported as alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLiveness;

impl ProcessLiveness for SystemLiveness {
    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        // pid 0 and values outside pid_t would address process groups
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }

        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(_) => true,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, pid: u32) -> bool {
        pid != 0
    }
}

/// Hostname of this machine, or `"unknown"` when it cannot be read.
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }
    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(SystemLiveness.is_alive(std::process::id()));
    }

    #[test]
    fn test_pid_zero_is_not_alive() {
        assert!(!SystemLiveness.is_alive(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        // Reaped children release their pid
        assert!(!SystemLiveness.is_alive(pid));
    }

    #[test]
    fn test_local_hostname_not_empty() {
        assert!(!local_hostname().is_empty());
    }
}
