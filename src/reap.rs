//! Child reaping and termination analysis.
//!
//! Every child whose frame has been consumed must be reaped or zombies
//! accumulate. Abnormal terminations are logged; they never become errors
//! because the parent's only view of a child failure is the ERROR frame.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::debug;

/// Why a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// The status could not be determined (already reaped elsewhere).
    Unknown,
}

impl TerminationReason {
    /// Check if this is a clean exit.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig:?}"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classify a `WaitStatus`.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}

/// Blocking reap of one child. A child that is already gone (ECHILD) is
/// tolerated silently.
pub(crate) fn reap(pid: Pid) -> TerminationReason {
    match waitpid(pid, None) {
        Ok(status) => {
            let reason = analyze_wait_status(status);
            if !reason.is_clean() {
                debug!(pid = pid.as_raw(), reason = %reason, "child ended abnormally");
            }
            reason
        }
        Err(Errno::ECHILD) => TerminationReason::Unknown,
        Err(err) => {
            debug!(pid = pid.as_raw(), ?err, "waitpid failed");
            TerminationReason::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 0);
        assert_eq!(analyze_wait_status(status), TerminationReason::Exited(0));
        assert!(analyze_wait_status(status).is_clean());

        let status = WaitStatus::Exited(Pid::from_raw(1), 3);
        assert_eq!(analyze_wait_status(status), TerminationReason::Exited(3));
        assert!(!analyze_wait_status(status).is_clean());

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(
            analyze_wait_status(status),
            TerminationReason::Signaled(Signal::SIGKILL)
        );
    }

    #[test]
    fn test_termination_reason_display() {
        assert_eq!(TerminationReason::Exited(0).to_string(), "exited with code 0");
        assert!(
            TerminationReason::Signaled(Signal::SIGTERM)
                .to_string()
                .contains("SIGTERM")
        );
    }

    #[test]
    fn test_reap_unknown_child_is_tolerated() {
        // No such child exists; waitpid reports ECHILD.
        assert_eq!(reap(Pid::from_raw(999_999)), TerminationReason::Unknown);
    }
}
