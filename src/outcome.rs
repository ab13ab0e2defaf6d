use std::{fmt, process::ExitStatus};

use crate::session::SessionState;

/// Exit status a shell reports for a process ended by SIGINT
pub const SIGINT_EXIT_CODE: i32 = 130;

const SIGINT: i32 = 2;

/// How a running tunnel ended, decided once when it exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Exited on its own without error
    Clean,
    /// Ended because a stop was requested (user, signal or stop-all)
    Interrupted,
    Failed(FailureCause),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    ExitCode(i32),
    Signal(i32),
    Error(String),
}

impl SessionOutcome {
    /// Classify the exit status of an external tunnel process
    pub fn from_exit_status(status: ExitStatus, stop_requested: bool) -> Self {
        if stop_requested {
            return SessionOutcome::Interrupted;
        }
        match status.code() {
            Some(0) => SessionOutcome::Clean,
            Some(SIGINT_EXIT_CODE) => SessionOutcome::Interrupted,
            Some(code) => SessionOutcome::Failed(FailureCause::ExitCode(code)),
            None => match exit_signal(&status) {
                Some(SIGINT) => SessionOutcome::Interrupted,
                Some(signal) => SessionOutcome::Failed(FailureCause::Signal(signal)),
                None => SessionOutcome::Failed(FailureCause::Error(status.to_string())),
            },
        }
    }

    /// Classify the terminal state of an in-process session
    pub fn from_session_state(state: &SessionState) -> Self {
        match state {
            SessionState::Failed(reason) => {
                SessionOutcome::Failed(FailureCause::Error(reason.clone()))
            }
            _ => SessionOutcome::Interrupted,
        }
    }

    /// Only abnormal exits are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionOutcome::Failed(_))
    }

    pub fn is_failure(&self) -> bool {
        self.is_retryable()
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Clean => f.write_str("exited cleanly"),
            SessionOutcome::Interrupted => f.write_str("stopped"),
            SessionOutcome::Failed(cause) => write!(f, "failed ({cause})"),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::ExitCode(code) => write!(f, "exit code {code}"),
            FailureCause::Signal(signal) => write!(f, "killed by signal {signal}"),
            FailureCause::Error(reason) => f.write_str(reason),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signalled(signal: i32) -> ExitStatus {
        ExitStatus::from_raw(signal)
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SessionOutcome::from_exit_status(exited(0), false), SessionOutcome::Clean);
        assert_eq!(
            SessionOutcome::from_exit_status(exited(130), false),
            SessionOutcome::Interrupted
        );
        assert_eq!(
            SessionOutcome::from_exit_status(exited(255), false),
            SessionOutcome::Failed(FailureCause::ExitCode(255))
        );
    }

    #[test]
    fn test_signals() {
        assert_eq!(
            SessionOutcome::from_exit_status(signalled(2), false),
            SessionOutcome::Interrupted
        );
        assert_eq!(
            SessionOutcome::from_exit_status(signalled(9), false),
            SessionOutcome::Failed(FailureCause::Signal(9))
        );
    }

    #[test]
    fn test_requested_stop_is_never_a_failure() {
        let outcome = SessionOutcome::from_exit_status(signalled(9), true);
        assert_eq!(outcome, SessionOutcome::Interrupted);
        assert!(!outcome.is_retryable());
    }

    #[test]
    fn test_session_states() {
        assert_eq!(
            SessionOutcome::from_session_state(&SessionState::Stopped),
            SessionOutcome::Interrupted
        );
        let failed = SessionOutcome::from_session_state(&SessionState::Failed("boom".into()));
        assert!(failed.is_retryable());
        assert_eq!(failed.to_string(), "failed (boom)");
    }
}
