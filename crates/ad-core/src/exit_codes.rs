//! Exit codes for the ad-core CLI.
//!
//! Exit code ranges:
//! - 0-9: success and operational outcomes
//! - 10-19: user/environment errors (fixable by the caller)
//! - 20-29: job and process failures
//! - 30-39: internal errors

use ad_common::Error;

/// Stable exit codes. Changes require a major version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // success (0-9)
    /// Success
    Clean = 0,

    /// Input was written but some records were skipped
    PartialInput = 1,

    // caller-fixable (10-19)
    /// Invalid arguments
    ArgsError = 10,

    /// Configuration missing or invalid
    ConfigError = 11,

    /// Input file missing or malformed
    InputError = 12,

    // job / process failures (20-29)
    /// Another operation holds the job; retry
    Busy = 20,

    /// A wait was interrupted; retry
    Interrupted = 21,

    /// The native process died
    ProcessDead = 22,

    /// The native process could not be run or talked to
    ProcessError = 23,

    // internal errors (30-39)
    /// Internal error (bug, please report)
    InternalError = 30,

    /// I/O error
    IoError = 31,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        (self as i32) < 10
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ExitCode::Busy | ExitCode::Interrupted)
    }

    /// Error code name for JSON output.
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::PartialInput => "OK_PARTIAL_INPUT",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::InputError => "ERR_INPUT",
            ExitCode::Busy => "ERR_BUSY",
            ExitCode::Interrupted => "ERR_INTERRUPTED",
            ExitCode::ProcessDead => "ERR_PROCESS_DEAD",
            ExitCode::ProcessError => "ERR_PROCESS",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<&Error> for ExitCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Config(_) => ExitCode::ConfigError,
            Error::InvalidJobId(_) => ExitCode::ArgsError,
            Error::JobNotFound { .. } => ExitCode::ArgsError,
            Error::JobBusy { .. } => ExitCode::Busy,
            Error::Interrupted { .. } => ExitCode::Interrupted,
            Error::ProcessDead { .. } => ExitCode::ProcessDead,
            Error::NativeProcessRun { .. } | Error::Protocol(_) => ExitCode::ProcessError,
            Error::Normalization(_) => ExitCode::InternalError,
            Error::Json(_) => ExitCode::InputError,
            Error::Io(_) => ExitCode::IoError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges() {
        assert!(ExitCode::Clean.is_success());
        assert!(ExitCode::PartialInput.is_success());
        assert!(!ExitCode::ArgsError.is_success());
        assert_eq!(ExitCode::ProcessDead.as_i32(), 22);
        assert_eq!(ExitCode::Busy.to_string(), "ERR_BUSY (20)");
    }

    #[test]
    fn test_from_error() {
        let busy = Error::JobBusy {
            job_id: "j".into(),
            operation: "flush".into(),
        };
        assert_eq!(ExitCode::from(&busy), ExitCode::Busy);
        assert!(ExitCode::from(&busy).is_retryable());

        let dead = Error::ProcessDead {
            job_id: "j".into(),
            stderr: String::new(),
        };
        assert_eq!(ExitCode::from(&dead), ExitCode::ProcessDead);
        assert_eq!(ExitCode::from(&Error::Config("x".into())), ExitCode::ConfigError);
    }
}
