//! Error types for the anomaly detector.
//!
//! Every job-level failure maps to one [`Error`] variant carrying:
//! - A stable error code for machine parsing
//! - A category for grouping
//! - A recoverability hint and a suggested action for callers
//!
//! # JSON form
//!
//! [`StructuredError`] is what `--log-format jsonl` prints on failure:
//! ```json
//! {
//!   "code": 21,
//!   "category": "overloaded",
//!   "message": "job farequote is busy: flush rejected while another operation is in progress",
//!   "recoverable": true,
//!   "suggested_action": "retry",
//!   "context": { "job_id": "farequote" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Shorthand used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse grouping of error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration and argument errors.
    Config,
    /// Job lookup errors.
    Job,
    /// The job is serving another operation (rate-limit style).
    Overloaded,
    /// Native process start, death and pipe errors.
    Process,
    /// Malformed traffic from the native process.
    Protocol,
    /// Normalization tree contract violations.
    Normalization,
    /// Local files and JSON.
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Config => "config",
            Self::Job => "job",
            Self::Overloaded => "overloaded",
            Self::Process => "process",
            Self::Protocol => "protocol",
            Self::Normalization => "normalization",
            Self::Io => "io",
        })
    }
}

/// What a caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Try the same call again later.
    Retry,
    /// Fix the configuration and try again.
    FixConfig,
    /// Reopen the job; its process is gone.
    ReopenJob,
    /// Drop the offending item and carry on.
    Skip,
    /// Needs an operator.
    ManualIntervention,
}

impl fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Retry => "retry",
            Self::FixConfig => "fix_config",
            Self::ReopenJob => "reopen_job",
            Self::Skip => "skip",
            Self::ManualIntervention => "manual_intervention",
        })
    }
}

/// Stable codes for native process run failures.
///
/// These numbers are part of the external contract and never change meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRunCode {
    /// The process could not be spawned.
    StartFailed,
    /// The process exited or reported failure while in use.
    ProcessFailed,
    /// Writing to the process input failed.
    WriteFailed,
    /// Reading the process output failed.
    ReadFailed,
    /// A stdin/stdout pipe could not be opened.
    StreamOpenFailed,
    /// The helper returned a different number of rows than it was given.
    UnexpectedResultCount,
}

impl ProcessRunCode {
    /// Numeric code.
    pub fn as_u32(self) -> u32 {
        match self {
            ProcessRunCode::StartFailed => 30001,
            ProcessRunCode::ProcessFailed => 30002,
            ProcessRunCode::WriteFailed => 30004,
            ProcessRunCode::ReadFailed => 30005,
            ProcessRunCode::StreamOpenFailed => 30006,
            ProcessRunCode::UnexpectedResultCount => 30007,
        }
    }

    /// Code name for JSON output.
    pub fn name(self) -> &'static str {
        match self {
            ProcessRunCode::StartFailed => "NATIVE_PROCESS_START_ERROR",
            ProcessRunCode::ProcessFailed => "NATIVE_PROCESS_ERROR",
            ProcessRunCode::WriteFailed => "NATIVE_PROCESS_WRITE_ERROR",
            ProcessRunCode::ReadFailed => "NATIVE_PROCESS_READ_ERROR",
            ProcessRunCode::StreamOpenFailed => "NATIVE_PROCESS_STREAM_ERROR",
            ProcessRunCode::UnexpectedResultCount => "NATIVE_PROCESS_RESULT_COUNT_ERROR",
        }
    }
}

impl fmt::Display for ProcessRunCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u32())
    }
}

/// Every failure a job operation can report.
#[derive(Error, Debug)]
pub enum Error {
    // 10-19: bad input from the operator
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    // 20-29: job state
    #[error("no running process for job {job_id}")]
    JobNotFound { job_id: String },

    #[error("job {job_id} is busy: {operation} rejected while another operation is in progress")]
    JobBusy { job_id: String, operation: String },

    #[error("job {job_id} was interrupted while waiting to {operation}")]
    Interrupted { job_id: String, operation: String },

    // 30-39: native processes
    #[error("native process for job {job_id} has died: {stderr}")]
    ProcessDead { job_id: String, stderr: String },

    #[error("native process error [{code}]: {message}")]
    NativeProcessRun {
        code: ProcessRunCode,
        message: String,
    },

    // 40-49
    #[error("protocol error: {0}")]
    Protocol(String),

    // 50-59
    #[error("normalization failed: {0}")]
    Normalization(String),

    // 60-69: local I/O
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an I/O failure into a stable-coded process run error.
    pub fn process_run(code: ProcessRunCode, context: &str, err: &std::io::Error) -> Self {
        Error::NativeProcessRun {
            code,
            message: format!("{}: {}", context, err),
        }
    }

    /// Stable numeric code; the tens digit matches [`Error::category`].
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidJobId(_) => 11,
            Error::JobNotFound { .. } => 20,
            Error::JobBusy { .. } => 21,
            Error::Interrupted { .. } => 22,
            Error::ProcessDead { .. } => 30,
            Error::NativeProcessRun { .. } => 31,
            Error::Protocol(_) => 40,
            Error::Normalization(_) => 50,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }

    /// Coarse grouping used by the JSON form.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::InvalidJobId(_) => ErrorCategory::Config,
            Error::JobNotFound { .. } => ErrorCategory::Job,
            Error::JobBusy { .. } | Error::Interrupted { .. } => ErrorCategory::Overloaded,
            Error::ProcessDead { .. } | Error::NativeProcessRun { .. } => ErrorCategory::Process,
            Error::Protocol(_) => ErrorCategory::Protocol,
            Error::Normalization(_) => ErrorCategory::Normalization,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Whether retrying can succeed.
    ///
    /// A dead process or a failed spawn ends the job's processing; busy and
    /// interrupted operations can simply be retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Config(_) => true,
            Error::InvalidJobId(_) => true,
            Error::JobNotFound { .. } => false,
            Error::JobBusy { .. } => true,
            Error::Interrupted { .. } => true,
            Error::ProcessDead { .. } => false,
            Error::NativeProcessRun { .. } => false,
            Error::Protocol(_) => true,
            Error::Normalization(_) => true,
            Error::Io(_) => true,
            Error::Json(_) => true,
        }
    }

    /// Next step for the caller.
    pub fn suggested_action(&self) -> SuggestedAction {
        match self {
            Error::Config(_) | Error::InvalidJobId(_) => SuggestedAction::FixConfig,
            Error::JobNotFound { .. } => SuggestedAction::ReopenJob,
            Error::JobBusy { .. } | Error::Interrupted { .. } => SuggestedAction::Retry,
            Error::ProcessDead { .. } | Error::NativeProcessRun { .. } => {
                SuggestedAction::ReopenJob
            }
            Error::Protocol(_) => SuggestedAction::Skip,
            Error::Normalization(_) => SuggestedAction::Retry,
            Error::Io(_) => SuggestedAction::Retry,
            Error::Json(_) => SuggestedAction::ManualIntervention,
        }
    }

    /// Title line for the human rendering.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::InvalidJobId(_) => "Invalid Job Id",
            Error::JobNotFound { .. } => "Job Not Running",
            Error::JobBusy { .. } => "Job Busy",
            Error::Interrupted { .. } => "Operation Interrupted",
            Error::ProcessDead { .. } => "Native Process Died",
            Error::NativeProcessRun { .. } => "Native Process Error",
            Error::Protocol(_) => "Protocol Error",
            Error::Normalization(_) => "Normalization Error",
            Error::Io(_) => "Local I/O Failure",
            Error::Json(_) => "Invalid JSON",
        }
    }
}

/// Machine-readable rendering of an [`Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// See [`Error::code`].
    pub code: u32,

    /// See [`Error::category`].
    pub category: ErrorCategory,

    /// `Display` text of the error.
    pub message: String,

    /// See [`Error::is_recoverable`].
    pub recoverable: bool,

    /// Suggested action for callers.
    pub suggested_action: SuggestedAction,

    /// Additional structured context (e.g., job id, process run code).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        use serde_json::json;

        let pairs: Vec<(&str, serde_json::Value)> = match err {
            Error::JobNotFound { job_id } | Error::ProcessDead { job_id, .. } => {
                vec![("job_id", json!(job_id))]
            }
            Error::JobBusy { job_id, operation } | Error::Interrupted { job_id, operation } => {
                vec![("job_id", json!(job_id)), ("operation", json!(operation))]
            }
            Error::NativeProcessRun { code, .. } => vec![
                ("process_code", json!(code.as_u32())),
                ("process_code_name", json!(code.name())),
            ],
            _ => Vec::new(),
        };
        let context = pairs
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();

        Self {
            code: err.code(),
            category: err.category(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            suggested_action: err.suggested_action(),
            context,
        }
    }
}

impl StructuredError {
    /// Single-line JSON; never fails.
    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(_) => format!(r#"{{"code":{},"message":"unserializable error"}}"#, self.code),
        }
    }
}

/// Two-line stderr rendering: a marked headline, then the message.
pub fn format_error_human(err: &Error, use_color: bool) -> String {
    let (red, reset) = if use_color {
        ("\x1b[31m", "\x1b[0m")
    } else {
        ("", "")
    };

    format!("{red}✗{reset} {}\n  Reason: {err}", err.headline())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(Error::Config("test".into()).code(), 10);
        assert_eq!(
            Error::JobBusy {
                job_id: "j".into(),
                operation: "flush".into()
            }
            .code(),
            21
        );
        assert_eq!(
            Error::ProcessDead {
                job_id: "j".into(),
                stderr: String::new()
            }
            .code(),
            30
        );
    }

    #[test]
    fn test_busy_and_interrupted_share_overloaded_category() {
        let busy = Error::JobBusy {
            job_id: "j".into(),
            operation: "write".into(),
        };
        let interrupted = Error::Interrupted {
            job_id: "j".into(),
            operation: "close".into(),
        };
        assert_eq!(busy.category(), ErrorCategory::Overloaded);
        assert_eq!(interrupted.category(), ErrorCategory::Overloaded);
        assert_eq!(busy.suggested_action(), SuggestedAction::Retry);
        assert_eq!(interrupted.suggested_action(), SuggestedAction::Retry);
    }

    #[test]
    fn test_process_dead_is_fatal() {
        let err = Error::ProcessDead {
            job_id: "j".into(),
            stderr: "segfault".into(),
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.suggested_action(), SuggestedAction::ReopenJob);
        assert!(err.to_string().contains("segfault"));
    }

    #[test]
    fn test_process_run_wraps_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = Error::process_run(ProcessRunCode::StartFailed, "spawning normalizer", &io);
        assert_eq!(err.code(), 31);
        let msg = err.to_string();
        assert!(msg.contains("NATIVE_PROCESS_START_ERROR"));
        assert!(msg.contains("30001"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_process_run_codes_are_stable() {
        assert_eq!(ProcessRunCode::StartFailed.as_u32(), 30001);
        assert_eq!(ProcessRunCode::ProcessFailed.as_u32(), 30002);
        assert_eq!(ProcessRunCode::WriteFailed.as_u32(), 30004);
        assert_eq!(ProcessRunCode::ReadFailed.as_u32(), 30005);
        assert_eq!(ProcessRunCode::StreamOpenFailed.as_u32(), 30006);
        assert_eq!(ProcessRunCode::UnexpectedResultCount.as_u32(), 30007);
    }

    #[test]
    fn test_structured_error_context() {
        let err = Error::JobBusy {
            job_id: "farequote".into(),
            operation: "flush".into(),
        };
        let structured = StructuredError::from(&err);
        assert_eq!(structured.code, 21);
        assert_eq!(structured.category, ErrorCategory::Overloaded);
        assert!(structured.recoverable);
        assert_eq!(structured.context["job_id"], serde_json::json!("farequote"));

        let json = structured.to_json();
        assert!(json.contains("\"suggested_action\":\"retry\""));
    }

    #[test]
    fn test_format_error_human_no_color() {
        let err = Error::Config("missing program".into());
        let out = format_error_human(&err, false);
        assert!(out.starts_with("✗ Configuration Error"));
        assert!(out.contains("Reason: configuration error: missing program"));
    }
}
