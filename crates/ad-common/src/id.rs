//! Job and flush identity types.
//!
//! A job owns exactly one native analysis process; every supervisor
//! operation, log line and error is keyed by the job's id.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a job id.
pub const MAX_JOB_ID_LEN: usize = 64;

/// Job identifier.
///
/// Format: lowercase ASCII letters, digits, `-` and `_`, starting with a
/// letter or digit, at most 64 characters.
/// Example: `web-logs-2026`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Parse and validate a job id string.
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() || s.len() > MAX_JOB_ID_LEN {
            return None;
        }
        let first = s.as_bytes()[0];
        if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
            return None;
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return None;
        }
        Some(JobId(s.to_string()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Flush identifier handed out by the control message writer.
///
/// Flush ids increase monotonically for the lifetime of one process and are
/// echoed back by the native process once every result up to the flush
/// point has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlushId(pub u64);

impl FlushId {
    /// Parse the decimal form echoed back by the native process.
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<u64>().ok().map(FlushId)
    }
}

impl fmt::Display for FlushId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for FlushId {
    fn from(id: u64) -> Self {
        FlushId(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_parse_valid() {
        assert_eq!(JobId::parse("web-logs_1").unwrap().as_str(), "web-logs_1");
        assert!(JobId::parse("0abc").is_some());
    }

    #[test]
    fn test_job_id_parse_invalid() {
        assert!(JobId::parse("").is_none());
        assert!(JobId::parse("-leading").is_none());
        assert!(JobId::parse("Upper").is_none());
        assert!(JobId::parse("has space").is_none());
        assert!(JobId::parse(&"a".repeat(MAX_JOB_ID_LEN + 1)).is_none());
    }

    #[test]
    fn test_flush_id_roundtrip_display() {
        let id = FlushId(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(FlushId::parse(" 42 "), Some(id));
        assert_eq!(FlushId::parse("x"), None);
    }

    #[test]
    fn test_job_id_serializes_transparently() {
        let id = JobId::parse("farequote").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"farequote\"");
    }
}
