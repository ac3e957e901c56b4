//! Anomaly detector common types, IDs, and errors.
//!
//! This crate provides foundational types shared across ad-core modules:
//! - Job and flush identity types
//! - The unified error type with stable codes

pub mod error;
pub mod id;

pub use error::{
    format_error_human, Error, ErrorCategory, ProcessRunCode, Result, StructuredError,
    SuggestedAction,
};
pub use id::{FlushId, JobId};
