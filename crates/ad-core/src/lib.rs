//! Anomaly Detector Core Library
//!
//! Supervises native anomaly-detection processes and renormalizes their
//! scores:
//! - Length-encoded wire codec and normalizer output parsing
//! - Per-job process supervision with single-flight access
//! - Result consumption, flush acknowledgement and renormalization
//! - The normalizable result tree and the normalization pass
//! - Configuration, logging and exit codes for the CLI
//!
//! The binary entry point is in `main.rs`.

pub mod codec;
pub mod config;
pub mod exit_codes;
pub mod logging;
pub mod normalize;
pub mod orchestrator;
pub mod process;
pub mod renormalize;
pub mod results;

// Test doubles for unit and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod mock_process;
