//! Native analysis process management.
//!
//! - [`command`]: argument construction for native binaries
//! - [`native`]: spawning, stderr capture and shutdown
//! - [`writer`] / [`control`]: data and control records on the input stream
//! - [`supervisor`]: per-job single-flight access to the process

pub mod command;
pub mod control;
pub mod counts;
pub mod native;
pub mod supervisor;
pub mod writer;

pub use command::ProcessCommand;
pub use control::{ControlMsgWriter, DataLoadParams, FlushParams, ModelDebugConfig, TimeRange};
pub use counts::DataCounts;
pub use native::{AnalysisProcess, NativeAnalysisProcess, NativeProcessOptions};
pub use supervisor::{CompletionHandler, InUseToken, ProcessSupervisor, ProcessSupervisorBuilder};
pub use writer::{DataDescription, DataWriter, TimeFormat};
