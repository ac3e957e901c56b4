//! Wire formats spoken with the native processes.
//!
//! - [`length_encoded`]: binary record framing for process input
//! - [`normalizer_output`]: tolerant JSON-lines parser for normalizer output

pub mod length_encoded;
pub mod normalizer_output;

pub use length_encoded::{LengthEncodedReader, LengthEncodedWriter};
pub use normalizer_output::{parse_results, spawn_result_reader, NormalizedResult};
