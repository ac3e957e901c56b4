//! Control messages interleaved with data records.
//!
//! A control record is as wide as a data record. Every field is empty except
//! the trailing control field, which holds the message:
//!
//! | Message | Meaning |
//! |---------|---------|
//! | `f<id>` | flush, acknowledged with the same id |
//! | `i` / `i<start> <end>` | calculate interim results |
//! | `t<epoch>` | advance time |
//! | `r<start> <end>` | reset buckets |
//! | `u[modelDebugConfig]...` | model debug config update |
//! | `u[detectorRules]...` | detector rules update |

use crate::process::native::AnalysisProcess;
use ad_common::FlushId;
use serde::{Deserialize, Serialize};
use std::io;
use tracing::debug;

pub const FLUSH_MESSAGE_CODE: char = 'f';
pub const INTERIM_MESSAGE_CODE: char = 'i';
pub const ADVANCE_TIME_MESSAGE_CODE: char = 't';
pub const RESET_BUCKETS_MESSAGE_CODE: char = 'r';
pub const UPDATE_MESSAGE_CODE: char = 'u';

/// Size of the padding message written after a flush.
///
/// The native side reads input through a buffer of this size; the padding
/// guarantees the flush message itself is consumed immediately.
pub const FLUSH_BUFFER_LEN: usize = 8192;

/// Inclusive-start time range in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: Option<i64>,
}

impl TimeRange {
    pub fn new(start: i64, end: Option<i64>) -> Self {
        Self { start, end }
    }

    /// `start end` when the end is known, otherwise `start start+1`.
    fn message_args(&self) -> String {
        let end = self.end.unwrap_or(self.start + 1);
        format!("{} {}", self.start, end)
    }
}

/// Parameters for a flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlushParams {
    /// Ask for interim results before flushing.
    pub calc_interim: bool,
    /// Restrict interim results to a range.
    pub interim_range: Option<TimeRange>,
    /// Advance the process's clock to this epoch before flushing.
    pub advance_time: Option<i64>,
}

/// Parameters for a data upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataLoadParams {
    /// Reset these buckets before writing the upload.
    pub reset_buckets: Option<TimeRange>,
}

impl DataLoadParams {
    pub fn resetting_buckets(&self) -> bool {
        self.reset_buckets.is_some()
    }
}

/// Model debug output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDebugConfig {
    pub bounds_percentile: f64,
    #[serde(default)]
    pub terms: String,
}

/// Writes control records for one process.
#[derive(Debug)]
pub struct ControlMsgWriter {
    num_fields: usize,
    last_flush_id: u64,
}

impl ControlMsgWriter {
    /// `num_fields` is the width of a data record, control field included.
    pub fn new(num_fields: usize) -> Self {
        Self {
            num_fields: num_fields.max(1),
            last_flush_id: 0,
        }
    }

    /// Write a flush, preceded by any interim or advance-time requests.
    pub fn write_flush(
        &mut self,
        process: &mut dyn AnalysisProcess,
        params: &FlushParams,
    ) -> io::Result<FlushId> {
        if params.calc_interim {
            let message = match &params.interim_range {
                Some(range) => format!("{}{}", INTERIM_MESSAGE_CODE, range.message_args()),
                None => INTERIM_MESSAGE_CODE.to_string(),
            };
            self.write_message(process, &message)?;
        }
        if let Some(epoch) = params.advance_time {
            self.write_message(process, &format!("{}{}", ADVANCE_TIME_MESSAGE_CODE, epoch))?;
        }

        self.last_flush_id += 1;
        let flush_id = FlushId(self.last_flush_id);
        self.write_message(process, &format!("{}{}", FLUSH_MESSAGE_CODE, flush_id))?;
        self.write_message(process, &" ".repeat(FLUSH_BUFFER_LEN))?;
        process.flush_stream()?;

        debug!(flush_id = %flush_id, "wrote flush control message");
        Ok(flush_id)
    }

    pub fn write_reset_buckets(
        &mut self,
        process: &mut dyn AnalysisProcess,
        range: &TimeRange,
    ) -> io::Result<()> {
        let message = format!("{}{}", RESET_BUCKETS_MESSAGE_CODE, range.message_args());
        self.write_message(process, &message)?;
        debug!(start = range.start, end = ?range.end, "wrote reset buckets control message");
        Ok(())
    }

    pub fn write_update_model_debug(
        &mut self,
        process: &mut dyn AnalysisProcess,
        config: &ModelDebugConfig,
    ) -> io::Result<()> {
        let message = format!(
            "{}[modelDebugConfig]\nboundspercentile = {}\nterms = {}\n",
            UPDATE_MESSAGE_CODE, config.bounds_percentile, config.terms
        );
        self.write_message(process, &message)?;
        process.flush_stream()
    }

    pub fn write_update_detector_rules(
        &mut self,
        process: &mut dyn AnalysisProcess,
        detector_index: usize,
        rules_json: &str,
    ) -> io::Result<()> {
        let message = format!(
            "{}[detectorRules]\ndetectorIndex={}\nrulesJson={}\n",
            UPDATE_MESSAGE_CODE, detector_index, rules_json
        );
        self.write_message(process, &message)?;
        process.flush_stream()
    }

    fn write_message(&self, process: &mut dyn AnalysisProcess, message: &str) -> io::Result<()> {
        let mut record = vec![String::new(); self.num_fields];
        if let Some(last) = record.last_mut() {
            *last = message.to_string();
        }
        process.write_record(&record)
    }
}
