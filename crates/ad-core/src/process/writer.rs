//! Converts NDJSON input into length-encoded data records.
//!
//! A data record is `[time, analysis fields..., control]` where the time is
//! epoch seconds and the control field is empty. The header record carries
//! the field names and `.` as the control field name.

use crate::process::counts::DataCounts;
use crate::process::native::AnalysisProcess;
use ad_common::{Error, ProcessRunCode, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::BufRead;
use tracing::{debug, trace, warn};

/// Name of the trailing control field in the header record.
pub const CONTROL_FIELD_NAME: &str = ".";

/// Encoding of the time field in input records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFormat {
    /// Seconds since the epoch.
    #[default]
    Epoch,
    /// Milliseconds since the epoch.
    EpochMs,
}

impl TimeFormat {
    /// Parse a time value to epoch seconds.
    pub fn parse(self, value: &Value) -> Option<i64> {
        let raw = match value {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        if !raw.is_finite() {
            return None;
        }
        let secs = match self {
            TimeFormat::Epoch => raw,
            TimeFormat::EpochMs => raw / 1000.0,
        };
        Some(secs.floor() as i64)
    }
}

impl std::str::FromStr for TimeFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "epoch" => Ok(TimeFormat::Epoch),
            "epoch_ms" => Ok(TimeFormat::EpochMs),
            other => Err(format!("unknown time format '{}' (expected epoch or epoch_ms)", other)),
        }
    }
}

/// Shape of a job's input data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDescription {
    pub time_field: String,
    #[serde(default)]
    pub time_format: TimeFormat,
    pub analysis_fields: Vec<String>,
}

impl DataDescription {
    /// Width of every record written to the process.
    pub fn num_fields(&self) -> usize {
        self.analysis_fields.len() + 2
    }

    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.num_fields());
        header.push(self.time_field.clone());
        header.extend(self.analysis_fields.iter().cloned());
        header.push(CONTROL_FIELD_NAME.to_string());
        header
    }
}

/// Writes input data for one process.
#[derive(Debug)]
pub struct DataWriter {
    description: DataDescription,
    latest_epoch: Option<i64>,
}

impl DataWriter {
    pub fn new(description: DataDescription) -> Self {
        Self {
            description,
            latest_epoch: None,
        }
    }

    pub fn description(&self) -> &DataDescription {
        &self.description
    }

    /// Write the header record. Must precede any data or control record.
    pub fn write_header(&self, process: &mut dyn AnalysisProcess) -> Result<()> {
        process
            .write_record(&self.description.header())
            .map_err(|e| Error::process_run(ProcessRunCode::WriteFailed, "writing header", &e))
    }

    /// Stream every input line to the process.
    ///
    /// Returns the counts for this call only.
    pub fn write<R: BufRead>(
        &mut self,
        process: &mut dyn AnalysisProcess,
        input: R,
    ) -> Result<DataCounts> {
        let mut counts = DataCounts::default();
        self.write_into(process, input, &mut counts)?;
        Ok(counts)
    }

    /// Like [`write`](Self::write), but accumulates into `counts`, which
    /// keeps whatever was counted before a failure.
    pub fn write_into<R: BufRead>(
        &mut self,
        process: &mut dyn AnalysisProcess,
        input: R,
        counts: &mut DataCounts,
    ) -> Result<()> {
        let mut record = vec![String::new(); self.description.num_fields()];

        for line in input.lines() {
            let line = line?;
            counts.input_bytes += line.len() as u64 + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            counts.input_record_count += 1;

            let object = match serde_json::from_str::<Value>(trimmed) {
                Ok(Value::Object(object)) => object,
                Ok(_) | Err(_) => {
                    counts.excluded_record_count += 1;
                    trace!(line = counts.input_record_count, "input line is not a JSON object");
                    continue;
                }
            };
            counts.input_field_count += object.len() as u64;

            if self.fill_record(&object, &mut record, counts) {
                process.write_record(&record).map_err(|e| {
                    Error::process_run(ProcessRunCode::WriteFailed, "writing data record", &e)
                })?;
                counts.processed_record_count += 1;
            }
        }

        process
            .flush_stream()
            .map_err(|e| Error::process_run(ProcessRunCode::WriteFailed, "flushing input", &e))?;

        if counts.skipped_record_count() > 0 {
            warn!(
                invalid_dates = counts.invalid_date_count,
                out_of_order = counts.out_of_order_time_stamp_count,
                excluded = counts.excluded_record_count,
                "skipped input records"
            );
        }
        debug!(
            processed = counts.processed_record_count,
            bytes = counts.input_bytes,
            "data upload written"
        );
        Ok(())
    }

    /// Fill `record` from one input object; false if the record is skipped.
    fn fill_record(
        &mut self,
        object: &Map<String, Value>,
        record: &mut [String],
        counts: &mut DataCounts,
    ) -> bool {
        let epoch = object
            .get(&self.description.time_field)
            .and_then(|v| self.description.time_format.parse(v));
        let Some(epoch) = epoch else {
            counts.invalid_date_count += 1;
            return false;
        };
        if self.latest_epoch.is_some_and(|latest| epoch < latest) {
            counts.out_of_order_time_stamp_count += 1;
            return false;
        }
        self.latest_epoch = Some(epoch);
        counts.latest_record_time_stamp = Some(epoch);

        record[0] = epoch.to_string();
        for (slot, field) in record[1..]
            .iter_mut()
            .zip(self.description.analysis_fields.iter())
        {
            *slot = match object.get(field) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => {
                    counts.missing_field_count += 1;
                    String::new()
                }
                Some(other) => other.to_string(),
            };
            if !slot.is_empty() {
                counts.processed_field_count += 1;
            }
        }
        if let Some(control) = record.last_mut() {
            control.clear();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_process::MockAnalysisProcess;

    fn description(format: TimeFormat) -> DataDescription {
        DataDescription {
            time_field: "time".into(),
            time_format: format,
            analysis_fields: vec!["airline".into(), "responsetime".into()],
        }
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(
            description(TimeFormat::Epoch).header(),
            vec!["time", "airline", "responsetime", "."]
        );
    }

    #[test]
    fn test_time_format_parse() {
        assert_eq!(TimeFormat::Epoch.parse(&serde_json::json!(1400000000)), Some(1_400_000_000));
        assert_eq!(TimeFormat::Epoch.parse(&serde_json::json!("1400000000")), Some(1_400_000_000));
        assert_eq!(
            TimeFormat::EpochMs.parse(&serde_json::json!(1400000000123i64)),
            Some(1_400_000_000)
        );
        assert_eq!(TimeFormat::Epoch.parse(&serde_json::json!("yesterday")), None);
        assert_eq!(TimeFormat::Epoch.parse(&serde_json::json!(true)), None);
        assert_eq!("epoch_ms".parse::<TimeFormat>(), Ok(TimeFormat::EpochMs));
        assert!("iso".parse::<TimeFormat>().is_err());
    }

    #[test]
    fn test_write_counts_and_records() {
        let input = concat!(
            "{\"time\":100,\"airline\":\"AAL\",\"responsetime\":132.5}\n",
            "\n",
            "{\"time\":\"bad\",\"airline\":\"JZA\"}\n",
            "{\"time\":200,\"airline\":\"JZA\"}\n",
            "{\"time\":150,\"airline\":\"AAL\",\"responsetime\":1}\n",
            "[1,2,3]\n",
        );
        let mut process = MockAnalysisProcess::new();
        let mut writer = DataWriter::new(description(TimeFormat::Epoch));
        let counts = writer.write(&mut process, input.as_bytes()).unwrap();

        assert_eq!(counts.input_record_count, 5);
        assert_eq!(counts.processed_record_count, 2);
        assert_eq!(counts.invalid_date_count, 1);
        assert_eq!(counts.out_of_order_time_stamp_count, 1);
        assert_eq!(counts.excluded_record_count, 1);
        assert_eq!(counts.missing_field_count, 1);
        assert_eq!(counts.processed_field_count, 3);
        assert_eq!(counts.input_bytes, input.len() as u64);
        assert_eq!(counts.latest_record_time_stamp, Some(200));

        let records = process.records();
        assert_eq!(records[0], vec!["100", "AAL", "132.5", ""]);
        assert_eq!(records[1], vec!["200", "JZA", "", ""]);
        assert_eq!(process.flush_count(), 1);
    }

    #[test]
    fn test_ordering_persists_across_uploads() {
        let mut process = MockAnalysisProcess::new();
        let mut writer = DataWriter::new(description(TimeFormat::Epoch));
        writer
            .write(&mut process, "{\"time\":500,\"airline\":\"a\"}\n".as_bytes())
            .unwrap();
        let counts = writer
            .write(&mut process, "{\"time\":400,\"airline\":\"a\"}\n".as_bytes())
            .unwrap();
        assert_eq!(counts.out_of_order_time_stamp_count, 1);
        assert_eq!(counts.processed_record_count, 0);
    }

    #[test]
    fn test_write_failure_is_process_run_error() {
        let mut process = MockAnalysisProcess::new();
        process.fail_writes();
        let mut writer = DataWriter::new(description(TimeFormat::Epoch));
        let err = writer
            .write(&mut process, "{\"time\":1}\n".as_bytes())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NativeProcessRun {
                code: ProcessRunCode::WriteFailed,
                ..
            }
        ));
    }
}
