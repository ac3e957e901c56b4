//! Running totals for data written to a job's process.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Counts of records and bytes seen by the data writer.
///
/// Mutated only by the write path; status queries read snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataCounts {
    /// Records written to the process.
    pub processed_record_count: u64,
    /// Analysis fields written to the process, excluding missing ones.
    pub processed_field_count: u64,
    /// Raw input bytes read, including line terminators.
    pub input_bytes: u64,
    /// Non-blank input lines read.
    pub input_record_count: u64,
    /// Fields across all parsed input records.
    pub input_field_count: u64,
    /// Records skipped because the time field was missing or unparseable.
    pub invalid_date_count: u64,
    /// Analysis fields absent from an otherwise valid record.
    pub missing_field_count: u64,
    /// Records skipped because their time preceded the latest record.
    pub out_of_order_time_stamp_count: u64,
    /// Lines skipped because they were not JSON objects.
    pub excluded_record_count: u64,
    /// Epoch seconds of the latest record written.
    pub latest_record_time_stamp: Option<i64>,
}

impl DataCounts {
    /// Add another set of counts to these totals.
    pub fn merge(&mut self, other: &DataCounts) {
        self.processed_record_count += other.processed_record_count;
        self.processed_field_count += other.processed_field_count;
        self.input_bytes += other.input_bytes;
        self.input_record_count += other.input_record_count;
        self.input_field_count += other.input_field_count;
        self.invalid_date_count += other.invalid_date_count;
        self.missing_field_count += other.missing_field_count;
        self.out_of_order_time_stamp_count += other.out_of_order_time_stamp_count;
        self.excluded_record_count += other.excluded_record_count;
        self.latest_record_time_stamp = match (self.latest_record_time_stamp, other.latest_record_time_stamp) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Records dropped for any reason.
    pub fn skipped_record_count(&self) -> u64 {
        self.invalid_date_count + self.out_of_order_time_stamp_count + self.excluded_record_count
    }

    pub fn latest_record_time(&self) -> Option<DateTime<Utc>> {
        self.latest_record_time_stamp
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_adds_and_keeps_latest_time() {
        let mut totals = DataCounts {
            processed_record_count: 2,
            latest_record_time_stamp: Some(200),
            ..Default::default()
        };
        totals.merge(&DataCounts {
            processed_record_count: 3,
            invalid_date_count: 1,
            latest_record_time_stamp: Some(100),
            ..Default::default()
        });
        assert_eq!(totals.processed_record_count, 5);
        assert_eq!(totals.invalid_date_count, 1);
        assert_eq!(totals.latest_record_time_stamp, Some(200));

        let mut empty = DataCounts::default();
        empty.merge(&totals);
        assert_eq!(empty.latest_record_time_stamp, Some(200));
    }

    #[test]
    fn test_skipped_and_latest_time() {
        let counts = DataCounts {
            invalid_date_count: 1,
            out_of_order_time_stamp_count: 2,
            excluded_record_count: 3,
            latest_record_time_stamp: Some(1_400_000_000),
            ..Default::default()
        };
        assert_eq!(counts.skipped_record_count(), 6);
        assert_eq!(
            counts.latest_record_time().unwrap().to_rfc3339(),
            "2014-05-13T16:53:20+00:00"
        );
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_string(&DataCounts::default()).unwrap();
        assert!(json.contains("\"processedRecordCount\":0"));
        assert!(json.contains("\"outOfOrderTimeStampCount\":0"));
    }
}
