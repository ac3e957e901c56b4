//! Analysis result types produced by the native autodetect process.
//!
//! A [`Bucket`] is the root of a result tree: it aggregates bucket
//! influencers, anomaly records and partition scores. Scores are on a
//! 0..=100 scale after normalization.

pub mod memory;
pub mod processor;

use serde::{Deserialize, Serialize};

pub use memory::MemoryResultsStore;
pub use processor::{
    FlushAcknowledger, FlushWait, ProcessorStats, ResultProcessor, ResultTracker,
    ResultsPersister,
};

/// Influencer field name used for the bucket-wide time influencer.
pub const BUCKET_TIME_INFLUENCER: &str = "bucket_time";

/// One bucket of analysis results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bucket {
    /// Bucket start, epoch seconds.
    pub timestamp: i64,
    pub bucket_span: u64,
    pub anomaly_score: f64,
    pub initial_anomaly_score: f64,
    pub max_normalized_probability: f64,
    pub max_partition_score: f64,
    pub event_count: u64,
    pub is_interim: bool,
    pub bucket_influencers: Vec<BucketInfluencer>,
    pub records: Vec<AnomalyRecord>,
    pub partition_scores: Vec<PartitionScore>,
    #[serde(skip)]
    pub had_big_normalized_update: bool,
}

impl Bucket {
    /// Stable id used as the `id` column in score states.
    pub fn id(&self) -> String {
        self.timestamp.to_string()
    }
}

/// Per-field contribution to a bucket's anomaly score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketInfluencer {
    pub influencer_field_name: String,
    pub probability: f64,
    pub raw_anomaly_score: f64,
    pub initial_anomaly_score: f64,
    pub anomaly_score: f64,
    #[serde(skip)]
    pub had_big_normalized_update: bool,
}

/// A single anomalous observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnomalyRecord {
    pub probability: f64,
    pub normalized_probability: f64,
    pub initial_normalized_probability: f64,
    /// Mirrors the parent bucket's score after normalization.
    pub anomaly_score: f64,
    pub function: Option<String>,
    pub field_name: Option<String>,
    pub by_field_name: Option<String>,
    pub by_field_value: Option<String>,
    pub over_field_name: Option<String>,
    pub over_field_value: Option<String>,
    pub partition_field_name: Option<String>,
    pub partition_field_value: Option<String>,
    pub is_interim: bool,
    #[serde(skip)]
    pub had_big_normalized_update: bool,
}

impl AnomalyRecord {
    /// The field that identifies the entity being modelled.
    pub fn person_field_name(&self) -> Option<&str> {
        self.over_field_name
            .as_deref()
            .or(self.by_field_name.as_deref())
    }
}

/// An influencer value's score within a bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Influencer {
    pub influencer_field_name: String,
    pub influencer_field_value: String,
    pub probability: f64,
    pub initial_anomaly_score: f64,
    pub anomaly_score: f64,
    #[serde(skip)]
    pub had_big_normalized_update: bool,
}

/// Score for one partition value within a bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartitionScore {
    pub partition_field_name: String,
    pub partition_field_value: String,
    pub probability: f64,
    pub anomaly_score: f64,
    #[serde(skip)]
    pub had_big_normalized_update: bool,
}

/// Normalizer state snapshot emitted by the autodetect process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Quantiles {
    /// Epoch seconds up to which the state applies.
    pub timestamp: i64,
    pub quantile_state: String,
}
