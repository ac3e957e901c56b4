//! Uniform view over the result tree for score normalization.
//!
//! [`Normalizable`] wraps a mutable borrow of one result node. Buckets are
//! container-only roots: they have no probability or score of their own and
//! only aggregate their children's maxima. Every other node is a leaf with a
//! probability and a normalized score.
//!
//! Writes go straight through to the wrapped result, so a normalization pass
//! mutates the caller's buckets in place.

pub mod initial_state;
pub mod normalizer;

use crate::results::{
    AnomalyRecord, Bucket, BucketInfluencer, Influencer, PartitionScore, BUCKET_TIME_INFLUENCER,
};
use thiserror::Error;

pub use initial_state::InitialState;
pub use normalizer::{BucketProvider, BucketScoresUpdater, Normalizer, NORMALIZER_ROW_HEADER};

/// Lowest normalized score.
pub const MIN_SCORE: f64 = 0.0;
/// Highest normalized score.
pub const MAX_SCORE: f64 = 100.0;

/// Errors from operations a node kind does not support.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizableError {
    #[error("{kind} is container-only and has no {operation}")]
    ContainerOnly {
        kind: &'static str,
        operation: &'static str,
    },

    #[error("{kind} is a leaf and has no {operation}")]
    NotAContainer {
        kind: &'static str,
        operation: &'static str,
    },

    #[error("invalid child type index {0}")]
    InvalidChildType(usize),
}

impl From<NormalizableError> for ad_common::Error {
    fn from(err: NormalizableError) -> Self {
        ad_common::Error::Normalization(err.to_string())
    }
}

/// Normalization level reported to the helper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Root,
    Leaf,
    BucketInfluencer,
    Influencer,
    Partition,
}

impl Level {
    /// Wire key for the `level` column.
    pub fn key(self) -> &'static str {
        match self {
            Level::Root => "root",
            Level::Leaf => "leaf",
            Level::BucketInfluencer => "inflb",
            Level::Influencer => "infl",
            Level::Partition => "part",
        }
    }
}

/// Kind of child a container aggregates.
///
/// The index selects which of the bucket's max-score slots a child kind
/// contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildType {
    BucketInfluencer = 0,
    Record = 1,
    PartitionScore = 2,
}

impl ChildType {
    /// All child types in merge order.
    pub const ALL: [ChildType; 3] = [
        ChildType::BucketInfluencer,
        ChildType::Record,
        ChildType::PartitionScore,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<usize> for ChildType {
    type Error = NormalizableError;

    fn try_from(index: usize) -> Result<Self, Self::Error> {
        ChildType::ALL
            .get(index)
            .copied()
            .ok_or(NormalizableError::InvalidChildType(index))
    }
}

/// Clamp a score into the normalized range; NaN maps to the minimum.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        MIN_SCORE
    } else {
        score.clamp(MIN_SCORE, MAX_SCORE)
    }
}

fn max_slot(bucket: &mut Bucket, child_type: ChildType) -> &mut f64 {
    match child_type {
        ChildType::BucketInfluencer => &mut bucket.anomaly_score,
        ChildType::Record => &mut bucket.max_normalized_probability,
        ChildType::PartitionScore => &mut bucket.max_partition_score,
    }
}

/// Mutable view of one node in a result tree.
#[derive(Debug)]
pub enum Normalizable<'a> {
    Bucket(&'a mut Bucket),
    BucketInfluencer(&'a mut BucketInfluencer),
    Record(&'a mut AnomalyRecord),
    Influencer(&'a mut Influencer),
    PartitionScore(&'a mut PartitionScore),
}

impl<'a> Normalizable<'a> {
    /// Short name of the wrapped node kind, for errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Normalizable::Bucket(_) => "bucket",
            Normalizable::BucketInfluencer(_) => "bucket influencer",
            Normalizable::Record(_) => "record",
            Normalizable::Influencer(_) => "influencer",
            Normalizable::PartitionScore(_) => "partition score",
        }
    }

    /// Container-only nodes contribute no row of their own.
    pub fn is_container_only(&self) -> bool {
        matches!(self, Normalizable::Bucket(_))
    }

    pub fn level(&self) -> Level {
        match self {
            Normalizable::Bucket(_) => Level::Root,
            Normalizable::BucketInfluencer(bi)
                if bi.influencer_field_name == BUCKET_TIME_INFLUENCER =>
            {
                Level::Root
            }
            Normalizable::BucketInfluencer(_) => Level::BucketInfluencer,
            Normalizable::Record(_) => Level::Leaf,
            Normalizable::Influencer(_) => Level::Influencer,
            Normalizable::PartitionScore(_) => Level::Partition,
        }
    }

    pub fn partition_field_name(&self) -> Option<&str> {
        match self {
            Normalizable::Record(r) => r.partition_field_name.as_deref(),
            Normalizable::PartitionScore(p) => Some(p.partition_field_name.as_str()),
            _ => None,
        }
    }

    pub fn partition_field_value(&self) -> Option<&str> {
        match self {
            Normalizable::Record(r) => r.partition_field_value.as_deref(),
            Normalizable::PartitionScore(p) => Some(p.partition_field_value.as_str()),
            _ => None,
        }
    }

    pub fn person_field_name(&self) -> Option<&str> {
        match self {
            Normalizable::Record(r) => r.person_field_name(),
            Normalizable::BucketInfluencer(bi) => Some(bi.influencer_field_name.as_str()),
            Normalizable::Influencer(i) => Some(i.influencer_field_name.as_str()),
            _ => None,
        }
    }

    pub fn function_name(&self) -> Option<&str> {
        match self {
            Normalizable::Record(r) => r.function.as_deref(),
            _ => None,
        }
    }

    pub fn value_field_name(&self) -> Option<&str> {
        match self {
            Normalizable::Record(r) => r.field_name.as_deref(),
            _ => None,
        }
    }

    pub fn probability(&self) -> Result<f64, NormalizableError> {
        match self {
            Normalizable::Bucket(_) => Err(self.container_only("probability")),
            Normalizable::BucketInfluencer(bi) => Ok(bi.probability),
            Normalizable::Record(r) => Ok(r.probability),
            Normalizable::Influencer(i) => Ok(i.probability),
            Normalizable::PartitionScore(p) => Ok(p.probability),
        }
    }

    /// Current normalized score. For a bucket this is its anomaly score.
    pub fn normalized_score(&self) -> f64 {
        match self {
            Normalizable::Bucket(b) => b.anomaly_score,
            Normalizable::BucketInfluencer(bi) => bi.anomaly_score,
            Normalizable::Record(r) => r.normalized_probability,
            Normalizable::Influencer(i) => i.anomaly_score,
            Normalizable::PartitionScore(p) => p.anomaly_score,
        }
    }

    pub fn set_normalized_score(&mut self, score: f64) -> Result<(), NormalizableError> {
        let score = clamp_score(score);
        match self {
            Normalizable::Bucket(_) => return Err(self.container_only("normalized score")),
            Normalizable::BucketInfluencer(bi) => bi.anomaly_score = score,
            Normalizable::Record(r) => r.normalized_probability = score,
            Normalizable::Influencer(i) => i.anomaly_score = score,
            Normalizable::PartitionScore(p) => p.anomaly_score = score,
        }
        Ok(())
    }

    /// Child kinds this node aggregates, in merge order.
    pub fn child_types(&self) -> &'static [ChildType] {
        match self {
            Normalizable::Bucket(_) => &ChildType::ALL,
            _ => &[],
        }
    }

    /// All children in merge order. Empty for leaves.
    pub fn children(&mut self) -> Vec<Normalizable<'_>> {
        let Normalizable::Bucket(bucket) = self else {
            return Vec::new();
        };
        let Bucket {
            bucket_influencers,
            records,
            partition_scores,
            ..
        } = &mut **bucket;
        bucket_influencers
            .iter_mut()
            .map(Normalizable::BucketInfluencer)
            .chain(records.iter_mut().map(Normalizable::Record))
            .chain(partition_scores.iter_mut().map(Normalizable::PartitionScore))
            .collect()
    }

    /// Children of one kind.
    pub fn children_of(
        &mut self,
        child_type: ChildType,
    ) -> Result<Vec<Normalizable<'_>>, NormalizableError> {
        let not_a_container = self.not_a_container("children");
        let bucket: &mut Bucket = match self {
            Normalizable::Bucket(bucket) => bucket,
            _ => return Err(not_a_container),
        };
        let children = match child_type {
            ChildType::BucketInfluencer => bucket
                .bucket_influencers
                .iter_mut()
                .map(Normalizable::BucketInfluencer)
                .collect(),
            ChildType::Record => bucket
                .records
                .iter_mut()
                .map(Normalizable::Record)
                .collect(),
            ChildType::PartitionScore => bucket
                .partition_scores
                .iter_mut()
                .map(Normalizable::PartitionScore)
                .collect(),
        };
        Ok(children)
    }

    /// Raise the max-score slot for `child_type` to `score`.
    ///
    /// Returns `true` only when the slot strictly increased.
    pub fn set_max_children_score(
        &mut self,
        child_type: ChildType,
        score: f64,
    ) -> Result<bool, NormalizableError> {
        let not_a_container = self.not_a_container("max children score");
        let bucket: &mut Bucket = match self {
            Normalizable::Bucket(bucket) => bucket,
            _ => return Err(not_a_container),
        };
        let score = clamp_score(score);
        let slot = max_slot(bucket, child_type);
        if score > *slot {
            *slot = score;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Current value of the max-score slot for `child_type`.
    pub fn max_children_score(&self, child_type: ChildType) -> Result<f64, NormalizableError> {
        match self {
            Normalizable::Bucket(bucket) => Ok(match child_type {
                ChildType::BucketInfluencer => bucket.anomaly_score,
                ChildType::Record => bucket.max_normalized_probability,
                ChildType::PartitionScore => bucket.max_partition_score,
            }),
            _ => Err(self.not_a_container("max children score")),
        }
    }

    /// Zero the max-score slot for `child_type`, returning its old value.
    ///
    /// A normalization pass clears a slot before re-raising it from the
    /// children, so the maximum can also go down.
    pub fn clear_max_children_score(
        &mut self,
        child_type: ChildType,
    ) -> Result<f64, NormalizableError> {
        let not_a_container = self.not_a_container("max children score");
        match self {
            Normalizable::Bucket(bucket) => {
                Ok(std::mem::replace(max_slot(bucket, child_type), MIN_SCORE))
            }
            _ => Err(not_a_container),
        }
    }

    /// Propagate the parent's score to this node.
    ///
    /// Records mirror their bucket's anomaly score; other leaves ignore it.
    pub fn set_parent_score(&mut self, score: f64) -> Result<(), NormalizableError> {
        match self {
            Normalizable::Bucket(_) => Err(self.container_only("parent score")),
            Normalizable::Record(r) => {
                r.anomaly_score = clamp_score(score);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn raise_big_change_flag(&mut self) {
        *self.big_change_flag() = true;
    }

    pub fn reset_big_change_flag(&mut self) {
        *self.big_change_flag() = false;
    }

    pub fn has_big_change(&self) -> bool {
        match self {
            Normalizable::Bucket(b) => b.had_big_normalized_update,
            Normalizable::BucketInfluencer(bi) => bi.had_big_normalized_update,
            Normalizable::Record(r) => r.had_big_normalized_update,
            Normalizable::Influencer(i) => i.had_big_normalized_update,
            Normalizable::PartitionScore(p) => p.had_big_normalized_update,
        }
    }

    fn big_change_flag(&mut self) -> &mut bool {
        match self {
            Normalizable::Bucket(b) => &mut b.had_big_normalized_update,
            Normalizable::BucketInfluencer(bi) => &mut bi.had_big_normalized_update,
            Normalizable::Record(r) => &mut r.had_big_normalized_update,
            Normalizable::Influencer(i) => &mut i.had_big_normalized_update,
            Normalizable::PartitionScore(p) => &mut p.had_big_normalized_update,
        }
    }

    fn container_only(&self, operation: &'static str) -> NormalizableError {
        NormalizableError::ContainerOnly {
            kind: self.kind(),
            operation,
        }
    }

    fn not_a_container(&self, operation: &'static str) -> NormalizableError {
        NormalizableError::NotAContainer {
            kind: self.kind(),
            operation,
        }
    }
}

impl<'a> From<&'a mut Bucket> for Normalizable<'a> {
    fn from(bucket: &'a mut Bucket) -> Self {
        Normalizable::Bucket(bucket)
    }
}

impl<'a> From<&'a mut Influencer> for Normalizable<'a> {
    fn from(influencer: &'a mut Influencer) -> Self {
        Normalizable::Influencer(influencer)
    }
}

impl<'a> From<&'a mut AnomalyRecord> for Normalizable<'a> {
    fn from(record: &'a mut AnomalyRecord) -> Self {
        Normalizable::Record(record)
    }
}
