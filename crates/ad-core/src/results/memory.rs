//! In-process results store.
//!
//! Backs the CLI `run` command: buckets persisted by the result processor
//! are kept per job and handed back to the renormalizer on the next
//! quantiles update.

use crate::normalize::BucketProvider;
use crate::orchestrator::RawScoreProvider;
use crate::results::{Bucket, Influencer, Quantiles, ResultsPersister, BUCKET_TIME_INFLUENCER};
use ad_common::{JobId, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct JobResults {
    buckets: BTreeMap<i64, Bucket>,
    influencers: Vec<Influencer>,
    quantiles: Option<Quantiles>,
    bucket_writes: u64,
}

/// Shared in-memory store. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryResultsStore {
    jobs: Arc<Mutex<HashMap<JobId, JobResults>>>,
}

impl MemoryResultsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobResults>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buckets for a job, ordered by timestamp.
    pub fn buckets_for(&self, job_id: &JobId) -> Vec<Bucket> {
        self.lock()
            .get(job_id)
            .map(|job| job.buckets.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn influencers_for(&self, job_id: &JobId) -> Vec<Influencer> {
        self.lock()
            .get(job_id)
            .map(|job| job.influencers.clone())
            .unwrap_or_default()
    }

    pub fn latest_quantiles(&self, job_id: &JobId) -> Option<Quantiles> {
        self.lock().get(job_id).and_then(|job| job.quantiles.clone())
    }

    /// Total bucket writes, including rewrites after renormalization.
    pub fn bucket_writes(&self, job_id: &JobId) -> u64 {
        self.lock().get(job_id).map_or(0, |job| job.bucket_writes)
    }
}

impl ResultsPersister for MemoryResultsStore {
    fn persist_bucket(&self, job_id: &JobId, bucket: &Bucket) -> Result<()> {
        let mut jobs = self.lock();
        let job = jobs.entry(job_id.clone()).or_default();
        job.buckets.insert(bucket.timestamp, bucket.clone());
        job.bucket_writes += 1;
        Ok(())
    }

    fn persist_influencers(&self, job_id: &JobId, influencers: &[Influencer]) -> Result<()> {
        self.lock()
            .entry(job_id.clone())
            .or_default()
            .influencers
            .extend_from_slice(influencers);
        Ok(())
    }

    fn persist_quantiles(&self, job_id: &JobId, quantiles: &Quantiles) -> Result<()> {
        self.lock().entry(job_id.clone()).or_default().quantiles = Some(quantiles.clone());
        Ok(())
    }
}

impl BucketProvider for MemoryResultsStore {
    fn buckets(&self, job_id: &JobId, end_epoch: i64) -> Result<Vec<Bucket>> {
        Ok(self
            .lock()
            .get(job_id)
            .map(|job| job.buckets.range(..=end_epoch).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }
}

impl RawScoreProvider for MemoryResultsStore {
    /// Each bucket's raw score comes from its `bucket_time` influencer.
    fn raw_scores(&self, job_id: &JobId) -> Result<Vec<(i64, f64)>> {
        Ok(self
            .buckets_for(job_id)
            .iter()
            .filter_map(|bucket| {
                bucket
                    .bucket_influencers
                    .iter()
                    .find(|bi| bi.influencer_field_name == BUCKET_TIME_INFLUENCER)
                    .map(|bi| (bucket.timestamp, bi.raw_anomaly_score))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::BucketInfluencer;

    fn job() -> JobId {
        JobId::parse("farequote").unwrap()
    }

    fn bucket(timestamp: i64, raw: f64) -> Bucket {
        Bucket {
            timestamp,
            bucket_influencers: vec![BucketInfluencer {
                influencer_field_name: BUCKET_TIME_INFLUENCER.into(),
                raw_anomaly_score: raw,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_rewrite_replaces_bucket() {
        let store = MemoryResultsStore::new();
        store.persist_bucket(&job(), &bucket(300, 1.0)).unwrap();
        store.persist_bucket(&job(), &bucket(300, 2.0)).unwrap();
        assert_eq!(store.buckets_for(&job()).len(), 1);
        assert_eq!(store.bucket_writes(&job()), 2);
    }

    #[test]
    fn test_provider_respects_end_epoch() {
        let store = MemoryResultsStore::new();
        for t in [0, 300, 600] {
            store.persist_bucket(&job(), &bucket(t, t as f64)).unwrap();
        }
        let shared = store.clone();
        let buckets = shared.buckets(&job(), 300).unwrap();
        assert_eq!(buckets.iter().map(|b| b.timestamp).collect::<Vec<_>>(), vec![0, 300]);
        assert_eq!(
            store.raw_scores(&job()).unwrap(),
            vec![(0, 0.0), (300, 300.0), (600, 600.0)]
        );
        assert!(store.buckets(&JobId::parse("other").unwrap(), 1000).unwrap().is_empty());
    }

    #[test]
    fn test_latest_quantiles_kept() {
        let store = MemoryResultsStore::new();
        assert!(store.latest_quantiles(&job()).is_none());
        store
            .persist_quantiles(
                &job(),
                &Quantiles {
                    timestamp: 600,
                    quantile_state: "state".into(),
                },
            )
            .unwrap();
        assert_eq!(store.latest_quantiles(&job()).unwrap().timestamp, 600);
    }
}
