//! Normalization pass over result trees.
//!
//! A pass flattens the trees depth-first into one helper row per leaf, runs
//! the normalizer helper over the rows, and merges the returned scores back:
//!
//! 1. each leaf takes its new score (clamped to 0..=100) and raises its
//!    big-change flag if the rounded score moved,
//! 2. each leaf receives its parent's score,
//! 3. each container resets its per-slot maxima to its children's maxima.
//!
//! Rows come back in the order they were written, so the merge walks the
//! trees in the same order it flattened them.

use crate::codec::NormalizedResult;
use crate::normalize::initial_state::{format_decimal, InitialState};
use crate::normalize::{clamp_score, Normalizable};
use crate::orchestrator::NormalizerOrchestrator;
use crate::renormalize::ScoresUpdater;
use crate::results::{Bucket, Quantiles, ResultsPersister};
use ad_common::{Error, JobId, ProcessRunCode, Result};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Columns of a normalization pass row.
pub const NORMALIZER_ROW_HEADER: [&str; 7] = [
    "level",
    "partitionFieldName",
    "partitionFieldValue",
    "personFieldName",
    "functionName",
    "valueFieldName",
    "probability",
];

/// Runs normalization passes through an orchestrator.
pub struct Normalizer<'o> {
    orchestrator: &'o NormalizerOrchestrator,
}

impl<'o> Normalizer<'o> {
    pub fn new(orchestrator: &'o NormalizerOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Normalize `roots` in place.
    ///
    /// Returns, per root, whether any node in its tree had a big change or
    /// any container maximum moved.
    #[instrument(skip_all, fields(job_id = %self.orchestrator.job_id(), roots = roots.len()))]
    pub fn normalize(
        &self,
        bucket_span: u64,
        roots: &mut [Normalizable<'_>],
        quantiles_state: &str,
    ) -> Result<Vec<bool>> {
        let mut rows = Vec::new();
        for root in roots.iter_mut() {
            collect_rows(root, &mut rows)?;
        }
        if rows.is_empty() {
            debug!("no leaves to normalize");
            return Ok(vec![false; roots.len()]);
        }

        let expected = rows.len();
        let state = InitialState::from_rows(&NORMALIZER_ROW_HEADER, rows);
        let results = self
            .orchestrator
            .normalize(&state, Some(quantiles_state), Some(bucket_span))?;
        if results.len() != expected {
            return Err(Error::NativeProcessRun {
                code: ProcessRunCode::UnexpectedResultCount,
                message: format!(
                    "normalizer returned {} results for {} rows",
                    results.len(),
                    expected
                ),
            });
        }

        let mut scores = results.iter();
        let changed = roots
            .iter_mut()
            .map(|root| merge(&mut scores, None, root))
            .collect::<Result<Vec<bool>>>()?;
        debug!(
            changed = changed.iter().filter(|c| **c).count(),
            "normalization pass merged"
        );
        Ok(changed)
    }
}

/// Append one row per non-container node, depth-first.
pub fn collect_rows(node: &mut Normalizable<'_>, rows: &mut Vec<Vec<String>>) -> Result<()> {
    if !node.is_container_only() {
        rows.push(row_for(node)?);
    }
    for mut child in node.children() {
        collect_rows(&mut child, rows)?;
    }
    Ok(())
}

fn row_for(node: &Normalizable<'_>) -> Result<Vec<String>> {
    let text = |value: Option<&str>| value.unwrap_or_default().to_string();
    Ok(vec![
        node.level().key().to_string(),
        text(node.partition_field_name()),
        text(node.partition_field_value()),
        text(node.person_field_name()),
        text(node.function_name()),
        text(node.value_field_name()),
        format_decimal(node.probability()?),
    ])
}

fn merge<'r, I>(
    scores: &mut I,
    parent_score: Option<f64>,
    node: &mut Normalizable<'_>,
) -> Result<bool>
where
    I: Iterator<Item = &'r NormalizedResult>,
{
    let mut changed = false;

    if !node.is_container_only() {
        let result = scores.next().ok_or_else(|| Error::NativeProcessRun {
            code: ProcessRunCode::UnexpectedResultCount,
            message: "normalizer returned fewer results than rows".to_string(),
        })?;
        let old_score = node.normalized_score();
        let new_score = clamp_score(result.normalized_score);
        node.set_normalized_score(new_score)?;
        if is_big_change(old_score, new_score) {
            node.raise_big_change_flag();
            changed = true;
        }
        if let Some(parent_score) = parent_score {
            node.set_parent_score(parent_score)?;
        }
    }

    for &child_type in node.child_types() {
        // Records mirror the bucket score, which earlier slots may have raised.
        let parent = node.normalized_score();
        let mut max_score = None::<f64>;
        for mut child in node.children_of(child_type)? {
            changed |= merge(scores, Some(parent), &mut child)?;
            let score = child.normalized_score();
            max_score = Some(max_score.map_or(score, |m| m.max(score)));
        }
        if let Some(max_score) = max_score {
            let previous = node.clear_max_children_score(child_type)?;
            node.set_max_children_score(child_type, max_score)?;
            changed |= node.max_children_score(child_type)? != previous;
        }
    }

    Ok(changed)
}

/// A change is big when the rounded score moves.
fn is_big_change(old_score: f64, new_score: f64) -> bool {
    old_score.round() != new_score.round()
}

/// Reset big-change flags on a whole tree.
pub fn reset_big_change_flags(node: &mut Normalizable<'_>) {
    node.reset_big_change_flag();
    for mut child in node.children() {
        reset_big_change_flags(&mut child);
    }
}

/// Source of buckets affected by a quantiles update.
pub trait BucketProvider: Send {
    /// Buckets up to and including `end_epoch`, with their children loaded.
    fn buckets(&self, job_id: &JobId, end_epoch: i64) -> Result<Vec<Bucket>>;
}

/// Renormalizes stored buckets when quantiles change.
pub struct BucketScoresUpdater {
    orchestrator: NormalizerOrchestrator,
    bucket_span: u64,
    provider: Box<dyn BucketProvider>,
    persister: Arc<dyn ResultsPersister>,
}

impl BucketScoresUpdater {
    pub fn new(
        orchestrator: NormalizerOrchestrator,
        bucket_span: u64,
        provider: Box<dyn BucketProvider>,
        persister: Arc<dyn ResultsPersister>,
    ) -> Self {
        Self {
            orchestrator,
            bucket_span,
            provider,
            persister,
        }
    }

    /// Normalize `buckets` and persist the ones that changed.
    ///
    /// Returns the number of buckets persisted.
    pub fn update_buckets(&self, buckets: &mut [Bucket], quantiles_state: &str) -> Result<usize> {
        let job_id = self.orchestrator.job_id();
        let changed = {
            let mut roots: Vec<Normalizable<'_>> =
                buckets.iter_mut().map(Normalizable::Bucket).collect();
            Normalizer::new(&self.orchestrator).normalize(
                self.bucket_span,
                &mut roots,
                quantiles_state,
            )?
        };

        let mut persisted = 0;
        for (bucket, changed) in buckets.iter_mut().zip(changed) {
            if !changed {
                continue;
            }
            self.persister.persist_bucket(job_id, bucket)?;
            persisted += 1;
            reset_big_change_flags(&mut Normalizable::Bucket(bucket));
        }
        Ok(persisted)
    }
}

impl ScoresUpdater for BucketScoresUpdater {
    fn update(&mut self, quantiles: &Quantiles) -> Result<()> {
        let job_id = self.orchestrator.job_id().clone();
        let mut buckets = self.provider.buckets(&job_id, quantiles.timestamp)?;
        let total = buckets.len();
        let persisted = self.update_buckets(&mut buckets, &quantiles.quantile_state)?;
        info!(
            job_id = %job_id,
            buckets = total,
            persisted,
            "renormalized buckets"
        );
        Ok(())
    }
}
