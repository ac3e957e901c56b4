//! Consumer for the autodetect process's output stream.
//!
//! The native process writes one JSON document per line:
//!
//! ```text
//! {"bucket": {...}}
//! {"influencers": [...]}
//! {"quantiles": {"timestamp": 1400000000, "quantileState": "..."}}
//! {"flush": {"id": "3"}}
//! ```
//!
//! Buckets and influencers go to a [`ResultsPersister`], quantiles also feed
//! the renormalizer, and flush acknowledgements release waiters blocked in
//! [`ResultTracker::wait_for_flush`].

use crate::renormalize::Renormalizer;
use crate::results::{Bucket, Influencer, Quantiles};
use ad_common::{Error, FlushId, JobId, ProcessRunCode, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Outcome of one bounded wait for a flush acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushWait {
    /// The native process echoed the flush id.
    Acknowledged,
    /// Not yet acknowledged; the caller should re-check liveness and retry.
    Pending,
    /// The output stream ended, so the acknowledgement can never arrive.
    Aborted,
}

/// Tracks flush acknowledgements and completion of the output consumer.
pub trait ResultTracker: Send + Sync {
    /// Block for at most `timeout` waiting for `flush_id`.
    fn wait_for_flush(&self, flush_id: FlushId, timeout: Duration) -> FlushWait;

    /// Forget an acknowledged flush id.
    fn clear_flush(&self, flush_id: FlushId);

    /// Block until the output stream has been fully consumed.
    fn await_completion(&self) -> Result<()>;
}

/// Sink for parsed results.
pub trait ResultsPersister: Send + Sync {
    fn persist_bucket(&self, job_id: &JobId, bucket: &Bucket) -> Result<()>;

    fn persist_influencers(&self, job_id: &JobId, influencers: &[Influencer]) -> Result<()>;

    fn persist_quantiles(&self, job_id: &JobId, quantiles: &Quantiles) -> Result<()>;
}

#[derive(Debug, Default)]
struct AckState {
    acknowledged: HashSet<FlushId>,
    aborted: bool,
}

/// Condition-variable backed flush acknowledgement table.
#[derive(Debug, Default)]
pub struct FlushAcknowledger {
    state: Mutex<AckState>,
    changed: Condvar,
}

impl FlushAcknowledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `flush_id` has been acknowledged and wake waiters.
    pub fn acknowledge(&self, flush_id: FlushId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.acknowledged.insert(flush_id);
        self.changed.notify_all();
    }

    /// Fail all current and future waits for unacknowledged ids.
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.aborted = true;
        self.changed.notify_all();
    }

    pub fn wait(&self, flush_id: FlushId, timeout: Duration) -> FlushWait {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.acknowledged.contains(&flush_id) {
                return FlushWait::Acknowledged;
            }
            if state.aborted {
                return FlushWait::Aborted;
            }
            let now = Instant::now();
            if now >= deadline {
                return FlushWait::Pending;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    pub fn clear(&self, flush_id: FlushId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.acknowledged.remove(&flush_id);
    }
}

/// Counters reported when the output stream ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub buckets: u64,
    pub influencers: u64,
    pub quantiles: u64,
    pub flush_acknowledgements: u64,
    pub skipped_lines: u64,
    pub persist_failures: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum AutodetectOutput {
    Bucket(Bucket),
    Influencers(Vec<Influencer>),
    Quantiles(Quantiles),
    Flush(FlushAcknowledgement),
}

#[derive(Debug, Deserialize)]
struct FlushAcknowledgement {
    id: serde_json::Value,
}

/// Reads the autodetect output stream on a dedicated thread.
pub struct ResultProcessor {
    job_id: JobId,
    acknowledger: Arc<FlushAcknowledger>,
    worker: Mutex<Option<JoinHandle<ProcessorStats>>>,
    stats: Mutex<Option<ProcessorStats>>,
}

impl ResultProcessor {
    /// Start consuming `output`.
    pub fn start<R>(
        job_id: JobId,
        output: R,
        persister: Arc<dyn ResultsPersister>,
        renormalizer: Option<Arc<Renormalizer>>,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let acknowledger = Arc::new(FlushAcknowledger::new());
        let worker = {
            let job_id = job_id.clone();
            let acknowledger = Arc::clone(&acknowledger);
            thread::Builder::new()
                .name(format!("results-{}", job_id))
                .spawn(move || {
                    let stats = consume(
                        &job_id,
                        BufReader::new(output),
                        persister.as_ref(),
                        renormalizer.as_deref(),
                        &acknowledger,
                    );
                    acknowledger.abort();
                    stats
                })
                .map_err(|e| {
                    Error::process_run(
                        ProcessRunCode::StreamOpenFailed,
                        "spawning result reader thread",
                        &e,
                    )
                })?
        };

        Ok(Self {
            job_id,
            acknowledger,
            worker: Mutex::new(Some(worker)),
            stats: Mutex::new(None),
        })
    }

    /// Counters, available once the stream has ended and been awaited.
    pub fn stats(&self) -> Option<ProcessorStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ResultTracker for ResultProcessor {
    fn wait_for_flush(&self, flush_id: FlushId, timeout: Duration) -> FlushWait {
        self.acknowledger.wait(flush_id, timeout)
    }

    fn clear_flush(&self, flush_id: FlushId) {
        self.acknowledger.clear(flush_id);
    }

    fn await_completion(&self) -> Result<()> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let stats = handle.join().map_err(|_| Error::NativeProcessRun {
            code: ProcessRunCode::ReadFailed,
            message: format!("result reader for job {} panicked", self.job_id),
        })?;
        info!(
            job_id = %self.job_id,
            buckets = stats.buckets,
            quantiles = stats.quantiles,
            flushes = stats.flush_acknowledgements,
            skipped = stats.skipped_lines,
            "result processing complete"
        );
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = Some(stats);
        Ok(())
    }
}

fn consume<R: BufRead>(
    job_id: &JobId,
    input: R,
    persister: &dyn ResultsPersister,
    renormalizer: Option<&Renormalizer>,
    acknowledger: &FlushAcknowledger,
) -> ProcessorStats {
    let mut stats = ProcessorStats::default();

    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "failed reading autodetect output");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let output = match serde_json::from_str::<AutodetectOutput>(trimmed) {
            Ok(output) => output,
            Err(e) => {
                stats.skipped_lines += 1;
                warn!(job_id = %job_id, error = %e, "unparseable autodetect output line; skipping");
                continue;
            }
        };

        match output {
            AutodetectOutput::Bucket(bucket) => {
                stats.buckets += 1;
                trace!(job_id = %job_id, timestamp = bucket.timestamp, "bucket");
                if let Err(e) = persister.persist_bucket(job_id, &bucket) {
                    stats.persist_failures += 1;
                    warn!(job_id = %job_id, error = %e, "failed to persist bucket");
                }
            }
            AutodetectOutput::Influencers(influencers) => {
                stats.influencers += influencers.len() as u64;
                if let Err(e) = persister.persist_influencers(job_id, &influencers) {
                    stats.persist_failures += 1;
                    warn!(job_id = %job_id, error = %e, "failed to persist influencers");
                }
            }
            AutodetectOutput::Quantiles(quantiles) => {
                stats.quantiles += 1;
                debug!(job_id = %job_id, timestamp = quantiles.timestamp, "quantiles update");
                if let Err(e) = persister.persist_quantiles(job_id, &quantiles) {
                    stats.persist_failures += 1;
                    warn!(job_id = %job_id, error = %e, "failed to persist quantiles");
                }
                if let Some(renormalizer) = renormalizer {
                    renormalizer.renormalize(quantiles);
                }
            }
            AutodetectOutput::Flush(ack) => {
                let raw = match &ack.id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                match FlushId::parse(&raw) {
                    Some(flush_id) => {
                        stats.flush_acknowledgements += 1;
                        debug!(job_id = %job_id, flush_id = %flush_id, "flush acknowledged");
                        acknowledger.acknowledge(flush_id);
                    }
                    None => {
                        stats.skipped_lines += 1;
                        warn!(job_id = %job_id, id = %raw, "invalid flush id in acknowledgement");
                    }
                }
            }
        }
    }

    stats
}
