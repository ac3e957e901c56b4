//! Background renormalization driven by quantile updates.
//!
//! The autodetect process periodically emits a new quantiles snapshot. Each
//! snapshot means historical scores may be stale, so they are recomputed on
//! a worker thread. Only the newest snapshot matters: an update that arrives
//! while another is queued replaces it.
//!
//! Flushes wait for the worker to go idle so callers never observe a
//! half-rescaled result tree.

use crate::results::Quantiles;
use ad_common::{Error, JobId, ProcessRunCode, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, instrument, warn};

/// Renormalization-idle predicate consumed by the supervisor.
pub trait RenormalizationStatus: Send + Sync {
    fn is_idle(&self) -> bool;

    /// Block until no update is queued or running.
    fn wait_until_idle(&self);
}

/// Applies one quantiles snapshot to stored results.
pub trait ScoresUpdater: Send {
    fn update(&mut self, quantiles: &Quantiles) -> Result<()>;
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Option<Quantiles>,
    running: bool,
    shutdown: bool,
    completed: u64,
    superseded: u64,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_none() && !self.running
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-worker, coalescing renormalization queue for one job.
pub struct Renormalizer {
    job_id: JobId,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Renormalizer {
    /// Start the worker thread.
    pub fn start(job_id: JobId, updater: Box<dyn ScoresUpdater>) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = {
            let shared = Arc::clone(&shared);
            let job_id = job_id.clone();
            thread::Builder::new()
                .name(format!("renormalizer-{}", job_id))
                .spawn(move || run_worker(&job_id, &shared, updater))
                .map_err(|e| {
                    Error::process_run(
                        ProcessRunCode::StartFailed,
                        "spawning renormalizer thread",
                        &e,
                    )
                })?
        };
        Ok(Self {
            job_id,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a snapshot, replacing any snapshot not yet started.
    pub fn renormalize(&self, quantiles: Quantiles) {
        let mut state = self.shared.lock();
        if state.shutdown {
            warn!(job_id = %self.job_id, "renormalizer shut down; dropping quantiles update");
            return;
        }
        if let Some(previous) = state.pending.replace(quantiles) {
            state.superseded += 1;
            debug!(
                job_id = %self.job_id,
                superseded_timestamp = previous.timestamp,
                "coalesced queued quantiles update"
            );
        }
        self.shared.changed.notify_all();
    }

    /// Number of snapshots applied so far.
    pub fn completed(&self) -> u64 {
        self.shared.lock().completed
    }

    /// Number of snapshots replaced before they ran.
    pub fn superseded(&self) -> u64 {
        self.shared.lock().superseded
    }

    /// Finish any queued work and stop the worker.
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.changed.notify_all();
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(job_id = %self.job_id, "renormalizer worker panicked");
            }
        }
        info!(job_id = %self.job_id, "renormalizer stopped");
    }
}

impl RenormalizationStatus for Renormalizer {
    fn is_idle(&self) -> bool {
        self.shared.lock().is_idle()
    }

    fn wait_until_idle(&self) {
        let mut state = self.shared.lock();
        while !state.is_idle() {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for Renormalizer {
    fn drop(&mut self) {
        let has_worker = self
            .worker
            .lock()
            .map(|w| w.is_some())
            .unwrap_or(false);
        if has_worker {
            self.shutdown();
        }
    }
}

fn run_worker(job_id: &JobId, shared: &Shared, mut updater: Box<dyn ScoresUpdater>) {
    loop {
        let quantiles = {
            let mut state = shared.lock();
            loop {
                if let Some(quantiles) = state.pending.take() {
                    state.running = true;
                    break quantiles;
                }
                if state.shutdown {
                    return;
                }
                state = shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        debug!(job_id = %job_id, timestamp = quantiles.timestamp, "renormalizing");
        let _running = RunningGuard { job_id, shared };
        if let Err(e) = updater.update(&quantiles) {
            warn!(job_id = %job_id, error = %e, "renormalization failed");
        }
    }
}

/// Marks the current update finished, even when the updater panics.
struct RunningGuard<'a> {
    job_id: &'a JobId,
    shared: &'a Shared,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.running = false;
        if thread::panicking() {
            // The worker is gone; nothing queued will ever run.
            warn!(job_id = %self.job_id, "renormalization panicked; stopping worker");
            state.shutdown = true;
            state.pending = None;
        } else {
            state.completed += 1;
        }
        self.shared.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct ChannelUpdater {
        seen: mpsc::Sender<i64>,
        gate: Arc<(Mutex<bool>, Condvar)>,
    }

    impl ScoresUpdater for ChannelUpdater {
        fn update(&mut self, quantiles: &Quantiles) -> Result<()> {
            let (lock, cond) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cond.wait(open).unwrap();
            }
            self.seen.send(quantiles.timestamp).unwrap();
            Ok(())
        }
    }

    fn quantiles(timestamp: i64) -> Quantiles {
        Quantiles {
            timestamp,
            quantile_state: String::new(),
        }
    }

    fn open(gate: &Arc<(Mutex<bool>, Condvar)>) {
        let (lock, cond) = &**gate;
        *lock.lock().unwrap() = true;
        cond.notify_all();
    }

    #[test]
    fn test_idle_when_nothing_queued() {
        let (tx, _rx) = mpsc::channel();
        let gate = Arc::new((Mutex::new(true), Condvar::new()));
        let renormalizer = Renormalizer::start(
            JobId::parse("j1").unwrap(),
            Box::new(ChannelUpdater { seen: tx, gate }),
        )
        .unwrap();
        assert!(renormalizer.is_idle());
        renormalizer.wait_until_idle();
        renormalizer.shutdown();
    }

    #[test]
    fn test_queued_updates_coalesce_to_latest() {
        let (tx, rx) = mpsc::channel();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let renormalizer = Renormalizer::start(
            JobId::parse("j1").unwrap(),
            Box::new(ChannelUpdater {
                seen: tx,
                gate: Arc::clone(&gate),
            }),
        )
        .unwrap();

        renormalizer.renormalize(quantiles(1));
        // Wait for the worker to pick up the first update and block on the gate.
        while renormalizer.shared.lock().pending.is_some() {
            thread::sleep(Duration::from_millis(1));
        }
        renormalizer.renormalize(quantiles(2));
        renormalizer.renormalize(quantiles(3));
        assert!(!renormalizer.is_idle());

        open(&gate);
        renormalizer.wait_until_idle();

        let seen: Vec<i64> = rx.try_iter().collect();
        assert_eq!(seen, vec![1, 3]);
        assert_eq!(renormalizer.completed(), 2);
        assert_eq!(renormalizer.superseded(), 1);
        renormalizer.shutdown();
    }

    #[test]
    fn test_shutdown_drains_pending_update() {
        let (tx, rx) = mpsc::channel();
        let gate = Arc::new((Mutex::new(true), Condvar::new()));
        let renormalizer = Renormalizer::start(
            JobId::parse("j1").unwrap(),
            Box::new(ChannelUpdater { seen: tx, gate }),
        )
        .unwrap();
        renormalizer.renormalize(quantiles(7));
        renormalizer.shutdown();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![7]);

        renormalizer.renormalize(quantiles(8));
        assert!(renormalizer.is_idle());
    }

    struct PanickingUpdater;

    impl ScoresUpdater for PanickingUpdater {
        fn update(&mut self, _quantiles: &Quantiles) -> Result<()> {
            panic!("updater bug");
        }
    }

    #[test]
    fn test_panicking_update_does_not_wedge_idle_waiters() {
        let renormalizer =
            Renormalizer::start(JobId::parse("j1").unwrap(), Box::new(PanickingUpdater)).unwrap();
        renormalizer.renormalize(quantiles(300));
        renormalizer.wait_until_idle();
        assert!(renormalizer.is_idle());
        assert_eq!(renormalizer.completed(), 0);

        // Later updates are dropped rather than left pending forever.
        renormalizer.renormalize(quantiles(600));
        assert!(renormalizer.is_idle());
        renormalizer.shutdown();
    }
}
