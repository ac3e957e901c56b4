//! Per-job supervisor for the native analysis process.
//!
//! Every operation that touches the process runs under a single-slot
//! in-use token:
//!
//! - writes and control messages try to take the token and fail with
//!   [`Error::JobBusy`] if another operation holds it, never queueing;
//! - `close` waits for the holder to finish, then takes the token.
//!
//! Liveness is checked right after the token is taken and again after every
//! blocking wait, so a process that died in between is reported with its
//! captured stderr rather than as a pipe error.

use crate::process::control::{ControlMsgWriter, DataLoadParams, FlushParams, ModelDebugConfig};
use crate::process::counts::DataCounts;
use crate::process::native::AnalysisProcess;
use crate::process::writer::{DataDescription, DataWriter};
use crate::renormalize::RenormalizationStatus;
use crate::results::{FlushWait, ResultTracker};
use ad_common::{Error, JobId, ProcessRunCode, Result};
use chrono::{DateTime, Utc};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// Default interval between flush acknowledgement polls.
pub const DEFAULT_FLUSH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Called once when the job's process has been closed.
///
/// Receives the error that ended the job, if any.
pub type CompletionHandler = Box<dyn FnOnce(Option<&Error>) + Send>;

/// Single-slot mutual exclusion token.
///
/// Holds the name of the operation currently in flight.
#[derive(Debug, Default)]
pub struct InUseToken {
    holder: Mutex<Option<&'static str>>,
    released: Condvar,
}

/// Releases the token on drop.
#[derive(Debug)]
pub struct InUseGuard<'a> {
    token: &'a InUseToken,
}

/// A blocking acquire was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireInterrupted;

impl InUseToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the token if it is free.
    pub fn try_acquire(&self, operation: &'static str) -> Option<InUseGuard<'_>> {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if holder.is_some() {
            return None;
        }
        *holder = Some(operation);
        Some(InUseGuard { token: self })
    }

    /// Wait for the token to be released, then take it.
    pub fn acquire(
        &self,
        operation: &'static str,
    ) -> std::result::Result<InUseGuard<'_>, AcquireInterrupted> {
        let mut holder = self.holder.lock().map_err(|_| AcquireInterrupted)?;
        while let Some(current) = *holder {
            trace!(waiting = operation, holder = current, "waiting for in-use token");
            holder = self.released.wait(holder).map_err(|_| AcquireInterrupted)?;
        }
        *holder = Some(operation);
        Ok(InUseGuard { token: self })
    }

    /// Operation currently holding the token.
    pub fn holder(&self) -> Option<&'static str> {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for InUseGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self
            .token
            .holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *holder = None;
        self.token.released.notify_all();
    }
}

/// Renormalization status for jobs without a renormalizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysIdle;

impl RenormalizationStatus for AlwaysIdle {
    fn is_idle(&self) -> bool {
        true
    }

    fn wait_until_idle(&self) {}
}

struct ProcessInner {
    process: Box<dyn AnalysisProcess>,
    data_writer: DataWriter,
    control: ControlMsgWriter,
}

/// Builder for [`ProcessSupervisor`].
pub struct ProcessSupervisorBuilder {
    job_id: JobId,
    process: Box<dyn AnalysisProcess>,
    description: DataDescription,
    tracker: Arc<dyn ResultTracker>,
    renormalization: Arc<dyn RenormalizationStatus>,
    flush_poll_interval: Duration,
    on_completion: Option<CompletionHandler>,
}

impl ProcessSupervisorBuilder {
    pub fn renormalization(mut self, status: Arc<dyn RenormalizationStatus>) -> Self {
        self.renormalization = status;
        self
    }

    pub fn flush_poll_interval(mut self, interval: Duration) -> Self {
        self.flush_poll_interval = interval;
        self
    }

    pub fn on_completion(mut self, handler: CompletionHandler) -> Self {
        self.on_completion = Some(handler);
        self
    }

    /// Write the header record and return the running supervisor.
    pub fn start(self) -> Result<ProcessSupervisor> {
        let mut process = self.process;
        let data_writer = DataWriter::new(self.description);
        let control = ControlMsgWriter::new(data_writer.description().num_fields());
        data_writer.write_header(process.as_mut())?;
        let start_time = process.start_time();

        info!(
            job_id = %self.job_id,
            pid = ?process.pid(),
            fields = data_writer.description().num_fields(),
            "job process supervised"
        );

        Ok(ProcessSupervisor {
            job_id: self.job_id,
            in_use: InUseToken::new(),
            inner: Mutex::new(ProcessInner {
                process,
                data_writer,
                control,
            }),
            counts: Mutex::new(DataCounts::default()),
            tracker: self.tracker,
            renormalization: self.renormalization,
            flush_poll_interval: self.flush_poll_interval,
            start_time,
            closed: AtomicBool::new(false),
            on_completion: Mutex::new(self.on_completion),
        })
    }
}

/// Owns one job's native process and serializes access to it.
pub struct ProcessSupervisor {
    job_id: JobId,
    in_use: InUseToken,
    inner: Mutex<ProcessInner>,
    counts: Mutex<DataCounts>,
    tracker: Arc<dyn ResultTracker>,
    renormalization: Arc<dyn RenormalizationStatus>,
    flush_poll_interval: Duration,
    start_time: DateTime<Utc>,
    closed: AtomicBool,
    on_completion: Mutex<Option<CompletionHandler>>,
}

impl ProcessSupervisor {
    pub fn builder(
        job_id: JobId,
        process: Box<dyn AnalysisProcess>,
        description: DataDescription,
        tracker: Arc<dyn ResultTracker>,
    ) -> ProcessSupervisorBuilder {
        ProcessSupervisorBuilder {
            job_id,
            process,
            description,
            tracker,
            renormalization: Arc::new(AlwaysIdle),
            flush_poll_interval: DEFAULT_FLUSH_POLL_INTERVAL,
            on_completion: None,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn process_start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Snapshot of the running totals.
    pub fn data_counts(&self) -> DataCounts {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Name of the operation in flight, if any.
    pub fn active_operation(&self) -> Option<&'static str> {
        self.in_use.holder()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stream an upload to the process.
    ///
    /// Returns the counts for this upload; totals are in
    /// [`data_counts`](Self::data_counts).
    #[instrument(skip(self, input, params), fields(job_id = %self.job_id))]
    pub fn write_to_job<R: BufRead>(&self, input: R, params: &DataLoadParams) -> Result<DataCounts> {
        self.run_exclusive("write", |inner| {
            if let Some(range) = &params.reset_buckets {
                inner
                    .control
                    .write_reset_buckets(inner.process.as_mut(), range)
                    .map_err(|e| {
                        Error::process_run(ProcessRunCode::WriteFailed, "writing reset buckets", &e)
                    })?;
            }

            let mut counts = DataCounts::default();
            let written = inner
                .data_writer
                .write_into(inner.process.as_mut(), input, &mut counts);
            // Records already handed to the process count even if the upload fails.
            self.counts
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .merge(&counts);
            if let Err(e) = written {
                self.check_alive(inner.process.as_mut())?;
                return Err(e);
            }
            Ok(counts)
        })
    }

    /// Flush the process and wait until its results have been consumed.
    #[instrument(skip(self, params), fields(job_id = %self.job_id))]
    pub fn flush_job(&self, params: &FlushParams) -> Result<()> {
        self.run_exclusive("flush", |inner| {
            let flush_id = inner
                .control
                .write_flush(inner.process.as_mut(), params)
                .map_err(|e| {
                    Error::process_run(ProcessRunCode::WriteFailed, "writing flush", &e)
                })?;

            loop {
                match self.tracker.wait_for_flush(flush_id, self.flush_poll_interval) {
                    FlushWait::Acknowledged => break,
                    FlushWait::Pending => {
                        self.check_alive(inner.process.as_mut())?;
                        trace!(flush_id = %flush_id, "flush not yet acknowledged");
                    }
                    FlushWait::Aborted => {
                        self.check_alive(inner.process.as_mut())?;
                        warn!(flush_id = %flush_id, "result stream ended before flush acknowledgement");
                        return Err(self.interrupted("flush"));
                    }
                }
            }

            self.tracker.clear_flush(flush_id);
            self.renormalization.wait_until_idle();
            debug!(flush_id = %flush_id, "flush complete");
            Ok(())
        })
    }

    #[instrument(skip(self, config), fields(job_id = %self.job_id))]
    pub fn write_update_model_debug_message(&self, config: &ModelDebugConfig) -> Result<()> {
        self.run_exclusive("update model debug", |inner| {
            inner
                .control
                .write_update_model_debug(inner.process.as_mut(), config)
                .map_err(|e| {
                    Error::process_run(ProcessRunCode::WriteFailed, "writing model debug update", &e)
                })
        })
    }

    #[instrument(skip(self, rules_json), fields(job_id = %self.job_id))]
    pub fn write_update_detector_rules_message(
        &self,
        detector_index: usize,
        rules_json: &str,
    ) -> Result<()> {
        self.run_exclusive("update detector rules", |inner| {
            inner
                .control
                .write_update_detector_rules(inner.process.as_mut(), detector_index, rules_json)
                .map_err(|e| {
                    Error::process_run(ProcessRunCode::WriteFailed, "writing detector rules update", &e)
                })
        })
    }

    /// Close the process once any in-flight operation has finished.
    ///
    /// Waits for the result consumer to drain, then runs the completion
    /// handler. Closing an already closed job is a no-op.
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub fn close(&self) -> Result<()> {
        let _guard = self
            .in_use
            .acquire("close")
            .map_err(|_| self.interrupted("close"))?;
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("job already closed");
            return Ok(());
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let liveness = self.check_alive(inner.process.as_mut());

        let counts = self.data_counts();
        info!(
            processed_records = counts.processed_record_count,
            input_bytes = counts.input_bytes,
            skipped_records = counts.skipped_record_count(),
            "final data counts"
        );

        let stopped = if liveness.is_ok() {
            inner.process.close().map_err(|e| {
                Error::process_run(ProcessRunCode::ProcessFailed, "closing process", &e)
            })
        } else {
            inner.process.kill().map_err(|e| {
                Error::process_run(ProcessRunCode::ProcessFailed, "killing process", &e)
            })
        };
        drop(inner);

        let completed = self.tracker.await_completion();
        let outcome = liveness.and(stopped).and(completed);
        match &outcome {
            Ok(()) => info!("job closed"),
            Err(e) => error!(error = %e, "job closed with error"),
        }
        self.notify_completion(outcome.as_ref().err());
        outcome
    }

    fn run_exclusive<T>(
        &self,
        operation: &'static str,
        op: impl FnOnce(&mut ProcessInner) -> Result<T>,
    ) -> Result<T> {
        let Some(_guard) = self.in_use.try_acquire(operation) else {
            warn!(
                job_id = %self.job_id,
                operation,
                holder = ?self.in_use.holder(),
                "job busy; rejecting operation"
            );
            return Err(Error::JobBusy {
                job_id: self.job_id.to_string(),
                operation: operation.to_string(),
            });
        };
        if self.is_closed() {
            return Err(Error::JobNotFound {
                job_id: self.job_id.to_string(),
            });
        }
        let mut inner = self.lock_inner(operation)?;
        self.check_alive(inner.process.as_mut())?;
        op(&mut inner)
    }

    fn lock_inner(&self, operation: &'static str) -> Result<MutexGuard<'_, ProcessInner>> {
        self.inner.lock().map_err(|_| {
            error!(job_id = %self.job_id, operation, "process state poisoned by an earlier panic");
            self.interrupted(operation)
        })
    }

    fn check_alive(&self, process: &mut dyn AnalysisProcess) -> Result<()> {
        if process.is_alive() {
            return Ok(());
        }
        let stderr = process.read_error();
        error!(job_id = %self.job_id, stderr = %stderr, "native process has died");
        Err(Error::ProcessDead {
            job_id: self.job_id.to_string(),
            stderr,
        })
    }

    fn interrupted(&self, operation: &str) -> Error {
        Error::Interrupted {
            job_id: self.job_id.to_string(),
            operation: operation.to_string(),
        }
    }

    fn notify_completion(&self, error: Option<&Error>) {
        let handler = self
            .on_completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handler) = handler {
            handler(error);
        }
    }
}
