//! One-shot normalizer helper runs.
//!
//! Each run spawns a helper process, drains its output on a reader thread,
//! writes the [`InitialState`] to its input on the calling thread, closes the
//! input to signal end-of-data and collects the ordered results.

use crate::codec::{spawn_result_reader, LengthEncodedWriter, NormalizedResult};
use crate::normalize::InitialState;
use crate::process::command::ProcessCommand;
use crate::process::native::{capture_stderr, StderrTail};
use ad_common::{Error, JobId, ProcessRunCode, Result};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Bytes of helper stderr kept for error messages.
const HELPER_STDERR_TAIL_BYTES: usize = 4096;

/// Ordered raw-score snapshot for a job.
pub trait RawScoreProvider {
    /// `(epoch, score)` pairs ordered by epoch.
    fn raw_scores(&self, job_id: &JobId) -> Result<Vec<(i64, f64)>>;
}

/// A spawned normalizer helper.
pub trait NormalizerProcess: Send {
    /// Hand out the input and output streams. Called once per process.
    fn take_streams(&mut self) -> Result<(Box<dyn Write + Send>, Box<dyn Read + Send>)>;

    /// Wait for the helper to exit.
    fn wait(self: Box<Self>) -> Result<()>;
}

/// Creates normalizer helpers.
pub trait NormalizerProcessFactory: Send + Sync {
    fn create(
        &self,
        job_id: &JobId,
        quantiles_state: Option<&str>,
        bucket_span: Option<u64>,
    ) -> Result<Box<dyn NormalizerProcess>>;
}

/// Factory for the native normalizer program.
#[derive(Debug, Clone)]
pub struct NativeNormalizerFactory {
    program: PathBuf,
    args: Vec<String>,
}

impl NativeNormalizerFactory {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl NormalizerProcessFactory for NativeNormalizerFactory {
    fn create(
        &self,
        job_id: &JobId,
        quantiles_state: Option<&str>,
        bucket_span: Option<u64>,
    ) -> Result<Box<dyn NormalizerProcess>> {
        let mut command = ProcessCommand::new(&self.program)
            .args(self.args.iter().cloned())
            .job_id(job_id)
            .length_encoded_input();
        if let Some(span) = bucket_span {
            command = command.bucket_span(span);
        }
        if let Some(state) = quantiles_state {
            command = command.quantiles_state(state).map_err(|e| {
                Error::process_run(
                    ProcessRunCode::StartFailed,
                    "writing quantiles state file",
                    &e,
                )
            })?;
        }

        let mut child = command.to_command().spawn().map_err(|e| {
            Error::process_run(
                ProcessRunCode::StartFailed,
                &format!("spawning normalizer {}", self.program.display()),
                &e,
            )
        })?;
        debug!(job_id = %job_id, pid = child.id(), "normalizer helper started");

        let stderr_tail = Arc::new(StderrTail::new(HELPER_STDERR_TAIL_BYTES));
        let stderr_thread = match child.stderr.take() {
            Some(stderr) => Some(
                capture_stderr(job_id.clone(), stderr, Arc::clone(&stderr_tail)).map_err(|e| {
                    Error::process_run(ProcessRunCode::StreamOpenFailed, "capturing stderr", &e)
                })?,
            ),
            None => None,
        };

        Ok(Box::new(NativeNormalizerProcess {
            job_id: job_id.clone(),
            child,
            stderr_tail,
            stderr_thread,
            _command: command,
        }))
    }
}

struct NativeNormalizerProcess {
    job_id: JobId,
    child: Child,
    stderr_tail: Arc<StderrTail>,
    stderr_thread: Option<JoinHandle<()>>,
    // Keeps the quantiles state file alive until the helper exits.
    _command: ProcessCommand,
}

impl NormalizerProcess for NativeNormalizerProcess {
    fn take_streams(&mut self) -> Result<(Box<dyn Write + Send>, Box<dyn Read + Send>)> {
        match (self.child.stdin.take(), self.child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok((Box::new(stdin), Box::new(stdout))),
            _ => Err(Error::NativeProcessRun {
                code: ProcessRunCode::StreamOpenFailed,
                message: format!("normalizer for job {} has no stdio pipes", self.job_id),
            }),
        }
    }

    fn wait(mut self: Box<Self>) -> Result<()> {
        let status = self.child.wait().map_err(|e| {
            Error::process_run(ProcessRunCode::ProcessFailed, "waiting for normalizer", &e)
        })?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if status.success() {
            Ok(())
        } else {
            Err(Error::NativeProcessRun {
                code: ProcessRunCode::ProcessFailed,
                message: format!(
                    "normalizer for job {} exited with {}: {}",
                    self.job_id,
                    status,
                    self.stderr_tail.snapshot()
                ),
            })
        }
    }
}

/// Runs normalizer helpers for one job.
#[derive(Clone)]
pub struct NormalizerOrchestrator {
    job_id: JobId,
    factory: Arc<dyn NormalizerProcessFactory>,
}

impl NormalizerOrchestrator {
    pub fn new(job_id: JobId, factory: Arc<dyn NormalizerProcessFactory>) -> Self {
        Self { job_id, factory }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Normalize the job's current raw scores.
    pub fn normalize_job(
        &self,
        provider: &dyn RawScoreProvider,
        quantiles_state: Option<&str>,
    ) -> Result<Vec<NormalizedResult>> {
        let scores = provider.raw_scores(&self.job_id)?;
        let state = InitialState::from_scores(scores);
        let results = self.normalize(&state, quantiles_state, None)?;
        if results.len() != state.len() {
            let unanswered = state.epochs().get(results.len()..).unwrap_or_default();
            return Err(Error::NativeProcessRun {
                code: ProcessRunCode::UnexpectedResultCount,
                message: format!(
                    "normalizer returned {} results for {} scores (first unanswered epoch {:?})",
                    results.len(),
                    state.len(),
                    unanswered.first()
                ),
            });
        }
        Ok(results)
    }

    /// Run one helper over `state` and return its results in row order.
    #[instrument(skip(self, state, quantiles_state), fields(job_id = %self.job_id, rows = state.len()))]
    pub fn normalize(
        &self,
        state: &InitialState,
        quantiles_state: Option<&str>,
        bucket_span: Option<u64>,
    ) -> Result<Vec<NormalizedResult>> {
        if state.is_empty() {
            debug!("empty initial state; skipping normalizer run");
            return Ok(Vec::new());
        }

        let mut process = self
            .factory
            .create(&self.job_id, quantiles_state, bucket_span)?;
        let (input, output) = process.take_streams()?;

        let reader = spawn_result_reader(output).map_err(|e| {
            Error::process_run(
                ProcessRunCode::StreamOpenFailed,
                "spawning normalizer reader thread",
                &e,
            )
        })?;

        let mut writer = LengthEncodedWriter::new(input);
        let written = state.write_to(&mut writer).and_then(|_| writer.close());
        if let Err(e) = &written {
            warn!(error = %e, "failed writing to normalizer");
        }

        let read = reader.join().map_err(|_| Error::NativeProcessRun {
            code: ProcessRunCode::ReadFailed,
            message: format!("normalizer reader for job {} panicked", self.job_id),
        })?;
        let exited = process.wait();

        written.map_err(|e| {
            Error::process_run(ProcessRunCode::WriteFailed, "writing normalizer input", &e)
        })?;
        let results = read.map_err(|e| {
            Error::process_run(ProcessRunCode::ReadFailed, "reading normalizer output", &e)
        })?;
        exited?;

        info!(results = results.len(), "normalizer run complete");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_process::MockNormalizerFactory;

    struct FixedScores(Vec<(i64, f64)>);

    impl RawScoreProvider for FixedScores {
        fn raw_scores(&self, _job_id: &JobId) -> Result<Vec<(i64, f64)>> {
            Ok(self.0.clone())
        }
    }

    fn orchestrator(factory: Arc<MockNormalizerFactory>) -> NormalizerOrchestrator {
        NormalizerOrchestrator::new(JobId::parse("farequote").unwrap(), factory)
    }

    #[test]
    fn test_normalize_job_short_answer_names_missing_epoch() {
        let factory = Arc::new(MockNormalizerFactory::new().drop_last_row());
        let err = orchestrator(factory)
            .normalize_job(&FixedScores(vec![(600, 3.0), (0, 1.0), (300, 2.0)]), None)
            .unwrap_err();
        match err {
            Error::NativeProcessRun { code, message } => {
                assert_eq!(code, ProcessRunCode::UnexpectedResultCount);
                assert!(message.contains("Some(600)"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_normalize_job_returns_results_in_order() {
        let factory = Arc::new(MockNormalizerFactory::new());
        let results = orchestrator(Arc::clone(&factory))
            .normalize_job(&FixedScores(vec![(2, 88.0), (1, 42.0)]), Some("q-state"))
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].raw_anomaly_score, 42.0);
        assert_eq!(results[1].raw_anomaly_score, 88.0);

        let invocations = factory.invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].quantiles_state.as_deref(), Some("q-state"));
        assert_eq!(invocations[0].header, vec!["anomalyScore".to_string()]);
    }

    #[test]
    fn test_empty_state_skips_helper() {
        let factory = Arc::new(MockNormalizerFactory::new());
        let results = orchestrator(Arc::clone(&factory))
            .normalize_job(&FixedScores(Vec::new()), None)
            .unwrap();
        assert!(results.is_empty());
        assert!(factory.invocations().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_helper_is_start_error() {
        let factory = Arc::new(NativeNormalizerFactory::new("/nonexistent/normalize", Vec::new()));
        let orchestrator = NormalizerOrchestrator::new(JobId::parse("j1").unwrap(), factory);
        let err = orchestrator
            .normalize(&InitialState::from_scores(vec![(1, 1.0)]), None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NativeProcessRun {
                code: ProcessRunCode::StartFailed,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_helper_failure_reports_exit_status() {
        let factory = Arc::new(NativeNormalizerFactory::new(
            "sh",
            vec![
                "-c".to_string(),
                "cat >/dev/null; echo 'bad quantiles' >&2; exit 4".to_string(),
            ],
        ));
        let orchestrator = NormalizerOrchestrator::new(JobId::parse("j1").unwrap(), factory);
        let err = orchestrator
            .normalize(&InitialState::from_scores(vec![(1, 1.0)]), None, None)
            .unwrap_err();
        match err {
            Error::NativeProcessRun { code, message } => {
                assert_eq!(code, ProcessRunCode::ProcessFailed);
                assert!(message.contains("bad quantiles"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
