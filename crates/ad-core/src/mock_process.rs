//! Scriptable stand-ins for native processes, for tests.
//!
//! - [`MockAnalysisProcess`]: records written records, can die on demand and
//!   can hold a write in flight until released.
//! - [`MockResultTracker`] / [`MockRenormalizationStatus`]: collaborator
//!   doubles for the supervisor.
//! - [`MockNormalizerFactory`]: an in-memory normalizer helper running on a
//!   thread over `std::io::pipe`.
//!
//! # Example
//!
//! ```ignore
//! use ad_core::mock_process::MockAnalysisProcess;
//!
//! let process = MockAnalysisProcess::new();
//! let handle = process.clone();
//! handle.hold_writes();
//! // ... start a write on another thread ...
//! assert!(handle.wait_for_held_write(Duration::from_secs(5)));
//! handle.release_writes();
//! ```

use crate::codec::LengthEncodedReader;
use crate::orchestrator::{NormalizerProcess, NormalizerProcessFactory};
use crate::process::native::AnalysisProcess;
use crate::renormalize::RenormalizationStatus;
use crate::results::{FlushAcknowledger, FlushWait, ResultTracker};
use ad_common::{Error, FlushId, JobId, ProcessRunCode, Result};
use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// ============================================================================
// Analysis process
// ============================================================================

#[derive(Debug, Default)]
struct MockState {
    records: Vec<Vec<String>>,
    flushes: usize,
    dead: bool,
    closed: bool,
    killed: bool,
    stderr: String,
    fail_writes: bool,
    write_budget: Option<usize>,
}

#[derive(Debug, Default)]
struct GateState {
    holding: bool,
    held: usize,
}

#[derive(Debug, Default)]
struct WriteGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// In-memory [`AnalysisProcess`]. Clones share state.
#[derive(Debug, Clone)]
pub struct MockAnalysisProcess {
    state: Arc<Mutex<MockState>>,
    gate: Arc<WriteGate>,
    start_time: DateTime<Utc>,
}

impl Default for MockAnalysisProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAnalysisProcess {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            gate: Arc::new(WriteGate::default()),
            start_time: Utc::now(),
        }
    }

    /// Every record written so far, in order.
    pub fn records(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).records.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flushes
    }

    /// Simulate a crash with the given stderr output.
    pub fn die(&self, stderr: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.dead = true;
        state.stderr = stderr.to_string();
    }

    /// Make every subsequent write fail with a broken pipe.
    pub fn fail_writes(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).fail_writes = true;
    }

    /// Accept `records` more records, then fail every write.
    pub fn fail_writes_after(&self, records: usize) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).write_budget = Some(records);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    pub fn was_killed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).killed
    }

    /// Block writes at entry until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.gate.state.lock().unwrap_or_else(PoisonError::into_inner).holding = true;
    }

    pub fn release_writes(&self) {
        self.gate.state.lock().unwrap_or_else(PoisonError::into_inner).holding = false;
        self.gate.changed.notify_all();
    }

    /// Wait until a write is blocked at the gate.
    pub fn wait_for_held_write(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.state.lock().unwrap_or_else(PoisonError::into_inner);
        while gate.held == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            gate = self.gate.changed.wait_timeout(gate, deadline - now).unwrap_or_else(PoisonError::into_inner).0;
        }
        true
    }

    fn pass_gate(&self) {
        let mut gate = self.gate.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !gate.holding {
            return;
        }
        gate.held += 1;
        self.gate.changed.notify_all();
        while gate.holding {
            gate = self.gate.changed.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }
        gate.held -= 1;
    }
}

impl AnalysisProcess for MockAnalysisProcess {
    fn write_record(&mut self, fields: &[String]) -> io::Result<()> {
        self.pass_gate();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.fail_writes || state.dead || state.closed || state.write_budget == Some(0) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock pipe closed"));
        }
        if let Some(budget) = state.write_budget.as_mut() {
            *budget -= 1;
        }
        state.records.push(fields.to_vec());
        Ok(())
    }

    fn flush_stream(&mut self) -> io::Result<()> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed = true;
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        !state.dead && !state.closed
    }

    fn read_error(&self) -> String {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).stderr.clone()
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn kill(&mut self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.killed = true;
        state.dead = true;
        Ok(())
    }
}

// ============================================================================
// Supervisor collaborators
// ============================================================================

/// [`ResultTracker`] double that can acknowledge flushes automatically.
#[derive(Debug, Default)]
pub struct MockResultTracker {
    acknowledger: FlushAcknowledger,
    auto_ack: AtomicBool,
    cleared: Mutex<Vec<FlushId>>,
    completions: AtomicUsize,
}

impl MockResultTracker {
    /// A tracker that acknowledges every flush on first poll.
    pub fn auto_ack() -> Self {
        let tracker = Self::default();
        tracker.auto_ack.store(true, Ordering::SeqCst);
        tracker
    }

    /// A tracker that only acknowledges flushes explicitly.
    pub fn manual() -> Self {
        Self::default()
    }

    pub fn acknowledge(&self, flush_id: FlushId) {
        self.acknowledger.acknowledge(flush_id);
    }

    /// Simulate the output stream ending.
    pub fn abort(&self) {
        self.acknowledger.abort();
    }

    pub fn cleared(&self) -> Vec<FlushId> {
        self.cleared.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

impl ResultTracker for MockResultTracker {
    fn wait_for_flush(&self, flush_id: FlushId, timeout: Duration) -> FlushWait {
        if self.auto_ack.load(Ordering::SeqCst) {
            self.acknowledger.acknowledge(flush_id);
        }
        self.acknowledger.wait(flush_id, timeout)
    }

    fn clear_flush(&self, flush_id: FlushId) {
        self.cleared.lock().unwrap_or_else(PoisonError::into_inner).push(flush_id);
        self.acknowledger.clear(flush_id);
    }

    fn await_completion(&self) -> Result<()> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Always-idle [`RenormalizationStatus`] that counts waits.
#[derive(Debug, Default)]
pub struct MockRenormalizationStatus {
    waits: AtomicUsize,
}

impl MockRenormalizationStatus {
    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }
}

impl RenormalizationStatus for MockRenormalizationStatus {
    fn is_idle(&self) -> bool {
        true
    }

    fn wait_until_idle(&self) {
        self.waits.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Normalizer helper
// ============================================================================

/// Maps `(header, row)` to one JSON output line.
pub type Scorer = Arc<dyn Fn(&[String], &[String]) -> String + Send + Sync>;

/// What one mock helper run received.
#[derive(Debug, Clone, PartialEq)]
pub struct MockInvocation {
    pub job_id: JobId,
    pub quantiles_state: Option<String>,
    pub bucket_span: Option<u64>,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// In-memory [`NormalizerProcessFactory`].
///
/// The default scorer answers tree rows with
/// `normalizedScore = (1 - probability) * 100` and score rows by echoing the
/// score into `rawAnomalyScore`, `anomalyScore` and `normalizedProbability`.
pub struct MockNormalizerFactory {
    scorer: Scorer,
    drop_last_row: bool,
    invocations: Arc<Mutex<Vec<MockInvocation>>>,
}

impl Default for MockNormalizerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNormalizerFactory {
    pub fn new() -> Self {
        Self {
            scorer: Arc::new(default_score),
            drop_last_row: false,
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = scorer;
        self
    }

    /// Answer one row fewer than received.
    pub fn drop_last_row(mut self) -> Self {
        self.drop_last_row = true;
        self
    }

    /// Completed runs, in order.
    pub fn invocations(&self) -> Vec<MockInvocation> {
        self.invocations.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn default_score(header: &[String], row: &[String]) -> String {
    let column = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .and_then(|i| row.get(i))
            .and_then(|v| v.parse::<f64>().ok())
    };
    if let Some(probability) = column("probability") {
        let score = ((1.0 - probability) * 100.0 * 100.0).round() / 100.0;
        format!("{{\"normalizedScore\":\"{}\"}}", score)
    } else {
        let score = column("anomalyScore").unwrap_or_default();
        format!(
            "{{\"rawAnomalyScore\":\"{s}\",\"anomalyScore\":\"{s}\",\"normalizedProbability\":\"{s}\"}}",
            s = score
        )
    }
}

impl NormalizerProcessFactory for MockNormalizerFactory {
    fn create(
        &self,
        job_id: &JobId,
        quantiles_state: Option<&str>,
        bucket_span: Option<u64>,
    ) -> Result<Box<dyn NormalizerProcess>> {
        let open_err =
            |e: io::Error| Error::process_run(ProcessRunCode::StreamOpenFailed, "mock pipe", &e);
        let (input_reader, input_writer) = io::pipe().map_err(open_err)?;
        let (output_reader, mut output_writer) = io::pipe().map_err(open_err)?;

        let scorer = Arc::clone(&self.scorer);
        let drop_last_row = self.drop_last_row;
        let invocations = Arc::clone(&self.invocations);
        let mut invocation = MockInvocation {
            job_id: job_id.clone(),
            quantiles_state: quantiles_state.map(str::to_string),
            bucket_span,
            header: Vec::new(),
            rows: Vec::new(),
        };

        let worker = thread::Builder::new()
            .name("mock-normalizer".to_string())
            .spawn(move || -> io::Result<()> {
                let mut records = LengthEncodedReader::new(input_reader);
                invocation.header = records.read_record()?.unwrap_or_default();
                for record in records {
                    invocation.rows.push(record?);
                }
                let answered = if drop_last_row {
                    invocation.rows.len().saturating_sub(1)
                } else {
                    invocation.rows.len()
                };
                for row in &invocation.rows[..answered] {
                    writeln!(output_writer, "{}", scorer(&invocation.header, row))?;
                }
                output_writer.flush()?;
                drop(output_writer);
                invocations.lock().unwrap_or_else(PoisonError::into_inner).push(invocation);
                Ok(())
            })
            .map_err(|e| Error::process_run(ProcessRunCode::StartFailed, "mock helper", &e))?;

        Ok(Box::new(MockNormalizerProcess {
            streams: Some((Box::new(input_writer), Box::new(output_reader))),
            worker: Some(worker),
        }))
    }
}

struct MockNormalizerProcess {
    streams: Option<(Box<dyn Write + Send>, Box<dyn Read + Send>)>,
    worker: Option<JoinHandle<io::Result<()>>>,
}

impl NormalizerProcess for MockNormalizerProcess {
    fn take_streams(&mut self) -> Result<(Box<dyn Write + Send>, Box<dyn Read + Send>)> {
        self.streams.take().ok_or_else(|| Error::NativeProcessRun {
            code: ProcessRunCode::StreamOpenFailed,
            message: "mock streams already taken".to_string(),
        })
    }

    fn wait(mut self: Box<Self>) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::process_run(
                ProcessRunCode::ProcessFailed,
                "mock helper",
                &e,
            )),
            Err(_) => Err(Error::NativeProcessRun {
                code: ProcessRunCode::ProcessFailed,
                message: "mock helper panicked".to_string(),
            }),
        }
    }
}
