//! Native analysis process handle.
//!
//! [`AnalysisProcess`] is the seam between the supervisor and the external
//! process: the supervisor only needs to write records, probe liveness and
//! shut the process down. [`NativeAnalysisProcess`] implements it on top of
//! `std::process`, capturing a bounded tail of stderr on its own thread so a
//! crash report is available when the process dies.

use crate::codec::LengthEncodedWriter;
use crate::process::command::ProcessCommand;
use ad_common::{Error, JobId, ProcessRunCode, Result};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, ChildStdin, ChildStdout};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Grace period between SIGTERM and SIGKILL.
const SIGTERM_GRACE_MS: u64 = 2000;

/// Interval between exit polls while waiting for a process to stop.
const EXIT_POLL_MS: u64 = 20;

/// One job's native process.
pub trait AnalysisProcess: Send {
    /// Write one length-encoded record to the process input.
    fn write_record(&mut self, fields: &[String]) -> io::Result<()>;

    /// Push buffered input to the process.
    fn flush_stream(&mut self) -> io::Result<()>;

    /// Close the input stream and wait for the process to exit.
    fn close(&mut self) -> io::Result<()>;

    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Captured stderr tail, for error reports.
    fn read_error(&self) -> String;

    fn pid(&self) -> Option<u32>;

    fn start_time(&self) -> DateTime<Utc>;

    /// Terminate the process, escalating from SIGTERM to SIGKILL.
    fn kill(&mut self) -> io::Result<()>;
}

/// Bounded buffer of the most recent stderr lines.
#[derive(Debug)]
pub struct StderrTail {
    lines: Mutex<VecDeque<String>>,
    max_bytes: usize,
}

impl StderrTail {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            max_bytes,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.push_back(line);
        let mut total: usize = lines.iter().map(|l| l.len() + 1).sum();
        while total > self.max_bytes && lines.len() > 1 {
            if let Some(dropped) = lines.pop_front() {
                total -= dropped.len() + 1;
            }
        }
    }

    /// The retained lines joined with newlines.
    pub fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Drain a stderr stream into `tail`, logging each line.
pub fn capture_stderr<R>(
    job_id: JobId,
    stderr: R,
    tail: Arc<StderrTail>,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("stderr-{}", job_id))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => {
                        debug!(job_id = %job_id, line = %line, "native stderr");
                        tail.push(line);
                    }
                    Err(e) => {
                        trace!(job_id = %job_id, error = %e, "stderr stream ended");
                        break;
                    }
                }
            }
        })
}

/// Options for spawning a native process.
#[derive(Debug, Clone)]
pub struct NativeProcessOptions {
    /// Bytes of stderr retained for error reports.
    pub stderr_tail_bytes: usize,
    /// How long `close` waits for a clean exit before killing.
    pub exit_timeout: Duration,
}

impl Default for NativeProcessOptions {
    fn default() -> Self {
        Self {
            stderr_tail_bytes: 8192,
            exit_timeout: Duration::from_secs(30),
        }
    }
}

/// `std::process` backed [`AnalysisProcess`].
pub struct NativeAnalysisProcess {
    job_id: JobId,
    child: Child,
    input: Option<LengthEncodedWriter<ChildStdin>>,
    stderr_tail: Arc<StderrTail>,
    stderr_thread: Option<JoinHandle<()>>,
    start_time: DateTime<Utc>,
    exit_timeout: Duration,
    // Keeps temp config files alive until the process exits.
    _command: ProcessCommand,
}

impl NativeAnalysisProcess {
    /// Spawn the process and hand back its output stream.
    pub fn spawn(
        job_id: JobId,
        command: ProcessCommand,
        options: &NativeProcessOptions,
    ) -> Result<(Self, ChildStdout)> {
        let mut child = command.to_command().spawn().map_err(|e| {
            Error::process_run(
                ProcessRunCode::StartFailed,
                &format!("spawning {}", command.program().display()),
                &e,
            )
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::NativeProcessRun {
                code: ProcessRunCode::StreamOpenFailed,
                message: format!("missing stdio pipe for job {}", job_id),
            });
        };

        let stderr_tail = Arc::new(StderrTail::new(options.stderr_tail_bytes));
        let stderr_thread = capture_stderr(job_id.clone(), stderr, Arc::clone(&stderr_tail))
            .map_err(|e| {
                Error::process_run(ProcessRunCode::StreamOpenFailed, "capturing stderr", &e)
            })?;

        info!(
            job_id = %job_id,
            pid = child.id(),
            program = %command.program().display(),
            "native process started"
        );

        Ok((
            Self {
                job_id,
                child,
                input: Some(LengthEncodedWriter::new(stdin)),
                stderr_tail,
                stderr_thread: Some(stderr_thread),
                start_time: Utc::now(),
                exit_timeout: options.exit_timeout,
                _command: command,
            },
            stdout,
        ))
    }

    fn input(&mut self) -> io::Result<&mut LengthEncodedWriter<ChildStdin>> {
        self.input
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "process input is closed"))
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait()? {
                info!(job_id = %self.job_id, status = %status, "native process exited");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(EXIT_POLL_MS));
        }
    }

    fn join_stderr(&mut self) {
        if let Some(handle) = self.stderr_thread.take() {
            if handle.join().is_err() {
                warn!(job_id = %self.job_id, "stderr capture thread panicked");
            }
        }
    }

    #[cfg(unix)]
    fn kill_with_grace(&mut self) -> io::Result<()> {
        let pid = self.child.id() as i32;

        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        debug!(job_id = %self.job_id, pid, "sent SIGTERM");

        if self.wait_for_exit(Duration::from_millis(SIGTERM_GRACE_MS))? {
            return Ok(());
        }

        warn!(job_id = %self.job_id, pid, "process did not exit after SIGTERM, sending SIGKILL");
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
        self.child.wait().map(|_| ())
    }

    #[cfg(not(unix))]
    fn kill_with_grace(&mut self) -> io::Result<()> {
        self.child.kill()?;
        self.child.wait().map(|_| ())
    }
}

impl AnalysisProcess for NativeAnalysisProcess {
    fn write_record(&mut self, fields: &[String]) -> io::Result<()> {
        self.input()?.write_record(fields)
    }

    fn flush_stream(&mut self) -> io::Result<()> {
        self.input()?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        if let Some(input) = self.input.take() {
            if let Err(e) = input.close() {
                warn!(job_id = %self.job_id, error = %e, "error closing process input");
            }
        }
        if !self.wait_for_exit(self.exit_timeout)? {
            warn!(
                job_id = %self.job_id,
                timeout_ms = self.exit_timeout.as_millis() as u64,
                "native process did not exit after input closed"
            );
            self.kill_with_grace()?;
        }
        self.join_stderr();
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(job_id = %self.job_id, status = %status, "native process has exited");
                // Drain the rest of stderr so read_error sees the final lines.
                self.join_stderr();
                false
            }
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "failed to check process status");
                false
            }
        }
    }

    fn read_error(&self) -> String {
        self.stderr_tail.snapshot()
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    fn kill(&mut self) -> io::Result<()> {
        self.input.take();
        if self.child.try_wait()?.is_some() {
            self.join_stderr();
            return Ok(());
        }
        self.kill_with_grace()?;
        self.join_stderr();
        Ok(())
    }
}

impl Drop for NativeAnalysisProcess {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            warn!(job_id = %self.job_id, "native process dropped while running; killing");
            let _ = self.kill_with_grace();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_tail_keeps_latest_lines() {
        let tail = StderrTail::new(12);
        tail.push("first".to_string());
        tail.push("second".to_string());
        tail.push("third".to_string());
        assert_eq!(tail.snapshot(), "third");
    }

    #[test]
    fn test_stderr_tail_keeps_oversized_single_line() {
        let tail = StderrTail::new(4);
        tail.push("a long crash message".to_string());
        assert_eq!(tail.snapshot(), "a long crash message");
    }

    #[test]
    fn test_capture_stderr_collects_lines() {
        let tail = Arc::new(StderrTail::new(1024));
        let handle = capture_stderr(
            JobId::parse("j1").unwrap(),
            io::Cursor::new(b"fatal: bad config\nexiting\n".to_vec()),
            Arc::clone(&tail),
        )
        .unwrap();
        handle.join().unwrap();
        assert_eq!(tail.snapshot(), "fatal: bad config\nexiting");
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_missing_program_is_start_error() {
        let err = NativeAnalysisProcess::spawn(
            JobId::parse("j1").unwrap(),
            ProcessCommand::new("/nonexistent/autodetect"),
            &NativeProcessOptions::default(),
        )
        .err()
        .unwrap();
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
    fn test_close_waits_for_exit_after_input_closed() {
        let (mut process, _stdout) = NativeAnalysisProcess::spawn(
            JobId::parse("j1").unwrap(),
            ProcessCommand::new("cat"),
            &NativeProcessOptions::default(),
        )
        .unwrap();
        assert!(process.is_alive());
        assert!(process.pid().is_some());
        process.close().unwrap();
        assert!(!process.is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_process_reports_stderr() {
        let (mut process, _stdout) = NativeAnalysisProcess::spawn(
            JobId::parse("j1").unwrap(),
            ProcessCommand::new("sh").args(["-c", "echo boom >&2; exit 3"]),
            &NativeProcessOptions::default(),
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while process.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!process.is_alive());
        // No close: the exit check alone must have drained stderr.
        assert_eq!(process.read_error(), "boom");
    }
}
