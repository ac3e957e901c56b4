//! Command line builder for native processes.
//!
//! Argument contract:
//!
//! | Flag | Meaning |
//! |------|---------|
//! | `--jobid=<id>` | job the process analyses |
//! | `--bucketspan=<secs>` | bucket span |
//! | `--lengthEncodedInput` | stdin carries length-encoded records |
//! | `--<name>config=<path>` | named config file |
//! | `--quantilesState=<path>` | quantiles state to restore |
//!
//! Content written by this builder goes to temp files that live as long as
//! the `ProcessCommand` itself, so the command must be kept until the
//! process exits.

use ad_common::JobId;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::NamedTempFile;

/// A runnable native process command line.
#[derive(Debug)]
pub struct ProcessCommand {
    program: PathBuf,
    args: Vec<String>,
    temp_files: Vec<NamedTempFile>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            temp_files: Vec::new(),
        }
    }

    /// Append a raw argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append raw arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn job_id(self, job_id: &JobId) -> Self {
        self.arg(format!("--jobid={}", job_id))
    }

    pub fn bucket_span(self, secs: u64) -> Self {
        self.arg(format!("--bucketspan={}", secs))
    }

    pub fn length_encoded_input(self) -> Self {
        self.arg("--lengthEncodedInput")
    }

    /// Pass an existing config file as `--<name>config=<path>`.
    pub fn config_file(self, name: &str, path: &Path) -> Self {
        self.arg(format!("--{}config={}", name, path.display()))
    }

    /// Write `contents` to a temp file and pass it as `--<name>config=<path>`.
    pub fn config_contents(mut self, name: &str, contents: &str) -> io::Result<Self> {
        let file = write_temp(&format!("ad-{}config-", name), ".conf", contents)?;
        let arg = format!("--{}config={}", name, file.path().display());
        self.temp_files.push(file);
        Ok(self.arg(arg))
    }

    /// Write a quantiles state to a temp file and pass it as
    /// `--quantilesState=<path>`.
    pub fn quantiles_state(mut self, state: &str) -> io::Result<Self> {
        let file = write_temp("ad-quantiles-", ".json", state)?;
        let arg = format!("--quantilesState={}", file.path().display());
        self.temp_files.push(file);
        Ok(self.arg(arg))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// Build a `Command` with all three standard streams piped.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

fn write_temp(prefix: &str, suffix: &str, contents: &str) -> io::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}
