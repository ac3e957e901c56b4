//! CLI smoke tests for ad-core.
//!
//! The autodetect and normalizer programs are stood in for by `sh` scripts
//! configured through a temp config file.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn ad_core() -> Command {
    let mut cmd = Command::cargo_bin("ad-core").expect("ad-core binary should exist");
    cmd.env_remove("AD_CONFIG")
        .env_remove("AD_LOG")
        .env_remove("AD_LOG_FORMAT")
        .env_remove("RUST_LOG");
    cmd
}

fn write(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path.display().to_string()
}

#[test]
fn version_prints_package_version() {
    ad_core()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_command_fails() {
    ad_core()
        .arg("nonexistent-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn check_reports_explicit_config() {
    let dir = TempDir::new().unwrap();
    let config = write(
        dir.path(),
        "engine.toml",
        "[supervisor]\nflush_poll_interval_ms = 250\n",
    );
    ad_core()
        .args(["check", "--config", &config])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"ok\""))
        .stdout(predicate::str::contains("\"flush_poll_interval_ms\": 250"));
}

#[test]
fn check_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let config = write(
        dir.path(),
        "engine.toml",
        "[supervisor]\nflush_poll_interval_ms = 0\n",
    );
    ad_core()
        .args(["check", "--config", &config])
        .assert()
        .code(11)
        .stderr(predicate::str::contains("flush_poll_interval_ms"));
}

#[test]
fn check_missing_config_fails() {
    ad_core()
        .args(["check", "--config", "/nonexistent/engine.toml"])
        .assert()
        .code(11)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn run_rejects_invalid_job_id() {
    let dir = TempDir::new().unwrap();
    let config = write(dir.path(), "engine.toml", "");
    ad_core()
        .args(["run", "--config", &config, "--job-id", "Not A Job", "--fields", "a"])
        .assert()
        .code(10);
}

#[cfg(unix)]
mod native {
    use super::*;

    #[test]
    fn normalize_runs_helper_and_prints_results() {
        let dir = TempDir::new().unwrap();
        let config = write(
            dir.path(),
            "engine.toml",
            r#"
[normalizer]
program = "sh"
args = ["-c", '''cat >/dev/null; echo '{"rawAnomalyScore":"1.5","normalizedProbability":"","anomalyScore":"0"}'; echo '{"rawAnomalyScore":"2.5","normalizedProbability":"40","anomalyScore":"7"}' ''']
"#,
        );
        let scores = write(dir.path(), "scores.json", "[[300, 2.5], [0, 1.5]]");

        ad_core()
            .args(["normalize", "--config", &config, "--scores", &scores])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"rawAnomalyScore\": 1.5"))
            .stdout(predicate::str::contains("\"normalizedProbability\": 40.0"));
    }

    #[test]
    fn normalize_helper_failure_exits_with_process_error() {
        let dir = TempDir::new().unwrap();
        let config = write(
            dir.path(),
            "engine.toml",
            "[normalizer]\nprogram = \"sh\"\nargs = [\"-c\", \"cat >/dev/null; exit 2\"]\n",
        );
        let scores = write(dir.path(), "scores.json", "[[0, 1.0]]");

        ad_core()
            .args(["normalize", "--config", &config, "--scores", &scores])
            .assert()
            .code(23);
    }

    fn autodetect_config(dir: &Path) -> String {
        write(
            dir,
            "engine.toml",
            r#"
[autodetect]
program = "sh"
args = ["-c", '''echo '{"bucket":{"timestamp":300,"anomalyScore":1.0}}'; echo '{"flush":{"id":"1"}}'; cat >/dev/null''']

[supervisor]
flush_poll_interval_ms = 50
process_exit_timeout_ms = 5000
"#,
        )
    }

    #[test]
    fn run_streams_input_and_prints_counts() {
        let dir = TempDir::new().unwrap();
        let config = autodetect_config(dir.path());
        let input = write(
            dir.path(),
            "data.ndjson",
            "{\"time\":300,\"host\":\"a\",\"cpu\":1}\n{\"time\":360,\"host\":\"b\",\"cpu\":2}\n",
        );

        ad_core()
            .args([
                "run", "--config", &config, "--job-id", "it-ops", "--fields", "host,cpu",
                "--input", &input,
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"processedRecordCount\": 2"))
            .stdout(predicate::str::contains("\"buckets\": 1"));
    }

    #[test]
    fn run_with_skipped_records_exits_partial() {
        let dir = TempDir::new().unwrap();
        let config = autodetect_config(dir.path());
        let input = write(
            dir.path(),
            "data.ndjson",
            "{\"time\":300,\"host\":\"a\"}\n{\"time\":\"never\",\"host\":\"b\"}\n",
        );

        ad_core()
            .args([
                "run", "--config", &config, "--job-id", "it-ops", "--fields", "host",
                "--input", &input,
            ])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("\"invalidDateCount\": 1"));
    }
}
