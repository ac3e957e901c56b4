//! Engine configuration.
//!
//! Resolution order (highest to lowest priority):
//! 1. Explicit `--config` path
//! 2. `AD_CONFIG` environment variable
//! 3. XDG config home (`~/.config/anomaly_detector/config.toml`)
//! 4. Built-in defaults
//!
//! An explicit or env-provided path must exist; a missing XDG file falls
//! back to defaults.

use crate::process::NativeProcessOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "AD_CONFIG";

const CONFIG_DIR_NAME: &str = "anomaly_detector";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("invalid TOML in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for ad_common::Error {
    fn from(err: ConfigError) -> Self {
        ad_common::Error::Config(err.to_string())
    }
}

/// The autodetect (analysis) binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutodetectConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Default bucket span in seconds.
    pub bucket_span: Option<u64>,
    /// Config files passed as `--<name>config=<path>`.
    pub config_files: BTreeMap<String, PathBuf>,
}

impl Default for AutodetectConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("autodetect"),
            args: Vec::new(),
            bucket_span: None,
            config_files: BTreeMap::new(),
        }
    }
}

/// The normalizer helper binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("normalize"),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub flush_poll_interval_ms: u64,
    pub stderr_tail_bytes: usize,
    pub process_exit_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            flush_poll_interval_ms: 1000,
            stderr_tail_bytes: 8192,
            process_exit_timeout_ms: 30_000,
        }
    }
}

impl SupervisorConfig {
    pub fn flush_poll_interval(&self) -> Duration {
        Duration::from_millis(self.flush_poll_interval_ms)
    }

    pub fn process_options(&self) -> NativeProcessOptions {
        NativeProcessOptions {
            stderr_tail_bytes: self.stderr_tail_bytes,
            exit_timeout: Duration::from_millis(self.process_exit_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub autodetect: AutodetectConfig,
    pub normalizer: NormalizerConfig,
    pub supervisor: SupervisorConfig,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.flush_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.flush_poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.supervisor.stderr_tail_bytes == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.stderr_tail_bytes must be positive".to_string(),
            ));
        }
        if self.autodetect.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("autodetect.program is empty".to_string()));
        }
        if self.normalizer.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("normalizer.program is empty".to_string()));
        }
        if self.autodetect.bucket_span == Some(0) {
            return Err(ConfigError::Invalid(
                "autodetect.bucket_span must be positive".to_string(),
            ));
        }
        if let Some(name) = self.autodetect.config_files.keys().find(|n| n.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "autodetect.config_files has an empty name: {:?}",
                name
            )));
        }
        Ok(())
    }
}

/// Where the resolved configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Env(PathBuf),
    Xdg(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Explicit(p) | ConfigSource::Env(p) | ConfigSource::Xdg(p) => Some(p),
            ConfigSource::Defaults => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: EngineConfig,
    pub source: ConfigSource,
}

/// Pick the config source without touching the environment.
pub fn resolve_source(
    explicit: Option<&Path>,
    env_path: Option<&str>,
    xdg_config_home: Option<&Path>,
) -> ConfigSource {
    if let Some(path) = explicit {
        return ConfigSource::Explicit(path.to_path_buf());
    }
    if let Some(path) = env_path.filter(|p| !p.is_empty()) {
        return ConfigSource::Env(PathBuf::from(path));
    }
    if let Some(home) = xdg_config_home {
        let path = home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        if path.exists() {
            return ConfigSource::Xdg(path);
        }
    }
    ConfigSource::Defaults
}

/// Load and validate configuration with the standard resolution order.
pub fn load_config(explicit: Option<&Path>) -> Result<ResolvedConfig, ConfigError> {
    let env_path = std::env::var(CONFIG_ENV_VAR).ok();
    let xdg = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir);
    let source = resolve_source(explicit, env_path.as_deref(), xdg.as_deref());

    let config = match source.path() {
        Some(path) => EngineConfig::load_file(path)?,
        None => EngineConfig::default(),
    };
    config.validate()?;

    tracing::debug!(source = ?source, "configuration resolved");
    Ok(ResolvedConfig { config, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.supervisor.flush_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.supervisor.process_options().stderr_tail_bytes, 8192);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [autodetect]
            program = "/opt/ml/bin/autodetect"
            bucket_span = 300

            [autodetect.config_files]
            field = "/etc/ml/fields.conf"

            [supervisor]
            flush_poll_interval_ms = 250
            "#,
            Path::new("inline.toml"),
        )
        .unwrap();
        assert_eq!(config.autodetect.program, PathBuf::from("/opt/ml/bin/autodetect"));
        assert_eq!(config.autodetect.bucket_span, Some(300));
        assert_eq!(
            config.autodetect.config_files.get("field"),
            Some(&PathBuf::from("/etc/ml/fields.conf"))
        );
        assert_eq!(config.supervisor.flush_poll_interval_ms, 250);
        assert_eq!(config.supervisor.stderr_tail_bytes, 8192);
        assert_eq!(config.normalizer, NormalizerConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let mut config = EngineConfig::default();
        config.supervisor.flush_poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_program() {
        let mut config = EngineConfig::default();
        config.normalizer.program = PathBuf::new();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resolution_order() {
        let dir = TempDir::new().unwrap();
        let xdg_file = dir.path().join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        std::fs::create_dir_all(xdg_file.parent().unwrap()).unwrap();
        std::fs::write(&xdg_file, "").unwrap();

        let explicit = Path::new("/tmp/explicit.toml");
        assert_eq!(
            resolve_source(Some(explicit), Some("/tmp/env.toml"), Some(dir.path())),
            ConfigSource::Explicit(explicit.to_path_buf())
        );
        assert_eq!(
            resolve_source(None, Some("/tmp/env.toml"), Some(dir.path())),
            ConfigSource::Env(PathBuf::from("/tmp/env.toml"))
        );
        assert_eq!(
            resolve_source(None, Some(""), Some(dir.path())),
            ConfigSource::Xdg(xdg_file)
        );

        let empty = TempDir::new().unwrap();
        assert_eq!(resolve_source(None, None, Some(empty.path())), ConfigSource::Defaults);
    }

    #[test]
    fn test_load_file_errors() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            EngineConfig::load_file(&missing),
            Err(ConfigError::NotFound { .. })
        ));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[supervisor\nflush_poll_interval_ms = ").unwrap();
        assert!(matches!(
            EngineConfig::load_file(&bad),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_explicit_path_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[normalizer]\nprogram = \"/usr/bin/normalize\"\n").unwrap();
        let resolved = load_config(Some(&path)).unwrap();
        assert_eq!(resolved.source, ConfigSource::Explicit(path));
        assert_eq!(
            resolved.config.normalizer.program,
            PathBuf::from("/usr/bin/normalize")
        );
    }
}
