//! Log level and format resolution.
//!
//! CLI flags (`-v`/`-q`, `--log-format`) win over `AD_LOG` and
//! `AD_LOG_FORMAT`; `RUST_LOG` is consulted only when `AD_LOG` is unset.

use serde::{Deserialize, Serialize};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console format (default).
    #[default]
    Human,
    /// One JSON object per line.
    Jsonl,
}

impl LogFormat {
    pub fn name(self) -> &'static str {
        match self {
            LogFormat::Human => "human",
            LogFormat::Jsonl => "jsonl",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let name = raw.trim().to_ascii_lowercase();
        match name.as_str() {
            "human" | "text" | "pretty" => Ok(Self::Human),
            "jsonl" | "json" | "ndjson" => Ok(Self::Jsonl),
            _ => Err(format!("log format must be human or jsonl, got {raw:?}")),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Log level filter, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    const ORDERED: [LogLevel; 6] = [
        LogLevel::Trace,
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
        LogLevel::Off,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }

    /// One step more verbose, saturating at trace.
    pub fn more_verbose(self) -> Self {
        let idx = Self::ORDERED.iter().position(|l| *l == self).unwrap_or(0);
        Self::ORDERED[idx.saturating_sub(1)]
    }

    /// Most verbose level named anywhere in a `RUST_LOG`-style directive list.
    fn from_directives(directives: &str) -> Option<Self> {
        directives
            .split(',')
            .filter_map(|d| d.rsplit('=').next())
            .filter_map(|l| l.parse::<LogLevel>().ok())
            .min()
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let name = raw.trim().to_ascii_lowercase();
        if name == "warning" {
            return Ok(Self::Warn);
        }
        if name == "none" || name == "quiet" {
            return Ok(Self::Off);
        }
        Self::ORDERED
            .into_iter()
            .find(|l| l.name() == name)
            .ok_or_else(|| format!("log level must be one of trace..off, got {raw:?}"))
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
            LogLevel::Off => Self::OFF,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Include timestamps in human output.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::default(),
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Create config from the process environment and CLI overrides.
    pub fn from_env(cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self {
        Self::from_vars(|name| std::env::var(name).ok(), cli_level, cli_format)
    }

    /// Create config from an arbitrary variable lookup.
    pub fn from_vars(
        var: impl Fn(&str) -> Option<String>,
        cli_level: Option<LogLevel>,
        cli_format: Option<LogFormat>,
    ) -> Self {
        let env_level = match var("AD_LOG") {
            Some(val) => val.parse::<LogLevel>().ok(),
            None => var("RUST_LOG").as_deref().and_then(LogLevel::from_directives),
        };
        let env_format = var("AD_LOG_FORMAT").and_then(|v| v.parse::<LogFormat>().ok());

        let defaults = LogConfig::default();
        LogConfig {
            level: cli_level.or(env_level).unwrap_or(defaults.level),
            format: cli_format.or(env_format).unwrap_or(defaults.format),
            ..defaults
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn test_format_aliases() {
        assert_eq!(" NDJSON ".parse::<LogFormat>(), Ok(LogFormat::Jsonl));
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Human));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Jsonl.to_string(), "jsonl");
    }

    #[test]
    fn test_level_names_and_verbosity_steps() {
        for level in LogLevel::ORDERED {
            assert_eq!(level.name().parse::<LogLevel>(), Ok(level));
        }
        assert_eq!("Warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!("none".parse::<LogLevel>(), Ok(LogLevel::Off));
        assert_eq!(LogLevel::Off.more_verbose(), LogLevel::Error);
        assert_eq!(LogLevel::Info.more_verbose(), LogLevel::Debug);
        assert_eq!(LogLevel::Trace.more_verbose(), LogLevel::Trace);
    }

    #[test]
    fn test_rust_log_directives_pick_most_verbose() {
        assert_eq!(
            LogLevel::from_directives("warn,ad_core::process=debug"),
            Some(LogLevel::Debug)
        );
        assert_eq!(LogLevel::from_directives("ad_core"), None);
    }

    #[test]
    fn test_ad_log_beats_rust_log() {
        let pairs = [("AD_LOG", "warn"), ("RUST_LOG", "trace")];
        assert_eq!(LogConfig::from_vars(vars(&pairs), None, None).level, LogLevel::Warn);

        let pairs = [("RUST_LOG", "info,ad_core=debug")];
        assert_eq!(LogConfig::from_vars(vars(&pairs), None, None).level, LogLevel::Debug);
    }

    #[test]
    fn test_cli_flags_win_over_environment() {
        let pairs = [("AD_LOG", "warn"), ("AD_LOG_FORMAT", "jsonl")];
        let config = LogConfig::from_vars(vars(&pairs), Some(LogLevel::Trace), Some(LogFormat::Human));
        assert_eq!((config.level, config.format), (LogLevel::Trace, LogFormat::Human));

        let config = LogConfig::from_vars(vars(&pairs[1..]), None, None);
        assert_eq!((config.level, config.format), (LogLevel::Info, LogFormat::Jsonl));
        assert!(config.timestamps);
    }
}
