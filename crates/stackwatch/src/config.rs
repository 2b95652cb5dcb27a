use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stackwatch_jdwp::JdwpClientConfig;
use thiserror::Error;

/// Top-level `stackwatch.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackWatchConfig {
    #[serde(default)]
    pub jdwp: JdwpConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JdwpConfig {
    #[serde(default = "JdwpConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a single command may wait for its reply before the
    /// connection is considered broken.
    #[serde(default = "JdwpConfig::default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl JdwpConfig {
    fn default_connect_timeout_ms() -> u64 {
        3_000
    }

    fn default_reply_timeout_ms() -> u64 {
        10_000
    }

    pub fn client_config(&self) -> JdwpClientConfig {
        JdwpClientConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
        }
    }
}

impl Default for JdwpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            reply_timeout_ms: Self::default_reply_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecodeConfig {
    /// Rendering of a null reference.
    #[serde(default = "DecodeConfig::default_null_marker")]
    pub null_marker: String,

    /// Array nesting expanded element by element; deeper arrays use the
    /// default `instance of T[n] (id=N)` rendering.
    #[serde(default = "DecodeConfig::default_max_depth")]
    pub max_depth: usize,
}

impl DecodeConfig {
    fn default_null_marker() -> String {
        "null".to_owned()
    }

    fn default_max_depth() -> usize {
        8
    }
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            null_marker: Self::default_null_marker(),
            max_depth: Self::default_max_depth(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    /// Append logs to the given file in addition to stderr.
    ///
    /// If the file cannot be opened, file logging is disabled while stderr
    /// stays active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Effective filter: the configured level, with `RUST_LOG` merged on top.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        match env_directives {
            Some(env_directives) => {
                let config_directives = Self::normalize_level_directives(&self.level);
                tracing_subscriber::EnvFilter::try_new(format!("{config_directives},{env_directives}"))
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            file: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` embeds a snippet of the input; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl StackWatchConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}
