//! Run configuration.
//!
//! Priority: `config.json` > environment variables > built-in defaults.
//! `Config::save_example` writes a starter file for the `--create-config`
//! flag.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which retrieval strategy to start with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalPreference {
    /// Server-side phrase search (falls back to iteration if unsupported).
    Search,
    /// Full reverse-chronological walk with local filtering.
    Iterate,
}

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Channel username to retrieve from.
    pub channel: String,
    /// Exact substring that marks an overnight attack report.
    pub search_phrase: String,
    /// Base URL of the authenticated channel gateway.
    pub gateway_url: String,
    /// Model identifier for extraction calls.
    pub model: String,
    /// Hard cap on generated tokens per extraction call.
    pub max_tokens: u32,
    /// Decoding temperature (0 = deterministic).
    pub temperature: f32,
    /// Resume from the session checkpoint instead of starting a fresh pass.
    pub incremental: bool,
    /// Cap on matching messages to process (None = unlimited).
    pub message_limit: Option<usize>,
    /// Minimum spacing between model call issuances, in seconds.
    pub request_delay_secs: f64,
    /// Ceiling on concurrently outstanding model calls.
    pub max_concurrent_requests: usize,
    /// Retry attempt cap per item (total attempts, including the first).
    pub retry_max_attempts: u32,
    /// Total retry time budget per item, in seconds.
    pub retry_max_secs: u64,
    /// Preferred retrieval strategy.
    pub retrieval: RetrievalPreference,
    /// Output CSV path.
    pub output_file: PathBuf,
    /// Log file path.
    pub log_file: PathBuf,
    /// Log verbosity: trace, debug, info, warn, error.
    pub log_level: String,
    /// Session identifier; keys the checkpoint file.
    pub session_name: String,
    /// Directory for checkpoint state.
    pub state_dir: PathBuf,
    /// Output text encoding. Only utf-8 is supported.
    pub csv_encoding: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel: "kpszsu".to_string(),
            search_phrase: "У ніч на".to_string(),
            gateway_url: "http://127.0.0.1:8089".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 2000,
            temperature: 0.0,
            incremental: true,
            message_limit: Some(1000),
            request_delay_secs: 1.0,
            max_concurrent_requests: 5,
            retry_max_attempts: 3,
            retry_max_secs: 60,
            retrieval: RetrievalPreference::Search,
            output_file: PathBuf::from("channel_reports.csv"),
            log_file: PathBuf::from("skywatch.log"),
            log_level: "info".to_string(),
            session_name: "session".to_string(),
            state_dir: PathBuf::from("."),
            csv_encoding: "utf-8".to_string(),
        }
    }
}

impl Config {
    /// Load configuration: file (if present) over defaults, then env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `SKYWATCH_*` environment variable overrides.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SKYWATCH_CHANNEL") {
            self.channel = v;
        }
        if let Ok(v) = std::env::var("SKYWATCH_SEARCH_PHRASE") {
            self.search_phrase = v;
        }
        if let Ok(v) = std::env::var("SKYWATCH_GATEWAY_URL") {
            self.gateway_url = v;
        }
        if let Ok(v) = std::env::var("SKYWATCH_MODEL") {
            self.model = v;
        }
        if let Ok(v) = std::env::var("SKYWATCH_MESSAGE_LIMIT") {
            self.message_limit = match v.to_lowercase().as_str() {
                "" | "none" | "null" | "unlimited" => None,
                other => other.parse().ok().or(self.message_limit),
            };
        }
        if let Ok(v) = std::env::var("SKYWATCH_INCREMENTAL") {
            self.incremental = matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on");
        }
        if let Ok(v) = std::env::var("SKYWATCH_REQUEST_DELAY")
            && let Ok(parsed) = v.parse()
        {
            self.request_delay_secs = parsed;
        }
        if let Ok(v) = std::env::var("SKYWATCH_OUTPUT_FILE") {
            self.output_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SKYWATCH_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("SKYWATCH_SESSION") {
            self.session_name = v;
        }
    }

    /// Validate option values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "channel".into(),
                hint: "Set the channel username to retrieve from".into(),
            });
        }
        if self.search_phrase.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "search_phrase".into(),
                hint: "Set the phrase that marks report messages".into(),
            });
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_requests".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry_max_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidValue {
                key: "temperature".into(),
                message: format!("{} is outside 0.0..=2.0", self.temperature),
            });
        }
        if self.request_delay_secs < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "request_delay_secs".into(),
                message: "must not be negative".into(),
            });
        }
        let enc = self.csv_encoding.to_lowercase();
        if enc != "utf-8" && enc != "utf8" {
            return Err(ConfigError::InvalidValue {
                key: "csv_encoding".into(),
                message: format!("'{}' is not supported; use utf-8", self.csv_encoding),
            });
        }
        Ok(())
    }

    /// Write an example configuration file.
    pub fn save_example(path: &Path) -> Result<(), ConfigError> {
        let example = Self::default();
        let data = serde_json::to_string_pretty(&example).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        std::fs::write(path, format!("{data}\n"))?;
        Ok(())
    }

    /// Pacing delay as a `Duration`.
    pub fn request_delay(&self) -> Duration {
        Duration::from_secs_f64(self.request_delay_secs.max(0.0))
    }

    /// Total retry time budget as a `Duration`.
    pub fn retry_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.retry_max_secs)
    }

    /// Checkpoint file path for this session.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir
            .join(format!("{}.checkpoint.json", self.session_name))
    }
}
