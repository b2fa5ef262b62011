//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `MAILXFER_ADDRESS`, `MAILXFER_USERNAME`,
//!    `MAILXFER_PASSWORD`
//! 2. **Config file**: path via `--config <path>`, or `mailxfer.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [engine]
//! max_concurrent = 4
//! max_connections = 16
//! digest = "sha256"          # "sha256", "md5" or "none"
//! timeout_ms = 300000        # 0 = no limit
//! connect_timeout_ms = 30000
//! follow_location = true
//!
//! [mail]
//! address = "mail.example.com"
//! username = "ada"
//! password = "secret"
//! mailbox = "INBOX"
//! since = "2024-03-05"       # or since_days = 30
//! flag_replied = false
//! dont_touch_unread = true
//! tls = true
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use chrono::{Days, NaiveDate};
use serde::Deserialize;

use crate::mail::MailServer;
use crate::util::expand_tilde;
use crate::xfer::hasher::DigestAlgorithm;
use crate::xfer::options::OptionKey;
use crate::xfer::types::ManagerConfig;

const DEFAULT_FILE: &str = "mailxfer.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
    #[error("[mail] {0} is not set")]
    MissingMail(&'static str),
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transfer engine limits and per-transfer defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Transfers run at once by the session manager (default 4).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Live connections the network transport allows (default 16).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Digest computed over every payload (default `sha256`, `none` disables).
    #[serde(default = "default_digest")]
    pub digest: String,
    /// User agent sent on HTTP transfers.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Whole-transfer timeout in milliseconds, 0 for none (default 300 000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Connect timeout in milliseconds (default 30 000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Follow HTTP redirects (default true).
    #[serde(default = "default_follow_location")]
    pub follow_location: bool,
}

/// Mail account used by the `mailbox` subcommands.
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// Server host, optionally `host:port`. Override with `MAILXFER_ADDRESS`.
    pub address: Option<String>,
    /// Override with `MAILXFER_USERNAME`.
    pub username: Option<String>,
    /// Override with `MAILXFER_PASSWORD`.
    pub password: Option<String>,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    /// Oldest date searches consider. Takes precedence over `since_days`.
    pub since: Option<NaiveDate>,
    /// Search window in days back from today (default 30).
    #[serde(default = "default_since_days")]
    pub since_days: u64,
    #[serde(default)]
    pub flag_replied: bool,
    #[serde(default = "default_dont_touch_unread")]
    pub dont_touch_unread: bool,
    #[serde(default = "default_tls")]
    pub tls: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_max_concurrent() -> usize {
    4
}
fn default_max_connections() -> usize {
    16
}
fn default_digest() -> String {
    "sha256".to_string()
}
fn default_user_agent() -> String {
    format!("mailxfer/{}", env!("CARGO_PKG_VERSION"))
}
fn default_timeout_ms() -> u64 {
    300_000
}
fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_follow_location() -> bool {
    true
}
fn default_mailbox() -> String {
    "INBOX".to_string()
}
fn default_since_days() -> u64 {
    30
}
fn default_dont_touch_unread() -> bool {
    true
}
fn default_tls() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_connections: default_max_connections(),
            digest: default_digest(),
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            follow_location: default_follow_location(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            address: None,
            username: None,
            password: None,
            mailbox: default_mailbox(),
            since: None,
            since_days: default_since_days(),
            flag_replied: false,
            dont_touch_unread: default_dont_touch_unread(),
            tls: default_tls(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (`~` is expanded). Otherwise looks
    /// for `mailxfer.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => Some(expand_tilde(p)),
            None => Some(PathBuf::from(DEFAULT_FILE)).filter(|p| p.exists()),
        };
        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.engine.digest_algorithm()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Env var overrides, looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(address) = var("MAILXFER_ADDRESS") {
            self.mail.address = Some(address);
        }
        if let Some(username) = var("MAILXFER_USERNAME") {
            self.mail.username = Some(username);
        }
        if let Some(password) = var("MAILXFER_PASSWORD") {
            self.mail.password = Some(password);
        }
    }
}

impl EngineConfig {
    pub fn digest_algorithm(&self) -> Result<Option<DigestAlgorithm>, ConfigError> {
        match self.digest.as_str() {
            "" | "none" => Ok(None),
            other => other
                .parse()
                .map(Some)
                .map_err(|message| ConfigError::Invalid {
                    field: "engine.digest",
                    message,
                }),
        }
    }

    /// Session manager settings: concurrency, digest, and the options every
    /// transfer starts from.
    pub fn manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        let mut config = ManagerConfig::new(self.max_concurrent)
            .with_default(OptionKey::UserAgent, self.user_agent.as_str())
            .with_default(OptionKey::TimeoutMs, millis(self.timeout_ms))
            .with_default(OptionKey::ConnectTimeoutMs, millis(self.connect_timeout_ms))
            .with_default(OptionKey::FollowLocation, self.follow_location);
        if let Some(algorithm) = self.digest_algorithm()? {
            config = config.with_digest(algorithm);
        }
        Ok(config)
    }
}

fn millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

impl MailConfig {
    /// Account settings, with the search window resolved against `today`.
    pub fn server(&self, today: NaiveDate) -> Result<MailServer, ConfigError> {
        let since = match self.since {
            Some(date) => date,
            None => today
                .checked_sub_days(Days::new(self.since_days))
                .unwrap_or(NaiveDate::MIN),
        };
        Ok(MailServer {
            address: self.address.clone().ok_or(ConfigError::MissingMail("address"))?,
            username: self.username.clone().ok_or(ConfigError::MissingMail("username"))?,
            password: self.password.clone().ok_or(ConfigError::MissingMail("password"))?,
            since,
            flag_replied: self.flag_replied,
            dont_touch_unread: self.dont_touch_unread,
            tls: self.tls,
        })
    }
}
