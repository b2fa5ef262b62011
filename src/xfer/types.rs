//! Shared types for transfer handles and the session manager.
//!
//! Plain data: lifecycle states, results, submission requests, progress
//! events, and manager configuration.

use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};

use super::error::XferError;
use super::hasher::DigestAlgorithm;
use super::options::{OptionKey, OptionValue, UserData};

/// Transfer handle lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Created,
    Configured,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl HandleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one finished transfer.
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub transfer_id: String,
    pub label: Option<String>,
    /// Terminal state: `Completed`, `Failed` or `Cancelled`.
    pub state: HandleState,
    /// Bytes delivered to the consumer. Partial for failed or cancelled transfers.
    pub bytes_transferred: u64,
    /// Hex digest of the received bytes, only for completed transfers.
    pub digest: Option<String>,
    pub error: Option<XferError>,
    pub elapsed_ms: u64,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        self.state == HandleState::Completed
    }

    /// `"OK"` for completed transfers, otherwise the error code.
    pub fn status_code(&self) -> &'static str {
        match &self.error {
            Some(e) => e.code(),
            None if self.state == HandleState::Cancelled => "CANCELLED",
            None => "OK",
        }
    }

    /// JSON form used by the CLI and progress events.
    pub fn to_json(&self) -> Value {
        json!({
            "transfer_id": self.transfer_id,
            "label": self.label,
            "state": self.state,
            "status": self.status_code(),
            "bytes_transferred": self.bytes_transferred,
            "digest": self.digest,
            "error": self.error.as_ref().map(ToString::to_string),
            "elapsed_ms": self.elapsed_ms,
        })
    }
}

/// Everything needed to configure one transfer: its options plus the
/// handle-level digest choice.
#[derive(Debug, Clone, Default)]
pub struct TransferRequest {
    pub label: Option<String>,
    pub options: Vec<(OptionKey, OptionValue)>,
    /// Overrides the manager's default digest algorithm.
    pub digest: Option<DigestAlgorithm>,
}

impl TransferRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self::default().option(OptionKey::Url, OptionValue::Str(url.into()))
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn option(mut self, key: OptionKey, value: impl Into<OptionValue>) -> Self {
        self.options.push((key, value.into()));
        self
    }

    #[must_use]
    pub fn credentials(self, username: &str, password: &str) -> Self {
        self.option(OptionKey::Username, username)
            .option(OptionKey::Password, password)
    }

    #[must_use]
    pub fn custom_request(self, command: impl Into<String>) -> Self {
        self.option(OptionKey::CustomRequest, OptionValue::Str(command.into()))
    }

    #[must_use]
    pub fn digest(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest = Some(algorithm);
        self
    }

    /// Bind a chunk consumer and its user data.
    #[must_use]
    pub fn on_chunk<F>(self, data: Option<UserData>, f: F) -> Self
    where
        F: Fn(&[u8], Option<&UserData>) -> usize + Send + Sync + 'static,
    {
        let req = self.option(OptionKey::WriteFunction, OptionValue::callback(f));
        match data {
            Some(data) => req.option(OptionKey::WriteData, OptionValue::Pointer(data)),
            None => req,
        }
    }
}

/// Events broadcast while the manager runs transfers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        transfer_id: String,
        label: Option<String>,
    },
    Chunk {
        transfer_id: String,
        chunk_len: usize,
        bytes_transferred: u64,
    },
    Finished {
        transfer_id: String,
        state: HandleState,
        bytes_transferred: u64,
    },
}

/// Counts returned by [`SessionManager::run_all`](super::manager::SessionManager::run_all).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub(crate) fn record(&mut self, state: HandleState) {
        match state {
            HandleState::Completed => self.completed += 1,
            HandleState::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }
    }
}

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum transfers running at once. Zero is treated as 1.
    pub max_concurrent: usize,
    /// Digest computed for every transfer unless the request overrides it.
    pub digest: Option<DigestAlgorithm>,
    /// Options applied to every handle before the request's own options.
    pub defaults: Vec<(OptionKey, OptionValue)>,
}

impl ManagerConfig {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            digest: None,
            defaults: Vec::new(),
        }
    }

    /// The limit the manager actually enforces.
    pub fn concurrency_limit(&self) -> usize {
        self.max_concurrent.max(1)
    }

    #[must_use]
    pub fn with_digest(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest = Some(algorithm);
        self
    }

    #[must_use]
    pub fn with_default(mut self, key: OptionKey, value: impl Into<OptionValue>) -> Self {
        self.defaults.push((key, value.into()));
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new(4)
    }
}
