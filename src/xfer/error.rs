//! Error taxonomy for transfer handles and the session manager.
//!
//! Configuration errors (`InvalidOptionKind`, `OptionRejected`,
//! `AllocationFailed`) are returned directly and are recoverable before a
//! handle starts. Errors that happen while a transfer runs are recorded in its
//! [`TransferResult`](super::types::TransferResult) instead.

use serde::Serialize;

use super::options::{OptionKey, OptionKind};
use super::types::HandleState;

/// Failure codes reported by the transport while a transfer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferCode {
    UnsupportedProtocol,
    UrlMalformed,
    CouldntResolveHost,
    CouldntConnect,
    SslConnectError,
    LoginDenied,
    RemoteFileNotFound,
    QuoteError,
    HttpReturnedError(u16),
    OperationTimedout,
    SendError,
    RecvError,
    WriteError,
    FilesizeExceeded,
    WeirdServerReply,
}

impl TransferCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            Self::UrlMalformed => "URL_MALFORMED",
            Self::CouldntResolveHost => "COULDNT_RESOLVE_HOST",
            Self::CouldntConnect => "COULDNT_CONNECT",
            Self::SslConnectError => "SSL_CONNECT_ERROR",
            Self::LoginDenied => "LOGIN_DENIED",
            Self::RemoteFileNotFound => "REMOTE_FILE_NOT_FOUND",
            Self::QuoteError => "QUOTE_ERROR",
            Self::HttpReturnedError(_) => "HTTP_RETURNED_ERROR",
            Self::OperationTimedout => "OPERATION_TIMEDOUT",
            Self::SendError => "SEND_ERROR",
            Self::RecvError => "RECV_ERROR",
            Self::WriteError => "WRITE_ERROR",
            Self::FilesizeExceeded => "FILESIZE_EXCEEDED",
            Self::WeirdServerReply => "WEIRD_SERVER_REPLY",
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn recoverable(self) -> bool {
        matches!(
            self,
            Self::CouldntResolveHost
                | Self::CouldntConnect
                | Self::OperationTimedout
                | Self::SendError
                | Self::RecvError
        ) || matches!(self, Self::HttpReturnedError(status) if status >= 500)
    }
}

impl std::fmt::Display for TransferCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HttpReturnedError(status) => write!(f, "HTTP_RETURNED_ERROR({status})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A failure raised by a [`Connection`](crate::transport::Connection) while
/// performing a transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct TransportFault {
    pub code: TransferCode,
    pub message: String,
}

impl TransportFault {
    pub fn new(code: TransferCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors produced by transfer handles and the session manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XferError {
    #[error("option {key} expects a {expected} value, got {actual}")]
    InvalidOptionKind {
        key: OptionKey,
        expected: OptionKind,
        actual: OptionKind,
    },
    #[error("option {key} rejected: {reason}")]
    OptionRejected { key: OptionKey, reason: String },
    #[error("failed to allocate transfer handle: {0}")]
    AllocationFailed(String),
    #[error("transfer failed ({code}): {message}")]
    TransferError { code: TransferCode, message: String },
    #[error("transfer cancelled")]
    Cancelled,
    #[error("cannot {op} a handle in state {state}")]
    InvalidState { op: &'static str, state: HandleState },
}

impl XferError {
    /// Stable identifier for logs and JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidOptionKind { .. } => "INVALID_OPTION_KIND",
            Self::OptionRejected { .. } => "OPTION_REJECTED",
            Self::AllocationFailed(_) => "ALLOCATION_FAILED",
            Self::TransferError { code, .. } => code.as_str(),
            Self::Cancelled => "CANCELLED",
            Self::InvalidState { .. } => "INVALID_STATE",
        }
    }

    /// The transport code, if this is a mid-transfer failure.
    pub fn transfer_code(&self) -> Option<TransferCode> {
        match self {
            Self::TransferError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<TransportFault> for XferError {
    fn from(fault: TransportFault) -> Self {
        Self::TransferError {
            code: fault.code,
            message: fault.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_strings() {
        assert_eq!(TransferCode::LoginDenied.as_str(), "LOGIN_DENIED");
        assert_eq!(
            TransferCode::HttpReturnedError(404).to_string(),
            "HTTP_RETURNED_ERROR(404)"
        );
        assert_eq!(XferError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn test_recoverable() {
        assert!(TransferCode::OperationTimedout.recoverable());
        assert!(TransferCode::HttpReturnedError(503).recoverable());
        assert!(!TransferCode::HttpReturnedError(404).recoverable());
        assert!(!TransferCode::LoginDenied.recoverable());
    }

    #[test]
    fn test_fault_into_error() {
        let err: XferError = TransportFault::new(TransferCode::QuoteError, "BAD command").into();
        assert_eq!(err.transfer_code(), Some(TransferCode::QuoteError));
        assert_eq!(err.code(), "QUOTE_ERROR");
    }
}
