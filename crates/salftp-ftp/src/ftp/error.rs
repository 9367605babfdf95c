//! FTP-specific error type.
//!
//! Every failure carries a [`FtpErrorKind`]; the kind maps onto an
//! [`ErrorClass`] that the control connection uses to decide between
//! retry, reconnect, abort-operation and degrade.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure reported by any part of the FTP stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpError {
    pub kind: FtpErrorKind,
    pub message: String,
    /// Server reply code behind the failure.
    pub code: Option<u16>,
    /// Session counter of the control connection when it failed.
    pub session_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FtpErrorKind {
    /// Host lookup or TCP connect did not succeed.
    ConnectionFailed,
    /// AUTH TLS refused, handshake failed or certificate rejected.
    TlsFailed,
    /// Login rejected.
    AuthFailed,
    /// Negative completion reply to a command.
    CommandRejected,
    /// PASV/PORT setup or data socket connect failed.
    DataChannelFailed,
    /// Data transfer ended early.
    TransferFailed,
    /// Reply that does not follow RFC 959 framing.
    ProtocolError,
    /// Proxy refused the tunnel or the proxy script is invalid.
    ProxyFailed,
    /// Local file read or write failed.
    IoError,
    /// Could not grow a buffer.
    OutOfMemory,
    /// No reply within the configured timeout.
    Timeout,
    /// Peer or network closed the connection.
    Disconnected,
    /// Server reports missing access rights.
    PermissionDenied,
    /// Remote path does not exist.
    NotFound,
    /// Server side quota is full.
    QuotaExceeded,
    /// Listing could not be parsed by any server type.
    ListingUnparsed,
    /// The server refused to list the directory.
    ListRefused,
    /// Stopped by the user.
    Cancelled,
    /// A login value is missing and must be supplied by the user.
    NeedUserInput,
    /// Bad connection parameters or user-part path.
    InvalidConfig,
    /// Anything else.
    Unknown,
}

/// Coarse classification used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connect refused, reset, timeout. Retried up to the attempt budget.
    Transport,
    /// Malformed or refusing reply. Terminal for the operation.
    Protocol,
    /// TLS failure. Reconnect immediately with a distinct message.
    Tls,
    /// Memory or local disk. Aborts the operation, keeps the session.
    Resource,
    /// Corrupt or unparseable listing. Degrades to raw listing.
    Listing,
    /// User cancelled.
    Cancelled,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transport | ErrorClass::Tls)
    }
}

pub type FtpResult<T> = Result<T, FtpError>;

impl FtpError {
    pub fn new(kind: FtpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
            session_id: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_session(mut self, id: u64) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ConnectionFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TlsFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::AuthFailed, msg)
    }

    pub fn command_rejected(code: u16, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::CommandRejected, msg).with_code(code)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::DataChannelFailed, msg)
    }

    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::TransferFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProtocolError, msg)
    }

    pub fn proxy_failed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ProxyFailed, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::IoError, msg)
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::OutOfMemory, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Timeout, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Disconnected, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::NotFound, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::Cancelled, msg)
    }

    pub fn need_user_input(variable: impl Into<String>) -> Self {
        let variable = variable.into();
        Self::new(
            FtpErrorKind::NeedUserInput,
            format!("value of {} is required", variable),
        )
    }

    /// Variable named by a [`FtpErrorKind::NeedUserInput`] error.
    pub fn missing_variable(&self) -> Option<&str> {
        if self.kind != FtpErrorKind::NeedUserInput {
            return None;
        }
        self.message
            .strip_prefix("value of ")
            .and_then(|s| s.strip_suffix(" is required"))
    }

    pub fn list_refused(code: u16, msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ListRefused, msg).with_code(code)
    }

    pub fn listing_unparsed(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::ListingUnparsed, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(FtpErrorKind::InvalidConfig, msg)
    }

    /// Maps a negative reply onto an error kind, looking at the text for 450/550.
    pub fn from_reply(code: u16, text: &str) -> Self {
        let kind = match code {
            421 => FtpErrorKind::Disconnected,
            425 | 426 => FtpErrorKind::DataChannelFailed,
            430 | 530 => FtpErrorKind::AuthFailed,
            450 | 550 => {
                let lower = text.to_lowercase();
                if lower.contains("permission") || lower.contains("denied") {
                    FtpErrorKind::PermissionDenied
                } else if lower.contains("not found") || lower.contains("no such") {
                    FtpErrorKind::NotFound
                } else if lower.contains("quota") {
                    FtpErrorKind::QuotaExceeded
                } else {
                    FtpErrorKind::CommandRejected
                }
            }
            451 | 452 | 552 => FtpErrorKind::TransferFailed,
            500..=504 => FtpErrorKind::CommandRejected,
            _ if code >= 400 => FtpErrorKind::CommandRejected,
            _ => FtpErrorKind::Unknown,
        };
        Self {
            kind,
            message: text.to_string(),
            code: Some(code),
            session_id: None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.kind {
            FtpErrorKind::ConnectionFailed
            | FtpErrorKind::Timeout
            | FtpErrorKind::Disconnected
            | FtpErrorKind::DataChannelFailed => ErrorClass::Transport,
            FtpErrorKind::TlsFailed => ErrorClass::Tls,
            FtpErrorKind::IoError | FtpErrorKind::OutOfMemory => ErrorClass::Resource,
            FtpErrorKind::ListingUnparsed => ErrorClass::Listing,
            FtpErrorKind::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Protocol,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

impl fmt::Display for FtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[FTP {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[FTP {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for FtpError {}

impl From<std::io::Error> for FtpError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected => Self::disconnected(e.to_string()),
            ErrorKind::OutOfMemory => Self::out_of_memory(e.to_string()),
            _ => Self::io_error(e.to_string()),
        }
    }
}

impl From<rustls::Error> for FtpError {
    fn from(e: rustls::Error) -> Self {
        Self::tls_failed(e.to_string())
    }
}

impl From<FtpError> for String {
    fn from(e: FtpError) -> String {
        e.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_classification() {
        assert_eq!(
            FtpError::from_reply(550, "No such file or directory").kind,
            FtpErrorKind::NotFound
        );
        assert_eq!(
            FtpError::from_reply(550, "Permission denied").kind,
            FtpErrorKind::PermissionDenied
        );
        assert_eq!(FtpError::from_reply(421, "bye").class(), ErrorClass::Transport);
        assert_eq!(FtpError::from_reply(500, "what?").class(), ErrorClass::Protocol);
    }

    #[test]
    fn test_display_includes_code() {
        let e = FtpError::command_rejected(530, "Login incorrect");
        assert_eq!(e.to_string(), "[FTP CommandRejected 530] Login incorrect");
    }

    #[test]
    fn test_io_error_mapping() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(FtpError::from(reset).is_retryable());
        let disk = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro fs");
        assert_eq!(FtpError::from(disk).class(), ErrorClass::Resource);
    }
}
