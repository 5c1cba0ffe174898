//! error.rs
//! Failure taxonomy shared by every Protocol Client implementation.
//!
//! Each failure has a kind (connection, internal, timeout, flash timeout) and a
//! numeric code from the remote CAN / XCP vocabulary:
//! - 0 success
//! - 1 download failure
//! - 2 internal error
//! - 3 unknown network error
//! - 4 flash timeout
//!
//! Recoverable errors (connection class, or a timeout mapped to code 3) are retried
//! locally by the capture and flash workers. Everything else is fatal.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    DownloadFailure = 1,
    InternalError = 2,
    NetworkUnknown = 3,
    FlashTimeout = 4,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::Success),
            1 => Some(ErrorCode::DownloadFailure),
            2 => Some(ErrorCode::InternalError),
            3 => Some(ErrorCode::NetworkUnknown),
            4 => Some(ErrorCode::FlashTimeout),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ErrorCode::Success => "success",
            ErrorCode::DownloadFailure => "xcp download failure",
            ErrorCode::InternalError => "xcp internal error",
            ErrorCode::NetworkUnknown => "network unknown error",
            ErrorCode::FlashTimeout => "xcp flashing timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.as_u8(), self.describe())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("connection error ({code}){}", detail_suffix(.detail))]
    Connection { code: ErrorCode, detail: Option<String> },

    #[error("internal error ({code}){}", detail_suffix(.detail))]
    Internal { code: ErrorCode, detail: Option<String> },

    #[error("timeout ({code}){}", detail_suffix(.detail))]
    Timeout { code: ErrorCode, detail: Option<String> },

    #[error("flash timeout ({code}){}", detail_suffix(.detail))]
    FlashTimeout { code: ErrorCode, detail: Option<String> },
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {}", d),
        None => String::new(),
    }
}

impl ProtocolError {
    pub fn connection(code: ErrorCode, detail: impl Into<String>) -> Self {
        ProtocolError::Connection { code, detail: Some(detail.into()) }
    }

    pub fn internal(code: ErrorCode, detail: impl Into<String>) -> Self {
        ProtocolError::Internal { code, detail: Some(detail.into()) }
    }

    /// A transport timeout. Callers that cannot tell a slow network from a dead
    /// one report it with [`ErrorCode::NetworkUnknown`], which makes it recoverable.
    pub fn timeout(code: ErrorCode, detail: impl Into<String>) -> Self {
        ProtocolError::Timeout { code, detail: Some(detail.into()) }
    }

    pub fn flash_timeout(detail: impl Into<String>) -> Self {
        ProtocolError::FlashTimeout {
            code: ErrorCode::FlashTimeout,
            detail: Some(detail.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Connection { code, .. }
            | ProtocolError::Internal { code, .. }
            | ProtocolError::Timeout { code, .. }
            | ProtocolError::FlashTimeout { code, .. } => *code,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            ProtocolError::Connection { detail, .. }
            | ProtocolError::Internal { detail, .. }
            | ProtocolError::Timeout { detail, .. }
            | ProtocolError::FlashTimeout { detail, .. } => detail.as_deref(),
        }
    }

    /// Connectivity-class failures are retried by the worker that hit them.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ProtocolError::Connection { .. } => true,
            ProtocolError::Timeout { code, .. } => *code == ErrorCode::NetworkUnknown,
            ProtocolError::Internal { .. } | ProtocolError::FlashTimeout { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip_and_names() {
        for raw in 0..=4u8 {
            let code = ErrorCode::from_u8(raw).unwrap();
            assert_eq!(code.as_u8(), raw);
        }
        assert!(ErrorCode::from_u8(5).is_none());
        assert_eq!(ErrorCode::NetworkUnknown.describe(), "network unknown error");
    }

    #[test]
    fn test_recoverability_classes() {
        assert!(ProtocolError::connection(ErrorCode::NetworkUnknown, "refused").is_recoverable());
        assert!(ProtocolError::connection(ErrorCode::DownloadFailure, "reset").is_recoverable());
        assert!(ProtocolError::timeout(ErrorCode::NetworkUnknown, "slow").is_recoverable());
        assert!(!ProtocolError::timeout(ErrorCode::InternalError, "hung").is_recoverable());
        assert!(!ProtocolError::internal(ErrorCode::InternalError, "crc").is_recoverable());
        assert!(!ProtocolError::flash_timeout("3s").is_recoverable());
    }

    #[test]
    fn test_display_carries_code_and_detail() {
        let err = ProtocolError::flash_timeout("xcp download timeout");
        assert_eq!(err.code(), ErrorCode::FlashTimeout);
        assert_eq!(
            err.to_string(),
            "flash timeout (code 4: xcp flashing timeout): xcp download timeout"
        );

        let bare = ProtocolError::Internal { code: ErrorCode::InternalError, detail: None };
        assert_eq!(bare.to_string(), "internal error (code 2: xcp internal error)");
        assert!(bare.detail().is_none());
    }
}
