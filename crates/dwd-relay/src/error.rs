//! Relay error types.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayErrorKind {
    /// Socket bind, accept, read or write failure.
    Io,
    /// The peer broke the SMTP dialogue (bad reply, closed mid-DATA).
    Protocol,
    /// The peer answered with a permanent or transient failure.
    Rejected,
}

impl fmt::Display for RelayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub message: String,
    /// SMTP reply code, for `Rejected`.
    pub code: Option<u16>,
}

impl RelayError {
    pub fn new(kind: RelayErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Io, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Protocol, msg)
    }

    pub fn rejected(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            ..Self::new(RelayErrorKind::Rejected, msg)
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[SMTP {}] {}: {}", code, self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
