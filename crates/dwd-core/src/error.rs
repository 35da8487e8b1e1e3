//! Error types for credential loading, token exchange and dispatch.
//!
//! Every failure is a value: the exchanger and dispatcher never retry and
//! never panic on provider rejections, so the diagnostician can match on
//! the [`DelegateErrorKind`] and the raw provider payload attached to it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Kinds of delegation errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DelegateErrorKind {
    /// The credential file is absent or could not be read.
    CredentialNotFound,
    /// The credential file was read but lacks required fields or a parsable key.
    CredentialMalformed,
    /// The token endpoint refused to let the identity act for the subject.
    DelegationDenied,
    /// The subject is not a member of the directory.
    SubjectNotFound,
    /// The requested scope is not part of the delegation grant.
    ScopeNotAuthorized,
    /// The token endpoint could not be reached or answered with a server fault.
    NetworkError,
    /// Connection, TLS or timeout failure while submitting a message.
    TransportFault,
    /// A delegated token was used after its declared expiry.
    TokenExpired,
    /// The outbound message failed validation.
    InvalidMessage,
    /// Configuration could not be loaded or is inconsistent.
    Config,
    /// Catch-all.
    Unknown,
}

impl DelegateErrorKind {
    /// Local errors are raised before any network call is attempted.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::CredentialNotFound
                | Self::CredentialMalformed
                | Self::TokenExpired
                | Self::InvalidMessage
                | Self::Config
        )
    }

    /// Errors produced by the token endpoint (or on the way to it).
    pub fn is_exchange(&self) -> bool {
        matches!(
            self,
            Self::DelegationDenied
                | Self::SubjectNotFound
                | Self::ScopeNotAuthorized
                | Self::NetworkError
        )
    }
}

impl fmt::Display for DelegateErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Top-level error type for the delegation core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelegateError {
    pub kind: DelegateErrorKind,
    pub message: String,
    /// HTTP status returned by the provider, if any.
    pub status: Option<u16>,
    /// Raw provider payload, kept verbatim as diagnostic evidence.
    pub raw: Option<String>,
}

impl DelegateError {
    pub fn new(kind: DelegateErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            status: None,
            raw: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn credential_not_found(path: &Path, detail: impl fmt::Display) -> Self {
        Self::new(
            DelegateErrorKind::CredentialNotFound,
            format!("credential file {} is not readable: {}", path.display(), detail),
        )
    }

    pub fn credential_malformed(msg: impl Into<String>) -> Self {
        Self::new(DelegateErrorKind::CredentialMalformed, msg)
    }

    pub fn delegation_denied(msg: impl Into<String>) -> Self {
        Self::new(DelegateErrorKind::DelegationDenied, msg)
    }

    pub fn subject_not_found(msg: impl Into<String>) -> Self {
        Self::new(DelegateErrorKind::SubjectNotFound, msg)
    }

    pub fn scope_not_authorized(msg: impl Into<String>) -> Self {
        Self::new(DelegateErrorKind::ScopeNotAuthorized, msg)
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(DelegateErrorKind::NetworkError, msg)
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(DelegateErrorKind::TransportFault, msg)
    }

    pub fn token_expired(subject: &str) -> Self {
        Self::new(
            DelegateErrorKind::TokenExpired,
            format!("delegated token for {} has expired", subject),
        )
    }

    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::new(DelegateErrorKind::InvalidMessage, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(DelegateErrorKind::Config, msg)
    }

    /// Raw payload if the provider sent one, otherwise the message.
    pub fn evidence(&self) -> &str {
        self.raw.as_deref().unwrap_or(&self.message)
    }
}

impl fmt::Display for DelegateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "[HTTP {}] {}: {}", status, self.kind, self.message)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for DelegateError {}

pub type DelegateResult<T> = Result<T, DelegateError>;
