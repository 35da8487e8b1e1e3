//! Bootstrap error types following Google Cloud API error conventions.
//!
//! Google Cloud APIs return errors as
//! `{ "error": { "code", "message", "status", "details": [ErrorInfo] } }`.
//! The `ErrorInfo` reason distinguishes a disabled API from a caller
//! without the right roles, which the operator fixes in different places.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BootstrapErrorKind {
    /// The admin access token is missing, expired or invalid.
    Unauthenticated,
    /// The caller lacks the IAM or Service Usage roles for the project.
    PermissionDenied,
    /// A required API is disabled for the project.
    ApiNotEnabled,
    AlreadyExists,
    NotFound,
    /// Local file or transport failure.
    Io,
    /// Any other remote failure.
    Remote,
}

impl fmt::Display for BootstrapErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapError {
    pub kind: BootstrapErrorKind,
    pub message: String,
    /// HTTP status, for remote errors.
    pub status: Option<u16>,
    /// The API a `SERVICE_DISABLED` error names (e.g. `iam.googleapis.com`).
    pub service: Option<String>,
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for BootstrapError {}

impl BootstrapError {
    pub fn new(kind: BootstrapErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            service: None,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(BootstrapErrorKind::Io, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(BootstrapErrorKind::Remote, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(BootstrapErrorKind::AlreadyExists, message)
    }

    /// Parse a Google API error body.
    pub fn from_api_response(status_code: u16, body: &str) -> Self {
        #[derive(Deserialize)]
        struct ErrorInfo {
            reason: Option<String>,
            #[serde(default)]
            metadata: std::collections::HashMap<String, String>,
        }
        #[derive(Deserialize)]
        struct ApiErrorInner {
            code: Option<u16>,
            message: Option<String>,
            status: Option<String>,
            #[serde(default)]
            details: Vec<ErrorInfo>,
        }
        #[derive(Deserialize)]
        struct ApiErrorWrapper {
            error: Option<ApiErrorInner>,
        }

        let inner = serde_json::from_str::<ApiErrorWrapper>(body)
            .ok()
            .and_then(|w| w.error);

        let Some(inner) = inner else {
            let message = if body.is_empty() {
                format!("HTTP {}", status_code)
            } else {
                body.chars().take(500).collect()
            };
            let mut err = Self::new(kind_for(status_code, "", ""), message);
            err.status = Some(status_code);
            return err;
        };

        let code = inner.code.unwrap_or(status_code);
        let status = inner.status.unwrap_or_default();
        let info = inner.details.into_iter().find(|d| d.reason.is_some());
        let reason = info
            .as_ref()
            .and_then(|d| d.reason.clone())
            .unwrap_or_default();
        let service = info.and_then(|mut d| d.metadata.remove("service"));

        Self {
            kind: kind_for(code, &status, &reason),
            message: inner.message.unwrap_or_else(|| "Unknown error".to_string()),
            status: Some(code),
            service,
        }
    }

    /// What the operator should do next.
    pub fn hint(&self, project_id: &str) -> Vec<String> {
        match self.kind {
            BootstrapErrorKind::Unauthenticated => vec![
                "Supply a valid admin access token (e.g. from `gcloud auth print-access-token`)".into(),
            ],
            BootstrapErrorKind::PermissionDenied => vec![
                format!(
                    "The active account lacks permissions on project '{}' (Service Account Admin, Service Account Key Admin and Service Usage Admin, or Owner)",
                    project_id
                ),
                "Check the active account: gcloud auth list".into(),
            ],
            BootstrapErrorKind::ApiNotEnabled => {
                let service = self.service.as_deref().unwrap_or("iam.googleapis.com");
                vec![
                    format!("Enable it: gcloud services enable {} --project {}", service, project_id),
                    format!(
                        "Console: https://console.developers.google.com/apis/api/{}/overview?project={}",
                        service, project_id
                    ),
                ]
            }
            _ => Vec::new(),
        }
    }
}

fn kind_for(code: u16, status: &str, reason: &str) -> BootstrapErrorKind {
    match (reason, status, code) {
        ("SERVICE_DISABLED", _, _) => BootstrapErrorKind::ApiNotEnabled,
        ("AUTH_PERMISSION_DENIED" | "SERVICE_PERMISSION_DENIED" | "IAM_PERMISSION_DENIED", _, _) => {
            BootstrapErrorKind::PermissionDenied
        }
        (_, "UNAUTHENTICATED", _) | (_, _, 401) => BootstrapErrorKind::Unauthenticated,
        (_, "PERMISSION_DENIED", _) | (_, _, 403) => BootstrapErrorKind::PermissionDenied,
        (_, "ALREADY_EXISTS", _) | (_, _, 409) => BootstrapErrorKind::AlreadyExists,
        (_, "NOT_FOUND", _) | (_, _, 404) => BootstrapErrorKind::NotFound,
        _ => BootstrapErrorKind::Remote,
    }
}

pub type BootstrapResult<T> = Result<T, BootstrapError>;
