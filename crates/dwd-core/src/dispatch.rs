//! Message submission through the Gmail API.
//!
//! - Base URL: `https://gmail.googleapis.com`
//! - Endpoint: `POST /gmail/v1/users/{userId}/messages/send`
//! - Auth: `Authorization: Bearer {delegated token}`
//! - Body: `{ "raw": base64url(RFC 5322 message) }`
//!
//! One call, one submission attempt. Provider rejections come back as
//! [`DispatchOutcome::Failed`]; only connection, TLS and timeout failures
//! are errors.

use log::{debug, info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{DelegateConfig, DEFAULT_GMAIL_API_BASE};
use crate::error::{DelegateError, DelegateResult};
use crate::exchange::DelegatedToken;
use crate::message::{encode_raw_bytes, OutboundMessage};

const USER_ID: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'@')
    .remove(b'.')
    .remove(b'-')
    .remove(b'_');

/// Result of one submission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent {
        message_id: String,
        thread_id: Option<String>,
    },
    Failed {
        /// Response body, verbatim.
        raw: String,
        status: u16,
        /// Machine-readable reason (`insufficientPermissions`, `SERVICE_DISABLED`, …).
        reason: Option<String>,
    },
}

impl DispatchOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Sent { message_id, .. } => Some(message_id),
            Self::Failed { .. } => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    #[serde(default)]
    id: String,
    thread_id: Option<String>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    raw: &'a str,
}

// ── Dispatcher ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Dispatcher {
    http: Client,
    api_base: String,
}

impl Dispatcher {
    pub fn new(http: Client, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn gmail(http: Client) -> Self {
        Self::new(http, DEFAULT_GMAIL_API_BASE)
    }

    pub fn from_config(config: &DelegateConfig) -> DelegateResult<Self> {
        Ok(Self::new(config.http_client()?, config.gmail_api_base.clone()))
    }

    fn send_url(&self, user_id: &str) -> String {
        format!(
            "{}/gmail/v1/users/{}/messages/send",
            self.api_base,
            utf8_percent_encode(user_id, USER_ID)
        )
    }

    /// Encode `message` and submit it as the token's subject.
    pub async fn send(
        &self,
        token: &DelegatedToken,
        message: &OutboundMessage,
    ) -> DelegateResult<DispatchOutcome> {
        if !token.subject().eq_ignore_ascii_case(message.from()) {
            return Err(DelegateError::invalid_message(format!(
                "token was issued for {} but the message is from {}",
                token.subject(),
                message.from()
            )));
        }
        debug!(
            "Dispatching message {} from {} to {} recipient(s)",
            message.id(),
            message.from(),
            message.to().len()
        );
        self.submit(token, &message.encode_raw()).await
    }

    /// Submit an already-formatted RFC 5322 message as the token's subject.
    pub async fn send_raw(
        &self,
        token: &DelegatedToken,
        rfc5322: &[u8],
    ) -> DelegateResult<DispatchOutcome> {
        if rfc5322.is_empty() {
            return Err(DelegateError::invalid_message("message is empty"));
        }
        self.submit(token, &encode_raw_bytes(rfc5322)).await
    }

    async fn submit(&self, token: &DelegatedToken, raw: &str) -> DelegateResult<DispatchOutcome> {
        if token.is_expired() {
            return Err(DelegateError::token_expired(token.subject()));
        }

        let response = self
            .http
            .post(self.send_url(token.subject()))
            .bearer_auth(token.bearer())
            .json(&SendRequest { raw })
            .send()
            .await
            .map_err(|e| {
                let what = if e.is_timeout() {
                    "timed out"
                } else if e.is_connect() {
                    "could not connect"
                } else {
                    "failed"
                };
                DelegateError::transport(format!("message submission {}: {}", what, e))
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| DelegateError::transport(format!("response read failed: {}", e)))?;

        if !(200..300).contains(&status) {
            let outcome = parse_failure(status, &body);
            warn!("Gmail rejected message from {} (HTTP {})", token.subject(), status);
            return Ok(outcome);
        }

        match serde_json::from_str::<SendResponse>(&body) {
            Ok(sent) if !sent.id.is_empty() => {
                info!("Message sent as {} (id {})", token.subject(), sent.id);
                Ok(DispatchOutcome::Sent {
                    message_id: sent.id,
                    thread_id: sent.thread_id,
                })
            }
            _ => Ok(DispatchOutcome::Failed {
                raw: body,
                status,
                reason: Some("missingMessageId".into()),
            }),
        }
    }
}

/// Build a `Failed` outcome from a Google API error envelope:
/// `{ "error": { "code", "message", "status", "errors": [{ "reason" }], "details": [{ "reason" }] } }`
pub fn parse_failure(status: u16, body: &str) -> DispatchOutcome {
    #[derive(Deserialize)]
    struct Reasoned {
        reason: Option<String>,
    }
    #[derive(Deserialize)]
    struct ApiErrorInner {
        status: Option<String>,
        #[serde(default)]
        errors: Vec<Reasoned>,
        #[serde(default)]
        details: Vec<Reasoned>,
    }
    #[derive(Deserialize)]
    struct ApiErrorWrapper {
        error: Option<ApiErrorInner>,
    }

    let reason = serde_json::from_str::<ApiErrorWrapper>(body)
        .ok()
        .and_then(|w| w.error)
        .and_then(|inner| {
            inner
                .errors
                .into_iter()
                .chain(inner.details)
                .find_map(|r| r.reason)
                .or(inner.status)
        });

    DispatchOutcome::Failed {
        raw: body.to_string(),
        status,
        reason,
    }
}
