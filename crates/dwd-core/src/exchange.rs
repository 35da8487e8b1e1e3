//! Domain-wide delegation token exchange.
//!
//! Implements the service-account JWT bearer grant with a `sub` claim:
//! <https://developers.google.com/identity/protocols/oauth2/service-account#delegatingauthority>
//!
//! 1. Build an assertion "identity X, acting as subject S, requests scopes [..]"
//! 2. Sign it with the service account's RSA key
//! 3. POST it to the token endpoint
//! 4. Receive a bearer token with an expiry
//!
//! The exchanger keeps no state between calls. Every call signs a new
//! assertion and returns a new token.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::{DelegateConfig, MAX_ASSERTION_LIFETIME_SECS};
use crate::credential::{domain_of, ServiceIdentity};
use crate::error::{DelegateError, DelegateResult};
use crate::scope::Scope;

pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Tokens are treated as expired this long before their declared expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

// ── Request / Token ─────────────────────────────────────────────────────

/// Act as `subject` with `scopes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpersonationRequest {
    pub subject: String,
    pub scopes: Vec<Scope>,
}

impl ImpersonationRequest {
    pub fn new(subject: impl Into<String>, scopes: Vec<Scope>) -> Self {
        Self {
            subject: subject.into(),
            scopes,
        }
    }

    /// Request the mail-submission scope for `subject`.
    pub fn mail(subject: impl Into<String>) -> Self {
        Self::new(subject, vec![Scope::MailFull])
    }

    pub fn scope_claim(&self) -> String {
        Scope::join(&self.scopes)
    }
}

/// A short-lived bearer token bound to one subject and scope set.
#[derive(Clone, PartialEq, Eq)]
pub struct DelegatedToken {
    bearer: String,
    expires_at: DateTime<Utc>,
    subject: String,
    scopes: Vec<Scope>,
}

impl fmt::Debug for DelegatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedToken")
            .field("bearer", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("subject", &self.subject)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl DelegatedToken {
    pub fn new(
        bearer: impl Into<String>,
        expires_at: DateTime<Utc>,
        subject: impl Into<String>,
        scopes: Vec<Scope>,
    ) -> Self {
        Self {
            bearer: bearer.into(),
            expires_at,
            subject: subject.into(),
            scopes,
        }
    }

    pub fn bearer(&self) -> &str {
        &self.bearer
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Expired at `now`, with a 60 s margin.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS)
    }
}

// ── Wire types ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique per assertion so two exchanges in the same second differ.
    pub jti: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Deserialize, Default)]
struct OAuthErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

// ── Exchanger ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TokenExchanger {
    http: Client,
    assertion_lifetime_secs: i64,
}

impl TokenExchanger {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            assertion_lifetime_secs: MAX_ASSERTION_LIFETIME_SECS,
        }
    }

    pub fn from_config(config: &DelegateConfig) -> DelegateResult<Self> {
        Ok(Self::new(config.http_client()?).with_assertion_lifetime(config.assertion_lifetime_secs))
    }

    pub fn with_assertion_lifetime(mut self, secs: i64) -> Self {
        self.assertion_lifetime_secs = secs.clamp(1, MAX_ASSERTION_LIFETIME_SECS);
        self
    }

    /// Exchange a signed assertion for a token impersonating `request.subject`.
    pub async fn exchange(
        &self,
        identity: &ServiceIdentity,
        request: &ImpersonationRequest,
    ) -> DelegateResult<DelegatedToken> {
        check_request(identity, request)?;

        let now = Utc::now();
        let assertion = self.assertion(identity, request, now)?;

        debug!(
            "Requesting delegated token for {} as {} ({})",
            request.subject,
            identity.client_email(),
            request.scope_claim()
        );

        let form = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];
        let response = self
            .http
            .post(identity.token_uri())
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                let what = if e.is_timeout() { "timed out" } else { "failed" };
                DelegateError::network(format!("token request {}: {}", what, e))
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| DelegateError::network(format!("token response read failed: {}", e)))?;

        if !(200..300).contains(&status) {
            let err = map_token_error(status, &body);
            warn!("Token exchange for {} failed: {}", request.subject, err);
            return Err(err);
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            DelegateError::network(format!("unparseable token response: {}", e))
                .with_status(status)
                .with_raw(body.clone())
        })?;

        Ok(DelegatedToken::new(
            token.access_token,
            now + Duration::seconds(token.expires_in.unwrap_or(3600)),
            request.subject.clone(),
            request.scopes.clone(),
        ))
    }

    fn assertion(
        &self,
        identity: &ServiceIdentity,
        request: &ImpersonationRequest,
        now: DateTime<Utc>,
    ) -> DelegateResult<String> {
        let iat = now.timestamp();
        let claims = AssertionClaims {
            iss: identity.client_email().to_string(),
            sub: request.subject.clone(),
            scope: request.scope_claim(),
            aud: identity.token_uri().to_string(),
            iat,
            exp: iat + self.assertion_lifetime_secs,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        identity.sign(&claims)
    }
}

/// Local checks made before anything is signed or sent.
fn check_request(identity: &ServiceIdentity, request: &ImpersonationRequest) -> DelegateResult<()> {
    if domain_of(&request.subject).is_none() {
        return Err(DelegateError::subject_not_found(format!(
            "'{}' is not an email address",
            request.subject
        )));
    }
    if !identity.owns(&request.subject) {
        return Err(DelegateError::subject_not_found(format!(
            "{} is outside the directory domain {}",
            request.subject,
            identity.directory_domain()
        )));
    }
    if request.scopes.is_empty() {
        return Err(DelegateError::scope_not_authorized("no scopes requested"));
    }
    Ok(())
}

/// Map a non-2xx token endpoint response onto the error taxonomy.
pub fn map_token_error(status: u16, body: &str) -> DelegateError {
    let parsed: OAuthErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.error.to_ascii_lowercase();
    let description = parsed.error_description.to_ascii_lowercase();
    let summary = if parsed.error.is_empty() {
        format!("token endpoint returned HTTP {}", status)
    } else if parsed.error_description.is_empty() {
        parsed.error.clone()
    } else {
        format!("{}: {}", parsed.error, parsed.error_description)
    };

    let err = if status >= 500 {
        DelegateError::network(summary)
    } else if code == "invalid_grant" && mentions_unknown_subject(&description) {
        DelegateError::subject_not_found(summary)
    } else if code == "invalid_scope"
        || (matches!(code.as_str(), "unauthorized_client" | "access_denied")
            && description.contains("scope")
            && !description.contains(UNREGISTERED_CLIENT))
    {
        DelegateError::scope_not_authorized(summary)
    } else if (400..500).contains(&status) {
        DelegateError::delegation_denied(summary)
    } else {
        DelegateError::network(summary)
    };

    err.with_status(status).with_raw(body)
}

/// Google answers an unregistered client and a grant lacking the scope with
/// the same text; the diagnostic probe tells the two apart.
const UNREGISTERED_CLIENT: &str = "unauthorized to retrieve access tokens using this method";

/// Texts naming the impersonated user. "account not found" refers to the
/// service account itself and stays `DelegationDenied`.
fn mentions_unknown_subject(description: &str) -> bool {
    ["invalid email", "not a valid email", "user id", "unknown user"]
        .iter()
        .any(|needle| description.contains(needle))
}
