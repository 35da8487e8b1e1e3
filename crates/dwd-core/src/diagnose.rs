//! Delegation failure classifier and diagnostician.
//!
//! [`classify`] maps one observed signal onto a fixed, ordered taxonomy of
//! misconfiguration states. [`Diagnostician`] wraps it: it either classifies
//! a signal it is handed (passive) or runs a probe exchange against the
//! directory owner to produce one (active), then attaches remediation steps,
//! the literal evidence and the identity in question.

use std::fmt;

use chrono::{DateTime, Utc};
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::DelegateConfig;
use crate::credential::{CredentialStore, IdentitySummary, ServiceIdentity};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{DelegateError, DelegateErrorKind};
use crate::exchange::{ImpersonationRequest, TokenExchanger};
use crate::message::OutboundMessage;
use crate::scope::Scope;

pub const DELEGATION_CONSOLE_URL: &str = "https://admin.google.com/ac/owl/domainwidedelegation";

// ── Observation ─────────────────────────────────────────────────────────

/// A signal the classifier can look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "detail", rename_all = "snake_case")]
pub enum Observation {
    /// Loading the credential failed.
    Credential(DelegateError),
    /// The token exchange failed.
    Exchange(DelegateError),
    /// A dispatch attempt reached the provider.
    Dispatch(DispatchOutcome),
    /// A dispatch attempt never reached the provider.
    Transport(DelegateError),
    /// A local precondition failed (message validation, expired token, config).
    Local(DelegateError),
    /// The exchange succeeded and nothing was dispatched.
    Delegated {
        subject: String,
        expires_at: DateTime<Utc>,
    },
}

impl From<DelegateError> for Observation {
    fn from(err: DelegateError) -> Self {
        match err.kind {
            DelegateErrorKind::CredentialNotFound | DelegateErrorKind::CredentialMalformed => {
                Self::Credential(err)
            }
            kind if kind.is_exchange() => Self::Exchange(err),
            DelegateErrorKind::TransportFault => Self::Transport(err),
            _ => Self::Local(err),
        }
    }
}

impl From<DispatchOutcome> for Observation {
    fn from(outcome: DispatchOutcome) -> Self {
        Self::Dispatch(outcome)
    }
}

// ── Classification ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    MissingCredential,
    DelegationNotConfigured,
    SubjectOutsideDirectory,
    ScopeMismatch,
    ApiNotEnabled,
    PermissionPropagationDelay,
    Configured,
    Unknown,
}

impl Classification {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "MISSING_CREDENTIAL",
            Self::DelegationNotConfigured => "DELEGATION_NOT_CONFIGURED",
            Self::SubjectOutsideDirectory => "SUBJECT_OUTSIDE_DIRECTORY",
            Self::ScopeMismatch => "SCOPE_MISMATCH",
            Self::ApiNotEnabled => "API_NOT_ENABLED",
            Self::PermissionPropagationDelay => "PERMISSION_PROPAGATION_DELAY",
            Self::Configured => "CONFIGURED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn headline(&self) -> &'static str {
        match self {
            Self::MissingCredential => "No usable service-account credential",
            Self::DelegationNotConfigured => {
                "Domain-wide delegation is not configured for this service account"
            }
            Self::SubjectOutsideDirectory => "The impersonated user is not in the directory",
            Self::ScopeMismatch => "Delegation exists but does not grant the mail scope",
            Self::ApiNotEnabled => "The Gmail API is not enabled for the project",
            Self::PermissionPropagationDelay => {
                "Gmail refused the delegated token; permissions may still be propagating"
            }
            Self::Configured => "Domain-wide delegation is configured and working",
            Self::Unknown => "Unrecognised delegation failure",
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Configured)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ── Rules ───────────────────────────────────────────────────────────────

type Rule = (fn(&Observation) -> bool, Classification);

/// Evaluated top to bottom; the first matching predicate wins.
static RULES: &[Rule] = &[
    (credential_unusable, Classification::MissingCredential),
    (delegation_denied, Classification::DelegationNotConfigured),
    (subject_unknown, Classification::SubjectOutsideDirectory),
    (scope_missing, Classification::ScopeMismatch),
    (api_disabled, Classification::ApiNotEnabled),
    (permission_refused, Classification::PermissionPropagationDelay),
    (succeeded, Classification::Configured),
];

/// Classify one observation. Pure: no I/O, same input gives same output.
pub fn classify(observation: &Observation) -> Classification {
    RULES
        .iter()
        .find(|(predicate, _)| predicate(observation))
        .map(|(_, classification)| *classification)
        .unwrap_or(Classification::Unknown)
}

fn credential_unusable(o: &Observation) -> bool {
    matches!(o, Observation::Credential(_))
}

fn exchange_failed_with(o: &Observation, kind: DelegateErrorKind) -> bool {
    matches!(o, Observation::Exchange(e) if e.kind == kind)
}

fn delegation_denied(o: &Observation) -> bool {
    exchange_failed_with(o, DelegateErrorKind::DelegationDenied)
}

fn subject_unknown(o: &Observation) -> bool {
    exchange_failed_with(o, DelegateErrorKind::SubjectNotFound)
}

fn scope_missing(o: &Observation) -> bool {
    exchange_failed_with(o, DelegateErrorKind::ScopeNotAuthorized)
}

/// (status, reason, lower-cased raw body) of a rejected dispatch.
fn rejection(o: &Observation) -> Option<(u16, &str, String)> {
    match o {
        Observation::Dispatch(DispatchOutcome::Failed {
            raw,
            status,
            reason,
        }) => Some((*status, reason.as_deref().unwrap_or(""), raw.to_ascii_lowercase())),
        _ => None,
    }
}

fn api_disabled(o: &Observation) -> bool {
    rejection(o)
        .map(|(_, reason, raw)| {
            reason.eq_ignore_ascii_case("accessNotConfigured")
                || reason.eq_ignore_ascii_case("SERVICE_DISABLED")
                || raw.contains("has not been used")
                || raw.contains("accessnotconfigured")
        })
        .unwrap_or(false)
}

/// Quota and rate-limit 403s share the `PERMISSION_DENIED` envelope status
/// and are not permission signals.
fn quota_exceeded(reason: &str, raw: &str) -> bool {
    reason.to_ascii_lowercase().ends_with("limitexceeded") || raw.contains("\"usagelimits\"")
}

fn permission_refused(o: &Observation) -> bool {
    rejection(o)
        .map(|(_, reason, raw)| {
            !quota_exceeded(reason, &raw)
                && (reason.eq_ignore_ascii_case("insufficientPermissions")
                    || reason.eq_ignore_ascii_case("PERMISSION_DENIED")
                    || raw.contains("insufficient"))
        })
        .unwrap_or(false)
}

fn succeeded(o: &Observation) -> bool {
    matches!(
        o,
        Observation::Dispatch(DispatchOutcome::Sent { .. }) | Observation::Delegated { .. }
    )
}

// ── Diagnosis ───────────────────────────────────────────────────────────

/// The literal signal a diagnosis was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// `credential`, `token_endpoint`, `gmail_api`, `transport` or `local`.
    pub source: String,
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub raw: String,
}

impl Evidence {
    fn of(observation: &Observation) -> Self {
        match observation {
            Observation::Credential(e) => Self::from_error("credential", e, None),
            Observation::Exchange(e) => {
                Self::from_error("token_endpoint", e, e.raw.as_deref().and_then(oauth_error_code))
            }
            Observation::Transport(e) => Self::from_error("transport", e, None),
            Observation::Local(e) => Self::from_error("local", e, None),
            Observation::Dispatch(DispatchOutcome::Failed {
                raw,
                status,
                reason,
            }) => Self {
                source: "gmail_api".into(),
                status: Some(*status),
                reason: reason.clone(),
                raw: raw.clone(),
            },
            Observation::Dispatch(DispatchOutcome::Sent { message_id, .. }) => Self {
                source: "gmail_api".into(),
                status: None,
                reason: None,
                raw: format!("message accepted with id {}", message_id),
            },
            Observation::Delegated {
                subject,
                expires_at,
            } => Self {
                source: "token_endpoint".into(),
                status: None,
                reason: None,
                raw: format!("token issued for {} valid until {}", subject, expires_at),
            },
        }
    }

    fn from_error(source: &str, e: &DelegateError, reason: Option<String>) -> Self {
        Self {
            source: source.into(),
            status: e.status,
            reason: reason.or_else(|| Some(e.kind.to_string())),
            raw: e.evidence().to_string(),
        }
    }
}

fn oauth_error_code(raw: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()?
        .get("error")?
        .as_str()
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub classification: Classification,
    pub headline: String,
    pub remediation: Vec<String>,
    pub evidence: Evidence,
    pub identity: Option<IdentitySummary>,
    /// Subject the probe impersonated, for active diagnoses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_subject: Option<String>,
}

impl Diagnosis {
    pub fn is_configured(&self) -> bool {
        self.classification.is_configured()
    }
}

/// Who the probe impersonated and whether that address was guessed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSubject {
    pub address: String,
    pub guessed: bool,
}

/// Build a diagnosis for an observation without touching the network.
pub fn explain(
    identity: Option<&ServiceIdentity>,
    observation: &Observation,
    probe: Option<&ProbeSubject>,
) -> Diagnosis {
    let classification = match identity {
        Some(_) => classify(observation),
        None => Classification::MissingCredential,
    };
    let evidence = Evidence::of(observation);
    let remediation = remediation(classification, identity, &evidence, probe);
    Diagnosis {
        classification,
        headline: classification.headline().to_string(),
        remediation,
        evidence,
        identity: identity.map(ServiceIdentity::summary),
        probe_subject: probe.map(|p| p.address.clone()),
    }
}

fn remediation(
    classification: Classification,
    identity: Option<&ServiceIdentity>,
    evidence: &Evidence,
    probe: Option<&ProbeSubject>,
) -> Vec<String> {
    let client_id = identity
        .map(|i| i.client_id().to_string())
        .unwrap_or_else(|| "<client_id from the key file>".into());
    let domain = identity
        .map(|i| i.directory_domain().to_string())
        .unwrap_or_else(|| "<your domain>".into());
    let mail_scope = Scope::MailFull.as_str();

    match classification {
        Classification::MissingCredential => vec![
            "Run bootstrap (`dwd bootstrap --project <project-id> --domain <domain>`) to create the service account and its key file".into(),
            "Or set credential_path (DWD_CREDENTIAL_PATH) to an existing service-account key".into(),
        ],
        Classification::DelegationNotConfigured => vec![
            format!(
                "Open {} (Security > API controls > Domain-wide delegation)",
                DELEGATION_CONSOLE_URL
            ),
            format!("Add a new entry with Client ID {}", client_id),
            format!("Authorize the OAuth scope {}", mail_scope),
            "Changes can take a few minutes to propagate; run diagnose again afterwards".into(),
        ],
        Classification::SubjectOutsideDirectory => {
            let mut steps = vec![format!(
                "Confirm that the sender is an existing user of the {} Workspace directory",
                domain
            )];
            if let Some(p) = probe.filter(|p| p.guessed) {
                steps.push(format!(
                    "The probe impersonated {}, a guessed owner address; set probe_subject to a real user in {} and run diagnose again",
                    p.address, domain
                ));
            }
            steps
        }
        Classification::ScopeMismatch => vec![
            format!(
                "Edit the domain-wide delegation entry for Client ID {} at {}",
                client_id, DELEGATION_CONSOLE_URL
            ),
            format!("Add {} to its OAuth scopes", mail_scope),
        ],
        Classification::ApiNotEnabled => {
            let project = project_number(&evidence.raw)
                .or_else(|| identity.map(|i| i.project_id().to_string()).filter(|p| !p.is_empty()))
                .unwrap_or_else(|| "YOUR_PROJECT_ID".into());
            vec![
                format!(
                    "Enable the Gmail API: gcloud services enable gmail.googleapis.com --project={}",
                    project
                ),
                format!(
                    "Or visit https://console.developers.google.com/apis/api/gmail.googleapis.com/overview?project={}",
                    project
                ),
                "Wait a few minutes after enabling, then try again".into(),
            ]
        }
        Classification::PermissionPropagationDelay => vec![
            "Delegation changes can take several minutes to propagate; wait and retry".into(),
            format!(
                "If it persists, check that Client ID {} is authorized for {}",
                client_id, mail_scope
            ),
            format!("Check that the sender is an existing user of {}", domain),
        ],
        Classification::Configured => Vec::new(),
        Classification::Unknown => vec![
            format!("Provider response: {}", evidence.raw),
            "Check connectivity to the token and Gmail endpoints, then run diagnose again".into(),
        ],
    }
}

/// Project number quoted in a Google "API not enabled" error.
fn project_number(raw: &str) -> Option<String> {
    Regex::new(r"project (\d+)")
        .ok()?
        .captures(raw)?
        .get(1)
        .map(|m| m.as_str().to_string())
}

// ── Diagnostician ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Diagnostician {
    exchanger: TokenExchanger,
    dispatcher: Dispatcher,
    probe_subject: Option<String>,
    probe_recipient: Option<String>,
}

impl Diagnostician {
    pub fn new(exchanger: TokenExchanger, dispatcher: Dispatcher) -> Self {
        Self {
            exchanger,
            dispatcher,
            probe_subject: None,
            probe_recipient: None,
        }
    }

    pub fn from_config(config: &DelegateConfig) -> crate::error::DelegateResult<Self> {
        let mut diagnostician =
            Self::new(TokenExchanger::from_config(config)?, Dispatcher::from_config(config)?);
        diagnostician.probe_subject = config.probe_subject.clone();
        diagnostician.probe_recipient = config.probe_recipient.clone();
        Ok(diagnostician)
    }

    pub fn with_probe_subject(mut self, subject: impl Into<String>) -> Self {
        self.probe_subject = Some(subject.into());
        self
    }

    pub fn with_probe_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.probe_recipient = Some(recipient.into());
        self
    }

    /// Classify `observed`, or probe when there is nothing to classify.
    /// Never fails: unmatched signals become `Unknown`.
    pub async fn diagnose(
        &self,
        identity: Option<&ServiceIdentity>,
        observed: Option<&Observation>,
    ) -> Diagnosis {
        let identity = match identity {
            Some(identity) => identity,
            None => {
                let missing = Observation::Credential(DelegateError::new(
                    DelegateErrorKind::CredentialNotFound,
                    "no service identity loaded",
                ));
                return explain(None, observed.unwrap_or(&missing), None);
            }
        };

        match observed {
            Some(observation) => explain(Some(identity), observation, None),
            None => {
                let (subject, observation) = self.probe(identity).await;
                let diagnosis = explain(Some(identity), &observation, Some(&subject));
                info!(
                    "Delegation probe as {}: {}",
                    subject.address, diagnosis.classification
                );
                diagnosis
            }
        }
    }

    /// Load the credential from `store` and run an active diagnosis.
    pub async fn diagnose_store(&self, store: &CredentialStore) -> Diagnosis {
        match store.load() {
            Ok(identity) => self.diagnose(Some(&identity), None).await,
            Err(e) => self.diagnose(None, Some(&Observation::from(e))).await,
        }
    }

    /// Exchange as the probe subject and, if configured, send a probe
    /// message. Returns the subject used and the resulting signal.
    pub async fn probe(&self, identity: &ServiceIdentity) -> (ProbeSubject, Observation) {
        let subject = match self.probe_subject {
            Some(ref address) => ProbeSubject {
                address: address.clone(),
                guessed: false,
            },
            None => ProbeSubject {
                address: identity.owner_address(),
                guessed: true,
            },
        };
        debug!("Probing delegation as {}", subject.address);

        let request = ImpersonationRequest::new(&subject.address, identity.scopes().to_vec());
        let token = match self.exchanger.exchange(identity, &request).await {
            Ok(token) => token,
            Err(e) if e.kind == DelegateErrorKind::DelegationDenied => {
                let observation = self.narrow_scope_retry(identity, &subject.address, e).await;
                return (subject, observation);
            }
            Err(e) => return (subject, Observation::from(e)),
        };

        let observation = match self.probe_recipient {
            Some(ref recipient) => {
                let sent = match probe_message(identity, &subject.address, recipient) {
                    Ok(message) => self.dispatcher.send(&token, &message).await,
                    Err(e) => Err(e),
                };
                match sent {
                    Ok(outcome) => Observation::Dispatch(outcome),
                    Err(e) => Observation::from(e),
                }
            }
            None => Observation::Delegated {
                subject: token.subject().to_string(),
                expires_at: token.expires_at(),
            },
        };
        (subject, observation)
    }

    /// A grant that works for the narrow send scope but not the mail scope
    /// exists with the wrong scope; otherwise there is no grant at all.
    async fn narrow_scope_retry(
        &self,
        identity: &ServiceIdentity,
        subject: &str,
        denied: DelegateError,
    ) -> Observation {
        let narrow = ImpersonationRequest::new(subject, vec![Scope::GmailSend]);
        match self.exchanger.exchange(identity, &narrow).await {
            Ok(_) => {
                let mut err = DelegateError::scope_not_authorized(format!(
                    "{} can be impersonated with {} but not with {}",
                    subject,
                    Scope::GmailSend,
                    Scope::join(identity.scopes())
                ));
                err.status = denied.status;
                err.raw = denied.raw;
                Observation::Exchange(err)
            }
            Err(_) => Observation::Exchange(denied),
        }
    }
}

fn probe_message(
    identity: &ServiceIdentity,
    from: &str,
    to: &str,
) -> crate::error::DelegateResult<OutboundMessage> {
    OutboundMessage::builder()
        .from(from)
        .to(to)
        .subject("Domain-wide delegation probe")
        .body(format!(
            "This message confirms that {} can send as {}.",
            identity.client_email(),
            from
        ))
        .build()
}
