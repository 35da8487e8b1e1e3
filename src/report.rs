//! Text and JSON rendering of command results.

use std::fmt::Write;

use dwd_bootstrap::{BootstrapError, DecommissionReport, ProvisionReport};
use dwd_core::Diagnosis;
use dwd_relay::ProbeReport;
use serde::Serialize;

use crate::error::CliError;

const RULE: &str = "======================================================================";

/// Outcome of `dwd send`.
#[derive(Debug, Serialize)]
pub struct SendReport {
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
}

/// `dwd bootstrap` / `dwd decommission` failure, with hints.
#[derive(Debug, Serialize)]
pub struct BootstrapFailure<'a> {
    pub error: &'a BootstrapError,
    pub hints: Vec<String>,
}

pub fn json<T: Serialize>(value: &T) -> Result<String, CliError> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn diagnosis(d: &Diagnosis) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "DELEGATION DIAGNOSIS: {}", d.classification);
    let _ = writeln!(out, "{}", RULE);
    if let Some(ref id) = d.identity {
        let _ = writeln!(out, "Project ID:       {}", id.project_id);
        let _ = writeln!(out, "Client Email:     {}", id.client_email);
        let _ = writeln!(out, "Client ID:        {}", id.client_id);
        let _ = writeln!(out, "Directory Domain: {}", id.directory_domain);
    }
    if let Some(ref subject) = d.probe_subject {
        let _ = writeln!(out, "Probe Subject:    {}", subject);
    }
    let _ = writeln!(out);
    let mark = if d.is_configured() { '✓' } else { '✗' };
    let _ = writeln!(out, "{} {}", mark, d.headline);

    if !d.remediation.is_empty() {
        let _ = writeln!(out, "\nNext steps:");
        for (i, step) in d.remediation.iter().enumerate() {
            let _ = writeln!(out, "  {}. {}", i + 1, step);
        }
    }

    let e = &d.evidence;
    let _ = writeln!(out, "\nEvidence ({}):", e.source);
    if let Some(status) = e.status {
        let _ = writeln!(out, "  status: {}", status);
    }
    if let Some(ref reason) = e.reason {
        let _ = writeln!(out, "  reason: {}", reason);
    }
    let _ = writeln!(out, "  {}", e.raw);
    out
}

pub fn send(r: &SendReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "From:    {}", r.sender);
    let _ = writeln!(out, "To:      {}", r.recipients.join(", "));
    let _ = writeln!(out, "Subject: {}", r.subject);
    match (&r.message_id, &r.diagnosis) {
        (Some(id), _) => {
            let _ = writeln!(out, "\n✓ Sent (Message ID: {})", id);
        }
        (None, Some(d)) => {
            let _ = writeln!(out, "\n✗ Not sent\n");
            out.push_str(&diagnosis(d));
        }
        (None, None) => {
            let _ = writeln!(out, "\n✗ Not sent");
        }
    }
    out
}

pub fn provision(r: &ProvisionReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", RULE);
    let _ = writeln!(out, "SERVICE ACCOUNT READY");
    let _ = writeln!(out, "{}", RULE);
    for api in &r.enabled_apis {
        let _ = writeln!(out, "✓ Enabled {}", api);
    }
    let verb = if r.reused_account { "Reused" } else { "Created" };
    let _ = writeln!(out, "✓ {} {}", verb, r.service_account_email);
    let _ = writeln!(out, "✓ Key {} saved to {}", r.key_id, r.key_path.display());
    let _ = writeln!(out, "\nClient ID: {}", r.client_id);
    let _ = writeln!(out, "\nFinish in the Google Admin console:");
    for (i, step) in r.delegation_steps.iter().enumerate() {
        let _ = writeln!(out, "  {}. {}", i + 1, step);
    }
    out
}

pub fn decommission(r: &DecommissionReport) -> String {
    let mut out = String::new();
    if r.account_deleted {
        let _ = writeln!(out, "✓ Deleted {}", r.service_account_email);
    } else {
        let _ = writeln!(out, "• {} did not exist", r.service_account_email);
    }
    if r.key_file_removed {
        let _ = writeln!(out, "✓ Removed the local key file");
    }
    for line in &r.reminder {
        let _ = writeln!(out, "\n{}", line);
    }
    out
}

pub fn bootstrap_failure(f: &BootstrapFailure<'_>) -> String {
    let mut out = format!("✗ {}\n", f.error);
    if !f.hints.is_empty() {
        out.push_str("\nNext steps:\n");
        for (i, hint) in f.hints.iter().enumerate() {
            let _ = writeln!(out, "  {}. {}", i + 1, hint);
        }
    }
    out
}

pub fn probe(r: &ProbeReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "S: {}", r.greeting);
    for step in &r.steps {
        let _ = writeln!(out, "C: {}", step.sent);
        let _ = writeln!(out, "S: {}", step.reply);
    }
    let verdict = if r.accepted {
        "✓ Relay accepted the message"
    } else {
        "✗ Relay did not accept the message"
    };
    let _ = writeln!(out, "\n{}", verdict);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dwd_core::{Classification, Evidence, IdentitySummary};
    use dwd_relay::{ProbeStep, Reply};
    use std::path::PathBuf;

    fn denied() -> Diagnosis {
        Diagnosis {
            classification: Classification::DelegationNotConfigured,
            headline: Classification::DelegationNotConfigured.headline().into(),
            remediation: vec!["Add a new entry with Client ID 1098".into()],
            evidence: Evidence {
                source: "token_endpoint".into(),
                status: Some(401),
                reason: Some("unauthorized_client".into()),
                raw: r#"{"error":"unauthorized_client"}"#.into(),
            },
            identity: Some(IdentitySummary {
                client_email: "gmail-sender@mail-project.iam.gserviceaccount.com".into(),
                client_id: "1098".into(),
                project_id: "mail-project".into(),
                directory_domain: "example.com".into(),
            }),
            probe_subject: Some("admin@example.com".into()),
        }
    }

    #[test]
    fn diagnosis_text_has_every_part() {
        let text = diagnosis(&denied());
        assert!(text.contains("DELEGATION DIAGNOSIS: DELEGATION_NOT_CONFIGURED"));
        assert!(text.contains("Client ID:        1098"));
        assert!(text.contains("Probe Subject:    admin@example.com"));
        assert!(text.contains("  1. Add a new entry with Client ID 1098"));
        assert!(text.contains("status: 401"));
        assert!(text.contains(r#"{"error":"unauthorized_client"}"#));
    }

    #[test]
    fn diagnosis_json_uses_codes() {
        let value: serde_json::Value = serde_json::from_str(&json(&denied()).unwrap()).unwrap();
        assert_eq!(value["classification"], "DELEGATION_NOT_CONFIGURED");
        assert_eq!(value["evidence"]["status"], 401);
    }

    #[test]
    fn send_text() {
        let sent = SendReport {
            sender: "alice@example.com".into(),
            recipients: vec!["bob@example.com".into()],
            subject: "Hello".into(),
            message_id: Some("18c2f".into()),
            diagnosis: None,
        };
        assert!(send(&sent).contains("✓ Sent (Message ID: 18c2f)"));

        let failed = SendReport {
            message_id: None,
            diagnosis: Some(denied()),
            ..sent
        };
        let text = send(&failed);
        assert!(text.contains("✗ Not sent"));
        assert!(text.contains("DELEGATION_NOT_CONFIGURED"));
    }

    #[test]
    fn provision_text_lists_steps() {
        let report = ProvisionReport {
            service_account_email: "gmail-sender@p.iam.gserviceaccount.com".into(),
            client_id: "4242".into(),
            key_id: "abc".into(),
            key_path: PathBuf::from("gmail_service_account.json"),
            reused_account: true,
            enabled_apis: vec!["iam.googleapis.com".into()],
            delegation_steps: vec!["Click 'Add new' and paste Client ID 4242".into()],
        };
        let text = provision(&report);
        assert!(text.contains("✓ Reused gmail-sender@p.iam.gserviceaccount.com"));
        assert!(text.contains("  1. Click 'Add new' and paste Client ID 4242"));
    }

    #[test]
    fn bootstrap_failure_lists_hints() {
        let error = BootstrapError::from_api_response(
            403,
            r#"{"error":{"code":403,"message":"Permission denied","status":"PERMISSION_DENIED"}}"#,
        );
        let failure = BootstrapFailure {
            hints: error.hint("mail-project"),
            error: &error,
        };
        let text = bootstrap_failure(&failure);
        assert!(text.starts_with("✗ PermissionDenied (HTTP 403): Permission denied"));
        assert!(text.contains("  2. Check the active account: gcloud auth list"));
    }

    #[test]
    fn probe_transcript_text() {
        let report = ProbeReport {
            greeting: Reply::new(220, "relay ESMTP"),
            steps: vec![ProbeStep {
                sent: "EHLO localhost".into(),
                reply: Reply::new(250, "relay"),
            }],
            accepted: false,
        };
        let text = probe(&report);
        assert!(text.starts_with("S: 220 relay ESMTP\nC: EHLO localhost\nS: 250 relay\n"));
        assert!(text.contains("did not accept"));
    }
}
