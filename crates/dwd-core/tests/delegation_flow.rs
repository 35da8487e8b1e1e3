mod common;

use common::{Grant, MockGoogle, DOMAIN, SEND_SCOPE};
use dwd_core::{
    classify, Classification, CredentialStore, DelegateError, DelegateErrorKind, Diagnostician,
    DispatchOutcome, Dispatcher, ImpersonationRequest, Mailer, Observation, OutboundMessage,
    TokenCache, TokenExchanger, TransferEncoding,
};
use mailparse::MailHeaderMap;
use reqwest::Client;

fn mailer(mock: &MockGoogle) -> Mailer {
    Mailer::new(
        TokenExchanger::new(Client::new()),
        Dispatcher::new(Client::new(), mock.base_url()),
    )
}

fn diagnostician(mock: &MockGoogle) -> Diagnostician {
    Diagnostician::new(
        TokenExchanger::new(Client::new()),
        Dispatcher::new(Client::new(), mock.base_url()),
    )
}

fn hello() -> OutboundMessage {
    OutboundMessage::builder()
        .from("alice@example.com")
        .to("bob@example.com")
        .subject("Hello")
        .body("Hi")
        .build()
        .unwrap()
}

// ── Exchange properties ─────────────────────────────────────────────────

#[tokio::test]
async fn subject_outside_domain_is_not_found_without_network() {
    // No grant: anything that reached the endpoint would come back denied.
    let mock = MockGoogle::start_with(Grant::None).await;
    let exchanger = TokenExchanger::new(Client::new());
    let identity = mock.identity();

    for subject in ["eve@evil.test", "alice@example.org", "alice@mail.example.com", "alice"] {
        let err = exchanger
            .exchange(&identity, &ImpersonationRequest::mail(subject))
            .await
            .unwrap_err();
        assert_eq!(err.kind, DelegateErrorKind::SubjectNotFound, "{}", subject);
    }
    assert!(mock.claims().is_empty());
}

#[tokio::test]
async fn repeated_exchanges_yield_fresh_tokens() {
    let mock = MockGoogle::start().await;
    let exchanger = TokenExchanger::new(Client::new());
    let identity = mock.identity();
    let request = ImpersonationRequest::mail("alice@example.com");

    let first = exchanger.exchange(&identity, &request).await.unwrap();
    let second = exchanger.exchange(&identity, &request).await.unwrap();
    assert_ne!(first.bearer(), second.bearer());
    assert!(!first.is_expired());

    let claims = mock.claims();
    assert_eq!(claims.len(), 2);
    assert_ne!(claims[0]["jti"], claims[1]["jti"]);
    assert_eq!(claims[0]["sub"], "alice@example.com");
    assert_eq!(claims[0]["iss"], "gmail-sender@mail-project.iam.gserviceaccount.com");
    assert_eq!(claims[0]["aud"], mock.token_uri());
}

#[tokio::test]
async fn unknown_member_maps_to_subject_not_found() {
    let mock = MockGoogle::start().await;
    let err = TokenExchanger::new(Client::new())
        .exchange(&mock.identity(), &ImpersonationRequest::mail("carol@example.com"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, DelegateErrorKind::SubjectNotFound);
    assert_eq!(err.status, Some(400));
    assert!(err.evidence().contains("Invalid email or User ID"));
}

#[tokio::test]
async fn unreachable_token_endpoint_is_network_error() {
    let identity = MockGoogle::start().await.identity().with_token_uri("http://127.0.0.1:1/token");
    let err = TokenExchanger::new(Client::new())
        .exchange(&identity, &ImpersonationRequest::mail("alice@example.com"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, DelegateErrorKind::NetworkError);
}

#[test]
fn classification_is_deterministic() {
    let observations = vec![
        Observation::from(DelegateError::credential_not_found(
            std::path::Path::new("key.json"),
            "No such file or directory",
        )),
        Observation::from(DelegateError::delegation_denied("unauthorized_client").with_status(401)),
        Observation::from(DelegateError::subject_not_found("Invalid email or User ID")),
        Observation::from(DelegateError::scope_not_authorized("scope")),
        Observation::Dispatch(DispatchOutcome::Failed {
            raw: "Gmail API has not been used in project 42".into(),
            status: 403,
            reason: Some("accessNotConfigured".into()),
        }),
        Observation::Dispatch(DispatchOutcome::Failed {
            raw: "{}".into(),
            status: 403,
            reason: Some("insufficientPermissions".into()),
        }),
        Observation::Dispatch(DispatchOutcome::Sent {
            message_id: "1".into(),
            thread_id: None,
        }),
        Observation::from(DelegateError::transport("connection reset")),
    ];
    let first: Vec<_> = observations.iter().map(classify).collect();
    let second: Vec<_> = observations.iter().map(classify).collect();
    assert_eq!(first, second);
    assert_eq!(
        first,
        vec![
            Classification::MissingCredential,
            Classification::DelegationNotConfigured,
            Classification::SubjectOutsideDirectory,
            Classification::ScopeMismatch,
            Classification::ApiNotEnabled,
            Classification::PermissionPropagationDelay,
            Classification::Configured,
            Classification::Unknown,
        ]
    );
}

// ── Dispatch ────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_delegation_sends_as_alice() {
    let mock = MockGoogle::start().await;
    let delivery = mailer(&mock).send(&mock.identity(), &hello()).await;

    assert!(delivery.token_expires_at.is_some());
    match delivery.result {
        Ok(DispatchOutcome::Sent { ref message_id, .. }) => assert!(!message_id.is_empty()),
        ref other => panic!("unexpected {:?}", other),
    }

    let sent = mock.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].user, "alice@example.com");

    let parsed = mailparse::parse_mail(&sent[0].rfc5322).unwrap();
    let headers = parsed.get_headers();
    assert_eq!(headers.get_first_value("Subject").as_deref(), Some("Hello"));
    assert_eq!(headers.get_first_value("From").as_deref(), Some("alice@example.com"));
    assert_eq!(headers.get_first_value("To").as_deref(), Some("bob@example.com"));
    assert_eq!(parsed.get_body().unwrap().trim_end(), "Hi");
}

#[tokio::test]
async fn encoded_message_round_trips_through_parser() {
    let body = "Grüße aus Köln,\nthis line is long enough that quoted-printable has to wrap it somewhere past column seventy-six.\n\n.leading dot\nEnde";
    for encoding in [TransferEncoding::QuotedPrintable, TransferEncoding::Base64] {
        let mock = MockGoogle::start().await;
        let message = OutboundMessage::builder()
            .from("alice@example.com")
            .to("bob@example.com")
            .to("carol@example.org")
            .subject("Grüße – Bericht")
            .body(body)
            .encoding(encoding)
            .build()
            .unwrap();
        let delivery = mailer(&mock).send(&mock.identity(), &message).await;
        assert!(delivery.is_sent(), "{:?}", delivery.result);

        let sent = mock.sent();
        let parsed = mailparse::parse_mail(&sent[0].rfc5322).unwrap();
        let headers = parsed.get_headers();
        assert_eq!(headers.get_first_value("Subject").as_deref(), Some("Grüße – Bericht"));
        assert_eq!(headers.get_first_value("From").as_deref(), Some("alice@example.com"));
        assert_eq!(
            headers.get_first_value("To").as_deref(),
            Some("bob@example.com, carol@example.org")
        );
        let decoded = parsed.get_body().unwrap().replace("\r\n", "\n");
        assert_eq!(decoded.trim_end_matches('\n'), body, "{:?}", encoding);
    }
}

#[tokio::test]
async fn token_cache_keeps_subjects_apart() {
    let mock = MockGoogle::start().await;
    let mailer = mailer(&mock).with_cache(TokenCache::new());
    let identity = mock.identity();

    for _ in 0..2 {
        assert!(mailer.send(&identity, &hello()).await.is_sent());
    }
    assert_eq!(mock.claims().len(), 1);

    let from_bob = OutboundMessage::builder()
        .from("bob@example.com")
        .to("alice@example.com")
        .subject("Re: Hello")
        .body("Hi yourself")
        .build()
        .unwrap();
    // The mock rejects a bearer issued for a different mailbox.
    assert!(mailer.send(&identity, &from_bob).await.is_sent());
    assert_eq!(mock.claims().len(), 2);

    let users: Vec<_> = mock.sent().into_iter().map(|m| m.user).collect();
    assert_eq!(users, ["alice@example.com", "alice@example.com", "bob@example.com"]);
}

#[tokio::test]
async fn connection_failure_is_transport_fault() {
    let mock = MockGoogle::start().await;
    let mailer = Mailer::new(
        TokenExchanger::new(Client::new()),
        Dispatcher::new(Client::new(), "http://127.0.0.1:1"),
    );
    let delivery = mailer.send(&mock.identity(), &hello()).await;
    let err = delivery.result.clone().unwrap_err();
    assert_eq!(err.kind, DelegateErrorKind::TransportFault);
    assert_eq!(classify(&delivery.observation()), Classification::Unknown);
}

// ── Diagnosis scenarios ─────────────────────────────────────────────────

#[tokio::test]
async fn missing_credential_file() {
    let mock = MockGoogle::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(dir.path().join("gmail_service_account.json"));

    let diagnosis = diagnostician(&mock).diagnose_store(&store).await;
    assert_eq!(diagnosis.classification, Classification::MissingCredential);
    assert!(diagnosis.remediation[0].starts_with("Run bootstrap"));
    assert!(diagnosis.evidence.raw.contains("gmail_service_account.json"));

    let diagnosis = diagnostician(&mock).diagnose(None, None).await;
    assert_eq!(diagnosis.classification, Classification::MissingCredential);
    assert!(mock.claims().is_empty());
}

#[tokio::test]
async fn credential_file_on_disk_is_probed() {
    let mock = MockGoogle::start().await;
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(common::write_key(dir.path(), &mock.token_uri()));

    let diagnosis = diagnostician(&mock).diagnose_store(&store).await;
    assert_eq!(diagnosis.classification, Classification::Configured);
    assert_eq!(diagnosis.identity.unwrap().client_id, common::CLIENT_ID);
}

#[tokio::test]
async fn no_delegation_grant() {
    let mock = MockGoogle::start_with(Grant::None).await;
    let diagnosis = diagnostician(&mock).diagnose(Some(&mock.identity()), None).await;

    assert_eq!(diagnosis.classification, Classification::DelegationNotConfigured);
    assert!(diagnosis.remediation.iter().any(|s| s.contains(common::CLIENT_ID)));
    assert_eq!(diagnosis.evidence.status, Some(401));
    assert_eq!(diagnosis.evidence.reason.as_deref(), Some("unauthorized_client"));
    assert_eq!(diagnosis.probe_subject.as_deref(), Some("admin@example.com"));
    // Mail scope first, then the narrow send scope.
    let claims = mock.claims();
    assert_eq!(claims.len(), 2);
    assert_eq!(claims[1]["scope"], SEND_SCOPE);
}

#[tokio::test]
async fn grant_without_mail_scope() {
    let mock = MockGoogle::start_with(Grant::Scopes(vec![SEND_SCOPE.into()])).await;
    let diagnosis = diagnostician(&mock).diagnose(Some(&mock.identity()), None).await;

    assert_eq!(diagnosis.classification, Classification::ScopeMismatch);
    assert!(diagnosis
        .remediation
        .iter()
        .any(|s| s.contains("https://mail.google.com/")));
    assert!(diagnosis.evidence.raw.contains("unauthorized_client"));
}

#[tokio::test]
async fn probe_succeeds_when_configured() {
    let mock = MockGoogle::start().await;
    let diagnosis = diagnostician(&mock)
        .with_probe_recipient("bob@example.com")
        .diagnose(Some(&mock.identity()), None)
        .await;

    assert_eq!(diagnosis.classification, Classification::Configured);
    assert!(diagnosis.remediation.is_empty());
    let sent = mock.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].user, format!("admin@{}", DOMAIN));
}

#[tokio::test]
async fn guessed_owner_missing_from_directory() {
    let mock = MockGoogle::start().await;
    mock.state.users.lock().unwrap().remove("admin@example.com");

    let diagnosis = diagnostician(&mock).diagnose(Some(&mock.identity()), None).await;
    assert_eq!(diagnosis.classification, Classification::SubjectOutsideDirectory);
    assert!(diagnosis.remediation.iter().any(|s| s.contains("probe_subject")));

    let diagnosis = diagnostician(&mock)
        .with_probe_subject("alice@example.com")
        .diagnose(Some(&mock.identity()), None)
        .await;
    assert_eq!(diagnosis.classification, Classification::Configured);
}

#[tokio::test]
async fn sender_not_in_directory() {
    let mock = MockGoogle::start().await;
    let identity = mock.identity();
    let message = OutboundMessage::builder()
        .from("carol@example.com")
        .to("bob@example.com")
        .build()
        .unwrap();
    let delivery = mailer(&mock).send(&identity, &message).await;
    assert!(delivery.token_expires_at.is_none());

    let diagnosis = diagnostician(&mock)
        .diagnose(Some(&identity), Some(&delivery.observation()))
        .await;
    assert_eq!(diagnosis.classification, Classification::SubjectOutsideDirectory);
    assert!(diagnosis.probe_subject.is_none());
}

#[tokio::test]
async fn gmail_api_disabled() {
    let mock = MockGoogle::start().await;
    mock.fail_gmail(
        403,
        r#"{"error":{"code":403,"message":"Gmail API has not been used in project 123456789012 before or it is disabled. Enable it by visiting https://console.developers.google.com/apis/api/gmail.googleapis.com/overview?project=123456789012 then retry.","errors":[{"message":"Gmail API has not been used in project 123456789012 before or it is disabled.","domain":"usageLimits","reason":"accessNotConfigured"}],"status":"PERMISSION_DENIED"}}"#,
    );
    let identity = mock.identity();
    let delivery = mailer(&mock).send(&identity, &hello()).await;
    assert!(!delivery.is_sent());

    let diagnosis = diagnostician(&mock)
        .diagnose(Some(&identity), Some(&delivery.observation()))
        .await;
    assert_eq!(diagnosis.classification, Classification::ApiNotEnabled);
    assert_eq!(diagnosis.evidence.reason.as_deref(), Some("accessNotConfigured"));
    assert!(diagnosis.remediation[0].contains("--project=123456789012"));
}

#[tokio::test]
async fn insufficient_permission_after_grant() {
    let mock = MockGoogle::start().await;
    mock.fail_gmail(
        403,
        r#"{"error":{"code":403,"message":"Request had insufficient authentication scopes.","errors":[{"message":"Insufficient Permission","domain":"global","reason":"insufficientPermissions"}],"status":"PERMISSION_DENIED"}}"#,
    );
    let identity = mock.identity();
    let delivery = mailer(&mock).send(&identity, &hello()).await;

    let diagnosis = diagnostician(&mock)
        .diagnose(Some(&identity), Some(&delivery.observation()))
        .await;
    assert_eq!(diagnosis.classification, Classification::PermissionPropagationDelay);
    assert_eq!(diagnosis.evidence.status, Some(403));
}
