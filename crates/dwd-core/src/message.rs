//! Outbound message model and RFC 5322 encoding.
//!
//! The Gmail API takes the whole message as one base64url string in the
//! `raw` field, so the encoder produces complete headers plus body with
//! CRLF line endings and then encodes the result.

use std::fmt;
use std::path::Path;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credential::domain_of;
use crate::error::{DelegateError, DelegateResult};

/// Content-Transfer-Encoding of the text body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransferEncoding {
    SevenBit,
    #[default]
    QuotedPrintable,
    Base64,
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SevenBit => write!(f, "7bit"),
            Self::QuotedPrintable => write!(f, "quoted-printable"),
            Self::Base64 => write!(f, "base64"),
        }
    }
}

// ── Message ─────────────────────────────────────────────────────────────

/// A validated, immutable outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    id: String,
    from: String,
    to: Vec<String>,
    subject: String,
    body: String,
    encoding: TransferEncoding,
    date: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn builder() -> MessageBuilder {
        MessageBuilder::new()
    }

    /// The impersonated sender.
    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &[String] {
        &self.to
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn encoding(&self) -> TransferEncoding {
        self.encoding
    }

    /// Message-ID without angle brackets.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full RFC 5322 text.
    pub fn to_rfc5322(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 512);
        write_header(&mut out, "Message-ID", &format!("<{}>", self.id));
        write_header(
            &mut out,
            "Date",
            &self.date.format("%a, %d %b %Y %H:%M:%S %z").to_string(),
        );
        write_header(&mut out, "From", &self.from);
        write_header(&mut out, "To", &self.to.join(", "));
        write_header(&mut out, "Subject", &encode_header_value(&self.subject));
        write_header(&mut out, "MIME-Version", "1.0");
        write_header(&mut out, "Content-Type", "text/plain; charset=\"utf-8\"");
        write_header(&mut out, "Content-Transfer-Encoding", &self.encoding.to_string());
        out.push_str("\r\n");
        out.push_str(&encode_body(&self.body, self.encoding));
        if !out.ends_with("\r\n") {
            out.push_str("\r\n");
        }
        out
    }

    /// base64url form expected by `users.messages.send`.
    pub fn encode_raw(&self) -> String {
        encode_raw_bytes(self.to_rfc5322().as_bytes())
    }
}

/// base64url-encode a complete RFC 5322 message.
pub fn encode_raw_bytes(message: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE.encode(message)
}

// ── Builder ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    to: Vec<String>,
    subject: String,
    body: String,
    encoding: TransferEncoding,
    date: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(mut self, addr: impl Into<String>) -> Self {
        self.from = Some(addr.into());
        self
    }

    pub fn to(mut self, addr: impl Into<String>) -> Self {
        self.to.push(addr.into());
        self
    }

    pub fn subject(mut self, s: impl Into<String>) -> Self {
        self.subject = s.into();
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Read the body from a UTF-8 text file.
    pub fn body_from_file(self, path: impl AsRef<Path>) -> DelegateResult<Self> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|e| {
            DelegateError::invalid_message(format!("cannot read body {}: {}", path.display(), e))
        })?;
        Ok(self.body(body))
    }

    pub fn encoding(mut self, enc: TransferEncoding) -> Self {
        self.encoding = enc;
        self
    }

    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    pub fn build(self) -> DelegateResult<OutboundMessage> {
        let from = self
            .from
            .map(|f| f.trim().to_string())
            .ok_or_else(|| DelegateError::invalid_message("sender is required"))?;
        check_address("sender", &from)?;

        let to: Vec<String> = self.to.iter().map(|a| a.trim().to_string()).collect();
        if to.is_empty() {
            return Err(DelegateError::invalid_message("at least one recipient is required"));
        }
        for addr in &to {
            check_address("recipient", addr)?;
        }

        if self.subject.contains(['\r', '\n']) {
            return Err(DelegateError::invalid_message("subject must be a single line"));
        }
        if self.encoding == TransferEncoding::SevenBit && !self.body.is_ascii() {
            return Err(DelegateError::invalid_message("7bit encoding requires an ASCII body"));
        }

        let domain = domain_of(&from).unwrap_or("localhost").to_string();
        Ok(OutboundMessage {
            id: format!("{}@{}", uuid::Uuid::new_v4().simple(), domain),
            from,
            to,
            subject: self.subject,
            body: self.body,
            encoding: self.encoding,
            date: self.date.unwrap_or_else(Utc::now),
        })
    }
}

fn check_address(role: &str, addr: &str) -> DelegateResult<()> {
    let valid = !addr.contains(|c: char| c.is_whitespace() || c == '<' || c == '>' || c == ',')
        && domain_of(addr).map(|d| d.contains('.')).unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(DelegateError::invalid_message(format!("invalid {} address: '{}'", role, addr)))
    }
}

// ── Header / body helpers ───────────────────────────────────────────────

fn write_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// RFC 2047 encode a header value if it contains non-ASCII characters.
pub fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }
    let encoded = base64::engine::general_purpose::STANDARD.encode(value.as_bytes());
    format!("=?UTF-8?B?{}?=", encoded)
}

/// Normalise line endings to CRLF and apply the transfer encoding.
pub fn encode_body(text: &str, encoding: TransferEncoding) -> String {
    let text = normalize_crlf(text);
    match encoding {
        TransferEncoding::SevenBit => text,
        TransferEncoding::QuotedPrintable => quoted_printable::encode_to_str(text.as_bytes()),
        TransferEncoding::Base64 => {
            let b64 = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
            // Wrap at 76 chars
            b64.as_bytes()
                .chunks(76)
                .map(|c| std::str::from_utf8(c).unwrap_or(""))
                .collect::<Vec<_>>()
                .join("\r\n")
        }
    }
}

fn normalize_crlf(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").replace('\n', "\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OutboundMessage {
        OutboundMessage::builder()
            .from("alice@example.com")
            .to("bob@example.com")
            .subject("Hello")
            .body("Hi")
            .build()
            .unwrap()
    }

    #[test]
    fn headers_present() {
        let raw = sample().to_rfc5322();
        assert!(raw.contains("From: alice@example.com\r\n"));
        assert!(raw.contains("To: bob@example.com\r\n"));
        assert!(raw.contains("Subject: Hello\r\n"));
        assert!(raw.contains("MIME-Version: 1.0\r\n"));
        assert!(raw.contains("Content-Transfer-Encoding: quoted-printable\r\n"));
        assert!(raw.contains("Message-ID: <"));
        assert!(raw.contains("@example.com>"));
    }

    #[test]
    fn multiple_recipients_joined() {
        let msg = OutboundMessage::builder()
            .from("alice@example.com")
            .to("bob@example.com")
            .to("carol@example.org")
            .subject("x")
            .build()
            .unwrap();
        assert!(msg.to_rfc5322().contains("To: bob@example.com, carol@example.org\r\n"));
    }

    #[test]
    fn raw_is_url_safe() {
        let msg = OutboundMessage::builder()
            .from("alice@example.com")
            .to("bob@example.com")
            .subject("??>>??")
            .body("ÿÿÿ>>>???")
            .encoding(TransferEncoding::Base64)
            .build()
            .unwrap();
        let raw = msg.encode_raw();
        assert!(!raw.contains('+'));
        assert!(!raw.contains('/'));
        let decoded = base64::engine::general_purpose::URL_SAFE.decode(raw).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), msg.to_rfc5322());
    }

    #[test]
    fn missing_sender_rejected() {
        let err = OutboundMessage::builder().to("bob@example.com").build().unwrap_err();
        assert!(err.message.contains("sender"));
    }

    #[test]
    fn missing_recipient_rejected() {
        let err = OutboundMessage::builder().from("alice@example.com").build().unwrap_err();
        assert!(err.message.contains("recipient"));
    }

    #[test]
    fn bad_addresses_rejected() {
        for bad in ["bob", "bob@localhost", "bob smith@example.com", "<bob@example.com>"] {
            assert!(OutboundMessage::builder()
                .from("alice@example.com")
                .to(bad)
                .build()
                .is_err());
        }
    }

    #[test]
    fn header_injection_rejected() {
        let err = OutboundMessage::builder()
            .from("alice@example.com")
            .to("bob@example.com")
            .subject("hi\r\nBcc: eve@evil.test")
            .build()
            .unwrap_err();
        assert!(err.message.contains("single line"));
    }

    #[test]
    fn seven_bit_requires_ascii() {
        assert!(OutboundMessage::builder()
            .from("alice@example.com")
            .to("bob@example.com")
            .body("naïve")
            .encoding(TransferEncoding::SevenBit)
            .build()
            .is_err());
    }

    #[test]
    fn body_from_missing_file() {
        let err = MessageBuilder::new().body_from_file("/no/such/body.txt").unwrap_err();
        assert_eq!(err.kind, crate::error::DelegateErrorKind::InvalidMessage);
    }

    #[test]
    fn encode_header_utf8() {
        let encoded = encode_header_value("Привет");
        assert!(encoded.starts_with("=?UTF-8?B?"));
        assert!(encoded.ends_with("?="));
        assert_eq!(encode_header_value("Hello"), "Hello");
    }

    #[test]
    fn body_line_endings_normalised() {
        assert_eq!(encode_body("a\nb\r\nc", TransferEncoding::SevenBit), "a\r\nb\r\nc");
    }

    #[test]
    fn base64_body_wraps() {
        let body = "x".repeat(200);
        let encoded = encode_body(&body, TransferEncoding::Base64);
        assert!(encoded.split("\r\n").all(|line| line.len() <= 76));
    }
}
