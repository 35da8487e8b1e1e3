//! One SMTP conversation: command state machine, DATA collection and the
//! hand-off to a [`MessageSink`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dwd_core::credential::domain_of;
use dwd_core::{classify, DispatchOutcome, Mailer, RelayConfig, ServiceIdentity};
use log::{debug, info, warn};
use mailparse::MailHeaderMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::command::Command;
use crate::error::{RelayError, RelayResult};
use crate::reply::Reply;

/// Longest command line accepted.
const MAX_COMMAND_LINE: u64 = 4096;
/// Read chunk for DATA lines; longer lines arrive in several chunks.
const DATA_CHUNK: u64 = 64 * 1024;

/// Envelope and content of one accepted transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub helo: Option<String>,
    /// `None` is the null sender.
    pub mail_from: Option<String>,
    pub rcpt_to: Vec<String>,
    /// Message exactly as received, dot-unstuffed, without the terminator.
    pub data: Vec<u8>,
}

/// Where a completed transaction goes. The returned reply is sent to the
/// client as the answer to the end of DATA.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, envelope: &Envelope) -> Reply;
}

// ── Gmail sink ──────────────────────────────────────────────────────────

/// Forwards each message through Gmail, impersonating the envelope sender.
pub struct GmailSink {
    mailer: Arc<Mailer>,
    identity: Arc<ServiceIdentity>,
    allowed_domain: Option<String>,
}

impl GmailSink {
    pub fn new(mailer: Arc<Mailer>, identity: Arc<ServiceIdentity>) -> Self {
        Self {
            mailer,
            identity,
            allowed_domain: None,
        }
    }

    pub fn with_allowed_domain(mut self, domain: Option<String>) -> Self {
        self.allowed_domain = domain.map(|d| d.trim().to_ascii_lowercase());
        self
    }

    /// Whether `sender` passes the allowed-domain filter.
    pub fn accepts(&self, sender: &str) -> bool {
        match self.allowed_domain {
            None => true,
            Some(ref allowed) => domain_of(sender)
                .map(|d| d.eq_ignore_ascii_case(allowed))
                .unwrap_or(false),
        }
    }
}

#[async_trait]
impl MessageSink for GmailSink {
    async fn deliver(&self, envelope: &Envelope) -> Reply {
        let Some(sender) = envelope.mail_from.as_deref() else {
            return Reply::new(550, "Null sender cannot be impersonated");
        };
        if !self.accepts(sender) {
            warn!("Rejected sender outside allowed domain: {}", sender);
            return Reply::new(550, format!("Sender domain not allowed: {}", sender));
        }

        let subject = mailparse::parse_headers(&envelope.data)
            .ok()
            .and_then(|(headers, _)| headers.get_first_value("Subject"))
            .unwrap_or_else(|| "(no subject)".into());
        info!(
            "Relaying from {} to {} ({})",
            sender,
            envelope.rcpt_to.join(", "),
            subject
        );

        let delivery = self.mailer.send_raw(&self.identity, sender, &envelope.data).await;
        match delivery.result {
            Ok(DispatchOutcome::Sent { ref message_id, .. }) => {
                info!("Relayed as {} (id {})", sender, message_id);
                Reply::new(250, format!("Message accepted for delivery ({})", message_id))
            }
            _ => {
                let classification = classify(&delivery.observation());
                warn!("Relay failed for {}: {}", sender, classification);
                Reply::new(550, format!("Failed to send: {}", classification.headline()))
            }
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────────

struct Transaction {
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
}

enum Flow {
    Continue,
    Close,
}

enum Incoming {
    Line(String),
    TooLong,
}

/// SMTP server side of one connection.
pub struct Session<S> {
    stream: BufReader<S>,
    sink: Arc<dyn MessageSink>,
    hostname: String,
    max_message_bytes: usize,
    command_timeout: Duration,
    helo: Option<String>,
    transaction: Option<Transaction>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    pub fn new(stream: S, sink: Arc<dyn MessageSink>, config: &RelayConfig) -> Self {
        Self {
            stream: BufReader::new(stream),
            sink,
            hostname: config.hostname.clone(),
            max_message_bytes: config.max_message_bytes,
            command_timeout: config.command_timeout(),
            helo: None,
            transaction: None,
        }
    }

    /// Greet, then serve commands until QUIT, EOF or an idle timeout.
    pub async fn run(mut self) -> RelayResult<()> {
        let greeting = Reply::new(220, format!("{} ESMTP dwd relay ready", self.hostname));
        self.send(&greeting).await?;

        loop {
            let line = match self.read_command().await? {
                Some(Incoming::Line(line)) => line,
                Some(Incoming::TooLong) => {
                    self.send(&Reply::new(500, "Line too long")).await?;
                    continue;
                }
                None => return Ok(()),
            };
            let command = Command::parse(&line);
            debug!("C: {}", command);
            if let Flow::Close = self.handle(command).await? {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, command: Command) -> RelayResult<Flow> {
        let reply = match command {
            Command::Helo(host) => {
                self.helo = Some(host);
                self.transaction = None;
                Reply::new(250, self.hostname.clone())
            }
            Command::Ehlo(host) => {
                self.helo = Some(host);
                self.transaction = None;
                Reply::multiline(
                    250,
                    vec![
                        self.hostname.clone(),
                        format!("SIZE {}", self.max_message_bytes),
                        "8BITMIME".into(),
                    ],
                )
            }
            Command::MailFrom(from) => {
                if self.helo.is_none() {
                    Reply::new(503, "Error: send HELO first")
                } else if self.transaction.is_some() {
                    Reply::new(503, "Error: nested MAIL command")
                } else {
                    self.transaction = Some(Transaction {
                        mail_from: from,
                        rcpt_to: Vec::new(),
                    });
                    Reply::ok()
                }
            }
            Command::RcptTo(to) => match self.transaction {
                Some(ref mut tx) => {
                    tx.rcpt_to.push(to);
                    Reply::ok()
                }
                None => Reply::new(503, "Error: need MAIL command"),
            },
            Command::Data => match self.transaction.take() {
                None => Reply::new(503, "Error: need MAIL command"),
                Some(tx) if tx.rcpt_to.is_empty() => {
                    self.transaction = Some(tx);
                    Reply::new(503, "Error: need RCPT command")
                }
                Some(tx) => {
                    self.send(&Reply::new(354, "End data with <CR><LF>.<CR><LF>"))
                        .await?;
                    self.receive_data(tx).await?
                }
            },
            Command::Rset => {
                self.transaction = None;
                Reply::ok()
            }
            Command::Noop => Reply::ok(),
            Command::Quit => {
                self.send(&Reply::new(221, "Bye")).await?;
                return Ok(Flow::Close);
            }
            Command::Syntax(msg) => Reply::new(501, msg),
            Command::Unknown(_) => Reply::new(500, "Command not recognised"),
        };
        self.send(&reply).await?;
        Ok(Flow::Continue)
    }

    /// Collect DATA up to the lone-dot terminator, then hand it to the sink.
    async fn receive_data(&mut self, tx: Transaction) -> RelayResult<Reply> {
        let mut data = Vec::new();
        let mut oversized = false;
        let mut at_line_start = true;

        loop {
            let mut chunk = Vec::new();
            let n = tokio::time::timeout(
                self.command_timeout,
                (&mut self.stream).take(DATA_CHUNK).read_until(b'\n', &mut chunk),
            )
            .await
            .map_err(|_| RelayError::protocol("timed out during DATA"))??;
            if n == 0 {
                return Err(RelayError::protocol("connection closed during DATA"));
            }

            let complete = chunk.ends_with(b"\n");
            if at_line_start && complete && matches!(chunk.as_slice(), b".\r\n" | b".\n") {
                break;
            }
            let content = if at_line_start && chunk.starts_with(b".") {
                &chunk[1..]
            } else {
                &chunk[..]
            };
            at_line_start = complete;

            if oversized || data.len() + content.len() > self.max_message_bytes {
                oversized = true;
                continue;
            }
            data.extend_from_slice(content);
        }

        if oversized {
            warn!("Discarded message over {} bytes", self.max_message_bytes);
            return Ok(Reply::new(552, "Message exceeds fixed maximum message size"));
        }

        let envelope = Envelope {
            helo: self.helo.clone(),
            mail_from: tx.mail_from,
            rcpt_to: tx.rcpt_to,
            data,
        };
        Ok(self.sink.deliver(&envelope).await)
    }

    /// Next command line, or `None` once the client is gone or idle.
    async fn read_command(&mut self) -> RelayResult<Option<Incoming>> {
        let mut line = Vec::new();
        let read = tokio::time::timeout(
            self.command_timeout,
            (&mut self.stream).take(MAX_COMMAND_LINE).read_until(b'\n', &mut line),
        )
        .await;
        match read {
            Err(_) => {
                debug!("Idle timeout, closing");
                let bye = Reply::new(421, format!("{} timeout, closing connection", self.hostname));
                self.send(&bye).await?;
                Ok(None)
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) => Ok(None),
            Ok(Ok(_)) if !line.ends_with(b"\n") && line.len() as u64 >= MAX_COMMAND_LINE => {
                self.discard_line().await?;
                Ok(Some(Incoming::TooLong))
            }
            Ok(Ok(_)) => Ok(Some(Incoming::Line(String::from_utf8_lossy(&line).into_owned()))),
        }
    }

    /// Drop the remainder of an over-long line, up to and including its `\n`.
    async fn discard_line(&mut self) -> RelayResult<()> {
        loop {
            let mut rest = Vec::new();
            let n = tokio::time::timeout(
                self.command_timeout,
                (&mut self.stream).take(MAX_COMMAND_LINE).read_until(b'\n', &mut rest),
            )
            .await
            .map_err(|_| RelayError::protocol("timed out reading an over-long line"))??;
            if n == 0 || rest.ends_with(b"\n") {
                return Ok(());
            }
        }
    }

    async fn send(&mut self, reply: &Reply) -> RelayResult<()> {
        debug!("S: {}", reply);
        let stream = self.stream.get_mut();
        stream.write_all(reply.to_wire().as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}
