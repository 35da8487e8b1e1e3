//! Raw-socket probe: feeds a literal SMTP transcript to a listening relay,
//! pausing between writes, and reports whether the message was accepted.

use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::{RelayError, RelayResult};
use crate::reply::Reply;

pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What the probe says to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTranscript {
    pub helo: String,
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl ProbeTranscript {
    pub fn new(mail_from: impl Into<String>, rcpt_to: impl Into<String>) -> Self {
        Self {
            helo: "localhost".into(),
            mail_from: mail_from.into(),
            rcpt_to: vec![rcpt_to.into()],
            subject: "SMTP relay probe".into(),
            body: "This message was submitted through the local SMTP relay.".into(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// The DATA payload, CRLF line endings, dot-stuffed, without the terminator.
    pub fn message(&self) -> String {
        let mut out = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\n",
            self.mail_from,
            self.rcpt_to.join(", "),
            self.subject
        );
        for line in self.body.lines() {
            if line.starts_with('.') {
                out.push('.');
            }
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeStep {
    pub sent: String,
    pub reply: Reply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub greeting: Reply,
    pub steps: Vec<ProbeStep>,
    /// Greeted with 220 and answered 250 after the terminator.
    pub accepted: bool,
}

impl ProbeReport {
    /// The reply to the end of DATA, if the transcript got that far.
    pub fn data_reply(&self) -> Option<&Reply> {
        self.steps.iter().find(|s| s.sent == ".").map(|s| &s.reply)
    }
}

pub struct RelayProbe {
    addr: String,
    step_delay: Duration,
    timeout: Duration,
}

impl RelayProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            step_delay: DEFAULT_STEP_DELAY,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(&self, transcript: &ProbeTranscript) -> RelayResult<ProbeReport> {
        debug!("Probing SMTP relay at {}", self.addr);
        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| RelayError::io(format!("Connection timed out: {}", self.addr)))?
            .map_err(|e| RelayError::io(format!("Connection to {} failed: {}", self.addr, e)))?;
        let mut conn = Conn {
            stream: BufReader::new(tcp),
            timeout: self.timeout,
        };

        let greeting = conn.read_reply().await?;
        let mut report = ProbeReport {
            greeting,
            steps: Vec::new(),
            accepted: false,
        };
        if report.greeting.code != 220 {
            return Ok(report);
        }

        let mut envelope = vec![
            format!("EHLO {}", transcript.helo),
            format!("MAIL FROM:<{}>", transcript.mail_from),
        ];
        envelope.extend(transcript.rcpt_to.iter().map(|r| format!("RCPT TO:<{}>", r)));
        envelope.push("DATA".into());

        for command in envelope {
            tokio::time::sleep(self.step_delay).await;
            let reply = conn.command(&command).await?;
            let refused = reply.is_error();
            report.steps.push(ProbeStep { sent: command, reply });
            if refused {
                self.quit(&mut conn, &mut report).await;
                return Ok(report);
            }
        }

        tokio::time::sleep(self.step_delay).await;
        conn.write(transcript.message().as_bytes()).await?;
        tokio::time::sleep(self.step_delay).await;
        let reply = conn.command(".").await?;
        report.accepted = reply.code == 250;
        report.steps.push(ProbeStep {
            sent: ".".into(),
            reply,
        });

        self.quit(&mut conn, &mut report).await;
        info!(
            "Relay {} {} the probe message",
            self.addr,
            if report.accepted { "accepted" } else { "refused" }
        );
        Ok(report)
    }

    /// QUIT is best-effort; the verdict is already known.
    async fn quit(&self, conn: &mut Conn, report: &mut ProbeReport) {
        tokio::time::sleep(self.step_delay).await;
        match conn.command("QUIT").await {
            Ok(reply) => report.steps.push(ProbeStep {
                sent: "QUIT".into(),
                reply,
            }),
            Err(e) => debug!("QUIT failed: {}", e),
        }
    }
}

struct Conn {
    stream: BufReader<TcpStream>,
    timeout: Duration,
}

impl Conn {
    async fn command(&mut self, line: &str) -> RelayResult<Reply> {
        debug!("C: {}", line);
        self.write(format!("{}\r\n", line).as_bytes()).await?;
        self.read_reply().await
    }

    async fn write(&mut self, data: &[u8]) -> RelayResult<()> {
        let stream = self.stream.get_mut();
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one complete (possibly multi-line) reply.
    async fn read_reply(&mut self) -> RelayResult<Reply> {
        let mut full = String::new();
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(self.timeout, self.stream.read_line(&mut line))
                .await
                .map_err(|_| RelayError::io("Read timeout"))??;
            if n == 0 {
                return Err(RelayError::protocol("Connection closed by relay"));
            }
            debug!("S: {}", line.trim_end());
            full.push_str(&line);
            if Reply::is_final_line(&line) {
                break;
            }
        }
        Reply::parse(&full)
    }
}
