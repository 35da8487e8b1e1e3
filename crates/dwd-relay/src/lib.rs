//! # dwd-relay – Local SMTP relay over delegated Gmail dispatch
//!
//! Accepts plain SMTP submissions on a local port and forwards each message
//! through `dwd-core`, impersonating the envelope sender. `probe` is the
//! client side: it walks a relay through one transcript and reports what
//! it answered.
//!
//! ```text
//! client ── SMTP ──▶ RelayServer ─▶ Session ─▶ MessageSink (GmailSink)
//!                                                  └─▶ Mailer::send_raw
//! ```

pub mod error;
pub mod reply;
pub mod command;
pub mod session;
pub mod server;
pub mod probe;

pub use command::Command;
pub use error::{RelayError, RelayErrorKind, RelayResult};
pub use probe::{ProbeReport, ProbeStep, ProbeTranscript, RelayProbe};
pub use reply::Reply;
pub use server::RelayServer;
pub use session::{Envelope, GmailSink, MessageSink, Session};
