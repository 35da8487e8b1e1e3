//! The closed set of OAuth scopes this crate ever requests.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    /// Full mailbox access; what message submission is granted under.
    #[serde(rename = "https://mail.google.com/")]
    MailFull,
    /// Send-only access. Requested by the diagnostic probe to tell a grant
    /// with the wrong scope apart from no grant at all.
    #[serde(rename = "https://www.googleapis.com/auth/gmail.send")]
    GmailSend,
}

impl Scope {
    pub const ALL: [Scope; 2] = [Scope::MailFull, Scope::GmailSend];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MailFull => "https://mail.google.com/",
            Self::GmailSend => "https://www.googleapis.com/auth/gmail.send",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|scope| scope.as_str() == s.trim())
    }

    /// Space-separated form used in the assertion's `scope` claim.
    pub fn join(scopes: &[Scope]) -> String {
        scopes.iter().map(Scope::as_str).collect::<Vec<_>>().join(" ")
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
