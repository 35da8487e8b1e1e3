//! SMTP replies, rendered by the relay and parsed by the probe.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RelayError, RelayResult};

/// A complete SMTP reply: one code, one or more text lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn ok() -> Self {
        Self::new(250, "OK")
    }

    /// 2xx.
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx.
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    pub fn text(&self) -> String {
        self.lines.join(" ")
    }

    /// Wire form: `250-first\r\n250 last\r\n`.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        if self.lines.is_empty() {
            out.push_str(&format!("{}\r\n", self.code));
        }
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        out
    }

    /// Parse the raw lines of one (possibly multi-line) reply.
    pub fn parse(raw: &str) -> RelayResult<Self> {
        let mut code: Option<u16> = None;
        let mut lines = Vec::new();

        for line in raw.lines() {
            if line.len() < 3 {
                continue;
            }
            let c: u16 = line
                .get(..3)
                .and_then(|digits| digits.parse().ok())
                .ok_or_else(|| RelayError::protocol(format!("Invalid reply code in: {}", line)))?;
            match code {
                None => code = Some(c),
                Some(first) if first != c => {
                    return Err(RelayError::protocol(format!(
                        "Reply code changed mid-reply: {} then {}",
                        first, c
                    )))
                }
                Some(_) => {}
            }
            lines.push(line.get(4..).unwrap_or_default().to_string());
        }

        code.map(|code| Self { code, lines })
            .ok_or_else(|| RelayError::protocol("Empty SMTP reply"))
    }

    /// True for the last line of a reply (code followed by a space or nothing).
    pub fn is_final_line(line: &str) -> bool {
        let bytes = line.trim_end_matches(['\r', '\n']).as_bytes();
        bytes.len() == 3 || (bytes.len() > 3 && bytes[3] == b' ')
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text())
    }
}
