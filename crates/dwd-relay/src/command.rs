//! SMTP command parsing for the relay's RFC 5321 subset.

use core::fmt::{self, Display, Formatter};

use mailparse::MailAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    /// `None` is the null reverse-path (`MAIL FROM:<>`).
    MailFrom(Option<String>),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    /// A known verb with unusable arguments; answered with 501.
    Syntax(String),
    /// Anything else; answered with 500.
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line.trim(), ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" | "EHLO" if arg.is_empty() => {
                Self::Syntax(format!("Syntax: {} hostname", verb.to_ascii_uppercase()))
            }
            "HELO" => Self::Helo(arg.to_string()),
            "EHLO" => Self::Ehlo(arg.to_string()),
            "MAIL" => match strip_keyword(arg, "FROM:") {
                Some(path) => match parse_path(path) {
                    Ok(addr) => Self::MailFrom(addr),
                    Err(e) => Self::Syntax(e),
                },
                None => Self::Syntax("Syntax: MAIL FROM:<address>".into()),
            },
            "RCPT" => match strip_keyword(arg, "TO:").map(parse_path) {
                Some(Ok(Some(addr))) => Self::RcptTo(addr),
                Some(Ok(None)) => Self::Syntax("Recipient address required".into()),
                Some(Err(e)) => Self::Syntax(e),
                None => Self::Syntax("Syntax: RCPT TO:<address>".into()),
            },
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(host) => write!(f, "HELO {}", host),
            Self::Ehlo(host) => write!(f, "EHLO {}", host),
            Self::MailFrom(from) => write!(f, "MAIL FROM:<{}>", from.as_deref().unwrap_or_default()),
            Self::RcptTo(to) => write!(f, "RCPT TO:<{}>", to),
            Self::Data => f.write_str("DATA"),
            Self::Rset => f.write_str("RSET"),
            Self::Noop => f.write_str("NOOP"),
            Self::Quit => f.write_str("QUIT"),
            Self::Syntax(msg) | Self::Unknown(msg) => f.write_str(msg),
        }
    }
}

fn strip_keyword<'a>(arg: &'a str, keyword: &str) -> Option<&'a str> {
    let head = arg.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| arg[keyword.len()..].trim())
}

/// Extract the mailbox from `<addr> [params]` or a bare `addr`.
fn parse_path(raw: &str) -> Result<Option<String>, String> {
    let path = match raw.strip_prefix('<') {
        Some(rest) => rest
            .split_once('>')
            .map(|(path, _)| path)
            .ok_or_else(|| format!("Unterminated path: {}", raw))?,
        None => raw.split_whitespace().next().unwrap_or_default(),
    };
    if path.is_empty() {
        return Ok(None);
    }
    let parsed = mailparse::addrparse(path).map_err(|e| e.to_string())?;
    match parsed.first() {
        Some(MailAddr::Single(info)) if info.addr.contains('@') => Ok(Some(info.addr.clone())),
        _ => Err(format!("Invalid address: {}", path)),
    }
}
