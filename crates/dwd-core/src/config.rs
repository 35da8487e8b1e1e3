//! Runtime configuration: credential location, endpoints, timeouts,
//! diagnostic probe addresses and the SMTP relay listener.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional TOML file, and `DWD_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DelegateError, DelegateResult};

/// Credential file name written by bootstrap.
pub const DEFAULT_CREDENTIAL_PATH: &str = "gmail_service_account.json";
pub const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com";
pub const DEFAULT_IAM_API_BASE: &str = "https://iam.googleapis.com";
/// Google rejects assertions that live longer than one hour.
pub const MAX_ASSERTION_LIFETIME_SECS: i64 = 3600;
pub const DEFAULT_RELAY_PORT: u16 = 1025;

const USER_AGENT: &str = concat!("dwd/", env!("CARGO_PKG_VERSION"));

// ── Relay ───────────────────────────────────────────────────────────────

/// SMTP relay listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind.
    pub host: String,
    pub port: u16,
    /// Name announced in the greeting and EHLO reply.
    pub hostname: String,
    /// Only accept envelope senders from this domain.
    pub allowed_domain: Option<String>,
    /// Largest DATA payload accepted, in bytes.
    pub max_message_bytes: usize,
    /// Idle timeout per command, in seconds.
    pub command_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_RELAY_PORT,
            hostname: "localhost".into(),
            allowed_domain: None,
            max_message_bytes: 25 * 1024 * 1024,
            command_timeout_secs: 300,
        }
    }
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

// ── Delegate config ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DelegateConfig {
    /// Path of the service-account key file.
    pub credential_path: PathBuf,
    /// Workspace domain, used when the key file does not name one.
    pub directory_domain: Option<String>,
    /// Subject impersonated by the diagnostic probe. Defaults to `admin@<domain>`.
    pub probe_subject: Option<String>,
    /// When set, the probe also sends a short test message to this address.
    pub probe_recipient: Option<String>,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Lifetime requested for the signed assertion.
    pub assertion_lifetime_secs: i64,
    pub gmail_api_base: String,
    /// Replaces the `token_uri` from the key file.
    pub token_uri_override: Option<String>,
    pub iam_api_base: String,
    /// Reuse delegated tokens per (subject, scopes) until they expire.
    pub cache_tokens: bool,
    pub relay: RelayConfig,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            credential_path: PathBuf::from(DEFAULT_CREDENTIAL_PATH),
            directory_domain: None,
            probe_subject: None,
            probe_recipient: None,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            assertion_lifetime_secs: MAX_ASSERTION_LIFETIME_SECS,
            gmail_api_base: DEFAULT_GMAIL_API_BASE.into(),
            token_uri_override: None,
            iam_api_base: DEFAULT_IAM_API_BASE.into(),
            cache_tokens: false,
            relay: RelayConfig::default(),
        }
    }
}

impl DelegateConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(input: &str) -> DelegateResult<Self> {
        toml::from_str(input).map_err(|e| DelegateError::config(format!("invalid config: {}", e)))
    }

    pub fn from_file(path: &Path) -> DelegateResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DelegateError::config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> DelegateResult<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DWD_*` overrides from an iterator of key/value pairs.
    pub fn apply_overrides<I>(&mut self, vars: I) -> DelegateResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "DWD_CREDENTIAL_PATH" => self.credential_path = PathBuf::from(value),
                "DWD_DIRECTORY_DOMAIN" => self.directory_domain = Some(value),
                "DWD_PROBE_SUBJECT" => self.probe_subject = Some(value),
                "DWD_PROBE_RECIPIENT" => self.probe_recipient = Some(value),
                "DWD_GMAIL_API_BASE" => self.gmail_api_base = value,
                "DWD_TOKEN_URI" => self.token_uri_override = Some(value),
                "DWD_IAM_API_BASE" => self.iam_api_base = value,
                "DWD_REQUEST_TIMEOUT_SECS" => {
                    self.request_timeout_secs = parse_number(&key, &value)?
                }
                "DWD_CACHE_TOKENS" => {
                    self.cache_tokens = matches!(value.as_str(), "1" | "true" | "yes" | "on")
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> DelegateResult<()> {
        if self.request_timeout_secs == 0 {
            return Err(DelegateError::config("request_timeout_secs must be positive"));
        }
        if self.assertion_lifetime_secs <= 0
            || self.assertion_lifetime_secs > MAX_ASSERTION_LIFETIME_SECS
        {
            return Err(DelegateError::config(format!(
                "assertion_lifetime_secs must be within 1..={}",
                MAX_ASSERTION_LIFETIME_SECS
            )));
        }
        for (name, value) in [
            ("gmail_api_base", Some(&self.gmail_api_base)),
            ("iam_api_base", Some(&self.iam_api_base)),
            ("token_uri_override", self.token_uri_override.as_ref()),
        ] {
            if let Some(value) = value {
                check_http_url(name, value)?;
            }
        }
        if let Some(ref domain) = self.directory_domain {
            if domain.is_empty() || domain.contains('@') {
                return Err(DelegateError::config(format!(
                    "directory_domain '{}' is not a bare domain",
                    domain
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// HTTP client with the per-call timeouts applied.
    pub fn http_client(&self) -> DelegateResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.request_timeout())
            .connect_timeout(self.connect_timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DelegateError::config(format!("cannot build HTTP client: {}", e)))
    }
}

fn check_http_url(name: &str, value: &str) -> DelegateResult<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| DelegateError::config(format!("{} '{}' is not a URL: {}", name, value, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        _ => Err(DelegateError::config(format!(
            "{} '{}' must be an http(s) URL",
            name, value
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> DelegateResult<u64> {
    value
        .parse()
        .map_err(|_| DelegateError::config(format!("{} must be a number, got '{}'", key, value)))
}
