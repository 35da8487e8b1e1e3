use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use dwd_core::TransferEncoding;

pub const DEFAULT_SUBJECT: &str = "Test from Service Account";
pub const DEFAULT_BODY: &str = "Hello! This email was sent via Service Account + Domain-Wide Delegation.";
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:1025";

#[derive(Parser, Debug)]
#[command(
    name = "dwd",
    version,
    about = "Send mail as any Workspace member through a delegated service account, and diagnose why delegation fails"
)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "DWD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Service-account key file (overrides credential_path)
    #[arg(long, global = true)]
    pub credential: Option<PathBuf>,

    #[arg(long, global = true, help = "Output machine-readable JSON")]
    pub json: bool,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send one message, impersonating the sender
    Send {
        /// Sender (the Workspace user to impersonate)
        #[arg(short = 'f', long = "from", value_name = "EMAIL")]
        from: String,
        /// Recipient; repeat for several
        #[arg(short = 't', long = "to", value_name = "EMAIL", required = true)]
        to: Vec<String>,
        #[arg(short, long, value_name = "TEXT", default_value = DEFAULT_SUBJECT)]
        subject: String,
        #[arg(short, long, value_name = "TEXT", conflicts_with = "body_file")]
        body: Option<String>,
        /// Read the body from a file
        #[arg(long, value_name = "PATH")]
        body_file: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = Encoding::QuotedPrintable)]
        encoding: Encoding,
    },
    /// Probe the delegation setup and explain what is missing
    Diagnose {
        /// User to impersonate (default: admin@<domain>)
        #[arg(long, value_name = "EMAIL")]
        subject: Option<String>,
        /// Also send a probe message to this address
        #[arg(long, value_name = "EMAIL")]
        recipient: Option<String>,
    },
    /// Run the local SMTP relay
    Relay {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Only accept senders from this domain
        #[arg(short, long)]
        domain: Option<String>,
    },
    /// Walk a running relay through one SMTP transcript
    ProbeRelay {
        #[arg(long, default_value = DEFAULT_RELAY_ADDR)]
        addr: String,
        #[arg(short = 'f', long = "from", value_name = "EMAIL")]
        from: String,
        #[arg(short = 't', long = "to", value_name = "EMAIL")]
        to: String,
        #[arg(short, long, default_value = "SMTP relay probe")]
        subject: String,
        /// Pause between writes, in milliseconds
        #[arg(long, default_value_t = 100)]
        delay_ms: u64,
    },
    /// Create the service account and its key file
    Bootstrap {
        #[arg(long)]
        project: String,
        /// Workspace domain the account will impersonate users of
        #[arg(long)]
        domain: String,
        #[arg(long, default_value = dwd_bootstrap::provision::DEFAULT_ACCOUNT_ID)]
        account_id: String,
        /// Where to write the key (default: credential_path)
        #[arg(long)]
        key_path: Option<PathBuf>,
        /// Replace an existing key file
        #[arg(long)]
        overwrite: bool,
        /// Skip enabling the IAM and Gmail APIs
        #[arg(long)]
        no_enable_apis: bool,
        /// Admin OAuth access token (e.g. `gcloud auth print-access-token`)
        #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,
    },
    /// Delete the service account and the local key file
    Decommission {
        #[arg(long)]
        project: String,
        #[arg(long, default_value = dwd_bootstrap::provision::DEFAULT_ACCOUNT_ID)]
        account_id: String,
        #[arg(long)]
        key_path: Option<PathBuf>,
        #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Encoding {
    #[value(name = "7bit")]
    SevenBit,
    QuotedPrintable,
    Base64,
}

impl From<Encoding> for TransferEncoding {
    fn from(e: Encoding) -> Self {
        match e {
            Encoding::SevenBit => TransferEncoding::SevenBit,
            Encoding::QuotedPrintable => TransferEncoding::QuotedPrintable,
            Encoding::Base64 => TransferEncoding::Base64,
        }
    }
}
