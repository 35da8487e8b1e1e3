//! # dwd-core – Delegated Gmail dispatch and delegation diagnosis
//!
//! Authenticates as a Google Cloud service account with domain-wide
//! delegation, impersonates a member of the Workspace directory, submits
//! mail through that member's mailbox and, when delegation fails, tells the
//! operator which part of the setup is missing.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  Diagnostician  (diagnose.rs)                    │
//! │  ├── classify()  ordered rule table             │
//! │  └── probe()     owner exchange + narrow retry   │
//! ├──────────────────────────────────────────────────┤
//! │  Mailer  (mailer.rs)                             │
//! │  ├── TokenCache (cache.rs, optional)             │
//! │  ├── TokenExchanger  (exchange.rs)               │
//! │  └── Dispatcher  (dispatch.rs + message.rs)      │
//! ├──────────────────────────────────────────────────┤
//! │  CredentialStore  (credential.rs)                │
//! │  └── ServiceIdentity  RS256 signing key          │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! | Endpoint        | Default                                   |
//! |-----------------|-------------------------------------------|
//! | Token exchange  | `token_uri` from the key file             |
//! | Message send    | `https://gmail.googleapis.com`            |

// ── Sub-modules ─────────────────────────────────────────────────────────

pub mod error;
pub mod config;
pub mod scope;
pub mod credential;
pub mod exchange;
pub mod cache;
pub mod message;
pub mod dispatch;
pub mod mailer;
pub mod diagnose;

// ── Re-exports ──────────────────────────────────────────────────────────

pub use cache::TokenCache;
pub use config::{DelegateConfig, RelayConfig};
pub use credential::{CredentialStore, IdentitySummary, ServiceAccountKey, ServiceIdentity};
pub use diagnose::{classify, Classification, Diagnosis, Diagnostician, Evidence, Observation};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::{DelegateError, DelegateErrorKind, DelegateResult};
pub use exchange::{DelegatedToken, ImpersonationRequest, TokenExchanger};
pub use mailer::{Delivery, Mailer};
pub use message::{MessageBuilder, OutboundMessage, TransferEncoding};
pub use scope::Scope;
