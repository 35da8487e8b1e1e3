//! Create (and remove) the delegated service account and its key file.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use dwd_core::config::DEFAULT_CREDENTIAL_PATH;
use dwd_core::diagnose::DELEGATION_CONSOLE_URL;
use dwd_core::{Scope, ServiceAccountKey};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::client::ApiClient;
use crate::error::{BootstrapError, BootstrapErrorKind, BootstrapResult};
use crate::iam::{service_account_email, IamClient, ServiceUsageClient};

pub const DEFAULT_ACCOUNT_ID: &str = "gmail-sender";
pub const DEFAULT_DISPLAY_NAME: &str = "Gmail Sender (domain-wide delegation)";
/// APIs enabled before the account is created.
pub const REQUIRED_APIS: [&str; 2] = ["iam.googleapis.com", "gmail.googleapis.com"];

// ── Requests / reports ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub project_id: String,
    pub account_id: String,
    pub display_name: String,
    /// Workspace domain recorded in the key file.
    pub directory_domain: String,
    pub key_path: PathBuf,
    /// Replace an existing key file.
    pub overwrite: bool,
    pub enable_apis: bool,
}

impl ProvisionRequest {
    pub fn new(project_id: impl Into<String>, directory_domain: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            account_id: DEFAULT_ACCOUNT_ID.into(),
            display_name: DEFAULT_DISPLAY_NAME.into(),
            directory_domain: directory_domain.into(),
            key_path: PathBuf::from(DEFAULT_CREDENTIAL_PATH),
            overwrite: false,
            enable_apis: true,
        }
    }

    pub fn service_account_email(&self) -> String {
        service_account_email(&self.project_id, &self.account_id)
    }

    fn validate(&self) -> BootstrapResult<()> {
        if self.project_id.trim().is_empty() {
            return Err(BootstrapError::io("project id is required"));
        }
        let id = &self.account_id;
        let valid_id = (6..=30).contains(&id.len())
            && id.starts_with(|c: char| c.is_ascii_lowercase())
            && id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !id.ends_with('-');
        if !valid_id {
            return Err(BootstrapError::io(format!(
                "account id '{}' must be 6-30 lowercase letters, digits or hyphens, starting with a letter",
                id
            )));
        }
        let domain = self.directory_domain.trim();
        if domain.is_empty() || domain.contains('@') || !domain.contains('.') {
            return Err(BootstrapError::io(format!(
                "directory domain '{}' is not a bare domain",
                self.directory_domain
            )));
        }
        if self.key_path.exists() && !self.overwrite {
            return Err(BootstrapError::already_exists(format!(
                "{} already exists; remove it or pass overwrite",
                self.key_path.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionReport {
    pub service_account_email: String,
    pub client_id: String,
    pub key_id: String,
    pub key_path: PathBuf,
    /// The account existed before this run.
    pub reused_account: bool,
    pub enabled_apis: Vec<String>,
    /// Manual admin-console steps that finish the setup.
    pub delegation_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecommissionReport {
    pub service_account_email: String,
    pub account_deleted: bool,
    pub key_file_removed: bool,
    pub reminder: Vec<String>,
}

// ── Provisioner ─────────────────────────────────────────────────────────

pub struct Provisioner {
    client: ApiClient,
}

impl Provisioner {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Enable the APIs, create (or reuse) the account, mint a key and write
    /// the credential file.
    pub async fn provision(&self, request: &ProvisionRequest) -> BootstrapResult<ProvisionReport> {
        request.validate()?;
        let project = request.project_id.as_str();
        let email = request.service_account_email();

        let mut enabled_apis = Vec::new();
        if request.enable_apis {
            for api in REQUIRED_APIS {
                let op = ServiceUsageClient::enable(&self.client, project, api).await?;
                info!("Enabling {} ({})", api, if op.done { "done" } else { "pending" });
                enabled_apis.push(api.to_string());
            }
        }

        let (account, reused_account) = match IamClient::create_service_account(
            &self.client,
            project,
            &request.account_id,
            &request.display_name,
        )
        .await
        {
            Ok(account) => {
                info!("Service account created: {}", account.email);
                (account, false)
            }
            Err(e) if e.kind == BootstrapErrorKind::AlreadyExists => {
                info!("Service account already exists: {}", email);
                (IamClient::get_service_account(&self.client, project, &email).await?, true)
            }
            Err(e) => return Err(e),
        };

        let key = IamClient::create_key(&self.client, project, &account.email).await?;
        let data = key
            .private_key_data
            .as_deref()
            .ok_or_else(|| BootstrapError::remote("key response has no privateKeyData"))?;
        let mut sa_key = decode_key(data)?;
        sa_key.directory_domain = Some(request.directory_domain.trim().to_ascii_lowercase());
        let contents = serde_json::to_string_pretty(&sa_key)
            .map_err(|e| BootstrapError::io(format!("cannot serialize key: {}", e)))?;
        write_key_file(&request.key_path, &contents)?;
        info!("Private key saved: {}", request.key_path.display());

        let client_id = if sa_key.client_id.is_empty() {
            account.client_id().to_string()
        } else {
            sa_key.client_id.clone()
        };
        Ok(ProvisionReport {
            service_account_email: account.email.clone(),
            delegation_steps: delegation_steps(&client_id),
            client_id,
            key_id: key.key_id().to_string(),
            key_path: request.key_path.clone(),
            reused_account,
            enabled_apis,
        })
    }

    /// Delete the account (a missing one is fine) and the local key file.
    pub async fn decommission(
        &self,
        project_id: &str,
        account_id: &str,
        key_path: &Path,
    ) -> BootstrapResult<DecommissionReport> {
        let email = service_account_email(project_id, account_id);
        let account_deleted =
            match IamClient::delete_service_account(&self.client, project_id, &email).await {
                Ok(()) => {
                    info!("Service account deleted: {}", email);
                    true
                }
                Err(e) if e.kind == BootstrapErrorKind::NotFound => {
                    warn!("Service account not found: {}", email);
                    false
                }
                Err(e) => return Err(e),
            };

        let key_file_removed = match std::fs::remove_file(key_path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(BootstrapError::io(format!(
                    "cannot remove {}: {}",
                    key_path.display(),
                    e
                )))
            }
        };

        Ok(DecommissionReport {
            reminder: vec![
                format!("Remove the domain-wide delegation entry for {} at {}", email, DELEGATION_CONSOLE_URL),
            ],
            service_account_email: email,
            account_deleted,
            key_file_removed,
        })
    }
}

fn decode_key(private_key_data: &str) -> BootstrapResult<ServiceAccountKey> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(private_key_data.trim())
        .map_err(|e| BootstrapError::remote(format!("privateKeyData is not base64: {}", e)))?;
    let json = String::from_utf8(bytes)
        .map_err(|e| BootstrapError::remote(format!("privateKeyData is not UTF-8: {}", e)))?;
    ServiceAccountKey::from_json(&json).map_err(|e| BootstrapError::remote(e.message))
}

/// Write the key readable by the owner only.
fn write_key_file(path: &Path, contents: &str) -> BootstrapResult<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| BootstrapError::io(format!("cannot write {}: {}", path.display(), e)))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| BootstrapError::io(format!("cannot write {}: {}", path.display(), e)))
}

fn delegation_steps(client_id: &str) -> Vec<String> {
    vec![
        format!("Open {} (Security > API controls > Domain-wide delegation)", DELEGATION_CONSOLE_URL),
        format!("Click 'Add new' and paste Client ID {}", client_id),
        format!("OAuth scopes: {}", Scope::MailFull),
        "Authorize, then run `dwd diagnose` to confirm".into(),
    ]
}
