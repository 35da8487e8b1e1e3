//! Google Cloud IAM and Service Usage calls used by bootstrap.
//!
//! API bases: `https://iam.googleapis.com/v1`,
//! `https://serviceusage.googleapis.com/v1`

use serde::{Deserialize, Serialize};

use crate::client::ApiClient;
use crate::error::BootstrapResult;

const IAM: &str = "iam";
const SERVICE_USAGE: &str = "serviceusage";
const V1: &str = "/v1";

// ── Types ───────────────────────────────────────────────────────────────

/// IAM service account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IamServiceAccount {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "projectId")]
    pub project_id: String,
    /// Numeric id; the OAuth client id registered for delegation.
    #[serde(default, rename = "uniqueId")]
    pub unique_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "displayName")]
    pub display_name: String,
    #[serde(default, rename = "oauth2ClientId")]
    pub oauth2_client_id: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl IamServiceAccount {
    pub fn client_id(&self) -> &str {
        self.oauth2_client_id.as_deref().unwrap_or(&self.unique_id)
    }
}

/// IAM service account key, as returned by `keys.create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IamServiceAccountKey {
    #[serde(default)]
    pub name: String,
    /// base64 of the Google JSON key file.
    #[serde(default, rename = "privateKeyData")]
    pub private_key_data: Option<String>,
    #[serde(default, rename = "privateKeyType")]
    pub private_key_type: String,
    #[serde(default, rename = "keyAlgorithm")]
    pub key_algorithm: String,
    #[serde(default, rename = "validAfterTime")]
    pub valid_after_time: Option<String>,
}

impl IamServiceAccountKey {
    /// Key id: last segment of `projects/*/serviceAccounts/*/keys/{id}`.
    pub fn key_id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or_default()
    }
}

/// Long-running operation returned by `services.enable`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub done: bool,
}

pub fn service_account_email(project: &str, account_id: &str) -> String {
    format!("{}@{}.iam.gserviceaccount.com", account_id, project)
}

// ── IAM Client ──────────────────────────────────────────────────────────

pub struct IamClient;

impl IamClient {
    /// Get a service account by email.
    pub async fn get_service_account(
        client: &ApiClient,
        project: &str,
        email: &str,
    ) -> BootstrapResult<IamServiceAccount> {
        let path = format!("{}/projects/{}/serviceAccounts/{}", V1, project, email);
        client.get(IAM, &path).await
    }

    /// Create a service account.
    pub async fn create_service_account(
        client: &ApiClient,
        project: &str,
        account_id: &str,
        display_name: &str,
    ) -> BootstrapResult<IamServiceAccount> {
        let path = format!("{}/projects/{}/serviceAccounts", V1, project);
        let body = serde_json::json!({
            "accountId": account_id,
            "serviceAccount": { "displayName": display_name },
        });
        client.post(IAM, &path, &body).await
    }

    /// Delete a service account.
    pub async fn delete_service_account(
        client: &ApiClient,
        project: &str,
        email: &str,
    ) -> BootstrapResult<()> {
        let path = format!("{}/projects/{}/serviceAccounts/{}", V1, project, email);
        client.delete(IAM, &path).await
    }

    /// Create a JSON key for a service account.
    pub async fn create_key(
        client: &ApiClient,
        project: &str,
        email: &str,
    ) -> BootstrapResult<IamServiceAccountKey> {
        let path = format!("{}/projects/{}/serviceAccounts/{}/keys", V1, project, email);
        let body = serde_json::json!({
            "privateKeyType": "TYPE_GOOGLE_CREDENTIALS_FILE",
            "keyAlgorithm": "KEY_ALG_RSA_2048",
        });
        client.post(IAM, &path, &body).await
    }
}

// ── Service Usage ───────────────────────────────────────────────────────

pub struct ServiceUsageClient;

impl ServiceUsageClient {
    /// Request that `service` (e.g. `gmail.googleapis.com`) be enabled.
    pub async fn enable(client: &ApiClient, project: &str, service: &str) -> BootstrapResult<Operation> {
        let path = format!("{}/projects/{}/services/{}:enable", V1, project, service);
        client.post(SERVICE_USAGE, &path, &serde_json::json!({})).await
    }
}
