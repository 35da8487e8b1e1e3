//! Google Cloud REST client for the bootstrap calls.
//!
//! - Base URL: `https://{service}.googleapis.com`
//! - Auth: `Authorization: Bearer {admin access token}`
//! - Request/Response: JSON
//!
//! The admin token is supplied by the caller; bootstrap never looks for
//! ambient credentials.

use dwd_core::config::DEFAULT_IAM_API_BASE;
use dwd_core::DelegateConfig;
use log::debug;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BootstrapError, BootstrapResult};

const USER_AGENT: &str = concat!("dwd-bootstrap/", env!("CARGO_PKG_VERSION"));

pub struct ApiClient {
    http: Client,
    access_token: String,
    endpoint_override: Option<String>,
}

impl ApiClient {
    pub fn new(http: Client, access_token: impl Into<String>, endpoint_override: Option<String>) -> Self {
        Self {
            http,
            access_token: access_token.into(),
            endpoint_override: endpoint_override.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// Use the configured timeouts; a non-default `iam_api_base` redirects
    /// every service to that base.
    pub fn from_config(config: &DelegateConfig, access_token: impl Into<String>) -> BootstrapResult<Self> {
        let http = config
            .http_client()
            .map_err(|e| BootstrapError::io(e.message))?;
        let endpoint_override = Some(config.iam_api_base.clone())
            .filter(|base| base.trim_end_matches('/') != DEFAULT_IAM_API_BASE);
        Ok(Self::new(http, access_token, endpoint_override))
    }

    fn base_url(&self, service: &str) -> String {
        match self.endpoint_override {
            Some(ref url) => url.clone(),
            None => format!("https://{}.googleapis.com", service),
        }
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.access_token)
            .header("User-Agent", USER_AGENT)
    }

    /// GET a Google API path and deserialize the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, service: &str, path: &str) -> BootstrapResult<T> {
        let url = format!("{}{}", self.base_url(service), path);
        debug!("GET {}", url);
        let body = self.execute(self.request(self.http.get(&url))).await?;
        parse_json(&body)
    }

    /// POST JSON to a Google API path and deserialize the response.
    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        service: &str,
        path: &str,
        body: &B,
    ) -> BootstrapResult<T> {
        let url = format!("{}{}", self.base_url(service), path);
        debug!("POST {}", url);
        let body = self.execute(self.request(self.http.post(&url)).json(body)).await?;
        parse_json(&body)
    }

    /// DELETE a resource.
    pub async fn delete(&self, service: &str, path: &str) -> BootstrapResult<()> {
        let url = format!("{}{}", self.base_url(service), path);
        debug!("DELETE {}", url);
        self.execute(self.request(self.http.delete(&url))).await?;
        Ok(())
    }

    async fn execute(&self, builder: RequestBuilder) -> BootstrapResult<String> {
        let response = builder
            .send()
            .await
            .map_err(|e| BootstrapError::io(format!("Request failed: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| BootstrapError::io(format!("Body read error: {}", e)))?;
        if status >= 400 {
            return Err(BootstrapError::from_api_response(status, &body));
        }
        Ok(body)
    }
}

fn parse_json<T: DeserializeOwned>(body: &str) -> BootstrapResult<T> {
    // DELETE and some POSTs answer with an empty body.
    let body = if body.trim().is_empty() { "{}" } else { body };
    serde_json::from_str(body).map_err(|e| BootstrapError::remote(format!("JSON parse error: {}", e)))
}
