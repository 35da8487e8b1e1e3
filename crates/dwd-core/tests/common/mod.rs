//! In-process stand-in for the Google token endpoint and the Gmail API.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path as UrlPath, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Form, Json, Router,
};
use base64::Engine;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use dwd_core::{ServiceAccountKey, ServiceIdentity};

pub const TEST_KEY: &str = include_str!("../fixtures/service_account_key.pem");
pub const DOMAIN: &str = "example.com";
pub const CLIENT_ID: &str = "109876543210";
pub const MAIL_SCOPE: &str = "https://mail.google.com/";
pub const SEND_SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";

const UNAUTHORIZED_CLIENT: &str = "Client is unauthorized to retrieve access tokens using this method, or client not authorized for any of the scopes requested.";

/// Scopes the admin console has granted to the client id; `None` = no entry.
#[derive(Debug, Clone)]
pub enum Grant {
    None,
    Scopes(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub user: String,
    pub rfc5322: Vec<u8>,
}

#[derive(Debug)]
pub struct MockState {
    pub grant: Mutex<Grant>,
    pub users: Mutex<HashSet<String>>,
    /// Canned Gmail rejection: (status, body).
    pub gmail_failure: Mutex<Option<(u16, String)>>,
    pub tokens: Mutex<HashMap<String, String>>,
    pub claims: Mutex<Vec<Value>>,
    pub sent: Mutex<Vec<SentMessage>>,
}

pub struct MockGoogle {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockGoogle {
    /// Fully delegated: `alice`, `bob` and `admin` exist and the mail scope is granted.
    pub async fn start() -> Self {
        Self::start_with(Grant::Scopes(vec![MAIL_SCOPE.to_string()])).await
    }

    pub async fn start_with(grant: Grant) -> Self {
        let users = ["alice", "bob", "admin"]
            .iter()
            .map(|u| format!("{}@{}", u, DOMAIN))
            .collect();
        let state = Arc::new(MockState {
            grant: Mutex::new(grant),
            users: Mutex::new(users),
            gmail_failure: Mutex::new(None),
            tokens: Mutex::new(HashMap::new()),
            claims: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/token", post(token))
            .route("/gmail/v1/users/:user/messages/send", post(send))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn token_uri(&self) -> String {
        format!("{}/token", self.base_url())
    }

    pub fn fail_gmail(&self, status: u16, body: &str) {
        *self.state.gmail_failure.lock().unwrap() = Some((status, body.to_string()));
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn claims(&self) -> Vec<Value> {
        self.state.claims.lock().unwrap().clone()
    }

    pub fn identity(&self) -> ServiceIdentity {
        let key = ServiceAccountKey::from_json(&key_json(&self.token_uri(), Some(DOMAIN))).unwrap();
        ServiceIdentity::from_key(key, None).unwrap()
    }
}

pub fn key_json(token_uri: &str, domain: Option<&str>) -> String {
    let mut value = json!({
        "type": "service_account",
        "project_id": "mail-project",
        "private_key_id": "0123456789abcdef",
        "private_key": TEST_KEY,
        "client_email": "gmail-sender@mail-project.iam.gserviceaccount.com",
        "client_id": CLIENT_ID,
        "auth_uri": "https://accounts.google.com/o/oauth2/auth",
        "token_uri": token_uri,
    });
    if let Some(d) = domain {
        value["directory_domain"] = Value::String(d.into());
    }
    value.to_string()
}

pub fn write_key(dir: &Path, token_uri: &str) -> PathBuf {
    let path = dir.join("gmail_service_account.json");
    std::fs::write(&path, key_json(token_uri, Some(DOMAIN))).unwrap();
    path
}

fn oauth_error(status: StatusCode, error: &str, description: &str) -> Response {
    (
        status,
        Json(json!({ "error": error, "error_description": description })),
    )
        .into_response()
}

async fn token(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if form.get("grant_type").map(String::as_str) != Some("urn:ietf:params:oauth:grant-type:jwt-bearer") {
        return oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type", "bad grant_type");
    }
    let claims = form
        .get("assertion")
        .and_then(|jwt| jwt.split('.').nth(1))
        .and_then(|payload| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload).ok())
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok());
    let Some(claims) = claims else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "Invalid JWT");
    };
    state.claims.lock().unwrap().push(claims.clone());

    let subject = claims["sub"].as_str().unwrap_or_default().to_ascii_lowercase();
    let requested: Vec<String> = claims["scope"]
        .as_str()
        .unwrap_or_default()
        .split_whitespace()
        .map(String::from)
        .collect();

    let authorized = match &*state.grant.lock().unwrap() {
        Grant::None => false,
        Grant::Scopes(granted) => requested.iter().all(|s| granted.contains(s)),
    };
    if !authorized {
        return oauth_error(StatusCode::UNAUTHORIZED, "unauthorized_client", UNAUTHORIZED_CLIENT);
    }
    if !state.users.lock().unwrap().contains(&subject) {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "Invalid email or User ID");
    }

    let access_token = format!("ya29.{}", uuid::Uuid::new_v4().simple());
    state
        .tokens
        .lock()
        .unwrap()
        .insert(access_token.clone(), subject);
    Json(json!({
        "access_token": access_token,
        "expires_in": 3599,
        "token_type": "Bearer",
    }))
    .into_response()
}

async fn send(
    State(state): State<Arc<MockState>>,
    UrlPath(user): UrlPath<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();
    let owner = state.tokens.lock().unwrap().get(&bearer).cloned();
    if owner.as_deref() != Some(user.to_ascii_lowercase().as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"code": 401, "message": "Invalid Credentials", "status": "UNAUTHENTICATED"}})),
        )
            .into_response();
    }

    if let Some((status, body)) = state.gmail_failure.lock().unwrap().clone() {
        let status = StatusCode::from_u16(status).unwrap();
        return (status, body).into_response();
    }

    let Some(rfc5322) = body["raw"]
        .as_str()
        .and_then(|raw| base64::engine::general_purpose::URL_SAFE.decode(raw).ok())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"code": 400, "message": "Invalid raw", "status": "INVALID_ARGUMENT"}})),
        )
            .into_response();
    };

    state.sent.lock().unwrap().push(SentMessage {
        user: user.clone(),
        rfc5322,
    });
    let id = format!("{:x}", uuid::Uuid::new_v4().as_u128() >> 64);
    Json(json!({ "id": id, "threadId": id, "labelIds": ["SENT"] })).into_response()
}
