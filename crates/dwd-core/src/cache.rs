//! Optional token cache in front of the exchanger.
//!
//! Entries are keyed by (subject, scope set) and dropped once expired, so a
//! token issued for one impersonation context is never handed to another.

use std::collections::HashMap;

use log::debug;
use tokio::sync::Mutex;

use crate::credential::ServiceIdentity;
use crate::error::DelegateResult;
use crate::exchange::{DelegatedToken, ImpersonationRequest, TokenExchanger};
use crate::scope::Scope;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    subject: String,
    scopes: Vec<Scope>,
}

impl CacheKey {
    fn new(subject: &str, scopes: &[Scope]) -> Self {
        let mut scopes = scopes.to_vec();
        scopes.sort();
        scopes.dedup();
        Self {
            subject: subject.trim().to_ascii_lowercase(),
            scopes,
        }
    }
}

#[derive(Debug, Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<CacheKey, DelegatedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live token for exactly this subject and scope set.
    pub async fn get(&self, request: &ImpersonationRequest) -> Option<DelegatedToken> {
        let key = CacheKey::new(&request.subject, &request.scopes);
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(token) if !token.is_expired() => Some(token.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, token: DelegatedToken) {
        let key = CacheKey::new(token.subject(), token.scopes());
        self.entries.lock().await.insert(key, token);
    }

    pub async fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, token| !token.is_expired());
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cached token if still valid, otherwise a fresh exchange.
    pub async fn get_or_exchange(
        &self,
        exchanger: &TokenExchanger,
        identity: &ServiceIdentity,
        request: &ImpersonationRequest,
    ) -> DelegateResult<DelegatedToken> {
        if let Some(token) = self.get(request).await {
            debug!("Reusing cached token for {}", request.subject);
            return Ok(token);
        }
        let token = exchanger.exchange(identity, request).await?;
        self.insert(token.clone()).await;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn token(bearer: &str, subject: &str, scopes: Vec<Scope>, ttl: i64) -> DelegatedToken {
        DelegatedToken::new(bearer, Utc::now() + Duration::seconds(ttl), subject, scopes)
    }

    #[tokio::test]
    async fn hit_requires_same_subject() {
        let cache = TokenCache::new();
        cache.insert(token("a", "alice@example.com", vec![Scope::MailFull], 600)).await;

        let hit = cache.get(&ImpersonationRequest::mail("ALICE@example.com")).await;
        assert_eq!(hit.unwrap().bearer(), "a");
        assert!(cache.get(&ImpersonationRequest::mail("bob@example.com")).await.is_none());
    }

    #[tokio::test]
    async fn hit_requires_same_scopes() {
        let cache = TokenCache::new();
        cache.insert(token("a", "alice@example.com", vec![Scope::GmailSend], 600)).await;
        assert!(cache.get(&ImpersonationRequest::mail("alice@example.com")).await.is_none());

        let both = ImpersonationRequest::new(
            "alice@example.com",
            vec![Scope::MailFull, Scope::GmailSend],
        );
        assert!(cache.get(&both).await.is_none());
    }

    #[tokio::test]
    async fn scope_order_does_not_matter() {
        let cache = TokenCache::new();
        cache
            .insert(token("a", "alice@example.com", vec![Scope::GmailSend, Scope::MailFull], 600))
            .await;
        let req = ImpersonationRequest::new(
            "alice@example.com",
            vec![Scope::MailFull, Scope::GmailSend],
        );
        assert!(cache.get(&req).await.is_some());
    }

    #[tokio::test]
    async fn expired_entries_are_dropped() {
        let cache = TokenCache::new();
        cache.insert(token("old", "alice@example.com", vec![Scope::MailFull], 10)).await;
        cache.insert(token("new", "bob@example.com", vec![Scope::MailFull], 600)).await;

        assert!(cache.get(&ImpersonationRequest::mail("alice@example.com")).await.is_none());
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.evict_expired().await, 0);
    }
}
