//! Exchange-then-dispatch in one call.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;

use crate::cache::TokenCache;
use crate::config::DelegateConfig;
use crate::credential::ServiceIdentity;
use crate::diagnose::Observation;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::error::{DelegateError, DelegateResult};
use crate::exchange::{DelegatedToken, ImpersonationRequest, TokenExchanger};
use crate::message::OutboundMessage;

/// What happened to one message: the token that was (or was not) obtained
/// and the dispatch outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub sender: String,
    /// Expiry of the delegated token, if the exchange succeeded.
    pub token_expires_at: Option<DateTime<Utc>>,
    pub result: DelegateResult<DispatchOutcome>,
}

impl Delivery {
    fn failed(sender: String, error: DelegateError) -> Self {
        Self {
            sender,
            token_expires_at: None,
            result: Err(error),
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self.result, Ok(ref outcome) if outcome.is_sent())
    }

    /// The signal the diagnostician classifies.
    pub fn observation(&self) -> Observation {
        match &self.result {
            Ok(outcome) => Observation::Dispatch(outcome.clone()),
            Err(e) => Observation::from(e.clone()),
        }
    }

    pub fn into_result(self) -> DelegateResult<DispatchOutcome> {
        self.result
    }
}

#[derive(Debug)]
pub struct Mailer {
    exchanger: TokenExchanger,
    dispatcher: Dispatcher,
    cache: Option<TokenCache>,
}

impl Mailer {
    pub fn new(exchanger: TokenExchanger, dispatcher: Dispatcher) -> Self {
        Self {
            exchanger,
            dispatcher,
            cache: None,
        }
    }

    pub fn from_config(config: &DelegateConfig) -> DelegateResult<Self> {
        let http = config.http_client()?;
        let exchanger = TokenExchanger::new(http.clone())
            .with_assertion_lifetime(config.assertion_lifetime_secs);
        let dispatcher = Dispatcher::new(http, config.gmail_api_base.clone());
        let mailer = Self::new(exchanger, dispatcher);
        Ok(if config.cache_tokens {
            mailer.with_cache(TokenCache::new())
        } else {
            mailer
        })
    }

    pub fn with_cache(mut self, cache: TokenCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn exchanger(&self) -> &TokenExchanger {
        &self.exchanger
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Obtain a token impersonating `sender` with the identity's scopes.
    pub async fn token_for(
        &self,
        identity: &ServiceIdentity,
        sender: &str,
    ) -> DelegateResult<DelegatedToken> {
        let request = ImpersonationRequest::new(sender, identity.scopes().to_vec());
        match self.cache {
            Some(ref cache) => cache.get_or_exchange(&self.exchanger, identity, &request).await,
            None => self.exchanger.exchange(identity, &request).await,
        }
    }

    /// Impersonate the message's sender and submit the message.
    pub async fn send(&self, identity: &ServiceIdentity, message: &OutboundMessage) -> Delivery {
        let sender = message.from().to_string();
        let token = match self.token_for(identity, &sender).await {
            Ok(token) => token,
            Err(e) => return Delivery::failed(sender, e),
        };
        debug!("Delegated token for {} valid until {}", sender, token.expires_at());
        Delivery {
            token_expires_at: Some(token.expires_at()),
            result: self.dispatcher.send(&token, message).await,
            sender,
        }
    }

    /// Impersonate `sender` and submit a pre-built RFC 5322 message.
    pub async fn send_raw(
        &self,
        identity: &ServiceIdentity,
        sender: &str,
        rfc5322: &[u8],
    ) -> Delivery {
        let token = match self.token_for(identity, sender).await {
            Ok(token) => token,
            Err(e) => return Delivery::failed(sender.to_string(), e),
        };
        Delivery {
            token_expires_at: Some(token.expires_at()),
            result: self.dispatcher.send_raw(&token, rfc5322).await,
            sender: sender.to_string(),
        }
    }
}
