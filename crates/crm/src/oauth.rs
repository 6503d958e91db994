//! OAuth bearer-token lifecycle for outbound CRM calls.
//!
//! [`TokenManager`] holds one credential for the whole process. The check,
//! refresh and read happen under a single async mutex, so concurrent callers
//! that find the token stale wait for one refresh and share its result.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_core::config::CrmConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tokens this close to expiry are treated as already expired.
pub const EXPIRY_MARGIN_SECS: i64 = 5 * 60;

#[derive(Clone, Debug)]
pub struct TokenInfo {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
}

impl TokenInfo {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(EXPIRY_MARGIN_SECS) >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

#[derive(Clone)]
pub enum TokenGrant {
    ClientCredentials { scope: Option<String> },
    RefreshToken(SecretString),
}

impl TokenGrant {
    pub fn grant_type(&self) -> &'static str {
        match self {
            Self::ClientCredentials { .. } => "client_credentials",
            Self::RefreshToken(_) => "refresh_token",
        }
    }
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.grant_type())
    }
}

#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenResponse {
    pub fn into_token_info(self, issued_at: DateTime<Utc>) -> Result<TokenInfo, TokenError> {
        if self.access_token.trim().is_empty() {
            return Err(TokenError::Decode("token response carried an empty access_token".into()));
        }
        if self.expires_in <= 0 {
            return Err(TokenError::Decode(format!(
                "token response carried a non-positive expires_in ({})",
                self.expires_in
            )));
        }

        let expires_at = chrono::Duration::try_seconds(self.expires_in)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| {
                TokenError::Decode(format!(
                    "token response carried an out-of-range expires_in ({})",
                    self.expires_in
                ))
            })?;

        Ok(TokenInfo {
            access_token: self.access_token.into(),
            refresh_token: self
                .refresh_token
                .filter(|token| !token.trim().is_empty())
                .map(SecretString::from),
            expires_at,
            token_type: self.token_type,
        })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("crm oauth is not configured: {0}")]
    Configuration(String),
    #[error("token request failed: {0}")]
    Transport(String),
    #[error("token endpoint returned status {0}")]
    Status(u16),
    #[error("could not decode token response: {0}")]
    Decode(String),
    #[error("token request timed out after {0:?}")]
    Timeout(Duration),
    #[error("token refresh failed after {attempts} attempts: {last_error}")]
    RefreshExhausted { attempts: u32, last_error: String },
}

/// The OAuth token endpoint, one grant per call.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn request_token(&self, grant: &TokenGrant) -> Result<TokenResponse, TokenError>;
}

pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
}

impl HttpTokenEndpoint {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self { client, token_url: token_url.into(), client_id: client_id.into(), client_secret }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn request_token(&self, grant: &TokenGrant) -> Result<TokenResponse, TokenError> {
        let mut form = vec![
            ("grant_type", grant.grant_type().to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.expose_secret().to_string()),
        ];
        match grant {
            TokenGrant::ClientCredentials { scope: Some(scope) } => {
                form.push(("scope", scope.clone()))
            }
            TokenGrant::ClientCredentials { scope: None } => {}
            TokenGrant::RefreshToken(token) => {
                form.push(("refresh_token", token.expose_secret().to_string()))
            }
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|error| TokenError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::Status(response.status().as_u16()));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|error| TokenError::Decode(error.to_string()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub attempt_timeout: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self { max_retries: 3, retry_delay_ms: 1_000, attempt_timeout: Duration::from_secs(10) }
    }
}

#[derive(Default)]
struct HeldCredential {
    token: Option<TokenInfo>,
    /// Refresh token supplied at startup, used until the first successful grant.
    seed_refresh_token: Option<SecretString>,
}

pub struct TokenManager {
    endpoint: Arc<dyn TokenEndpoint>,
    policy: RefreshPolicy,
    scope: Option<String>,
    held: Mutex<HeldCredential>,
}

impl TokenManager {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>, policy: RefreshPolicy) -> Self {
        Self { endpoint, policy, scope: None, held: Mutex::new(HeldCredential::default()) }
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_refresh_token(mut self, refresh_token: Option<SecretString>) -> Self {
        self.held.get_mut().seed_refresh_token = refresh_token;
        self
    }

    /// Builds the HTTP-backed manager from the `[crm]` config section.
    pub fn from_config(config: &CrmConfig, client: reqwest::Client) -> Result<Self, TokenError> {
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| TokenError::Configuration("crm.client_id is missing".to_string()))?;
        let client_secret = config
            .client_secret
            .clone()
            .ok_or_else(|| TokenError::Configuration("crm.client_secret is missing".to_string()))?;

        let endpoint = HttpTokenEndpoint::new(client, &config.token_url, client_id, client_secret);
        let policy = RefreshPolicy {
            max_retries: config.token_max_retries,
            retry_delay_ms: config.token_retry_delay_ms,
            attempt_timeout: Duration::from_secs(config.token_timeout_secs.max(1)),
        };

        Ok(Self::new(Arc::new(endpoint), policy)
            .with_scope(config.scope.clone())
            .with_refresh_token(config.refresh_token.clone()))
    }

    /// Returns a bearer token valid for at least the expiry margin,
    /// refreshing first if needed.
    pub async fn get_valid_token(&self) -> Result<SecretString, TokenError> {
        let mut held = self.held.lock().await;

        if let Some(token) = held.token.as_ref().filter(|token| !token.is_expired()) {
            return Ok(token.access_token.clone());
        }

        let token = self.refresh_locked(&mut held).await?;
        Ok(token.access_token)
    }

    /// Drops every held credential; the next caller performs a fresh grant.
    pub async fn clear_tokens(&self) {
        let mut held = self.held.lock().await;
        held.token = None;
        held.seed_refresh_token = None;
        info!(event_name = "crm.token.cleared", "crm oauth tokens cleared");
    }

    async fn refresh_locked(&self, held: &mut HeldCredential) -> Result<TokenInfo, TokenError> {
        let attempts = self.policy.max_retries.saturating_add(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 && self.policy.retry_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.policy.retry_delay_ms)).await;
            }

            let grant = self.next_grant(held);
            debug!(attempt, grant_type = grant.grant_type(), "requesting crm oauth token");

            let request = self.endpoint.request_token(&grant);
            let result = match tokio::time::timeout(self.policy.attempt_timeout, request).await {
                Ok(response) => response.and_then(|response| response.into_token_info(Utc::now())),
                Err(_) => Err(TokenError::Timeout(self.policy.attempt_timeout)),
            };

            match result {
                Ok(token) => {
                    info!(
                        event_name = "crm.token.refreshed",
                        attempt,
                        grant_type = grant.grant_type(),
                        expires_at = %token.expires_at,
                        "crm oauth token refreshed"
                    );
                    held.token = Some(token.clone());
                    held.seed_refresh_token = None;
                    return Ok(token);
                }
                Err(error) => {
                    warn!(
                        event_name = "crm.token.refresh_failed",
                        attempt,
                        max_retries = self.policy.max_retries,
                        grant_type = grant.grant_type(),
                        error = %error,
                        "crm oauth token refresh failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(TokenError::RefreshExhausted {
            attempts,
            last_error: last_error.map(|error| error.to_string()).unwrap_or_default(),
        })
    }

    fn next_grant(&self, held: &HeldCredential) -> TokenGrant {
        let refresh_token = held
            .token
            .as_ref()
            .and_then(|token| token.refresh_token.clone())
            .or_else(|| held.seed_refresh_token.clone());

        match refresh_token {
            Some(token) => TokenGrant::RefreshToken(token),
            None => TokenGrant::ClientCredentials { scope: self.scope.clone() },
        }
    }
}
