//! Authentication mechanisms for HTTP endpoints.
//!
//! Every variant implements the same contract: take the outgoing header map
//! and return it augmented with whatever authorization the endpoint needs.
//! Credentials are always resolved through the run's credential provider;
//! nothing secret lives in configuration.

use std::collections::HashMap;

use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use datafetch_core::{CredentialProvider, FetchError, Result};

/// Authentication mechanism attached to an [`crate::HttpProtocolConfig`].
#[derive(Debug, Clone)]
pub enum AuthMechanism {
    /// No authentication; headers pass through unchanged.
    None,
    /// HTTP basic auth; `username` and `password` come from the credential
    /// provider under the config name.
    Basic,
    /// Static bearer token, or a provider lookup of `token` when `None`.
    Bearer { token: Option<String> },
    /// OAuth client-credentials exchange against `token_url`, with
    /// `client_id` / `client_secret` from the credential provider.
    OAuth {
        token_url: String,
        scope: Option<String>,
    },
}

impl AuthMechanism {
    /// Augment `headers` for a request on behalf of `config_name`. OAuth
    /// token acquisition goes through `oauth` so tokens can be cached at the
    /// manager level.
    pub async fn authenticate_request(
        &self,
        config_name: &str,
        credentials: &dyn CredentialProvider,
        oauth: &OAuthTokenCache,
        mut headers: HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        match self {
            AuthMechanism::None => Ok(headers),
            AuthMechanism::Basic => {
                let username = credentials.get(config_name, "username").await?;
                let password = credentials.get(config_name, "password").await?;
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                headers.insert("Authorization".to_string(), format!("Basic {encoded}"));
                Ok(headers)
            }
            AuthMechanism::Bearer { token } => {
                let token = match token {
                    Some(token) => token.clone(),
                    None => credentials.get(config_name, "token").await?,
                };
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                Ok(headers)
            }
            AuthMechanism::OAuth { token_url, scope } => {
                let token = oauth
                    .access_token(config_name, credentials, token_url, scope.as_deref())
                    .await?;
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                Ok(headers)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    access_token: String,
    expires_at: tokio::time::Instant,
}

/// Access tokens cached per `(config_name, client_id)` and refreshed when
/// expired. Refresh happens at most once at a time per manager.
#[derive(Default)]
pub struct OAuthTokenCache {
    tokens: tokio::sync::Mutex<HashMap<String, CachedToken>>,
}

/// Refresh slightly before the server-side expiry to avoid using a token
/// that dies in flight.
const EXPIRY_MARGIN_SECS: u64 = 60;

impl OAuthTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn access_token(
        &self,
        config_name: &str,
        credentials: &dyn CredentialProvider,
        token_url: &str,
        scope: Option<&str>,
    ) -> Result<String> {
        let client_id = credentials.get(config_name, "client_id").await?;
        let client_secret = credentials.get(config_name, "client_secret").await?;
        let cache_key = format!("{config_name}:{client_id}");

        let mut tokens = self.tokens.lock().await;
        if let Some(cached) = tokens.get(&cache_key) {
            if cached.expires_at > tokio::time::Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        debug!(config_name, token_url, "OAUTH_TOKEN_REFRESH");

        let mut form = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        if let Some(scope) = scope {
            form.push(("scope", scope.to_string()));
        }

        let response = reqwest::Client::new()
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| FetchError::network_from("OAuth token request failed", e))?;

        if !response.status().is_success() {
            return Err(FetchError::network(format!(
                "OAuth token endpoint returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| FetchError::network_from("OAuth token response malformed", e))?;

        let ttl = token.expires_in.saturating_sub(EXPIRY_MARGIN_SECS).max(1);
        tokens.insert(
            cache_key,
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at: tokio::time::Instant::now() + std::time::Duration::from_secs(ttl),
            },
        );
        Ok(token.access_token)
    }
}
