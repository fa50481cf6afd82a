//! Scoped OAuth token helper for the embedding gateway.
//!
//! Tokens are fetched with the password grant and cached process-wide. A
//! cached token is reused while it is younger than half of its `expires_in`;
//! after that the next caller refreshes it. Refresh is single-flight: the
//! cache mutex is held across the fetch, so concurrent callers wait for the
//! in-progress refresh instead of issuing their own.
//!
//! When no `OAUTH_URL` is configured the helper yields an empty token and
//! callers skip the `Authorization` header, which keeps a minimal local run
//! free of required environment.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Settings;
use crate::errors::OauthError;

/// A cached access token with its issue time.
#[derive(Debug)]
struct CachedToken {
    access_token: String,
    issued_at: Instant,
    expires_in: Duration,
}

impl CachedToken {
    /// Reuse while `now - issued_at <= expires_in / 2`.
    fn is_fresh(&self) -> bool {
        fresh(self.issued_at.elapsed(), self.expires_in)
    }
}

fn fresh(age: Duration, expires_in: Duration) -> bool {
    age <= expires_in / 2
}

/// Process-wide OAuth client with a single-flight token cache.
#[derive(Debug)]
pub struct OauthService {
    http: reqwest::Client,
    url: String,
    client_credentials: String,
    username: String,
    password: String,
    state: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl OauthService {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: settings.oauth_url.clone(),
            client_credentials: settings.oauth_client_credentials.clone(),
            username: settings.oauth_username.clone(),
            password: settings.oauth_password.clone(),
            state: Mutex::new(None),
        }
    }

    /// Return a token, refreshing the cache when it has passed half-life.
    pub async fn token(&self) -> Result<String, OauthError> {
        if self.url.is_empty() {
            return Ok(String::new());
        }

        let mut state = self.state.lock().await;
        if let Some(cached) = state.as_ref() {
            if cached.is_fresh() {
                return Ok(cached.access_token.clone());
            }
        }

        debug!(url = %self.url, "refreshing oauth token");
        let fetched = self.fetch().await?;
        let token = fetched.access_token.clone();
        *state = Some(fetched);
        Ok(token)
    }

    async fn fetch(&self) -> Result<CachedToken, OauthError> {
        let response = self
            .http
            .post(&self.url)
            .header(
                "Authorization",
                format!("Basic {}", self.client_credentials),
            )
            .form(&[
                ("grant_type", "password"),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
                ("scope", "openid profile email"),
            ])
            .send()
            .await
            .map_err(|e| OauthError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OauthError::Status(status.as_u16(), body));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| OauthError::Malformed(e.to_string()))?;

        Ok(CachedToken {
            access_token: parsed.access_token,
            issued_at: Instant::now(),
            expires_in: Duration::from_secs(parsed.expires_in),
        })
    }
}

static OAUTH: OnceLock<OauthService> = OnceLock::new();

/// The process-global OAuth service, constructed lazily on first use.
pub fn global(settings: &Settings) -> &'static OauthService {
    OAUTH.get_or_init(|| OauthService::new(settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_within_half_life() {
        let expires = Duration::from_secs(3600);
        assert!(fresh(Duration::from_secs(0), expires));
        assert!(fresh(Duration::from_secs(1800), expires));
        assert!(!fresh(Duration::from_secs(1801), expires));
    }

    #[tokio::test]
    async fn test_empty_url_yields_empty_token() {
        let service = OauthService::new(&Settings::default());
        let token = service.token().await.unwrap();
        assert!(token.is_empty());
    }

    #[tokio::test]
    async fn test_cached_token_is_reused() {
        let settings = Settings {
            oauth_url: "http://localhost:1/oauth".to_string(),
            ..Settings::default()
        };
        let service = OauthService::new(&settings);
        {
            let mut state = service.state.lock().await;
            *state = Some(CachedToken {
                access_token: "cached".to_string(),
                issued_at: Instant::now(),
                expires_in: Duration::from_secs(3600),
            });
        }
        // Fresh cache entry means no network call against the dead endpoint.
        assert_eq!(service.token().await.unwrap(), "cached");
    }
}
