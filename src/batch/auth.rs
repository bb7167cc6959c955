//! Azure AD client-credentials tokens for the Batch data plane.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::BatchError;

const AUTHORITY: &str = "https://login.microsoftonline.com";
const BATCH_RESOURCE: &str = "https://batch.core.windows.net/";
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Upper bound on how long a token is reused, whatever the endpoint claims.
const MAX_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_LIFETIME: Duration = Duration::from_secs(300);

/// Service principal used to authenticate against Azure AD.
#[derive(Clone, Eq, PartialEq)]
pub struct AzureCredentials {
    /// Directory (tenant) identifier.
    pub tenant_id: String,
    /// Application (client) identifier.
    pub client_id: String,
    /// Client secret for the application.
    pub client_secret: String,
}

impl fmt::Debug for AzureCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Lifetime>,
}

/// AAD v1 endpoints return `expires_in` as a string, v2 as a number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Lifetime {
    Seconds(u64),
    Text(String),
}

impl Lifetime {
    fn as_duration(&self) -> Duration {
        match self {
            Self::Seconds(secs) => Duration::from_secs(*secs),
            Self::Text(text) => text
                .parse()
                .map_or(DEFAULT_LIFETIME, Duration::from_secs),
        }
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Fetches and caches bearer tokens for the Batch resource.
#[derive(Debug)]
pub struct TokenSource {
    http: reqwest::Client,
    credentials: AzureCredentials,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    /// Creates a token source using the shared HTTP client.
    #[must_use]
    pub const fn new(http: reqwest::Client, credentials: AzureCredentials) -> Self {
        Self {
            http,
            credentials,
            cached: Mutex::const_new(None),
        }
    }

    /// Returns a valid bearer token, requesting a new one when the cached
    /// token is within a minute of expiry.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::Auth`] when the token endpoint rejects the
    /// request or answers with an unexpected body.
    pub async fn bearer(&self) -> Result<String, BatchError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.clone());
        }

        let token = self.request_token().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn request_token(&self) -> Result<CachedToken, BatchError> {
        let url = format!("{AUTHORITY}/{}/oauth2/token", self.credentials.tenant_id);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("resource", BATCH_RESOURCE),
        ];
        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|err| BatchError::Auth {
                message: err.to_string(),
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|err| BatchError::Auth {
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(BatchError::Auth {
                message: format!(
                    "token endpoint returned {status}: {}",
                    String::from_utf8_lossy(&body)
                ),
            });
        }

        let parsed: TokenResponse =
            serde_json::from_slice(&body).map_err(|err| BatchError::Auth {
                message: err.to_string(),
            })?;
        let lifetime = parsed
            .expires_in
            .as_ref()
            .map_or(DEFAULT_LIFETIME, Lifetime::as_duration);
        debug!(lifetime_secs = lifetime.as_secs(), "obtained batch access token");

        Ok(CachedToken {
            value: parsed.access_token,
            refresh_at: refresh_deadline(Instant::now(), lifetime),
        })
    }
}

/// When a token with `lifetime` left at `now` should be replaced.
fn refresh_deadline(now: Instant, lifetime: Duration) -> Instant {
    let usable = lifetime.saturating_sub(REFRESH_MARGIN).min(MAX_LIFETIME);
    now.checked_add(usable).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(r#"{"access_token":"t","expires_in":"3599"}"#, 3599)]
    #[case(r#"{"access_token":"t","expires_in":1800}"#, 1800)]
    #[case(r#"{"access_token":"t","expires_in":"soon"}"#, 300)]
    fn token_lifetime_accepts_string_and_number(#[case] body: &str, #[case] secs: u64) {
        let parsed: TokenResponse = serde_json::from_str(body).expect("token should decode");
        let lifetime = parsed
            .expires_in
            .as_ref()
            .map_or(DEFAULT_LIFETIME, Lifetime::as_duration);
        assert_eq!(lifetime, Duration::from_secs(secs));
    }

    #[rstest]
    #[case(Duration::from_secs(3599), Duration::from_secs(3599) - REFRESH_MARGIN)]
    #[case(Duration::from_secs(10), Duration::ZERO)]
    #[case(Duration::from_secs(u64::MAX), MAX_LIFETIME)]
    fn refresh_deadline_is_bounded(#[case] lifetime: Duration, #[case] expected: Duration) {
        let now = Instant::now();
        assert_eq!(refresh_deadline(now, lifetime) - now, expected);
    }

    #[rstest]
    fn credentials_debug_redacts_secret() {
        let creds = AzureCredentials {
            tenant_id: String::from("tenant"),
            client_id: String::from("client"),
            client_secret: String::from("hunter2"),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"), "secret leaked: {rendered}");
    }
}
